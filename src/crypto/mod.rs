// Cryptographic services
//
// - secure_rng.rs: seeds for random passes and sample plans
// - canonical.rs: deterministic payload encoding
// - signing.rs: Ed25519 signer and verification helpers
// - attestation.rs: signed records of finalized jobs

pub mod attestation;
pub mod canonical;
pub mod secure_rng;
pub mod signing;




pub use attestation::{
    build_payload, certificate_id_for, verify_record, AttestationGenerator, AttestationPayload,
    AttestationRecord, CertificateContext, SignatureBlock, SignerInfo, SCHEMA_VERSION,
};
pub use secure_rng::generate_seed;
pub use signing::{key_fingerprint, AttestationSigner, Ed25519Signer};
