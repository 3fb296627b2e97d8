// Attestation signing
//
// Ed25519 over the canonical payload bytes. Keys are PKCS#8 documents on disk;
// the fingerprint recorded in an attestation is the SHA-256 of the raw public key.

use crate::{EngineError, EngineResult};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

pub const ED25519_ALGORITHM: &str = "ed25519";

#[cfg_attr(test, mockall::automock)]
pub trait AttestationSigner: Send + Sync {
    fn algorithm(&self) -> String;

    /// Who holds the key, as recorded in the signature block
    fn signer_identity(&self) -> String;

    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, message: &[u8]) -> EngineResult<Vec<u8>>;
}

pub struct Ed25519Signer {
    key_pair: Ed25519KeyPair,
    identity: String,
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("identity", &self.identity)
            .field("fingerprint", &key_fingerprint(self.key_pair.public_key().as_ref()))
            .finish()
    }
}

impl Ed25519Signer {
    pub fn from_pkcs8(pkcs8: &[u8], identity: impl Into<String>) -> EngineResult<Self> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| EngineError::SigningUnavailable(format!("signing key rejected: {}", e)))?;
        Ok(Self {
            key_pair,
            identity: identity.into(),
        })
    }

    /// Load a PKCS#8 key file. A missing or unreadable file means signing is unavailable.
    pub fn from_pkcs8_file(path: &Path, identity: impl Into<String>) -> EngineResult<Self> {
        let pkcs8 = fs::read(path).map_err(|e| {
            EngineError::SigningUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        let signer = Self::from_pkcs8(&pkcs8, identity)?;
        tracing::info!(
            path = %path.display(),
            fingerprint = %key_fingerprint(&signer.public_key()),
            "Signing key loaded"
        );
        Ok(signer)
    }

    /// Fresh PKCS#8 document from the system RNG.
    pub fn generate_pkcs8() -> EngineResult<Vec<u8>> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| {
            EngineError::SigningUnavailable("key generation failed".to_string())
        })?;
        Ok(document.as_ref().to_vec())
    }

    /// Write a key file readable only by its owner. Refuses to replace an existing key.
    pub fn write_pkcs8_file(path: &Path, pkcs8: &[u8]) -> EngineResult<()> {
        use std::io::Write;
        #[cfg(unix)]
        use std::os::unix::fs::OpenOptionsExt;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(path)?;
        file.write_all(pkcs8)?;
        file.sync_all()?;
        Ok(())
    }
}

impl AttestationSigner for Ed25519Signer {
    fn algorithm(&self) -> String {
        ED25519_ALGORITHM.to_string()
    }

    fn signer_identity(&self) -> String {
        self.identity.clone()
    }

    fn public_key(&self) -> Vec<u8> {
        self.key_pair.public_key().as_ref().to_vec()
    }

    fn sign(&self, message: &[u8]) -> EngineResult<Vec<u8>> {
        Ok(self.key_pair.sign(message).as_ref().to_vec())
    }
}

pub fn key_fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> EngineResult<()> {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(message, signature)
        .map_err(|_| EngineError::InvalidAttestation("signature does not match payload".to_string()))
}
