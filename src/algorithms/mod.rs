pub mod method;
pub mod patterns;
pub mod registry;

#[cfg(test)]
mod registry_tests;

// Re-export the registry surface
pub use method::{
    BadSectorPolicy, DurationModel, PassAction, PassSpec, PatternGenerator, SanitizationMethod,
    SanitizationRequest, SanitizationTier, StandardReference, VerificationRequirement,
};
pub use patterns::{PatternSeed, PatternStream};
pub use registry::{builtin_methods, validate_method, MethodRegistry, MethodRegistryBuilder};
