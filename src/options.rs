use crate::{ClassModel, VerificationError, VerifyError};

/// What happens when a class cannot be verified with its stack map tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailoverMode {
    /// Hands classes older than version 50, and version 50 classes that fail, to the
    /// [`LegacyVerifier`].
    #[default]
    Legacy,
    /// Reports failures of version 50 classes as they are. Classes older than version 50
    /// carry no stack maps and are still delegated.
    Never,
}

/// Settings for a [`Verifier`](crate::Verifier).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifierOptions {
    pub failover: FailoverMode,
    /// Skips the core classes the virtual machine trusts without verification.
    pub skip_bootstrap_classes: bool,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            failover: FailoverMode::Legacy,
            skip_bootstrap_classes: true,
        }
    }
}

impl VerifierOptions {
    pub fn failover(mut self, failover: FailoverMode) -> Self {
        self.failover = failover;
        self
    }

    pub fn skip_bootstrap_classes(mut self, skip: bool) -> Self {
        self.skip_bootstrap_classes = skip;
        self
    }
}

/// A type inference verifier for classes without stack map tables.
pub trait LegacyVerifier: Send + Sync {
    /// Verifies `class`, returning every failure found.
    fn verify(&self, class: &ClassModel) -> Vec<VerifyError>;
}

/// Rejects every class it is handed.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnsupportedLegacyVerifier;

impl LegacyVerifier for UnsupportedLegacyVerifier {
    fn verify(&self, class: &ClassModel) -> Vec<VerifyError> {
        vec![VerifyError::new(
            &class.this_class,
            None,
            None,
            VerificationError::InferenceNotSupported,
        )]
    }
}
