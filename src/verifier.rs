use crate::{
    bytecode::verify_method, hierarchy::Hierarchy, ClassHierarchyResolver, ClassModel,
    FailoverMode, LegacyVerifier, Method, UnsupportedLegacyVerifier, VerificationError,
    VerifierOptions, VerifyError,
};
use log::{debug, info};
use std::panic::{self, AssertUnwindSafe};

/// The first class file version that carries `StackMapTable` attributes.
const STACKMAP_ATTRIBUTE_MAJOR_VERSION: u16 = 50;
/// Classes below this version fall back to the legacy verifier when verification fails.
const NOFAILOVER_MAJOR_VERSION: u16 = 51;

/// Core classes the virtual machine loads before verification is possible.
const BOOTSTRAP_CLASSES: [&str; 4] = [
    "java/lang/Object",
    "java/lang/Class",
    "java/lang/String",
    "java/lang/Throwable",
];

/// Verifies every method of `class` with the default [`VerifierOptions`].
///
/// Returns an empty list if the class is type safe.
pub fn verify(class: &ClassModel, resolver: &dyn ClassHierarchyResolver) -> Vec<VerifyError> {
    Verifier::default().verify(class, resolver)
}

/// A configured class verifier.
pub struct Verifier {
    options: VerifierOptions,
    legacy: Box<dyn LegacyVerifier>,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(VerifierOptions::default())
    }
}

impl Verifier {
    pub fn new(options: VerifierOptions) -> Self {
        Self {
            options,
            legacy: Box::new(UnsupportedLegacyVerifier),
        }
    }

    /// Replaces the verifier used for classes without stack map tables.
    pub fn with_legacy_verifier<L: LegacyVerifier + 'static>(mut self, legacy: L) -> Self {
        self.legacy = Box::new(legacy);
        self
    }

    pub fn options(&self) -> &VerifierOptions {
        &self.options
    }

    /// Verifies every method of `class`, reporting the first failure of each method.
    pub fn verify(
        &self,
        class: &ClassModel,
        resolver: &dyn ClassHierarchyResolver,
    ) -> Vec<VerifyError> {
        if self.options.skip_bootstrap_classes
            && BOOTSTRAP_CLASSES.contains(&class.this_class.as_str())
        {
            debug!("Skipping bootstrap class {}", class.this_class);
            return Vec::new();
        }
        info!("Start class verification for {}", class.this_class);
        let errors = self.verify_class(class, resolver);
        info!(
            "End class verification for {} with {} error(s)",
            class.this_class,
            errors.len()
        );
        errors
    }

    fn verify_class(
        &self,
        class: &ClassModel,
        resolver: &dyn ClassHierarchyResolver,
    ) -> Vec<VerifyError> {
        if class.version < STACKMAP_ATTRIBUTE_MAJOR_VERSION {
            info!(
                "Class {} version {} has no stack maps, using the legacy verifier",
                class.this_class, class.version
            );
            return self.legacy.verify(class);
        }

        let hierarchy = Hierarchy::new(resolver, class);
        let errors: Vec<_> = class
            .methods
            .iter()
            .filter_map(|method| self.verify_method(class, method, &hierarchy).err())
            .collect();

        if !errors.is_empty()
            && class.version < NOFAILOVER_MAJOR_VERSION
            && self.options.failover == FailoverMode::Legacy
        {
            info!(
                "Fail over class verification to the legacy verifier for {}",
                class.this_class
            );
            return self.legacy.verify(class);
        }
        errors
    }

    fn verify_method(
        &self,
        class: &ClassModel,
        method: &Method,
        hierarchy: &Hierarchy,
    ) -> Result<(), VerifyError> {
        if method.is_skipped() {
            debug!("Skipping method {}.{method}", class.this_class);
            return Ok(());
        }
        debug!("Verifying method {}.{method}", class.this_class);
        panic::catch_unwind(AssertUnwindSafe(|| verify_method(class, method, hierarchy)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(VerifyError::new(
                    &class.this_class,
                    Some(method.to_string()),
                    None,
                    VerificationError::Internal(message),
                ))
            })
    }
}
