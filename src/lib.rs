//! A type-checking verifier for Java class files that carry `StackMapTable` attributes.
//!
//! [`verify`] checks every method of a [`ClassModel`] against its stack map frames and
//! returns the failures found. Subtype questions about classes other than the one being
//! verified are answered by a [`ClassHierarchyResolver`].
//!
//! A model is read from class file bytes with [`ClassModel::from_bytes`], or adapted from a
//! parsed [`ristretto_classfile::ClassFile`].

mod bytecode;
mod class;
mod constant_pool;
mod errors;
mod hierarchy;
mod method;
mod options;
#[cfg(test)]
mod testing;
mod verifier;

pub use bytecode::{opcodes, FrameFlags, TryCatchBlock, VerificationFrame, VerificationType};
pub use class::*;
pub use errors::*;
pub use hierarchy::{ClassHierarchy, ClassHierarchyInfo, ClassHierarchyResolver};
pub use method::*;
pub use options::*;
pub use verifier::*;
