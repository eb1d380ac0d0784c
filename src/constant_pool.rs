use crate::{VerificationError, VerifyResult};
use bitflags::bitflags;
use ristretto_classfile::{Constant, ConstantPool};

pub(crate) const UTF8: u8 = 1;
pub(crate) const INTEGER: u8 = 3;
pub(crate) const FLOAT: u8 = 4;
pub(crate) const LONG: u8 = 5;
pub(crate) const DOUBLE: u8 = 6;
pub(crate) const CLASS: u8 = 7;
pub(crate) const STRING: u8 = 8;
pub(crate) const FIELD_REF: u8 = 9;
pub(crate) const METHOD_REF: u8 = 10;
pub(crate) const INTERFACE_METHOD_REF: u8 = 11;
pub(crate) const NAME_AND_TYPE: u8 = 12;
pub(crate) const METHOD_HANDLE: u8 = 15;
pub(crate) const METHOD_TYPE: u8 = 16;
pub(crate) const DYNAMIC: u8 = 17;
pub(crate) const INVOKE_DYNAMIC: u8 = 18;
pub(crate) const MODULE: u8 = 19;
pub(crate) const PACKAGE: u8 = 20;

bitflags! {
    /// A set of constant pool tags an instruction accepts.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct ConstantTypes: u32 {
        const INTEGER = 1 << INTEGER;
        const FLOAT = 1 << FLOAT;
        const LONG = 1 << LONG;
        const DOUBLE = 1 << DOUBLE;
        const CLASS = 1 << CLASS;
        const STRING = 1 << STRING;
        const FIELD_REF = 1 << FIELD_REF;
        const METHOD_REF = 1 << METHOD_REF;
        const INTERFACE_METHOD_REF = 1 << INTERFACE_METHOD_REF;
        const METHOD_HANDLE = 1 << METHOD_HANDLE;
        const METHOD_TYPE = 1 << METHOD_TYPE;
        const DYNAMIC = 1 << DYNAMIC;
        const INVOKE_DYNAMIC = 1 << INVOKE_DYNAMIC;
    }
}

impl ConstantTypes {
    /// Returns `true` if an entry with the given tag is accepted.
    pub(crate) fn accepts(self, tag: u8) -> bool {
        u32::from(tag) < u32::BITS && self.bits() & (1 << tag) != 0
    }
}

/// Read-only accessors the verifier needs on top of [`ConstantPool`].
///
/// All lookups report malformed indices as [`VerificationError::IllegalConstantPoolIndex`],
/// so callers never see a [`ristretto_classfile::Error`].
pub(crate) trait ConstantPoolExt {
    /// Returns the constant at `index`, if it is a usable entry.
    fn entry(&self, index: u16) -> VerifyResult<&Constant>;

    /// Returns the tag of the entry at `index`.
    fn tag_at(&self, index: u16) -> VerifyResult<u8> {
        Ok(constant_tag(self.entry(index)?))
    }

    /// Returns the UTF-8 string at `index`.
    fn utf8_at(&self, index: u16) -> VerifyResult<&str> {
        match self.entry(index)? {
            Constant::Utf8(value) => Ok(value.as_str()),
            _ => Err(VerificationError::IllegalConstantPoolType(index)),
        }
    }

    /// Returns the binary name of the `Class` entry at `index`.
    fn class_name_at(&self, index: u16) -> VerifyResult<&str> {
        match self.entry(index)? {
            Constant::Class(name_index) => self.utf8_at(*name_index),
            _ => Err(VerificationError::IllegalConstantPoolType(index)),
        }
    }

    /// Returns the `Class` index of the field or method reference at `index`.
    fn ref_class_index_at(&self, index: u16) -> VerifyResult<u16> {
        match self.entry(index)? {
            Constant::FieldRef { class_index, .. }
            | Constant::MethodRef { class_index, .. }
            | Constant::InterfaceMethodRef { class_index, .. } => Ok(*class_index),
            _ => Err(VerificationError::IllegalConstantPoolType(index)),
        }
    }

    /// Returns the `NameAndType` index of the reference or dynamic entry at `index`.
    fn name_and_type_index_at(&self, index: u16) -> VerifyResult<u16> {
        match self.entry(index)? {
            Constant::FieldRef {
                name_and_type_index,
                ..
            }
            | Constant::MethodRef {
                name_and_type_index,
                ..
            }
            | Constant::InterfaceMethodRef {
                name_and_type_index,
                ..
            }
            | Constant::Dynamic {
                name_and_type_index,
                ..
            }
            | Constant::InvokeDynamic {
                name_and_type_index,
                ..
            } => Ok(*name_and_type_index),
            _ => Err(VerificationError::IllegalConstantPoolType(index)),
        }
    }

    /// Returns the member name of the reference at `index`.
    fn ref_name_at(&self, index: u16) -> VerifyResult<&str> {
        let name_and_type_index = self.name_and_type_index_at(index)?;
        match self.entry(name_and_type_index)? {
            Constant::NameAndType { name_index, .. } => self.utf8_at(*name_index),
            _ => Err(VerificationError::IllegalConstantPoolType(name_and_type_index)),
        }
    }

    /// Returns the descriptor of the reference at `index`.
    fn ref_signature_at(&self, index: u16) -> VerifyResult<&str> {
        let name_and_type_index = self.name_and_type_index_at(index)?;
        match self.entry(name_and_type_index)? {
            Constant::NameAndType {
                descriptor_index, ..
            } => self.utf8_at(*descriptor_index),
            _ => Err(VerificationError::IllegalConstantPoolType(name_and_type_index)),
        }
    }

    /// Returns the field descriptor of the `Dynamic` entry at `index`.
    fn dynamic_constant_signature_at(&self, index: u16) -> VerifyResult<&str> {
        match self.entry(index)? {
            Constant::Dynamic { .. } => self.ref_signature_at(index),
            _ => Err(VerificationError::IllegalConstantPoolType(index)),
        }
    }
}

impl ConstantPoolExt for ConstantPool {
    fn entry(&self, index: u16) -> VerifyResult<&Constant> {
        // Index 0 and the upper halves of long and double entries are not usable.
        self.get(index)
            .ok_or(VerificationError::IllegalConstantPoolIndex(index))
    }
}

/// Returns the class file tag of a constant.
pub(crate) fn constant_tag(constant: &Constant) -> u8 {
    match constant {
        Constant::Utf8 { .. } => UTF8,
        Constant::Integer { .. } => INTEGER,
        Constant::Float { .. } => FLOAT,
        Constant::Long { .. } => LONG,
        Constant::Double { .. } => DOUBLE,
        Constant::Class { .. } => CLASS,
        Constant::String { .. } => STRING,
        Constant::FieldRef { .. } => FIELD_REF,
        Constant::MethodRef { .. } => METHOD_REF,
        Constant::InterfaceMethodRef { .. } => INTERFACE_METHOD_REF,
        Constant::NameAndType { .. } => NAME_AND_TYPE,
        Constant::MethodHandle { .. } => METHOD_HANDLE,
        Constant::MethodType { .. } => METHOD_TYPE,
        Constant::Dynamic { .. } => DYNAMIC,
        Constant::InvokeDynamic { .. } => INVOKE_DYNAMIC,
        Constant::Module { .. } => MODULE,
        Constant::Package { .. } => PACKAGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_accessors() -> ristretto_classfile::Result<()> {
        let mut pool = ConstantPool::default();
        let class_index = pool.add_class("pkg/Owner")?;
        let method_index = pool.add_method_ref(class_index, "run", "(IJ)V")?;
        let field_index = pool.add_field_ref(class_index, "count", "I")?;

        assert_eq!(pool.tag_at(class_index), Ok(CLASS));
        assert_eq!(pool.class_name_at(class_index), Ok("pkg/Owner"));
        assert_eq!(pool.tag_at(method_index), Ok(METHOD_REF));
        assert_eq!(pool.ref_class_index_at(method_index), Ok(class_index));
        assert_eq!(pool.ref_name_at(method_index), Ok("run"));
        assert_eq!(pool.ref_signature_at(method_index), Ok("(IJ)V"));
        assert_eq!(pool.tag_at(field_index), Ok(FIELD_REF));
        assert_eq!(pool.ref_name_at(field_index), Ok("count"));
        assert_eq!(pool.ref_signature_at(field_index), Ok("I"));
        Ok(())
    }

    #[test]
    fn test_invalid_indices() -> ristretto_classfile::Result<()> {
        let mut pool = ConstantPool::default();
        let string_index = pool.add_string("hello")?;

        assert_eq!(
            pool.tag_at(0),
            Err(VerificationError::IllegalConstantPoolIndex(0))
        );
        assert_eq!(
            pool.tag_at(500),
            Err(VerificationError::IllegalConstantPoolIndex(500))
        );
        assert_eq!(pool.tag_at(string_index), Ok(STRING));
        assert_eq!(
            pool.class_name_at(string_index),
            Err(VerificationError::IllegalConstantPoolType(string_index))
        );
        Ok(())
    }

    #[test]
    fn test_constant_types() {
        let ldc = ConstantTypes::INTEGER | ConstantTypes::FLOAT | ConstantTypes::STRING;
        assert!(ldc.accepts(INTEGER));
        assert!(ldc.accepts(STRING));
        assert!(!ldc.accepts(LONG));
        assert!(!ldc.accepts(UTF8));
        assert!(!ldc.accepts(200));
    }
}
