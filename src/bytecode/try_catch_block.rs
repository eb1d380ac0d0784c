use super::VerificationType;
use crate::{
    constant_pool::ConstantPoolExt, hierarchy::JAVA_LANG_THROWABLE, VerifyResult,
};
use ristretto_classfile::ConstantPool;
use std::ops::Range;

/// An entry of a method's exception table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryCatchBlock {
    range_pc: Range<u16>,
    handler_pc: u16,
    catch_type: u16,
}

impl TryCatchBlock {
    /// Creates a new [`TryCatchBlock`] covering `range_pc`.
    ///
    /// A `catch_type` of zero catches every exception.
    pub fn new(range_pc: Range<u16>, handler_pc: u16, catch_type: u16) -> Self {
        Self {
            range_pc,
            handler_pc,
            catch_type,
        }
    }

    /// Returns the start PC of this try-catch block.
    pub fn start_pc(&self) -> u16 {
        self.range_pc.start
    }

    /// Returns the end PC (exclusive) of this try-catch block.
    pub fn end_pc(&self) -> u16 {
        self.range_pc.end
    }

    /// Returns the handler PC of this try-catch block.
    pub fn handler_pc(&self) -> u16 {
        self.handler_pc
    }

    /// Returns the constant pool index of the caught class, zero for catch-all handlers.
    pub fn catch_type_index(&self) -> u16 {
        self.catch_type
    }

    /// Returns `true` if the given instruction offset is covered by this try-catch block.
    pub fn covers(&self, bci: u16) -> bool {
        self.range_pc.contains(&bci)
    }

    /// Returns the Throwable subclass type that is caught by this try-catch block.
    ///
    /// # Errors
    /// If the catch type does not name a `Class` entry.
    pub(crate) fn catch_type(&self, pool: &ConstantPool) -> VerifyResult<VerificationType> {
        match self.catch_type {
            0 => Ok(VerificationType::reference(JAVA_LANG_THROWABLE)),
            index => Ok(VerificationType::reference(pool.class_name_at(index)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_type() -> ristretto_classfile::Result<()> {
        let mut pool = ConstantPool::default();
        let exception = pool.add_class("java/io/IOException")?;
        let utf8 = pool.add_utf8("not a class")?;

        let block = TryCatchBlock::new(2..8, 10, exception);
        assert!(block.covers(2));
        assert!(block.covers(7));
        assert!(!block.covers(8));
        assert_eq!(block.end_pc(), 8);
        assert_eq!(
            block.catch_type(&pool),
            Ok(VerificationType::reference("java/io/IOException"))
        );

        let catch_all = TryCatchBlock::new(0..4, 4, 0);
        assert_eq!(
            catch_all.catch_type(&pool),
            Ok(VerificationType::reference(JAVA_LANG_THROWABLE))
        );

        let malformed = TryCatchBlock::new(0..4, 4, utf8);
        assert!(malformed.catch_type(&pool).is_err());
        Ok(())
    }
}
