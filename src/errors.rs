use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub(crate) type VerifyResult<T, E = VerificationError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// An error occurred while parsing a method descriptor.
    #[error("Invalid method descriptor: {0}")]
    InvalidMethodDescriptor(String),
    /// An error occurred while looking for a method.
    #[error("No such method: {0}")]
    NoSuchMethod(String),
    /// The `Code` attribute of a method could not be decoded.
    #[error("Invalid code attribute in method {0}")]
    InvalidCodeAttribute(String),
    /// The raw class file bytes could not be walked.
    #[error("Invalid class file: {0}")]
    InvalidClassFile(String),
    /// An error occurred in [`ristretto_classfile`].
    #[error("{0}")]
    Ristretto(#[from] ristretto_classfile::Error),
}

/// The cause of a failed method verification.
///
/// Messages follow the wording used by the virtual machine's own verifier so diagnostics
/// can be compared directly against `java.lang.VerifyError` output.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum VerificationError {
    /// Pushing a value would exceed the method's `max_stack`.
    #[error("Operand stack overflow")]
    StackOverflow,
    /// Popping from an empty operand stack.
    #[error("Operand stack underflow")]
    StackUnderflow,
    /// The value on top of the operand stack is not assignable to the expected type.
    #[error("Bad type on operand stack: expected {expected}, found {actual}")]
    BadTypeOnStack { expected: String, actual: String },
    /// A local variable index is out of the method's `max_locals` range.
    #[error("Local variable table overflow at index {0}")]
    LocalsOverflow(u16),
    /// A local variable does not hold the expected type.
    #[error("Bad local variable type at index {index}: expected {expected}, found {actual}")]
    BadLocalType {
        index: u16,
        expected: String,
        actual: String,
    },
    /// The method receiver and parameters need more slots than `max_locals`.
    #[error("Insufficient max locals for method arguments")]
    InsufficientMaxLocals,
    /// An array instruction was applied to a value of the wrong array kind.
    #[error("Bad type")]
    BadType,
    /// Execution cannot fall through, and no stack map frame describes the next instruction.
    #[error("Expecting a stack map frame")]
    ExpectingStackMapFrame,
    /// A branch or handler target has no stack map frame.
    #[error("Expecting a stack map frame at branch target {0}")]
    ExpectingStackMapFrameAtTarget(i32),
    /// The frame at a branch is not assignable to the frame recorded for its target.
    #[error("Inconsistent stack map frames at branch target {0}")]
    InconsistentStackMapFrames(i32),
    /// The frame reaching an instruction by fallthrough does not match its stack map frame.
    #[error("Instruction type does not match stack map")]
    StackMapMismatch,
    /// The frame entering an exception handler does not match its stack map frame.
    #[error("Stack map does not match the one at exception handler {0}")]
    HandlerStackMapMismatch(u16),
    /// The last instruction of the method can fall through.
    #[error("Control flow falls through code end")]
    FallsThroughCodeEnd,
    /// `wide` was applied to an instruction that cannot be widened.
    #[error("Bad wide instruction")]
    BadWideInstruction,
    /// A recognized opcode that this verifier does not accept (`jsr`, `ret`, ...).
    #[error("Bad instruction: {0:02x}")]
    BadInstruction(u8),
    /// The method descriptor is malformed.
    #[error("Invalid method signature: {0}")]
    InvalidMethodSignature(String),
    /// A field descriptor is malformed.
    #[error("Invalid field signature: {0}")]
    InvalidFieldSignature(String),
    /// The type of a dynamic constant is malformed.
    #[error("Invalid type for dynamic constant: {0}")]
    InvalidDynamicConstantType(String),
    /// The constant pool entry has a type the instruction does not accept.
    #[error("Illegal type at constant pool entry {0}")]
    IllegalConstantPoolType(u16),
    /// The constant pool entry referenced by `ldc` cannot be loaded.
    #[error("Invalid index in ldc")]
    InvalidLdcIndex,
    /// A field instruction refers to something that is not a class.
    #[error("Expecting reference to class in class {class_name} at constant pool index {index}")]
    ExpectingClassReference { class_name: String, index: u16 },
    /// `putfield` on a value that is not assignable to the field's class.
    #[error("Bad type on operand stack in putfield")]
    BadPutfieldOperand,
    /// `<init>` invoked on the uninitialized receiver with an unrelated class.
    #[error("Bad <init> method call")]
    BadInitCall,
    /// `this()`/`super()` inside a try block whose handlers may return normally.
    #[error("Bad <init> method call from after the start of a try block")]
    InitInTryBlock,
    /// The uninitialized value does not originate from a `new` instruction.
    #[error("Expecting new instruction")]
    ExpectingNewInstruction,
    /// `<init>` of a class other than the one created by the matching `new`.
    #[error("Call to wrong <init> method")]
    WrongInitMethod,
    /// `<init>` invoked on an initialized value.
    #[error("Bad operand type when invoking <init>")]
    BadInitOperand,
    /// The count operand of `invokeinterface` does not match the descriptor.
    #[error("Inconsistent args count operand in invokeinterface")]
    InconsistentInterfaceArgsCount,
    /// The fourth operand byte of `invokeinterface` is not zero.
    #[error("Fourth operand byte of invokeinterface must be zero")]
    NonZeroInvokeInterfaceByte,
    /// The trailing operand bytes of `invokedynamic` are not zero.
    #[error("Third and fourth operand bytes of invokedynamic must be zero")]
    NonZeroInvokeDynamicBytes,
    /// A method whose name starts with `<` was invoked by something other than `invokespecial <init>`.
    #[error("Illegal call to internal method")]
    IllegalInternalMethodCall,
    /// `invokespecial` of a class the current class does not extend.
    #[error("Bad invokespecial instruction: current class isn't assignable to reference class.")]
    BadInvokeSpecial,
    /// `invokespecial` of an interface method that is not a direct superinterface.
    #[error("Bad invokespecial instruction: interface method reference is in an indirect superinterface.")]
    IndirectInterfaceInvokeSpecial,
    /// A constructor descriptor with a non-void return type.
    #[error("Return type must be void in <init> method")]
    InitMustReturnVoid,
    /// `new` of an array class.
    #[error("Illegal new instruction")]
    IllegalNew,
    /// `newarray` with an unknown primitive type code.
    #[error("Illegal newarray instruction")]
    IllegalNewArray,
    /// `anewarray` would create an array with more than 255 dimensions.
    #[error("Illegal anewarray instruction, array has more than 255 dimensions")]
    TooManyArrayDimensions,
    /// `multianewarray` of something that is not an array class.
    #[error("Illegal constant pool index in multianewarray instruction")]
    IllegalMultiNewArrayIndex,
    /// `multianewarray` with more dimensions than the array class has.
    #[error("Illegal dimension in multianewarray instruction: {0}")]
    IllegalMultiNewArrayDimension(u8),
    /// A value-returning instruction in a method that should not return a value.
    #[error("Method does not expect a return value")]
    UnexpectedReturnValue,
    /// `return` in a method that should return a value.
    #[error("Method expects a return value")]
    ExpectedReturnValue,
    /// The returned value is not assignable to the declared return type.
    #[error("Bad return type")]
    BadReturnType,
    /// A constructor returned without calling `this()` or `super()`.
    #[error("Constructor must call super() or this() before return")]
    ConstructorMustCallSuper,
    /// A switch instruction has non-zero alignment padding.
    #[error("Nonzero padding byte in lookupswitch or tableswitch")]
    NonZeroSwitchPadding,
    /// `tableswitch` with `low > high`.
    #[error("low must be less than or equal to high in tableswitch")]
    TableSwitchBounds,
    /// `tableswitch` whose key count overflows.
    #[error("too many keys in tableswitch")]
    TooManySwitchKeys,
    /// `lookupswitch` with a negative pair count.
    #[error("number of keys in lookupswitch less than 0")]
    NegativeLookupSwitchCount,
    /// `lookupswitch` keys are not strictly increasing.
    #[error("Bad lookupswitch instruction")]
    UnsortedLookupSwitch,
    /// A catch type that does not extend `java/lang/Throwable`.
    #[error("Catch type is not a subclass of Throwable in exception handler {0}")]
    CatchTypeNotThrowable(u16),
    /// A class could not be found by the hierarchy resolver.
    #[error("Unable to resolve class {0}")]
    UnresolvedClass(String),
    /// The superclass chain of a class did not terminate.
    #[error("Class hierarchy depth limit reached while resolving {0}")]
    HierarchyDepthLimitReached(String),
    /// The legacy (inference) verifier is not available.
    #[error("Inference verification is not supported")]
    InferenceNotSupported,
    /// Verification of the method panicked.
    #[error("Internal verifier failure: {0}")]
    Internal(String),

    // Structural (class format) errors.
    /// The code array is empty or longer than 65535 bytes.
    #[error("Invalid method Code length {0}")]
    InvalidCodeLength(usize),
    /// The code array contains an unknown or truncated instruction.
    #[error("Bad instruction at offset {0}")]
    IllegalInstruction(u16),
    /// A constant pool index that does not refer to a usable entry.
    #[error("Illegal constant pool index {0}")]
    IllegalConstantPoolIndex(u16),
    /// An exception table `start_pc` that is not an instruction boundary.
    #[error("Illegal exception table start_pc {0}")]
    IllegalExceptionTableStart(u16),
    /// An exception table `end_pc` that is not an instruction boundary or the code length.
    #[error("Illegal exception table end_pc {0}")]
    IllegalExceptionTableEnd(u16),
    /// An exception table `handler_pc` that is not an instruction boundary.
    #[error("Illegal exception table handler_pc {0}")]
    IllegalExceptionTableHandler(u16),
    /// A local variable table entry starting outside an instruction boundary.
    #[error("Illegal local variable table start_pc {0}")]
    IllegalLocalVariableStart(u16),
    /// A local variable table entry ending outside an instruction boundary.
    #[error("Illegal local variable table length {0}")]
    IllegalLocalVariableLength(u16),
    /// The next stack map frame lies before the current instruction.
    #[error("Bad stack map offset {0}")]
    BadStackMapOffset(u16),
    /// The `StackMapTable` attribute could not be decoded.
    #[error("StackMapTable format error: {0}")]
    StackMapFormat(String),
    /// `invokedynamic` in a class file that predates it.
    #[error("invokedynamic instructions not supported by this class file version ({0})")]
    InvokeDynamicUnsupported(u16),
}

impl VerificationError {
    /// Returns `true` if the error describes malformed static data rather than a
    /// type or stack safety violation.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            VerificationError::InvalidCodeLength(_)
                | VerificationError::IllegalInstruction(_)
                | VerificationError::IllegalConstantPoolIndex(_)
                | VerificationError::IllegalExceptionTableStart(_)
                | VerificationError::IllegalExceptionTableEnd(_)
                | VerificationError::IllegalExceptionTableHandler(_)
                | VerificationError::IllegalLocalVariableStart(_)
                | VerificationError::IllegalLocalVariableLength(_)
                | VerificationError::BadStackMapOffset(_)
                | VerificationError::StackMapFormat(_)
                | VerificationError::InvokeDynamicUnsupported(_)
                | VerificationError::NonZeroSwitchPadding
                | VerificationError::TableSwitchBounds
                | VerificationError::TooManySwitchKeys
                | VerificationError::NegativeLookupSwitchCount
                | VerificationError::UnsortedLookupSwitch
        )
    }
}

/// The category of a reported [`VerifyError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyErrorKind {
    /// Malformed class data (`ClassFormatError` in the virtual machine).
    Structural,
    /// A type or stack safety violation (`VerifyError` in the virtual machine).
    TypeSafety,
}

/// A verification failure reported for a class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyError {
    /// Whether the failure is structural or a type safety violation.
    pub kind: VerifyErrorKind,
    /// The binary name of the verified class.
    pub class_name: String,
    /// The name and descriptor of the failing method, absent for class level failures.
    pub method: Option<String>,
    /// The offset of the failing instruction, absent for failures found before the
    /// instruction walk.
    pub bci: Option<u16>,
    /// What went wrong.
    pub cause: VerificationError,
}

impl VerifyError {
    pub(crate) fn new(
        class_name: &str,
        method: Option<String>,
        bci: Option<u16>,
        cause: VerificationError,
    ) -> Self {
        let kind = if cause.is_structural() {
            VerifyErrorKind::Structural
        } else {
            VerifyErrorKind::TypeSafety
        };
        Self {
            kind,
            class_name: class_name.to_string(),
            method,
            bci,
            cause,
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.cause, self.class_name)?;
        if let Some(method) = &self.method {
            write!(f, ".{method}")?;
        }
        if let Some(bci) = self.bci {
            write!(f, " @{bci}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VerifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_errors_keep_offset() {
        let error = VerifyError::new(
            "Foo",
            Some("bar()V".into()),
            Some(3),
            VerificationError::BadStackMapOffset(2),
        );
        assert_eq!(error.kind, VerifyErrorKind::Structural);
        assert_eq!(error.bci, Some(3));
        assert_eq!(error.to_string(), "Bad stack map offset 2 at Foo.bar()V @3");

        let error = VerifyError::new(
            "Foo",
            Some("bar()V".into()),
            None,
            VerificationError::InvalidCodeLength(0),
        );
        assert_eq!(error.kind, VerifyErrorKind::Structural);
        assert_eq!(error.to_string(), "Invalid method Code length 0 at Foo.bar()V");
    }

    #[test]
    fn test_switch_format_errors_are_structural() {
        for cause in [
            VerificationError::NonZeroSwitchPadding,
            VerificationError::TableSwitchBounds,
            VerificationError::TooManySwitchKeys,
            VerificationError::NegativeLookupSwitchCount,
            VerificationError::UnsortedLookupSwitch,
            VerificationError::IllegalConstantPoolIndex(9),
        ] {
            assert!(cause.is_structural(), "{cause:?}");
        }
        assert!(!VerificationError::IllegalConstantPoolType(9).is_structural());
        assert!(!VerificationError::FallsThroughCodeEnd.is_structural());
    }

    #[test]
    fn test_type_safety_error_display() {
        let error = VerifyError::new(
            "Foo",
            Some("<init>()V".into()),
            Some(4),
            VerificationError::ConstructorMustCallSuper,
        );
        assert_eq!(error.kind, VerifyErrorKind::TypeSafety);
        assert_eq!(
            error.to_string(),
            "Constructor must call super() or this() before return at Foo.<init>()V @4"
        );
    }

    #[test]
    fn test_class_level_error_display() {
        let error = VerifyError::new("Foo", None, None, VerificationError::InferenceNotSupported);
        assert_eq!(
            error.to_string(),
            "Inference verification is not supported at Foo"
        );
    }
}
