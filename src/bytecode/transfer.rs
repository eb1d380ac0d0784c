use super::{
    opcodes::*,
    verifier::{ControlFlowOutcome, MethodVerifier},
    BytecodeStream, VerificationFrame, VerificationType,
};
use crate::{
    constant_pool::{self, ConstantPoolExt, ConstantTypes},
    hierarchy::{JAVA_LANG_OBJECT, JAVA_LANG_THROWABLE},
    method::MAX_ARRAY_DIMENSIONS,
    Method, VerificationError, VerifyResult,
};
use VerificationType::{
    Category1Check, Category2Check, Double, Double2, Float, Integer, Long, Long2, Null,
    ReferenceCheck,
};

/// The first class file version with `invokedynamic`. Older versions also require zeroed
/// switch padding.
const INVOKEDYNAMIC_MAJOR_VERSION: u16 = 51;
/// The first class file version that allows `invokespecial` and `invokestatic` of
/// interface methods.
const STATIC_METHOD_IN_INTERFACE_MAJOR_VERSION: u16 = 52;

const JAVA_LANG_STRING: &str = "java/lang/String";
const JAVA_LANG_CLASS: &str = "java/lang/Class";
const JAVA_LANG_INVOKE_METHOD_HANDLE: &str = "java/lang/invoke/MethodHandle";
const JAVA_LANG_INVOKE_METHOD_TYPE: &str = "java/lang/invoke/MethodType";

/// Pops the listed types (the last one first), then pushes the results.
macro_rules! transfer {
    ($self:ident, $frame:ident, [$($input:ident),*] => [$($output:ident),*]) => {{
        $frame.pop_all(&[$($input),*], $self.hierarchy)?;
        $($frame.push($output)?;)*
        ControlFlowOutcome::Continue
    }};
}

/// Pops one value of each listed type, top of stack first.
macro_rules! pop {
    ($self:ident, $frame:ident, $($expected:expr),+) => {{
        $($frame.pop_expected(&$expected, $self.hierarchy)?;)+
    }};
}

/// The local variable operand of a load, store or `iinc`.
fn local_index(stream: &BytecodeStream) -> u16 {
    match stream.opcode() {
        opcode @ ILOAD_0..=ALOAD_3 => u16::from((opcode - ILOAD_0) % 4),
        opcode @ ISTORE_0..=ASTORE_3 => u16::from((opcode - ISTORE_0) % 4),
        _ => stream.index(),
    }
}

fn object_type() -> VerificationType {
    VerificationType::reference(JAVA_LANG_OBJECT)
}

impl MethodVerifier<'_> {
    /// Applies the effect of the current instruction of `stream` to `frame`.
    ///
    /// Branch targets are checked against the stack map table here; the caller handles the
    /// fallthrough frame and exception handlers.
    pub(super) fn simulate_execution(
        &self,
        frame: &mut VerificationFrame,
        stream: &BytecodeStream,
    ) -> VerifyResult<ControlFlowOutcome> {
        let hierarchy = self.hierarchy;
        let opcode = stream.opcode();
        let outcome = match opcode {
            NOP => ControlFlowOutcome::Continue,
            ACONST_NULL => transfer!(self, frame, [] => [Null]),
            ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH => transfer!(self, frame, [] => [Integer]),
            LCONST_0 | LCONST_1 => transfer!(self, frame, [] => [Long, Long2]),
            FCONST_0..=FCONST_2 => transfer!(self, frame, [] => [Float]),
            DCONST_0 | DCONST_1 => transfer!(self, frame, [] => [Double, Double2]),
            LDC => self.simulate_ldc(frame, opcode, u16::from(stream.index_u1()))?,
            LDC_W | LDC2_W => self.simulate_ldc(frame, opcode, stream.index_u2())?,

            ILOAD | ILOAD_0..=ILOAD_3 => {
                frame.get_local(local_index(stream), &Integer, hierarchy)?;
                transfer!(self, frame, [] => [Integer])
            }
            FLOAD | FLOAD_0..=FLOAD_3 => {
                frame.get_local(local_index(stream), &Float, hierarchy)?;
                transfer!(self, frame, [] => [Float])
            }
            LLOAD | LLOAD_0..=LLOAD_3 => {
                frame.get_local2(local_index(stream), &Long, &Long2, hierarchy)?;
                transfer!(self, frame, [] => [Long, Long2])
            }
            DLOAD | DLOAD_0..=DLOAD_3 => {
                frame.get_local2(local_index(stream), &Double, &Double2, hierarchy)?;
                transfer!(self, frame, [] => [Double, Double2])
            }
            ALOAD | ALOAD_0..=ALOAD_3 => {
                let value = frame.get_local(local_index(stream), &ReferenceCheck, hierarchy)?;
                frame.push(value)?;
                ControlFlowOutcome::Continue
            }

            IALOAD => self.simulate_array_load(frame, VerificationType::is_int_array, &[Integer])?,
            BALOAD => self.simulate_array_load(
                frame,
                |array| array.is_bool_array() || array.is_byte_array(),
                &[Integer],
            )?,
            CALOAD => {
                self.simulate_array_load(frame, VerificationType::is_char_array, &[Integer])?
            }
            SALOAD => {
                self.simulate_array_load(frame, VerificationType::is_short_array, &[Integer])?
            }
            LALOAD => {
                self.simulate_array_load(frame, VerificationType::is_long_array, &[Long, Long2])?
            }
            FALOAD => self.simulate_array_load(frame, VerificationType::is_float_array, &[Float])?,
            DALOAD => self.simulate_array_load(
                frame,
                VerificationType::is_double_array,
                &[Double, Double2],
            )?,
            AALOAD => {
                pop!(self, frame, Integer);
                let array = frame.pop_expected(&ReferenceCheck, hierarchy)?;
                if !array.is_reference_array() {
                    return Err(VerificationError::BadType);
                }
                let component = if array.is_null() {
                    Null
                } else {
                    array.component().ok_or(VerificationError::BadType)?
                };
                frame.push(component)?;
                ControlFlowOutcome::Continue
            }

            ISTORE | ISTORE_0..=ISTORE_3 => {
                pop!(self, frame, Integer);
                frame.set_local(local_index(stream), Integer)?;
                ControlFlowOutcome::Continue
            }
            FSTORE | FSTORE_0..=FSTORE_3 => {
                pop!(self, frame, Float);
                frame.set_local(local_index(stream), Float)?;
                ControlFlowOutcome::Continue
            }
            LSTORE | LSTORE_0..=LSTORE_3 => {
                frame.pop2(&Long2, &Long, hierarchy)?;
                frame.set_local2(local_index(stream), Long, Long2)?;
                ControlFlowOutcome::Continue
            }
            DSTORE | DSTORE_0..=DSTORE_3 => {
                frame.pop2(&Double2, &Double, hierarchy)?;
                frame.set_local2(local_index(stream), Double, Double2)?;
                ControlFlowOutcome::Continue
            }
            ASTORE | ASTORE_0..=ASTORE_3 => {
                let value = frame.pop_expected(&ReferenceCheck, hierarchy)?;
                frame.set_local(local_index(stream), value)?;
                ControlFlowOutcome::Continue
            }

            IASTORE => self.simulate_array_store(frame, &[Integer], VerificationType::is_int_array)?,
            BASTORE => self.simulate_array_store(frame, &[Integer], |array| {
                array.is_bool_array() || array.is_byte_array()
            })?,
            CASTORE => {
                self.simulate_array_store(frame, &[Integer], VerificationType::is_char_array)?
            }
            SASTORE => {
                self.simulate_array_store(frame, &[Integer], VerificationType::is_short_array)?
            }
            LASTORE => {
                self.simulate_array_store(frame, &[Long, Long2], VerificationType::is_long_array)?
            }
            FASTORE => {
                self.simulate_array_store(frame, &[Float], VerificationType::is_float_array)?
            }
            DASTORE => self.simulate_array_store(
                frame,
                &[Double, Double2],
                VerificationType::is_double_array,
            )?,
            AASTORE => self.simulate_array_store(
                frame,
                &[object_type()],
                VerificationType::is_reference_array,
            )?,

            POP => transfer!(self, frame, [Category1Check] => []),
            POP2 => {
                self.pop_pair(frame)?;
                ControlFlowOutcome::Continue
            }
            DUP => {
                let value = frame.pop_expected(&Category1Check, hierarchy)?;
                frame.push_all(&[value.clone(), value])?;
                ControlFlowOutcome::Continue
            }
            DUP_X1 => {
                let value = frame.pop_expected(&Category1Check, hierarchy)?;
                let value2 = frame.pop_expected(&Category1Check, hierarchy)?;
                frame.push_all(&[value.clone(), value2, value])?;
                ControlFlowOutcome::Continue
            }
            DUP_X2 => {
                let value = frame.pop_expected(&Category1Check, hierarchy)?;
                let (value2, value3) = self.pop_pair(frame)?;
                frame.push_all(&[value.clone(), value3, value2, value])?;
                ControlFlowOutcome::Continue
            }
            DUP2 => {
                let (value, value2) = self.pop_pair(frame)?;
                frame.push_all(&[value2.clone(), value.clone(), value2, value])?;
                ControlFlowOutcome::Continue
            }
            DUP2_X1 => {
                let (value, value2) = self.pop_pair(frame)?;
                let value3 = frame.pop_expected(&Category1Check, hierarchy)?;
                frame.push_all(&[value2.clone(), value.clone(), value3, value2, value])?;
                ControlFlowOutcome::Continue
            }
            DUP2_X2 => {
                let (value, value2) = self.pop_pair(frame)?;
                let (value3, value4) = self.pop_pair(frame)?;
                frame.push_all(&[value2.clone(), value.clone(), value4, value3, value2, value])?;
                ControlFlowOutcome::Continue
            }
            SWAP => {
                let value = frame.pop_expected(&Category1Check, hierarchy)?;
                let value2 = frame.pop_expected(&Category1Check, hierarchy)?;
                frame.push_all(&[value, value2])?;
                ControlFlowOutcome::Continue
            }

            IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => {
                transfer!(self, frame, [Integer, Integer] => [Integer])
            }
            INEG | I2B | I2C | I2S => transfer!(self, frame, [Integer] => [Integer]),
            LADD | LSUB | LMUL | LDIV | LREM | LAND | LOR | LXOR => {
                transfer!(self, frame, [Long, Long2, Long, Long2] => [Long, Long2])
            }
            LNEG => transfer!(self, frame, [Long, Long2] => [Long, Long2]),
            LSHL | LSHR | LUSHR => transfer!(self, frame, [Long, Long2, Integer] => [Long, Long2]),
            FADD | FSUB | FMUL | FDIV | FREM => transfer!(self, frame, [Float, Float] => [Float]),
            FNEG => transfer!(self, frame, [Float] => [Float]),
            DADD | DSUB | DMUL | DDIV | DREM => {
                transfer!(self, frame, [Double, Double2, Double, Double2] => [Double, Double2])
            }
            DNEG => transfer!(self, frame, [Double, Double2] => [Double, Double2]),
            IINC => {
                let index = local_index(stream);
                let value = frame.get_local(index, &Integer, hierarchy)?;
                frame.set_local(index, value)?;
                ControlFlowOutcome::Continue
            }

            I2L => transfer!(self, frame, [Integer] => [Long, Long2]),
            I2F => transfer!(self, frame, [Integer] => [Float]),
            I2D => transfer!(self, frame, [Integer] => [Double, Double2]),
            L2I => transfer!(self, frame, [Long, Long2] => [Integer]),
            L2F => transfer!(self, frame, [Long, Long2] => [Float]),
            L2D => transfer!(self, frame, [Long, Long2] => [Double, Double2]),
            F2I => transfer!(self, frame, [Float] => [Integer]),
            F2L => transfer!(self, frame, [Float] => [Long, Long2]),
            F2D => transfer!(self, frame, [Float] => [Double, Double2]),
            D2I => transfer!(self, frame, [Double, Double2] => [Integer]),
            D2L => transfer!(self, frame, [Double, Double2] => [Long, Long2]),
            D2F => transfer!(self, frame, [Double, Double2] => [Float]),
            LCMP => transfer!(self, frame, [Long, Long2, Long, Long2] => [Integer]),
            FCMPL | FCMPG => transfer!(self, frame, [Float, Float] => [Integer]),
            DCMPL | DCMPG => transfer!(self, frame, [Double, Double2, Double, Double2] => [Integer]),

            IFEQ..=IFLE => {
                pop!(self, frame, Integer);
                self.check_jump_target(frame, stream.dest())?;
                ControlFlowOutcome::Continue
            }
            IF_ICMPEQ..=IF_ICMPLE => {
                pop!(self, frame, Integer, Integer);
                self.check_jump_target(frame, stream.dest())?;
                ControlFlowOutcome::Continue
            }
            IF_ACMPEQ | IF_ACMPNE => {
                pop!(self, frame, ReferenceCheck, ReferenceCheck);
                self.check_jump_target(frame, stream.dest())?;
                ControlFlowOutcome::Continue
            }
            IFNULL | IFNONNULL => {
                pop!(self, frame, ReferenceCheck);
                self.check_jump_target(frame, stream.dest())?;
                ControlFlowOutcome::Continue
            }
            GOTO => {
                self.check_jump_target(frame, stream.dest())?;
                ControlFlowOutcome::Jump
            }
            GOTO_W => {
                self.check_jump_target(frame, stream.dest_w())?;
                ControlFlowOutcome::Jump
            }
            TABLESWITCH | LOOKUPSWITCH => self.simulate_switch(frame, stream)?,

            IRETURN => {
                let value = frame.pop_expected(&Integer, hierarchy)?;
                self.simulate_return_value(&value)?
            }
            FRETURN => {
                let value = frame.pop_expected(&Float, hierarchy)?;
                self.simulate_return_value(&value)?
            }
            LRETURN => {
                let value = frame.pop2(&Long2, &Long, hierarchy)?;
                self.simulate_return_value(&value)?
            }
            DRETURN => {
                let value = frame.pop2(&Double2, &Double, hierarchy)?;
                self.simulate_return_value(&value)?
            }
            ARETURN => {
                let value = frame.pop_expected(&ReferenceCheck, hierarchy)?;
                self.simulate_return_value(&value)?
            }
            RETURN => {
                if !self.return_type.is_bogus() {
                    return Err(VerificationError::ExpectedReturnValue);
                }
                if self.method.is_constructor() && frame.is_this_uninit() {
                    return Err(VerificationError::ConstructorMustCallSuper);
                }
                ControlFlowOutcome::Return
            }

            GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
                self.simulate_field_instruction(frame, stream)?
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE | INVOKEDYNAMIC => {
                self.simulate_invoke(frame, stream)?
            }

            NEW => {
                let index = stream.index_u2();
                let class_type = self.class_type_at(index)?;
                if !class_type.is_object() {
                    return Err(VerificationError::IllegalNew);
                }
                frame.push(VerificationType::Uninitialized(frame.offset()))?;
                ControlFlowOutcome::Continue
            }
            NEWARRAY => {
                let descriptor = match stream.index_u1() {
                    4 => "[Z",
                    5 => "[C",
                    6 => "[F",
                    7 => "[D",
                    8 => "[B",
                    9 => "[S",
                    10 => "[I",
                    11 => "[J",
                    _ => return Err(VerificationError::IllegalNewArray),
                };
                pop!(self, frame, Integer);
                frame.push(VerificationType::reference(descriptor))?;
                ControlFlowOutcome::Continue
            }
            ANEWARRAY => self.simulate_anewarray(frame, stream.index_u2())?,
            MULTIANEWARRAY => {
                let array_type = self.class_type_at(stream.index_u2())?;
                let dimensions = stream.byte_at(stream.bci() + 3);
                if !array_type.is_array() {
                    return Err(VerificationError::IllegalMultiNewArrayIndex);
                }
                if dimensions < 1 || array_type.dimensions() < usize::from(dimensions) {
                    return Err(VerificationError::IllegalMultiNewArrayDimension(dimensions));
                }
                for _ in 0..dimensions {
                    pop!(self, frame, Integer);
                }
                frame.push(array_type)?;
                ControlFlowOutcome::Continue
            }
            ARRAYLENGTH => {
                let array = frame.pop_expected(&ReferenceCheck, hierarchy)?;
                if !array.is_null() && !array.is_array() {
                    return Err(VerificationError::BadType);
                }
                transfer!(self, frame, [] => [Integer])
            }
            ATHROW => {
                pop!(self, frame, VerificationType::reference(JAVA_LANG_THROWABLE));
                ControlFlowOutcome::Throw
            }
            CHECKCAST => {
                let class_type = self.class_type_at(stream.index_u2())?;
                pop!(self, frame, object_type());
                frame.push(class_type)?;
                ControlFlowOutcome::Continue
            }
            INSTANCEOF => {
                self.class_type_at(stream.index_u2())?;
                pop!(self, frame, object_type());
                transfer!(self, frame, [] => [Integer])
            }
            MONITORENTER | MONITOREXIT => transfer!(self, frame, [ReferenceCheck] => []),

            // Subroutines are not allowed in class files with stack map tables.
            JSR | JSR_W | RET => return Err(VerificationError::BadInstruction(opcode)),
            _ => return Err(VerificationError::BadInstruction(opcode)),
        };
        Ok(outcome)
    }

    fn check_jump_target(&self, frame: &VerificationFrame, target: i32) -> VerifyResult<()> {
        self.stackmap
            .check_jump_target(frame, target, self.code.code.len(), self.hierarchy)
    }

    /// Checks that the entry at `index` has one of the accepted tags, and returns the tag.
    fn verify_cp_type(&self, index: u16, types: ConstantTypes) -> VerifyResult<u8> {
        let tag = self.class.constant_pool.tag_at(index)?;
        if !types.accepts(tag) {
            return Err(VerificationError::IllegalConstantPoolType(index));
        }
        Ok(tag)
    }

    /// Returns the type named by the `Class` entry at `index`.
    fn class_type_at(&self, index: u16) -> VerifyResult<VerificationType> {
        self.verify_cp_type(index, ConstantTypes::CLASS)?;
        let name = self.class.constant_pool.class_name_at(index)?;
        Ok(VerificationType::reference(name))
    }

    /// Pops two single slot values, or both slots of one category 2 value. The top slot is
    /// returned first.
    fn pop_pair(
        &self,
        frame: &mut VerificationFrame,
    ) -> VerifyResult<(VerificationType, VerificationType)> {
        let top = frame.pop()?;
        let next = if top.is_category1() {
            frame.pop_expected(&Category1Check, self.hierarchy)?
        } else if top.is_category2_2nd() {
            frame.pop_expected(&Category2Check, self.hierarchy)?
        } else {
            return Err(VerificationError::BadType);
        };
        Ok((top, next))
    }

    fn simulate_array_load(
        &self,
        frame: &mut VerificationFrame,
        is_array_kind: impl Fn(&VerificationType) -> bool,
        element: &[VerificationType],
    ) -> VerifyResult<ControlFlowOutcome> {
        pop!(self, frame, Integer);
        let array = frame.pop_expected(&ReferenceCheck, self.hierarchy)?;
        if !is_array_kind(&array) {
            return Err(VerificationError::BadType);
        }
        frame.push_all(element)?;
        Ok(ControlFlowOutcome::Continue)
    }

    fn simulate_array_store(
        &self,
        frame: &mut VerificationFrame,
        element: &[VerificationType],
        is_array_kind: impl Fn(&VerificationType) -> bool,
    ) -> VerifyResult<ControlFlowOutcome> {
        frame.pop_all(element, self.hierarchy)?;
        pop!(self, frame, Integer);
        let array = frame.pop_expected(&ReferenceCheck, self.hierarchy)?;
        if !is_array_kind(&array) {
            return Err(VerificationError::BadType);
        }
        Ok(ControlFlowOutcome::Continue)
    }

    fn simulate_return_value(&self, value: &VerificationType) -> VerifyResult<ControlFlowOutcome> {
        if self.return_type.is_bogus() {
            return Err(VerificationError::UnexpectedReturnValue);
        }
        if !self.return_type.is_assignable_from(value, self.hierarchy)? {
            return Err(VerificationError::BadReturnType);
        }
        Ok(ControlFlowOutcome::Return)
    }

    fn simulate_switch(
        &self,
        frame: &mut VerificationFrame,
        stream: &BytecodeStream,
    ) -> VerifyResult<ControlFlowOutcome> {
        let bci = stream.bci();
        let aligned = stream.aligned_bci();
        if self.class.version < INVOKEDYNAMIC_MAJOR_VERSION
            && (bci + 1..aligned).any(|position| stream.byte_at(position) != 0)
        {
            return Err(VerificationError::NonZeroSwitchPadding);
        }
        pop!(self, frame, Integer);

        if stream.opcode() == TABLESWITCH {
            let low = stream.int_at(aligned + 4);
            let high = stream.int_at(aligned + 8);
            if low > high {
                return Err(VerificationError::TableSwitchBounds);
            }
            if high.wrapping_sub(low).wrapping_add(1) < 0 {
                return Err(VerificationError::TooManySwitchKeys);
            }
        } else {
            let keys = stream.int_at(aligned + 4);
            if keys < 0 {
                return Err(VerificationError::NegativeLookupSwitchCount);
            }
            let keys = keys as usize;
            for pair in 1..keys {
                let key = stream.int_at(aligned + (2 * pair) * 4);
                let next_key = stream.int_at(aligned + (2 * pair + 2) * 4);
                if key >= next_key {
                    return Err(VerificationError::UnsortedLookupSwitch);
                }
            }
        }

        for target in stream.switch_targets() {
            self.check_jump_target(frame, target)?;
        }
        Ok(ControlFlowOutcome::Jump)
    }

    fn simulate_ldc(
        &self,
        frame: &mut VerificationFrame,
        opcode: u8,
        index: u16,
    ) -> VerifyResult<ControlFlowOutcome> {
        let pool = &self.class.constant_pool;
        let types = if opcode == LDC2_W {
            ConstantTypes::LONG | ConstantTypes::DOUBLE | ConstantTypes::DYNAMIC
        } else {
            ConstantTypes::INTEGER
                | ConstantTypes::FLOAT
                | ConstantTypes::STRING
                | ConstantTypes::CLASS
                | ConstantTypes::METHOD_HANDLE
                | ConstantTypes::METHOD_TYPE
                | ConstantTypes::DYNAMIC
        };
        let tag = self.verify_cp_type(index, types)?;

        match tag {
            constant_pool::STRING => frame.push(VerificationType::reference(JAVA_LANG_STRING))?,
            constant_pool::CLASS => frame.push(VerificationType::reference(JAVA_LANG_CLASS))?,
            constant_pool::INTEGER => frame.push(Integer)?,
            constant_pool::FLOAT => frame.push(Float)?,
            constant_pool::LONG => frame.push2(Long, Long2)?,
            constant_pool::DOUBLE => frame.push2(Double, Double2)?,
            constant_pool::METHOD_HANDLE => {
                frame.push(VerificationType::reference(JAVA_LANG_INVOKE_METHOD_HANDLE))?;
            }
            constant_pool::METHOD_TYPE => {
                frame.push(VerificationType::reference(JAVA_LANG_INVOKE_METHOD_TYPE))?;
            }
            constant_pool::DYNAMIC => {
                let signature = pool.dynamic_constant_signature_at(index)?;
                let field_type = Method::parse_field_descriptor(signature).map_err(|_| {
                    VerificationError::InvalidDynamicConstantType(signature.to_string())
                })?;
                let slots = VerificationType::slots_of(&field_type);
                let expected = if opcode == LDC2_W { 2 } else { 1 };
                if slots.len() != expected {
                    self.verify_cp_type(index, types - ConstantTypes::DYNAMIC)?;
                }
                frame.push_all(&slots)?;
            }
            _ => return Err(VerificationError::InvalidLdcIndex),
        }
        Ok(ControlFlowOutcome::Continue)
    }

    fn simulate_anewarray(
        &self,
        frame: &mut VerificationFrame,
        index: u16,
    ) -> VerifyResult<ControlFlowOutcome> {
        let component = self.class_type_at(index)?;
        pop!(self, frame, Integer);
        let Some(name) = component.name() else {
            return Err(VerificationError::IllegalConstantPoolType(index));
        };
        let descriptor = if component.is_array() {
            if name.len() > MAX_ARRAY_DIMENSIONS
                && name.as_bytes()[MAX_ARRAY_DIMENSIONS - 1] == b'['
            {
                return Err(VerificationError::TooManyArrayDimensions);
            }
            format!("[{name}")
        } else {
            format!("[L{name};")
        };
        frame.push(VerificationType::reference(descriptor))?;
        Ok(ControlFlowOutcome::Continue)
    }

    fn simulate_field_instruction(
        &self,
        frame: &mut VerificationFrame,
        stream: &BytecodeStream,
    ) -> VerifyResult<ControlFlowOutcome> {
        let pool = &self.class.constant_pool;
        let opcode = stream.opcode();
        let index = stream.index_u2();
        self.verify_cp_type(index, ConstantTypes::FIELD_REF)?;
        let field_name = pool.ref_name_at(index)?;
        let field_signature = pool.ref_signature_at(index)?;
        let field_type = Method::parse_field_descriptor(field_signature)
            .map_err(|_| VerificationError::InvalidFieldSignature(field_signature.to_string()))?;
        let field_slots = VerificationType::slots_of(&field_type);

        let target_type =
            VerificationType::reference(pool.class_name_at(pool.ref_class_index_at(index)?)?);
        let allow_arrays = matches!(opcode, GETSTATIC | PUTSTATIC);
        if !target_type.is_object() && !(allow_arrays && target_type.is_array()) {
            return Err(VerificationError::ExpectingClassReference {
                class_name: self.class.this_class.clone(),
                index,
            });
        }

        match opcode {
            GETSTATIC => frame.push_all(&field_slots)?,
            PUTSTATIC => frame.pop_all(&field_slots, self.hierarchy)?,
            GETFIELD => {
                frame.pop_expected(&target_type, self.hierarchy)?;
                frame.push_all(&field_slots)?;
            }
            _ => {
                frame.pop_all(&field_slots, self.hierarchy)?;
                let mut object = frame.pop()?;
                // A constructor may assign its own fields before calling super().
                if object.is_uninitialized_this()
                    && target_type == self.this_type
                    && self.class.has_field(field_name, field_signature)
                {
                    object = self.this_type.clone();
                }
                if !target_type.is_assignable_from(&object, self.hierarchy)? {
                    return Err(VerificationError::BadPutfieldOperand);
                }
            }
        }
        Ok(ControlFlowOutcome::Continue)
    }

    fn simulate_invoke(
        &self,
        frame: &mut VerificationFrame,
        stream: &BytecodeStream,
    ) -> VerifyResult<ControlFlowOutcome> {
        let pool = &self.class.constant_pool;
        let opcode = stream.opcode();
        let index = stream.index_u2();
        let version = self.class.version;
        let types = match opcode {
            INVOKEINTERFACE => ConstantTypes::INTERFACE_METHOD_REF,
            INVOKEDYNAMIC => ConstantTypes::INVOKE_DYNAMIC,
            INVOKESPECIAL | INVOKESTATIC if version >= STATIC_METHOD_IN_INTERFACE_MAJOR_VERSION => {
                ConstantTypes::METHOD_REF | ConstantTypes::INTERFACE_METHOD_REF
            }
            _ => ConstantTypes::METHOD_REF,
        };
        let tag = self.verify_cp_type(index, types)?;
        let method_name = pool.ref_name_at(index)?;
        let method_signature = pool.ref_signature_at(index)?;
        let (parameters, return_type) = Method::parse_descriptor(method_signature)
            .map_err(|_| VerificationError::InvalidMethodSignature(method_signature.to_string()))?;

        let ref_class_type = if opcode == INVOKEDYNAMIC {
            if version < INVOKEDYNAMIC_MAJOR_VERSION {
                return Err(VerificationError::InvokeDynamicUnsupported(version));
            }
            None
        } else {
            let class_name = pool.class_name_at(pool.ref_class_index_at(index)?)?;
            Some(VerificationType::reference(class_name))
        };

        let arguments: Vec<_> = parameters.iter().flat_map(VerificationType::slots_of).collect();
        let bci = stream.bci();
        match opcode {
            INVOKEINTERFACE => {
                if usize::from(stream.byte_at(bci + 3)) != arguments.len() + 1 {
                    return Err(VerificationError::InconsistentInterfaceArgsCount);
                }
                if stream.byte_at(bci + 4) != 0 {
                    return Err(VerificationError::NonZeroInvokeInterfaceByte);
                }
            }
            INVOKEDYNAMIC => {
                if stream.byte_at(bci + 3) != 0 || stream.byte_at(bci + 4) != 0 {
                    return Err(VerificationError::NonZeroInvokeDynamicBytes);
                }
            }
            _ => {}
        }

        let is_init = method_name == "<init>";
        if method_name.starts_with('<') {
            if opcode != INVOKESPECIAL || !is_init {
                return Err(VerificationError::IllegalInternalMethodCall);
            }
        } else if let (INVOKESPECIAL, Some(ref_class_type)) = (opcode, &ref_class_type) {
            if !self.is_same_or_direct_interface(ref_class_type)
                && !self.is_super_class(ref_class_type)
            {
                if !ref_class_type.is_assignable_from(&self.this_type, self.hierarchy)? {
                    return Err(VerificationError::BadInvokeSpecial);
                }
                if tag == constant_pool::INTERFACE_METHOD_REF {
                    return Err(VerificationError::IndirectInterfaceInvokeSpecial);
                }
            }
        }

        frame.pop_all(&arguments, self.hierarchy)?;
        let mut outcome = ControlFlowOutcome::Continue;
        if let Some(ref_class_type) = ref_class_type.filter(|_| opcode != INVOKESTATIC) {
            if is_init {
                outcome = self.verify_invoke_init(frame, &ref_class_type)?;
            } else if opcode == INVOKESPECIAL {
                frame.pop_expected(&self.this_type, self.hierarchy)?;
            } else {
                frame.pop_expected(&ref_class_type, self.hierarchy)?;
            }
        }

        if let Some(return_type) = return_type {
            if is_init {
                return Err(VerificationError::InitMustReturnVoid);
            }
            frame.push_all(&VerificationType::slots_of(&return_type))?;
        }
        Ok(outcome)
    }

    fn is_same_or_direct_interface(&self, ref_class_type: &VerificationType) -> bool {
        *ref_class_type == self.this_type
            || self
                .class
                .interfaces
                .iter()
                .any(|interface| ref_class_type.name() == Some(interface.as_str()))
    }

    fn is_super_class(&self, ref_class_type: &VerificationType) -> bool {
        self.class.super_class.is_some()
            && ref_class_type.name() == self.class.super_class.as_deref()
    }

    /// Checks a constructor call and marks its receiver initialized.
    fn verify_invoke_init(
        &self,
        frame: &mut VerificationFrame,
        ref_class_type: &VerificationType,
    ) -> VerifyResult<ControlFlowOutcome> {
        let bci = frame.offset();
        let in_try_block = self.try_range.contains(&bci);
        let receiver = frame.pop_expected(&ReferenceCheck, self.hierarchy)?;

        match &receiver {
            VerificationType::UninitializedThis => {
                let ref_name = ref_class_type.name();
                if ref_name != Some(self.class.this_class.as_str())
                    && ref_name != self.class.super_class.as_deref()
                {
                    return Err(VerificationError::BadInitCall);
                }
                if in_try_block {
                    // The receiver stays uninitialized if the call throws, and a handler
                    // must not be able to return with it.
                    let handlers = self.code.exception_table.iter();
                    for handler in handlers.filter(|handler| handler.covers(bci)) {
                        if !self.ends_in_athrow(handler.handler_pc())? {
                            return Err(VerificationError::InitInTryBlock);
                        }
                    }
                    self.verify_exception_handler_targets(bci, true, frame)?;
                }
                frame.initialize_object(&receiver, &self.this_type);
                Ok(ControlFlowOutcome::InitializedThis)
            }
            VerificationType::Uninitialized(new_offset) => {
                let code = &self.code.code;
                let start = usize::from(*new_offset);
                if start + 3 > code.len() || code[start] != NEW {
                    return Err(VerificationError::ExpectingNewInstruction);
                }
                let new_class_index = u16::from_be_bytes([code[start + 1], code[start + 2]]);
                let new_class_type = self.class_type_at(new_class_index)?;
                if new_class_type != *ref_class_type {
                    return Err(VerificationError::WrongInitMethod);
                }
                if in_try_block {
                    self.verify_exception_handler_targets(bci, false, frame)?;
                }
                frame.initialize_object(&receiver, &new_class_type);
                Ok(ControlFlowOutcome::Continue)
            }
            _ => Err(VerificationError::BadInitOperand),
        }
    }
}
