use super::{
    opcodes::*, BytecodeStream, CodeData, FrameFlags, StackMapTable, VerificationFrame,
    VerificationType,
};
use crate::{
    hierarchy::{Hierarchy, JAVA_LANG_THROWABLE},
    ClassModel, Code, Method, VerificationError, VerifyError, VerifyResult,
};
use log::trace;
use std::ops::Range;

/// How control leaves an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ControlFlowOutcome {
    /// Execution continues with the next instruction.
    Continue,
    /// Execution continues, and the instruction initialized the constructor receiver.
    InitializedThis,
    /// Execution jumps unconditionally (`goto`, switches).
    Jump,
    /// Execution halts and the exception handler runs.
    Throw,
    /// Execution ends and returns from the current method.
    Return,
}

impl ControlFlowOutcome {
    /// Returns `true` if the next instruction may be reached by falling through.
    pub(crate) fn falls_through(self) -> bool {
        matches!(
            self,
            ControlFlowOutcome::Continue | ControlFlowOutcome::InitializedThis
        )
    }
}

/// Verifies one method body against its stack map table.
///
/// Methods without code have nothing to verify.
pub(crate) fn verify_method(
    class: &ClassModel,
    method: &Method,
    hierarchy: &Hierarchy,
) -> Result<(), VerifyError> {
    let Some(code) = &method.code else {
        return Ok(());
    };
    let error =
        |bci, cause| VerifyError::new(&class.this_class, Some(method.to_string()), bci, cause);

    let (mut verifier, frame) =
        MethodVerifier::new(class, method, code, hierarchy).map_err(|cause| error(None, cause))?;
    let result = verifier.verify(frame);
    result.map_err(|cause| error(verifier.bci, cause))
}

/// The state shared by every instruction of one method.
pub(crate) struct MethodVerifier<'a> {
    pub(super) class: &'a ClassModel,
    pub(super) method: &'a Method,
    pub(super) code: &'a Code,
    pub(super) hierarchy: &'a Hierarchy<'a>,
    pub(super) this_type: VerificationType,
    pub(super) return_type: VerificationType,
    pub(super) code_data: CodeData,
    pub(super) stackmap: StackMapTable,
    /// From the lowest `start_pc` to the highest `end_pc` of the exception table.
    pub(super) try_range: Range<u16>,
    /// The instruction being verified.
    bci: Option<u16>,
}

impl<'a> MethodVerifier<'a> {
    /// Runs the checks that precede the instruction walk, and returns the verifier with the
    /// method's entry frame.
    fn new(
        class: &'a ClassModel,
        method: &'a Method,
        code: &'a Code,
        hierarchy: &'a Hierarchy<'a>,
    ) -> VerifyResult<(Self, VerificationFrame)> {
        if code.code.is_empty() || code.code.len() > usize::from(u16::MAX) {
            return Err(VerificationError::InvalidCodeLength(code.code.len()));
        }
        let this_type = VerificationType::reference(class.this_class.as_str());
        let mut frame = VerificationFrame::new(code.max_locals, code.max_stack);
        let return_type = frame.set_locals_from_descriptor(method, &this_type)?;
        let code_data = CodeData::new(&code.code)?;

        let mut verifier = Self {
            class,
            method,
            code,
            hierarchy,
            this_type,
            return_type,
            code_data,
            stackmap: StackMapTable::default(),
            try_range: 0..0,
            bci: None,
        };
        verifier.try_range = verifier.verify_exception_handler_table()?;
        verifier.verify_local_variable_table()?;
        verifier.stackmap = StackMapTable::decode(
            code.stack_map_table.as_deref(),
            &frame,
            &verifier.code_data,
            &class.constant_pool,
        )?;
        Ok((verifier, frame))
    }

    /// Walks every instruction in order, carrying `frame` from one to the next.
    fn verify(&mut self, mut frame: VerificationFrame) -> VerifyResult<()> {
        let code = self.code;
        let mut stream = BytecodeStream::new(&code.code);
        let mut stackmap_index = 0;
        let mut no_control_flow = false;

        loop {
            let opcode = match stream.next_opcode() {
                Ok(Some(opcode)) => opcode,
                Ok(None) => break,
                Err(error) => {
                    self.bci = Some(stream.bci() as u16);
                    return Err(error);
                }
            };
            let bci = stream.bci() as u16;
            self.bci = Some(bci);
            frame.set_offset(bci);
            stackmap_index = self.verify_stackmap_table(stackmap_index, &mut frame, no_control_flow)?;
            trace!("{frame} opcode: {opcode:#04x}");

            if stream.is_wide() && !matches!(opcode, ILOAD..=ALOAD | ISTORE..=ASTORE | IINC) {
                return Err(VerificationError::BadWideInstruction);
            }

            // A store cannot complete abruptly after writing its local.
            let in_try_block = self.try_range.contains(&bci);
            let mut verified_handlers = false;
            if in_try_block && is_store_into_local(opcode) {
                self.verify_exception_handler_targets(bci, false, &frame)?;
                verified_handlers = true;
            }

            let outcome = self.simulate_execution(&mut frame, &stream)?;
            no_control_flow = !outcome.falls_through();

            if in_try_block && !verified_handlers {
                let this_uninit = outcome == ControlFlowOutcome::InitializedThis;
                self.verify_exception_handler_targets(bci, this_uninit, &frame)?;
            }
        }

        if !no_control_flow {
            return Err(VerificationError::FallsThroughCodeEnd);
        }
        Ok(())
    }

    /// Matches `frame` against the stack map frame recorded for the current instruction,
    /// if any, and returns the index of the next recorded frame.
    fn verify_stackmap_table(
        &self,
        index: usize,
        frame: &mut VerificationFrame,
        no_control_flow: bool,
    ) -> VerifyResult<usize> {
        let bci = frame.offset();
        let Some(offset) = self.stackmap.offset(index) else {
            if no_control_flow {
                return Err(VerificationError::ExpectingStackMapFrame);
            }
            return Ok(index);
        };

        if no_control_flow && offset > bci {
            return Err(VerificationError::ExpectingStackMapFrame);
        }
        if offset == bci {
            // After an unconditional transfer the recorded frame is adopted as is.
            let matches =
                self.stackmap
                    .match_stackmap_at(frame, index, !no_control_flow, true, self.hierarchy)?;
            if !matches {
                return Err(VerificationError::StackMapMismatch);
            }
            return Ok(index + 1);
        }
        if offset < bci {
            return Err(VerificationError::BadStackMapOffset(offset));
        }
        Ok(index)
    }

    /// Checks the exception table entries, and returns the range of code they cover.
    fn verify_exception_handler_table(&self) -> VerifyResult<Range<u16>> {
        let code_length = self.code.code.len();
        let mut min = u16::MAX;
        let mut max = 0;
        for handler in &self.code.exception_table {
            let start_pc = handler.start_pc();
            let end_pc = handler.end_pc();
            let handler_pc = handler.handler_pc();
            if !self.code_data.is_instruction_start(i64::from(start_pc)) {
                return Err(VerificationError::IllegalExceptionTableStart(start_pc));
            }
            if usize::from(end_pc) != code_length
                && !self.code_data.is_instruction_start(i64::from(end_pc))
            {
                return Err(VerificationError::IllegalExceptionTableEnd(end_pc));
            }
            if !self.code_data.is_instruction_start(i64::from(handler_pc)) {
                return Err(VerificationError::IllegalExceptionTableHandler(handler_pc));
            }
            if handler.catch_type_index() != 0 {
                let catch_type = handler.catch_type(&self.class.constant_pool)?;
                let throwable = VerificationType::reference(JAVA_LANG_THROWABLE);
                if !throwable.is_assignable_from(&catch_type, self.hierarchy)? {
                    return Err(VerificationError::CatchTypeNotThrowable(handler_pc));
                }
            }
            min = min.min(start_pc);
            max = max.max(end_pc);
        }

        if min < max {
            Ok(min..max)
        } else {
            Ok(0..0)
        }
    }

    /// Checks that every local variable table entry spans whole instructions.
    fn verify_local_variable_table(&self) -> VerifyResult<()> {
        let code_length = self.code.code.len();
        for variable in &self.code.local_variable_table {
            let start_pc = variable.start_pc;
            if !self.code_data.is_instruction_start(i64::from(start_pc)) {
                return Err(VerificationError::IllegalLocalVariableStart(start_pc));
            }
            let end_pc = usize::from(start_pc) + usize::from(variable.length);
            if end_pc != code_length && !self.code_data.is_instruction_start(end_pc as i64) {
                return Err(VerificationError::IllegalLocalVariableLength(variable.length));
            }
        }
        Ok(())
    }

    /// Matches the frame seen by every exception handler covering `bci`: the locals of
    /// `frame` and the caught exception on the stack.
    pub(super) fn verify_exception_handler_targets(
        &self,
        bci: u16,
        this_uninit: bool,
        frame: &VerificationFrame,
    ) -> VerifyResult<()> {
        let mut flags = frame.flags();
        if this_uninit {
            flags.insert(FrameFlags::THIS_UNINIT);
        }
        for handler in self
            .code
            .exception_table
            .iter()
            .filter(|handler| handler.covers(bci))
        {
            let mut handler_frame = frame.frame_in_exception_handler(flags);
            handler_frame.push(handler.catch_type(&self.class.constant_pool)?)?;
            let target = i32::from(handler.handler_pc());
            let matches =
                self.stackmap
                    .match_stackmap(&mut handler_frame, target, true, false, self.hierarchy)?;
            if !matches {
                return Err(VerificationError::HandlerStackMapMismatch(handler.handler_pc()));
            }
        }
        Ok(())
    }

    /// Returns `true` if every path from `start` ends in `athrow`.
    ///
    /// Returns, subroutines and falling off the end of the code count as normal
    /// completion. A path that loops back onto code already walked cannot complete.
    pub(super) fn ends_in_athrow(&self, start: u16) -> VerifyResult<bool> {
        let code = &self.code.code;
        let mut visited = vec![false; code.len()];
        let mut pending = vec![start];

        while let Some(start) = pending.pop() {
            let mut stream = BytecodeStream::at(code, start);
            loop {
                let Some(opcode) = stream.next_opcode()? else {
                    return Ok(false);
                };
                if std::mem::replace(&mut visited[stream.bci()], true) {
                    break;
                }
                match opcode {
                    ATHROW => break,
                    IRETURN..=RETURN | JSR | JSR_W | RET => return Ok(false),
                    GOTO | GOTO_W => {
                        let target = if opcode == GOTO {
                            stream.dest()
                        } else {
                            stream.dest_w()
                        };
                        let Some(target) = self.instruction_at(target) else {
                            return Ok(false);
                        };
                        pending.push(target);
                        break;
                    }
                    IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL => {
                        let Some(target) = self.instruction_at(stream.dest()) else {
                            return Ok(false);
                        };
                        pending.push(target);
                    }
                    TABLESWITCH | LOOKUPSWITCH => {
                        for target in stream.switch_targets() {
                            let Some(target) = self.instruction_at(target) else {
                                return Ok(false);
                            };
                            pending.push(target);
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }
        Ok(true)
    }

    fn instruction_at(&self, target: i32) -> Option<u16> {
        if self.code_data.is_instruction_start(i64::from(target)) {
            u16::try_from(target).ok()
        } else {
            None
        }
    }
}
