use super::VerificationType;
use crate::{
    hierarchy::{Hierarchy, JAVA_LANG_OBJECT},
    Method, VerificationError, VerifyResult,
};
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Flags carried by a frame.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// The constructor receiver has not been initialized yet.
        const THIS_UNINIT = 0x01;
    }
}

/// The abstract machine state at one instruction: local variables and operand stack.
#[derive(Clone, Debug, PartialEq)]
pub struct VerificationFrame {
    offset: u16,
    /// The number of leading locals that are in use.
    locals_size: u16,
    max_locals: u16,
    max_stack: u16,
    flags: FrameFlags,
    /// Always `max_locals` entries long, unused slots are `Top`.
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

impl VerificationFrame {
    /// Creates an empty frame for a method with the given limits.
    pub fn new(max_locals: u16, max_stack: u16) -> Self {
        Self {
            offset: 0,
            locals_size: 0,
            max_locals,
            max_stack,
            flags: FrameFlags::empty(),
            locals: vec![VerificationType::Top; usize::from(max_locals)],
            stack: Vec::with_capacity(usize::from(max_stack)),
        }
    }

    /// Creates a frame from explicit contents, as described by a stack map entry.
    ///
    /// `locals` must not be longer than `max_locals`.
    pub(crate) fn with_contents(
        offset: u16,
        flags: FrameFlags,
        max_locals: u16,
        max_stack: u16,
        mut locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    ) -> Self {
        let locals_size = locals.len() as u16;
        locals.resize(usize::from(max_locals), VerificationType::Top);
        Self {
            offset,
            locals_size,
            max_locals,
            max_stack,
            flags,
            locals,
            stack,
        }
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: u16) {
        self.offset = offset;
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Returns `true` while the constructor receiver is uninitialized.
    pub fn is_this_uninit(&self) -> bool {
        self.flags.contains(FrameFlags::THIS_UNINIT)
    }

    pub fn locals_size(&self) -> u16 {
        self.locals_size
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    /// Returns the locals that are in use.
    pub fn locals(&self) -> &[VerificationType] {
        &self.locals[..usize::from(self.locals_size)]
    }

    /// Returns the operand stack, bottom first.
    pub fn stack(&self) -> &[VerificationType] {
        &self.stack
    }

    /// Pushes a single slot value.
    ///
    /// # Errors
    /// [`VerificationError::StackOverflow`] if the stack is full.
    pub fn push(&mut self, value: VerificationType) -> VerifyResult<()> {
        if self.stack.len() >= usize::from(self.max_stack) {
            return Err(VerificationError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pushes both slots of a category 2 value.
    pub fn push2(&mut self, first: VerificationType, second: VerificationType) -> VerifyResult<()> {
        if self.stack.len() + 2 > usize::from(self.max_stack) {
            return Err(VerificationError::StackOverflow);
        }
        self.stack.push(first);
        self.stack.push(second);
        Ok(())
    }

    /// Pushes every slot of `values` in order.
    pub(crate) fn push_all(&mut self, values: &[VerificationType]) -> VerifyResult<()> {
        for value in values {
            self.push(value.clone())?;
        }
        Ok(())
    }

    /// Pops the top slot without checking its type.
    ///
    /// # Errors
    /// [`VerificationError::StackUnderflow`] if the stack is empty.
    pub fn pop(&mut self) -> VerifyResult<VerificationType> {
        self.stack.pop().ok_or(VerificationError::StackUnderflow)
    }

    /// Pops the top slot, which must be assignable to `expected`.
    pub(crate) fn pop_expected(
        &mut self,
        expected: &VerificationType,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<VerificationType> {
        let top = self.stack.last().ok_or(VerificationError::StackUnderflow)?;
        if !expected.is_assignable_from(top, hierarchy)? {
            return Err(VerificationError::BadTypeOnStack {
                expected: expected.to_string(),
                actual: top.to_string(),
            });
        }
        self.pop()
    }

    /// Pops both slots of a category 2 value, the second slot first.
    pub(crate) fn pop2(
        &mut self,
        second: &VerificationType,
        first: &VerificationType,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<VerificationType> {
        self.pop_expected(second, hierarchy)?;
        self.pop_expected(first, hierarchy)
    }

    /// Pops the slots of `values` in reverse order, checking each one.
    pub(crate) fn pop_all(
        &mut self,
        values: &[VerificationType],
        hierarchy: &Hierarchy,
    ) -> VerifyResult<()> {
        for value in values.iter().rev() {
            self.pop_expected(value, hierarchy)?;
        }
        Ok(())
    }

    /// Reads the local at `index`, which must be assignable to `expected`.
    pub(crate) fn get_local(
        &mut self,
        index: u16,
        expected: &VerificationType,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<VerificationType> {
        if index >= self.max_locals {
            return Err(VerificationError::LocalsOverflow(index));
        }
        let local = &self.locals[usize::from(index)];
        if !expected.is_assignable_from(local, hierarchy)? {
            return Err(VerificationError::BadLocalType {
                index,
                expected: expected.to_string(),
                actual: local.to_string(),
            });
        }
        let local = local.clone();
        if index >= self.locals_size {
            self.locals_size = index + 1;
        }
        Ok(local)
    }

    /// Reads both slots of a category 2 local starting at `index`.
    pub(crate) fn get_local2(
        &mut self,
        index: u16,
        first: &VerificationType,
        second: &VerificationType,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<()> {
        if u32::from(index) + 1 >= u32::from(self.locals_size) {
            return Err(VerificationError::LocalsOverflow(index));
        }
        let index = usize::from(index);
        for (slot, expected) in [(index, first), (index + 1, second)] {
            let local = &self.locals[slot];
            if !expected.is_assignable_from(local, hierarchy)? {
                return Err(VerificationError::BadLocalType {
                    index: slot as u16,
                    expected: expected.to_string(),
                    actual: local.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Writes `value` into the local at `index`.
    ///
    /// A category 2 value partially overwritten by this store becomes unusable.
    pub(crate) fn set_local(&mut self, index: u16, value: VerificationType) -> VerifyResult<()> {
        if index >= self.max_locals {
            return Err(VerificationError::LocalsOverflow(index));
        }
        let slot = usize::from(index);
        self.invalidate_pair_at(slot);
        self.locals[slot] = value;
        if index >= self.locals_size {
            self.locals_size = index + 1;
        }
        Ok(())
    }

    /// Writes both slots of a category 2 value starting at `index`.
    pub(crate) fn set_local2(
        &mut self,
        index: u16,
        first: VerificationType,
        second: VerificationType,
    ) -> VerifyResult<()> {
        if u32::from(index) + 1 >= u32::from(self.max_locals) {
            return Err(VerificationError::LocalsOverflow(index));
        }
        let slot = usize::from(index);
        if self.locals[slot + 1].is_category2() && slot + 2 < self.locals.len() {
            self.locals[slot + 2] = VerificationType::Top;
        }
        if self.locals[slot].is_category2_2nd() && slot >= 1 {
            self.locals[slot - 1] = VerificationType::Top;
        }
        self.locals[slot] = first;
        self.locals[slot + 1] = second;
        if index + 1 >= self.locals_size {
            self.locals_size = index + 2;
        }
        Ok(())
    }

    /// Clears the other half of a category 2 value that occupies `slot`.
    fn invalidate_pair_at(&mut self, slot: usize) {
        if self.locals[slot].is_category2() && slot + 1 < self.locals.len() {
            self.locals[slot + 1] = VerificationType::Top;
        }
        if self.locals[slot].is_category2_2nd() && slot >= 1 {
            self.locals[slot - 1] = VerificationType::Top;
        }
    }

    /// Replaces every occurrence of `old` in locals and stack with `new`.
    pub fn initialize_object(&mut self, old: &VerificationType, new: &VerificationType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if slot == old {
                *slot = new.clone();
            }
        }
        if old.is_uninitialized_this() {
            self.flags.remove(FrameFlags::THIS_UNINIT);
        }
    }

    /// Seeds the locals from the receiver and the parameters of `method`, and returns the
    /// method's return type ([`VerificationType::Bogus`] for `void`).
    ///
    /// # Errors
    /// If the descriptor is malformed or the parameters need more than `max_locals` slots.
    pub(crate) fn set_locals_from_descriptor(
        &mut self,
        method: &Method,
        this_type: &VerificationType,
    ) -> VerifyResult<VerificationType> {
        let (parameters, return_type) = Method::parse_descriptor(&method.descriptor)
            .map_err(|_| VerificationError::InvalidMethodSignature(method.descriptor.clone()))?;

        let mut locals = Vec::new();
        if !method.is_static() {
            let is_object = this_type.name() == Some(JAVA_LANG_OBJECT);
            if method.is_constructor() && !is_object {
                locals.push(VerificationType::UninitializedThis);
                self.flags.insert(FrameFlags::THIS_UNINIT);
            } else {
                locals.push(this_type.clone());
            }
        }
        for parameter in &parameters {
            locals.extend(VerificationType::slots_of(parameter));
        }
        if locals.len() > usize::from(self.max_locals) {
            return Err(VerificationError::InsufficientMaxLocals);
        }

        self.locals_size = locals.len() as u16;
        for (slot, local) in locals.into_iter().enumerate() {
            self.locals[slot] = local;
        }

        Ok(return_type
            .as_ref()
            .map_or(VerificationType::Bogus, VerificationType::from_field_type))
    }

    /// Returns the frame seen by an exception handler: same locals, empty stack.
    pub fn frame_in_exception_handler(&self, flags: FrameFlags) -> Self {
        Self {
            offset: self.offset,
            locals_size: self.locals_size,
            max_locals: self.max_locals,
            max_stack: self.max_stack,
            flags,
            locals: self.locals.clone(),
            stack: Vec::with_capacity(usize::from(self.max_stack)),
        }
    }

    /// Replaces this frame's state with the state recorded in `target`.
    pub(crate) fn adopt(&mut self, target: &VerificationFrame) {
        self.locals_size = target.locals_size;
        self.locals.clone_from(&target.locals);
        self.stack.clone_from(&target.stack);
        self.flags = target.flags;
    }

    /// Returns `true` if this frame may flow into `target`.
    ///
    /// Locals are compared up to the target's `locals_size`; a `Top` slot in the target
    /// discards whatever this frame holds there.
    pub(crate) fn is_assignable_to(
        &self,
        target: &VerificationFrame,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<bool> {
        if self.max_locals != target.max_locals || self.stack.len() != target.stack.len() {
            return Ok(false);
        }
        let locals = usize::from(target.locals_size);
        let pairs = self.locals[..locals]
            .iter()
            .zip(&target.locals[..locals])
            .chain(self.stack.iter().zip(&target.stack));
        for (from, to) in pairs {
            if !to.is_top() && !to.is_assignable_from(from, hierarchy)? {
                return Ok(false);
            }
        }
        Ok(target.flags.contains(self.flags))
    }
}

impl fmt::Display for VerificationFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[VerificationType]| {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "@{} locals: [{}] stack: [{}]",
            self.offset,
            join(self.locals()),
            join(&self.stack)
        )?;
        if self.is_this_uninit() {
            write!(f, " flags: this_uninit")?;
        }
        Ok(())
    }
}
