use super::opcodes::*;
use crate::{VerificationError, VerifyResult};
use byteorder::{BigEndian, ByteOrder};

/// A cursor over raw bytecode that decodes one instruction at a time.
///
/// Only instruction boundaries are validated here. Operands are read on demand by the
/// caller, always within the bounds of the current instruction.
#[derive(Debug, Clone)]
pub(crate) struct BytecodeStream<'a> {
    code: &'a [u8],
    bci: usize,
    next_bci: usize,
    opcode: u8,
    is_wide: bool,
}

impl<'a> BytecodeStream<'a> {
    pub(crate) fn new(code: &'a [u8]) -> Self {
        Self::at(code, 0)
    }

    /// Creates a stream whose next instruction starts at `bci`.
    pub(crate) fn at(code: &'a [u8], bci: u16) -> Self {
        let bci = usize::from(bci);
        Self {
            code,
            bci,
            next_bci: bci,
            opcode: NOP,
            is_wide: false,
        }
    }

    /// Returns `true` if no instruction follows the current one.
    pub(crate) fn is_last(&self) -> bool {
        self.next_bci >= self.code.len()
    }

    /// Advances to the next instruction and returns its opcode, or `None` at the end of
    /// the code.
    ///
    /// # Errors
    /// If the opcode is undefined or the instruction is truncated.
    pub(crate) fn next_opcode(&mut self) -> VerifyResult<Option<u8>> {
        if self.is_last() {
            self.bci = self.next_bci;
            return Ok(None);
        }
        self.bci = self.next_bci;
        let illegal = VerificationError::IllegalInstruction(self.bci() as u16);

        let mut opcode = self.code[self.bci];
        self.is_wide = false;
        let length = match instruction_length(opcode).ok_or(illegal.clone())? {
            VARIABLE_LENGTH => {
                if opcode == WIDE {
                    opcode = *self.code.get(self.bci + 1).ok_or(illegal.clone())?;
                    if !is_wideable(opcode) {
                        return Err(illegal);
                    }
                    self.is_wide = true;
                    if opcode == IINC {
                        6
                    } else {
                        4
                    }
                } else {
                    self.switch_length(opcode).ok_or(illegal.clone())?
                }
            }
            length => usize::from(length),
        };

        let next_bci = self.bci + length;
        if next_bci > self.code.len() {
            return Err(illegal);
        }
        self.next_bci = next_bci;
        self.opcode = opcode;
        Ok(Some(opcode))
    }

    /// Computes the length of a `tableswitch` or `lookupswitch` at the current offset.
    fn switch_length(&self, opcode: u8) -> Option<usize> {
        let aligned = (self.bci + 4) & !3;
        let padding = (aligned - self.bci) as i64;
        let length = if opcode == TABLESWITCH {
            let low = i64::from(self.checked_int_at(aligned + 4)?);
            let high = i64::from(self.checked_int_at(aligned + 8)?);
            padding + (3 + high - low + 1) * 4
        } else {
            let pairs = i64::from(self.checked_int_at(aligned + 4)?);
            padding + (2 + 2 * pairs) * 4
        };
        if length > 0 && length <= i64::from(i32::MAX) {
            usize::try_from(length).ok()
        } else {
            None
        }
    }

    fn checked_int_at(&self, position: usize) -> Option<i32> {
        self.code
            .get(position..position + 4)
            .map(BigEndian::read_i32)
    }

    /// The offset of the current instruction.
    pub(crate) fn bci(&self) -> usize {
        self.bci
    }

    /// The offset of the instruction following the current one.
    #[cfg(test)]
    pub(crate) fn next_bci(&self) -> usize {
        self.next_bci
    }

    /// The opcode of the current instruction, with any `wide` prefix removed.
    pub(crate) fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Returns `true` if the current instruction carries a `wide` prefix.
    pub(crate) fn is_wide(&self) -> bool {
        self.is_wide
    }

    /// The local variable index operand, one byte or two when widened.
    pub(crate) fn index(&self) -> u16 {
        if self.is_wide {
            BigEndian::read_u16(&self.code[self.bci + 2..])
        } else {
            u16::from(self.code[self.bci + 1])
        }
    }

    /// The one byte operand following the opcode.
    pub(crate) fn index_u1(&self) -> u8 {
        self.code[self.bci + 1]
    }

    /// The two byte operand following the opcode.
    pub(crate) fn index_u2(&self) -> u16 {
        BigEndian::read_u16(&self.code[self.bci + 1..])
    }

    /// The target of a branch with a two byte offset.
    pub(crate) fn dest(&self) -> i32 {
        self.bci as i32 + i32::from(BigEndian::read_i16(&self.code[self.bci + 1..]))
    }

    /// The target of a branch with a four byte offset.
    pub(crate) fn dest_w(&self) -> i32 {
        (self.bci as i32).wrapping_add(BigEndian::read_i32(&self.code[self.bci + 1..]))
    }

    /// Reads a byte at an absolute position inside the current instruction.
    pub(crate) fn byte_at(&self, position: usize) -> u8 {
        self.code[position]
    }

    /// Reads a four byte integer at an absolute position inside the current instruction.
    pub(crate) fn int_at(&self, position: usize) -> i32 {
        BigEndian::read_i32(&self.code[position..])
    }

    /// The offset of the first four byte aligned operand of a switch.
    pub(crate) fn aligned_bci(&self) -> usize {
        (self.bci + 4) & !3
    }

    /// The default target of a switch followed by its case targets.
    pub(crate) fn switch_targets(&self) -> Vec<i32> {
        let aligned = self.aligned_bci();
        let (keys, delta) = if self.opcode == TABLESWITCH {
            let low = i64::from(self.int_at(aligned + 4));
            let high = i64::from(self.int_at(aligned + 8));
            (usize::try_from(high - low + 1).unwrap_or(0), 1)
        } else {
            (usize::try_from(self.int_at(aligned + 4)).unwrap_or(0), 2)
        };
        let bci = self.bci as i32;
        std::iter::once(self.int_at(aligned))
            .chain((0..keys).map(|key| self.int_at(aligned + (3 + key * delta) * 4)))
            .map(|offset| bci.wrapping_add(offset))
            .collect()
    }
}

const BYTECODE_OFFSET: u8 = 1;
const NEW_OFFSET: u8 = 2;

/// Marks every instruction boundary of a method, and every `new` instruction.
#[derive(Debug)]
pub(crate) struct CodeData {
    marks: Vec<u8>,
}

impl CodeData {
    /// Decodes every instruction of `code`.
    ///
    /// # Errors
    /// [`VerificationError::IllegalInstruction`] at the first undefined or truncated
    /// instruction.
    pub(crate) fn new(code: &[u8]) -> VerifyResult<Self> {
        let mut marks = vec![0; code.len()];
        let mut stream = BytecodeStream::new(code);
        while let Some(opcode) = stream.next_opcode()? {
            marks[stream.bci()] = if opcode == NEW {
                BYTECODE_OFFSET | NEW_OFFSET
            } else {
                BYTECODE_OFFSET
            };
        }
        Ok(Self { marks })
    }

    /// Returns `true` if an instruction starts at `bci`.
    pub(crate) fn is_instruction_start(&self, bci: i64) -> bool {
        usize::try_from(bci)
            .ok()
            .and_then(|bci| self.marks.get(bci))
            .is_some_and(|mark| mark & BYTECODE_OFFSET != 0)
    }

    /// Returns `true` if a `new` instruction starts at `bci`.
    pub(crate) fn is_new(&self, bci: u16) -> bool {
        self.marks
            .get(usize::from(bci))
            .is_some_and(|mark| mark & NEW_OFFSET != 0)
    }
}
