use super::{CodeData, FrameFlags, VerificationFrame, VerificationType};
use crate::{
    constant_pool::ConstantPoolExt, hierarchy::Hierarchy, VerificationError, VerifyResult,
};
use byteorder::{BigEndian, ReadBytesExt};
use ristretto_classfile::ConstantPool;
use std::io::Cursor;

const SAME_FRAME_MAX: u8 = 63;
const SAME_LOCALS_1_STACK_ITEM: u8 = 64;
const SAME_LOCALS_1_STACK_ITEM_MAX: u8 = 127;
const RESERVED: u8 = 128;
const RESERVED_MAX: u8 = 246;
const SAME_LOCALS_1_STACK_ITEM_EXTENDED: u8 = 247;
const CHOP: u8 = 248;
const CHOP_MAX: u8 = 250;
const SAME_FRAME_EXTENDED: u8 = 251;
const APPEND: u8 = 252;
const APPEND_MAX: u8 = 254;
const FULL_FRAME: u8 = 255;

const ITEM_TOP: u8 = 0;
const ITEM_INTEGER: u8 = 1;
const ITEM_FLOAT: u8 = 2;
const ITEM_DOUBLE: u8 = 3;
const ITEM_LONG: u8 = 4;
const ITEM_NULL: u8 = 5;
const ITEM_UNINITIALIZED_THIS: u8 = 6;
const ITEM_OBJECT: u8 = 7;
const ITEM_UNINITIALIZED: u8 = 8;

macro_rules! format_error {
    ($($arg:tt)*) => {
        VerificationError::StackMapFormat(format!($($arg)*))
    };
}

/// The decoded frames of a `StackMapTable` attribute, in ascending offset order.
#[derive(Debug, Default)]
pub(crate) struct StackMapTable {
    frames: Vec<VerificationFrame>,
}

impl StackMapTable {
    /// Decodes the `StackMapTable` payload of a method. `initial` is the frame derived
    /// from the method descriptor, which the first entry is relative to.
    ///
    /// A method without the attribute has no frames.
    ///
    /// # Errors
    /// [`VerificationError::StackMapFormat`] if the payload is malformed.
    pub(crate) fn decode(
        payload: Option<&[u8]>,
        initial: &VerificationFrame,
        code_data: &CodeData,
        pool: &ConstantPool,
    ) -> VerifyResult<Self> {
        let Some(payload) = payload else {
            return Ok(Self::default());
        };

        let mut reader = StackMapReader {
            stream: Cursor::new(payload),
            code_data,
            pool,
            max_locals: initial.max_locals(),
            max_stack: initial.max_stack(),
        };
        let frame_count = reader.u2()?;
        let mut frames: Vec<VerificationFrame> = Vec::with_capacity(usize::from(frame_count));
        for index in 0..frame_count {
            let previous = frames.last().unwrap_or(initial);
            let frame = reader.next(previous, index == 0)?;
            frames.push(frame);
        }
        reader.check_end()?;

        Ok(Self { frames })
    }

    #[cfg(test)]
    pub(crate) fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The offset of the frame at `index`.
    pub(crate) fn offset(&self, index: usize) -> Option<u16> {
        self.frames.get(index).map(VerificationFrame::offset)
    }

    fn frame_at(&self, target: i32) -> VerifyResult<&VerificationFrame> {
        self.frames
            .binary_search_by_key(&target, |frame| i32::from(frame.offset()))
            .map(|index| &self.frames[index])
            .map_err(|_| VerificationError::ExpectingStackMapFrameAtTarget(target))
    }

    /// Matches `frame` against the stack map frame recorded at `target`.
    ///
    /// With `is_match` the frame must be assignable to the recorded one; with `update` it
    /// then takes over the recorded locals, stack and flags.
    ///
    /// # Errors
    /// [`VerificationError::ExpectingStackMapFrameAtTarget`] if no frame is recorded at
    /// `target`.
    pub(crate) fn match_stackmap(
        &self,
        frame: &mut VerificationFrame,
        target: i32,
        is_match: bool,
        update: bool,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<bool> {
        let stackmap_frame = self.frame_at(target)?;
        Self::match_frame(frame, stackmap_frame, is_match, update, hierarchy)
    }

    /// Like [`StackMapTable::match_stackmap`], for the frame at `index`.
    pub(crate) fn match_stackmap_at(
        &self,
        frame: &mut VerificationFrame,
        index: usize,
        is_match: bool,
        update: bool,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<bool> {
        let stackmap_frame = self
            .frames
            .get(index)
            .ok_or(VerificationError::ExpectingStackMapFrame)?;
        Self::match_frame(frame, stackmap_frame, is_match, update, hierarchy)
    }

    fn match_frame(
        frame: &mut VerificationFrame,
        stackmap_frame: &VerificationFrame,
        is_match: bool,
        update: bool,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<bool> {
        let matches = !is_match || frame.is_assignable_to(stackmap_frame, hierarchy)?;
        if update {
            frame.adopt(stackmap_frame);
        }
        Ok(matches)
    }

    /// Checks that a branch to `target` lands on a stack map frame the current frame is
    /// assignable to.
    pub(crate) fn check_jump_target(
        &self,
        frame: &VerificationFrame,
        target: i32,
        code_length: usize,
        hierarchy: &Hierarchy,
    ) -> VerifyResult<()> {
        let stackmap_frame = self.frame_at(target)?;
        let in_code = usize::try_from(target).is_ok_and(|target| target < code_length);
        if !in_code || !frame.is_assignable_to(stackmap_frame, hierarchy)? {
            return Err(VerificationError::InconsistentStackMapFrames(target));
        }
        Ok(())
    }
}

struct StackMapReader<'a> {
    stream: Cursor<&'a [u8]>,
    code_data: &'a CodeData,
    pool: &'a ConstantPool,
    max_locals: u16,
    max_stack: u16,
}

impl StackMapReader<'_> {
    fn u1(&mut self) -> VerifyResult<u8> {
        self.stream
            .read_u8()
            .map_err(|_| format_error!("access beyond the end of attribute"))
    }

    fn u2(&mut self) -> VerifyResult<u16> {
        self.stream
            .read_u16::<BigEndian>()
            .map_err(|_| format_error!("access beyond the end of attribute"))
    }

    fn check_end(&self) -> VerifyResult<()> {
        if self.stream.position() != self.stream.get_ref().len() as u64 {
            return Err(format_error!("wrong attribute size"));
        }
        Ok(())
    }

    /// Decodes the frame following `previous`.
    fn next(&mut self, previous: &VerificationFrame, first: bool) -> VerifyResult<VerificationFrame> {
        let frame_type = self.u1()?;
        let offset_delta = match frame_type {
            0..=SAME_FRAME_MAX => u16::from(frame_type),
            SAME_LOCALS_1_STACK_ITEM..=SAME_LOCALS_1_STACK_ITEM_MAX => {
                u16::from(frame_type - SAME_LOCALS_1_STACK_ITEM)
            }
            RESERVED..=RESERVED_MAX => {
                return Err(format_error!("reserved frame type {frame_type}"));
            }
            _ => self.u2()?,
        };
        let offset = self.offset(previous, offset_delta, first)?;
        let previous_locals = previous.locals().to_vec();

        let (locals, stack, flags) = match frame_type {
            0..=SAME_FRAME_MAX | SAME_FRAME_EXTENDED => {
                (previous_locals, Vec::new(), previous.flags())
            }
            SAME_LOCALS_1_STACK_ITEM..=SAME_LOCALS_1_STACK_ITEM_MAX
            | SAME_LOCALS_1_STACK_ITEM_EXTENDED => {
                let mut stack = Vec::with_capacity(2);
                let value = self.verification_type()?;
                self.push_slots(&mut stack, value, self.max_stack, "stack")?;
                (previous_locals, stack, previous.flags())
            }
            CHOP..=CHOP_MAX => {
                let chops = usize::from(SAME_FRAME_EXTENDED - frame_type);
                let length = chop(&previous_locals, chops)
                    .ok_or_else(|| format_error!("chop frame removes {chops} locals"))?;
                let locals = previous_locals[..length].to_vec();
                let flags = flags_of(&locals);
                (locals, Vec::new(), flags)
            }
            APPEND..=APPEND_MAX => {
                let appends = frame_type - SAME_FRAME_EXTENDED;
                let mut locals = previous_locals;
                let mut flags = previous.flags();
                for _ in 0..appends {
                    let value = self.verification_type()?;
                    if value.is_uninitialized_this() {
                        flags.insert(FrameFlags::THIS_UNINIT);
                    }
                    self.push_slots(&mut locals, value, self.max_locals, "locals")?;
                }
                (locals, Vec::new(), flags)
            }
            FULL_FRAME => {
                let locals_count = self.u2()?;
                let mut locals = Vec::with_capacity(usize::from(locals_count));
                for _ in 0..locals_count {
                    let value = self.verification_type()?;
                    self.push_slots(&mut locals, value, self.max_locals, "locals")?;
                }
                let stack_count = self.u2()?;
                let mut stack = Vec::with_capacity(usize::from(stack_count));
                for _ in 0..stack_count {
                    let value = self.verification_type()?;
                    self.push_slots(&mut stack, value, self.max_stack, "stack")?;
                }
                let flags = flags_of(&locals);
                (locals, stack, flags)
            }
            RESERVED..=RESERVED_MAX => {
                return Err(format_error!("reserved frame type {frame_type}"));
            }
        };

        Ok(VerificationFrame::with_contents(
            offset,
            flags,
            self.max_locals,
            self.max_stack,
            locals,
            stack,
        ))
    }

    /// Computes the absolute offset of a frame, which must start an instruction.
    fn offset(&self, previous: &VerificationFrame, delta: u16, first: bool) -> VerifyResult<u16> {
        let offset = if first {
            i64::from(delta)
        } else {
            i64::from(previous.offset()) + i64::from(delta) + 1
        };
        if !self.code_data.is_instruction_start(offset) {
            return Err(format_error!("bad offset {offset}"));
        }
        u16::try_from(offset).map_err(|_| format_error!("bad offset {offset}"))
    }

    /// Appends `value` and, for category 2 types, its second half.
    fn push_slots(
        &self,
        slots: &mut Vec<VerificationType>,
        value: VerificationType,
        limit: u16,
        kind: &str,
    ) -> VerifyResult<()> {
        let second = value.second_half();
        slots.push(value);
        slots.extend(second);
        if slots.len() > usize::from(limit) {
            return Err(format_error!("frame has more {kind} than allowed"));
        }
        Ok(())
    }

    fn verification_type(&mut self) -> VerifyResult<VerificationType> {
        let tag = self.u1()?;
        let value = match tag {
            ITEM_TOP => VerificationType::Top,
            ITEM_INTEGER => VerificationType::Integer,
            ITEM_FLOAT => VerificationType::Float,
            ITEM_DOUBLE => VerificationType::Double,
            ITEM_LONG => VerificationType::Long,
            ITEM_NULL => VerificationType::Null,
            ITEM_UNINITIALIZED_THIS => VerificationType::UninitializedThis,
            ITEM_OBJECT => {
                let index = self.u2()?;
                let class_name = self
                    .pool
                    .class_name_at(index)
                    .map_err(|_| format_error!("bad class index {index}"))?;
                VerificationType::reference(class_name)
            }
            ITEM_UNINITIALIZED => {
                let offset = self.u2()?;
                if !self.code_data.is_new(offset) {
                    return Err(format_error!("bad offset {offset} for Uninitialized"));
                }
                VerificationType::Uninitialized(offset)
            }
            _ => return Err(format_error!("bad verification type {tag}")),
        };
        Ok(value)
    }
}

/// Returns the number of slots left after removing `chops` locals, counting a category 2
/// value as one local.
fn chop(locals: &[VerificationType], chops: usize) -> Option<usize> {
    let mut length = locals.len();
    for _ in 0..chops {
        let last = locals.get(length.checked_sub(1)?)?;
        length -= if last.is_category2_2nd() { 2 } else { 1 };
    }
    Some(length)
}

fn flags_of(locals: &[VerificationType]) -> FrameFlags {
    if locals.iter().any(VerificationType::is_uninitialized_this) {
        FrameFlags::THIS_UNINIT
    } else {
        FrameFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{ClassBuilder, StackMapEncoder, VType},
        bytecode::opcodes::*,
        ClassHierarchy,
    };
    use VerificationType::*;

    struct Fixture {
        pool: ConstantPool,
        string: u16,
        code_data: CodeData,
        initial: VerificationFrame,
    }

    /// `static void m(int)` with eight one byte instructions and a `new` at offset 8.
    fn fixture() -> Fixture {
        let mut pool = ConstantPool::default();
        let class_index = pool.add_class("java/lang/String").unwrap();
        let mut code = vec![NOP; 8];
        code.extend_from_slice(&[NEW, 0, class_index as u8, RETURN]);
        let code_data = CodeData::new(&code).unwrap();
        let mut initial = VerificationFrame::new(4, 2);
        initial.set_local(0, Integer).unwrap();
        Fixture {
            pool,
            string: class_index,
            code_data,
            initial,
        }
    }

    fn decode(fixture: &Fixture, encoder: StackMapEncoder) -> VerifyResult<StackMapTable> {
        let payload = encoder.build();
        StackMapTable::decode(
            Some(&payload),
            &fixture.initial,
            &fixture.code_data,
            &fixture.pool,
        )
    }

    #[test]
    fn test_decode_frames() -> VerifyResult<()> {
        let fixture = fixture();
        let string = fixture.string;
        let table = decode(
            &fixture,
            StackMapEncoder::default()
                .same(1)
                .append(0, &[VType::Long])
                .same_locals_1(1, VType::Object(string))
                .chop(1, 0)
                .full(1, &[VType::Float, VType::Uninitialized(8)], &[VType::Double])
                .same(3),
        )?;

        let frames: Vec<_> = table
            .frames
            .iter()
            .map(|frame| (frame.offset(), frame.locals().to_vec(), frame.stack().to_vec()))
            .collect();
        assert_eq!(
            frames,
            vec![
                (1, vec![Integer], vec![]),
                (2, vec![Integer, Long, Long2], vec![]),
                (4, vec![Integer, Long, Long2], vec![VerificationType::reference("java/lang/String")]),
                (5, vec![Integer], vec![]),
                (7, vec![Float, Uninitialized(8)], vec![Double, Double2]),
                (11, vec![Float, Uninitialized(8)], vec![]),
            ]
        );
        assert_eq!(table.frame_count(), 6);
        assert_eq!(table.offset(1), Some(2));
        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        let fixture = fixture();
        for (encoder, message) in [
            (StackMapEncoder::default().raw(&[200]), "reserved frame type 200"),
            (StackMapEncoder::default().same(9), "bad offset 9"),
            (StackMapEncoder::default().same(8).same(1), "bad offset 10"),
            (StackMapEncoder::default().chop(2, 1), "chop frame removes 2 locals"),
            (
                StackMapEncoder::default().append(1, &[VType::Long, VType::Long]),
                "frame has more locals than allowed",
            ),
            (
                StackMapEncoder::default().same_locals_1(1, VType::Uninitialized(3)),
                "bad offset 3 for Uninitialized",
            ),
            (
                StackMapEncoder::default().same_locals_1(1, VType::Object(500)),
                "bad class index 500",
            ),
            (StackMapEncoder::default().raw(&[SAME_LOCALS_1_STACK_ITEM + 1, 9]), "bad verification type 9"),
            (StackMapEncoder::default().raw(&[SAME_FRAME_EXTENDED, 0]), "access beyond the end of attribute"),
            (StackMapEncoder::default().same(1).trailing(&[0]), "wrong attribute size"),
        ] {
            assert_eq!(
                decode(&fixture, encoder).err(),
                Some(VerificationError::StackMapFormat(message.to_string()))
            );
        }
    }

    #[test]
    fn test_missing_table() -> VerifyResult<()> {
        let fixture = fixture();
        let table = StackMapTable::decode(None, &fixture.initial, &fixture.code_data, &fixture.pool)?;
        assert_eq!(table.frame_count(), 0);
        assert_eq!(table.offset(0), None);
        Ok(())
    }

    #[test]
    fn test_match_and_jump_targets() -> VerifyResult<()> {
        let fixture = fixture();
        let table = decode(
            &fixture,
            StackMapEncoder::default()
                .same(1)
                .same_locals_1(1, VType::Integer),
        )?;
        let class = ClassBuilder::new("pkg/Jump").build();
        let resolver = ClassHierarchy::default();
        let hierarchy = Hierarchy::new(&resolver, &class);

        let mut frame = fixture.initial.clone();
        table.check_jump_target(&frame, 1, 12, &hierarchy)?;
        assert_eq!(
            table.check_jump_target(&frame, 2, 12, &hierarchy),
            Err(VerificationError::ExpectingStackMapFrameAtTarget(2))
        );
        assert_eq!(
            table.check_jump_target(&frame, 3, 12, &hierarchy),
            Err(VerificationError::InconsistentStackMapFrames(3))
        );

        frame.push(Float)?;
        assert!(!table.match_stackmap(&mut frame, 3, true, false, &hierarchy)?);
        assert_eq!(frame.stack(), &[Float]);
        // Updating without matching adopts the recorded frame.
        assert!(table.match_stackmap(&mut frame, 3, false, true, &hierarchy)?);
        assert_eq!(frame.stack(), &[Integer]);
        assert!(table.match_stackmap_at(&mut frame, 1, true, true, &hierarchy)?);
        Ok(())
    }

    #[test]
    fn test_full_frame_with_top_and_null() -> VerifyResult<()> {
        let fixture = fixture();
        let table = decode(
            &fixture,
            StackMapEncoder::default().full(0, &[VType::Top, VType::Null], &[VType::Null]),
        )?;
        let frame = &table.frames[0];
        assert_eq!(frame.offset(), 0);
        assert_eq!(frame.locals(), &[Top, Null]);
        assert_eq!(frame.stack(), &[Null]);
        Ok(())
    }

    #[test]
    fn test_frame_type_boundaries() -> VerifyResult<()> {
        let fixture = fixture();
        let three = [VType::Float, VType::Float, VType::Float];
        let table = decode(&fixture, StackMapEncoder::default().append(0, &three))?;
        assert_eq!(table.frames[0].locals(), &[Integer, Float, Float, Float]);

        let extended = [SAME_LOCALS_1_STACK_ITEM_EXTENDED, 0, 2, ITEM_INTEGER];
        let table = decode(&fixture, StackMapEncoder::default().raw(&extended))?;
        assert_eq!(table.frames[0].offset(), 2);
        assert_eq!(table.frames[0].stack(), &[Integer]);

        for frame_type in [RESERVED, RESERVED_MAX] {
            assert_eq!(
                decode(&fixture, StackMapEncoder::default().raw(&[frame_type])).err(),
                Some(VerificationError::StackMapFormat(format!(
                    "reserved frame type {frame_type}"
                )))
            );
        }
        Ok(())
    }

    #[test]
    fn test_chop() {
        let locals = [Integer, Long, Long2, Float];
        assert_eq!(chop(&locals, 1), Some(3));
        assert_eq!(chop(&locals, 2), Some(1));
        assert_eq!(chop(&locals, 3), Some(0));
        assert_eq!(chop(&locals, 4), None);
    }
}
