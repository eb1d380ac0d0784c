use crate::{
    bytecode::{BytecodeStream, TryCatchBlock},
    errors::*,
};
use byteorder::{BigEndian, ReadBytesExt};
use ristretto_classfile::{
    attributes::{Attribute, ExceptionTableEntry},
    BaseType, ClassFile, ConstantPool, FieldType, MethodAccessFlags,
};
use std::io::{self, Cursor, Read};

/// The maximum number of array dimensions a descriptor may declare.
pub(crate) const MAX_ARRAY_DIMENSIONS: usize = 255;

/// An entry of the `LocalVariableTable` attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

/// The parts of a `Code` attribute the verifier consumes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    /// The raw bytecode.
    pub code: Vec<u8>,
    pub exception_table: Vec<TryCatchBlock>,
    pub local_variable_table: Vec<LocalVariable>,
    /// The payload of the `StackMapTable` attribute, without the attribute header.
    pub stack_map_table: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Method {
    pub access_flags: MethodAccessFlags,
    pub name: String,
    pub descriptor: String,
    /// `None` for native and abstract methods.
    pub code: Option<Code>,
}

impl Method {
    /// Create a new class method with the given definition.
    ///
    /// The `Code` attribute is re-encoded to recover the raw bytecode and the
    /// `StackMapTable` payload. [`ClassFile`] keeps exception table ranges as instruction
    /// indices, so they are mapped back onto the offsets of the re-encoded bytecode. A range
    /// ending at the last instruction cannot be told apart from one ending at the end of the
    /// code, and is taken to exclude the last instruction. Use
    /// [`ClassModel::from_bytes`](crate::ClassModel::from_bytes) to read the exception
    /// table exactly as it was written.
    ///
    /// # Errors
    /// If the method name cannot be read or the code attribute is malformed.
    pub fn try_from(class: &ClassFile, definition: &ristretto_classfile::Method) -> Result<Self> {
        let constant_pool = &class.constant_pool;
        let name = constant_pool.try_get_utf8(definition.name_index)?;
        let descriptor = constant_pool.try_get_utf8(definition.descriptor_index)?;
        let mut method = Method {
            access_flags: definition.access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
        };

        let code_attribute = definition.attributes.iter().find_map(|attribute| match attribute {
            Attribute::Code {
                exception_table, ..
            } => Some((attribute, exception_table)),
            _ => None,
        });
        if let Some((attribute, exception_table)) = code_attribute {
            let mut bytes = Vec::new();
            attribute.to_bytes(&mut bytes)?;
            let mut code = method.decode_code(constant_pool, &bytes)?;
            code.exception_table = exception_table_at_offsets(&code.code, exception_table);
            method.code = Some(code);
        }
        Ok(method)
    }

    /// Decodes a complete `Code` attribute, header included, as found in a class file.
    ///
    /// # Errors
    /// If the attribute is truncated or names an attribute outside the constant pool.
    pub(crate) fn decode_code(&self, pool: &ConstantPool, bytes: &[u8]) -> Result<Code> {
        decode_code_attribute(pool, bytes).map_err(|error| match error {
            CodeAttributeError::Truncated => Error::InvalidCodeAttribute(self.to_string()),
            CodeAttributeError::Ristretto(error) => Error::Ristretto(error),
        })
    }

    /// Returns `true` if the method is static.
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    /// Returns `true` if the method has no body the verifier should look at.
    pub fn is_skipped(&self) -> bool {
        self.access_flags.intersects(
            MethodAccessFlags::NATIVE | MethodAccessFlags::ABSTRACT | MethodAccessFlags::BRIDGE,
        )
    }

    /// Returns `true` if the method is an instance initializer.
    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// Parse the method descriptor. The descriptor is a string representing the method signature.
    /// The descriptor has the following format:
    ///
    /// See: <https://docs.oracle.com/javase/specs/jvms/se23/html/jvms-4.html#jvms-4.3.3>
    ///
    /// # Errors
    /// If the descriptor cannot be parsed.
    pub fn parse_descriptor(descriptor: &str) -> Result<(Vec<FieldType>, Option<FieldType>)> {
        let invalid = || Error::InvalidMethodDescriptor(descriptor.to_string());
        let mut chars = descriptor.chars().peekable();
        let mut parameters = Vec::new();

        if chars.next() != Some('(') {
            return Err(invalid());
        }

        loop {
            match chars.peek() {
                Some(')') => {
                    chars.next();
                    break;
                }
                Some(_) => parameters.push(Self::parse_field_type(descriptor, &mut chars)?),
                None => return Err(invalid()),
            }
        }

        let return_type = match chars.peek() {
            Some('V') => {
                chars.next();
                None
            }
            Some(_) => Some(Self::parse_field_type(descriptor, &mut chars)?),
            None => return Err(invalid()),
        };

        // Nothing may follow the return type.
        if chars.next().is_some() {
            return Err(invalid());
        }

        Ok((parameters, return_type))
    }

    /// Parse a complete field descriptor, rejecting trailing characters.
    ///
    /// # Errors
    /// If the descriptor cannot be parsed.
    pub fn parse_field_descriptor(descriptor: &str) -> Result<FieldType> {
        let mut chars = descriptor.chars();
        let field_type = Self::parse_field_type(descriptor, &mut chars)?;
        if chars.next().is_some() {
            return Err(Error::InvalidMethodDescriptor(descriptor.to_string()));
        }
        Ok(field_type)
    }

    /// Parse the field type.
    ///
    /// # Errors
    /// If the field type cannot be parsed.
    pub(crate) fn parse_field_type<I>(descriptor: &str, chars: &mut I) -> Result<FieldType>
    where
        I: Iterator<Item = char>,
    {
        Self::parse_field_type_at_depth(descriptor, chars, 0)
    }

    fn parse_field_type_at_depth<I>(descriptor: &str, chars: &mut I, depth: usize) -> Result<FieldType>
    where
        I: Iterator<Item = char>,
    {
        let invalid = || Error::InvalidMethodDescriptor(descriptor.to_string());
        match chars.next() {
            Some('L') => {
                let mut class_name = String::new();
                loop {
                    match chars.next() {
                        Some(';') => break,
                        // Unqualified names may not contain these characters.
                        Some('.' | '[' | '(' | ')' | '<' | '>') | None => return Err(invalid()),
                        Some(ch) => class_name.push(ch),
                    }
                }
                if class_name.is_empty() || class_name.split('/').any(str::is_empty) {
                    return Err(invalid());
                }
                Ok(FieldType::Object(class_name))
            }
            Some('[') => {
                if depth >= MAX_ARRAY_DIMENSIONS {
                    return Err(invalid());
                }
                let component_type = Self::parse_field_type_at_depth(descriptor, chars, depth + 1)?;
                Ok(FieldType::Array(Box::new(component_type)))
            }
            Some(value) => {
                let base_type = BaseType::parse(value)?;
                Ok(FieldType::Base(base_type))
            }
            None => Err(invalid()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

enum CodeAttributeError {
    Truncated,
    Ristretto(ristretto_classfile::Error),
}

impl From<io::Error> for CodeAttributeError {
    fn from(_: io::Error) -> Self {
        CodeAttributeError::Truncated
    }
}

impl From<ristretto_classfile::Error> for CodeAttributeError {
    fn from(error: ristretto_classfile::Error) -> Self {
        CodeAttributeError::Ristretto(error)
    }
}

/// Decodes a serialized `Code` attribute, header included.
fn decode_code_attribute(
    pool: &ConstantPool,
    bytes: &[u8],
) -> std::result::Result<Code, CodeAttributeError> {
    let mut cursor = Cursor::new(bytes);
    // Skip the attribute name index and length.
    cursor.read_u16::<BigEndian>()?;
    cursor.read_u32::<BigEndian>()?;

    let max_stack = cursor.read_u16::<BigEndian>()?;
    let max_locals = cursor.read_u16::<BigEndian>()?;
    let code_length = cursor.read_u32::<BigEndian>()? as usize;
    let mut code = vec![0; code_length];
    cursor.read_exact(&mut code)?;

    let exception_table_length = cursor.read_u16::<BigEndian>()?;
    let mut exception_table = Vec::with_capacity(usize::from(exception_table_length));
    for _ in 0..exception_table_length {
        let start_pc = cursor.read_u16::<BigEndian>()?;
        let end_pc = cursor.read_u16::<BigEndian>()?;
        let handler_pc = cursor.read_u16::<BigEndian>()?;
        let catch_type = cursor.read_u16::<BigEndian>()?;
        exception_table.push(TryCatchBlock::new(start_pc..end_pc, handler_pc, catch_type));
    }

    let mut local_variable_table = Vec::new();
    let mut stack_map_table = None;
    let attributes_count = cursor.read_u16::<BigEndian>()?;
    for _ in 0..attributes_count {
        let name_index = cursor.read_u16::<BigEndian>()?;
        let length = cursor.read_u32::<BigEndian>()? as usize;
        let mut payload = vec![0; length];
        cursor.read_exact(&mut payload)?;

        let attribute_name: &str = pool.try_get_utf8(name_index)?;
        match attribute_name {
            "StackMapTable" => stack_map_table = Some(payload),
            "LocalVariableTable" => {
                let mut payload = Cursor::new(payload);
                let count = payload.read_u16::<BigEndian>()?;
                for _ in 0..count {
                    local_variable_table.push(LocalVariable {
                        start_pc: payload.read_u16::<BigEndian>()?,
                        length: payload.read_u16::<BigEndian>()?,
                        name_index: payload.read_u16::<BigEndian>()?,
                        descriptor_index: payload.read_u16::<BigEndian>()?,
                        index: payload.read_u16::<BigEndian>()?,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(Code {
        max_stack,
        max_locals,
        code,
        exception_table,
        local_variable_table,
        stack_map_table,
    })
}

/// Converts exception table entries indexed by instruction into entries indexed by bytecode
/// offset.
///
/// `start_pc` and `handler_pc` name an instruction, while `end_pc` is one past the index of
/// the last covered instruction.
fn exception_table_at_offsets(
    code: &[u8],
    entries: &[ExceptionTableEntry],
) -> Vec<TryCatchBlock> {
    let mut offsets = Vec::new();
    let mut stream = BytecodeStream::new(code);
    while let Ok(Some(_)) = stream.next_opcode() {
        offsets.push(stream.bci() as u16);
    }
    let code_length = u16::try_from(code.len()).unwrap_or(u16::MAX);
    let offset_of = |index: u16| {
        offsets
            .get(usize::from(index))
            .copied()
            .unwrap_or(code_length)
    };

    entries
        .iter()
        .map(|entry| {
            let start_pc = offset_of(entry.range_pc.start);
            let end_pc = match entry.range_pc.end.checked_sub(1) {
                Some(last) => offset_of(last),
                None => start_pc,
            };
            TryCatchBlock::new(start_pc..end_pc, offset_of(entry.handler_pc), entry.catch_type)
        })
        .collect()
}

/// Returns the descriptor string of a field type.
pub(crate) fn field_descriptor(field_type: &FieldType) -> String {
    match field_type {
        FieldType::Base(base_type) => base_type_code(base_type).to_string(),
        FieldType::Object(class_name) => format!("L{class_name};"),
        FieldType::Array(component_type) => format!("[{}", field_descriptor(component_type)),
    }
}

pub(crate) fn base_type_code(base_type: &BaseType) -> char {
    match base_type {
        BaseType::Byte => 'B',
        BaseType::Char => 'C',
        BaseType::Double => 'D',
        BaseType::Float => 'F',
        BaseType::Int => 'I',
        BaseType::Long => 'J',
        BaseType::Short => 'S',
        BaseType::Boolean => 'Z',
    }
}
