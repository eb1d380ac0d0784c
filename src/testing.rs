//! Builders for the classes, code attributes and stack maps used throughout the tests.

use crate::{ClassModel, Code, Field, LocalVariable, Method, TryCatchBlock};
use byteorder::{BigEndian, WriteBytesExt};
use ristretto_classfile::{ClassAccessFlags, ConstantPool, MethodAccessFlags};

/// Builds a [`ClassModel`] with a Java 8 class file version and `java/lang/Object` as its
/// superclass unless told otherwise.
#[derive(Clone, Debug)]
pub(crate) struct ClassBuilder {
    class: ClassModel,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            class: ClassModel {
                version: 52,
                access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
                this_class: name.to_string(),
                super_class: Some("java/lang/Object".to_string()),
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                constant_pool: ConstantPool::default(),
            },
        }
    }

    pub(crate) fn version(mut self, major: u16) -> Self {
        self.class.version = major;
        self
    }

    pub(crate) fn super_class(mut self, name: &str) -> Self {
        self.class.super_class = Some(name.to_string());
        self
    }

    pub(crate) fn access_flags(mut self, access_flags: ClassAccessFlags) -> Self {
        self.class.access_flags = access_flags;
        self
    }

    pub(crate) fn interface(mut self, name: &str) -> Self {
        self.class.interfaces.push(name.to_string());
        self
    }

    pub(crate) fn field(mut self, name: &str, descriptor: &str) -> Self {
        self.class.fields.push(Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        });
        self
    }

    pub(crate) fn method(
        mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        code: Option<Code>,
    ) -> Self {
        self.class.methods.push(Method {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code,
        });
        self
    }

    /// The constant pool the built class will carry.
    pub(crate) fn pool_mut(&mut self) -> &mut ConstantPool {
        &mut self.class.constant_pool
    }

    pub(crate) fn build(self) -> ClassModel {
        self.class
    }

    /// Writes the class as a class file. Missing names are appended to the constant pool,
    /// so indices already referenced by the code stay valid.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let class = &self.class;
        let mut pool = class.constant_pool.clone();
        let this_class = pool.add_class(&class.this_class).unwrap();
        let super_class = match &class.super_class {
            Some(name) => pool.add_class(name).unwrap(),
            None => 0,
        };
        let interfaces: Vec<u16> = class
            .interfaces
            .iter()
            .map(|name| pool.add_class(name).unwrap())
            .collect();
        let fields: Vec<(u16, u16)> = class
            .fields
            .iter()
            .map(|field| {
                (
                    pool.add_utf8(&field.name).unwrap(),
                    pool.add_utf8(&field.descriptor).unwrap(),
                )
            })
            .collect();
        let methods: Vec<(u16, u16)> = class
            .methods
            .iter()
            .map(|method| {
                (
                    pool.add_utf8(&method.name).unwrap(),
                    pool.add_utf8(&method.descriptor).unwrap(),
                )
            })
            .collect();
        let names = AttributeNames {
            code: pool.add_utf8("Code").unwrap(),
            stack_map_table: pool.add_utf8("StackMapTable").unwrap(),
            local_variable_table: pool.add_utf8("LocalVariableTable").unwrap(),
        };

        let mut bytes = Vec::new();
        bytes.write_u32::<BigEndian>(0xCAFE_BABE).unwrap();
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes.write_u16::<BigEndian>(class.version).unwrap();
        pool.to_bytes(&mut bytes).unwrap();
        bytes.write_u16::<BigEndian>(class.access_flags.bits()).unwrap();
        bytes.write_u16::<BigEndian>(this_class).unwrap();
        bytes.write_u16::<BigEndian>(super_class).unwrap();
        bytes.write_u16::<BigEndian>(interfaces.len() as u16).unwrap();
        for interface in interfaces {
            bytes.write_u16::<BigEndian>(interface).unwrap();
        }
        bytes.write_u16::<BigEndian>(fields.len() as u16).unwrap();
        for (name, descriptor) in fields {
            for value in [0, name, descriptor, 0] {
                bytes.write_u16::<BigEndian>(value).unwrap();
            }
        }
        bytes.write_u16::<BigEndian>(methods.len() as u16).unwrap();
        for (method, (name, descriptor)) in class.methods.iter().zip(methods) {
            bytes.write_u16::<BigEndian>(method.access_flags.bits()).unwrap();
            bytes.write_u16::<BigEndian>(name).unwrap();
            bytes.write_u16::<BigEndian>(descriptor).unwrap();
            match &method.code {
                Some(code) => {
                    bytes.write_u16::<BigEndian>(1).unwrap();
                    names.write_code(code, &mut bytes);
                }
                None => bytes.write_u16::<BigEndian>(0).unwrap(),
            }
        }
        // No class attributes.
        bytes.write_u16::<BigEndian>(0).unwrap();
        bytes
    }
}

/// Constant pool indices of the attribute names a [`Code`] is written with.
struct AttributeNames {
    code: u16,
    stack_map_table: u16,
    local_variable_table: u16,
}

impl AttributeNames {
    fn write_code(&self, code: &Code, bytes: &mut Vec<u8>) {
        let mut body = Vec::new();
        body.write_u16::<BigEndian>(code.max_stack).unwrap();
        body.write_u16::<BigEndian>(code.max_locals).unwrap();
        body.write_u32::<BigEndian>(code.code.len() as u32).unwrap();
        body.extend_from_slice(&code.code);
        body.write_u16::<BigEndian>(code.exception_table.len() as u16).unwrap();
        for block in &code.exception_table {
            for value in [
                block.start_pc(),
                block.end_pc(),
                block.handler_pc(),
                block.catch_type_index(),
            ] {
                body.write_u16::<BigEndian>(value).unwrap();
            }
        }

        let mut attributes = Vec::new();
        if let Some(payload) = &code.stack_map_table {
            attributes.push((self.stack_map_table, payload.clone()));
        }
        if !code.local_variable_table.is_empty() {
            let mut payload = Vec::new();
            payload
                .write_u16::<BigEndian>(code.local_variable_table.len() as u16)
                .unwrap();
            for variable in &code.local_variable_table {
                for value in [
                    variable.start_pc,
                    variable.length,
                    variable.name_index,
                    variable.descriptor_index,
                    variable.index,
                ] {
                    payload.write_u16::<BigEndian>(value).unwrap();
                }
            }
            attributes.push((self.local_variable_table, payload));
        }
        body.write_u16::<BigEndian>(attributes.len() as u16).unwrap();
        for (name, payload) in attributes {
            body.write_u16::<BigEndian>(name).unwrap();
            body.write_u32::<BigEndian>(payload.len() as u32).unwrap();
            body.extend(payload);
        }

        bytes.write_u16::<BigEndian>(self.code).unwrap();
        bytes.write_u32::<BigEndian>(body.len() as u32).unwrap();
        bytes.extend(body);
    }
}

/// Builds a [`Code`] attribute.
#[derive(Clone, Debug)]
pub(crate) struct CodeBuilder {
    code: Code,
}

impl CodeBuilder {
    pub(crate) fn new(max_stack: u16, max_locals: u16) -> Self {
        Self {
            code: Code {
                max_stack,
                max_locals,
                ..Code::default()
            },
        }
    }

    /// Appends raw instruction bytes.
    pub(crate) fn code(mut self, bytes: &[u8]) -> Self {
        self.code.code.extend_from_slice(bytes);
        self
    }

    /// Appends an instruction taking a two byte constant pool index.
    pub(crate) fn indexed(mut self, opcode: u8, index: u16) -> Self {
        self.code.code.push(opcode);
        self.code.code.extend_from_slice(&index.to_be_bytes());
        self
    }

    pub(crate) fn handler(mut self, block: TryCatchBlock) -> Self {
        self.code.exception_table.push(block);
        self
    }

    pub(crate) fn local_variable(mut self, variable: LocalVariable) -> Self {
        self.code.local_variable_table.push(variable);
        self
    }

    pub(crate) fn stack_map(mut self, encoder: StackMapEncoder) -> Self {
        self.code.stack_map_table = Some(encoder.build());
        self
    }

    pub(crate) fn build(self) -> Code {
        self.code
    }
}

/// A `verification_type_info` entry.
#[derive(Clone, Copy, Debug)]
pub(crate) enum VType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// A class constant pool index.
    Object(u16),
    /// The offset of a `new` instruction.
    Uninitialized(u16),
}

impl VType {
    fn encode(self, bytes: &mut Vec<u8>) {
        match self {
            VType::Top => bytes.push(0),
            VType::Integer => bytes.push(1),
            VType::Float => bytes.push(2),
            VType::Double => bytes.push(3),
            VType::Long => bytes.push(4),
            VType::Null => bytes.push(5),
            VType::UninitializedThis => bytes.push(6),
            VType::Object(index) => {
                bytes.push(7);
                bytes.extend_from_slice(&index.to_be_bytes());
            }
            VType::Uninitialized(offset) => {
                bytes.push(8);
                bytes.extend_from_slice(&offset.to_be_bytes());
            }
        }
    }
}

/// Encodes a `StackMapTable` attribute payload, frame by frame.
///
/// Offsets are given as deltas, exactly as they are stored in the attribute.
#[derive(Clone, Debug, Default)]
pub(crate) struct StackMapEncoder {
    count: u16,
    frames: Vec<u8>,
    trailing: Vec<u8>,
}

impl StackMapEncoder {
    pub(crate) fn same(mut self, delta: u16) -> Self {
        match u8::try_from(delta) {
            Ok(delta) if delta < 64 => self.frames.push(delta),
            _ => self.frame(251, delta),
        }
        self.count += 1;
        self
    }

    pub(crate) fn same_locals_1(mut self, delta: u16, stack: VType) -> Self {
        match u8::try_from(delta) {
            Ok(delta) if delta < 64 => self.frames.push(64 + delta),
            _ => self.frame(247, delta),
        }
        stack.encode(&mut self.frames);
        self.count += 1;
        self
    }

    pub(crate) fn chop(mut self, locals: u8, delta: u16) -> Self {
        self.frame(251 - locals, delta);
        self.count += 1;
        self
    }

    pub(crate) fn append(mut self, delta: u16, locals: &[VType]) -> Self {
        self.frame(251 + locals.len() as u8, delta);
        for local in locals {
            local.encode(&mut self.frames);
        }
        self.count += 1;
        self
    }

    pub(crate) fn full(mut self, delta: u16, locals: &[VType], stack: &[VType]) -> Self {
        self.frame(255, delta);
        for types in [locals, stack] {
            self.frames.extend_from_slice(&(types.len() as u16).to_be_bytes());
            for value in types {
                value.encode(&mut self.frames);
            }
        }
        self.count += 1;
        self
    }

    /// Appends the bytes of a single, possibly malformed, frame.
    pub(crate) fn raw(mut self, bytes: &[u8]) -> Self {
        self.frames.extend_from_slice(bytes);
        self.count += 1;
        self
    }

    /// Appends bytes after the last frame that are not counted as one.
    pub(crate) fn trailing(mut self, bytes: &[u8]) -> Self {
        self.trailing.extend_from_slice(bytes);
        self
    }

    fn frame(&mut self, frame_type: u8, delta: u16) {
        self.frames.push(frame_type);
        self.frames.extend_from_slice(&delta.to_be_bytes());
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut payload = self.count.to_be_bytes().to_vec();
        payload.extend(self.frames);
        payload.extend(self.trailing);
        payload
    }
}
