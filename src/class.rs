use crate::{errors::*, ClassHierarchyInfo, Method};
use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use ristretto_classfile::{ClassAccessFlags, ClassFile, ConstantPool};
use std::io::{self, Cursor};

/// A field declared by a class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub descriptor: String,
}

/// The structural view of a class the verifier works on.
///
/// A model is usually adapted from a parsed [`ClassFile`], but every field is public so
/// callers with their own class reader can build one directly.
#[derive(Clone, Debug)]
pub struct ClassModel {
    /// The class file major version.
    pub version: u16,
    pub access_flags: ClassAccessFlags,
    /// The binary name of this class.
    pub this_class: String,
    /// The binary name of the superclass, `None` for `java/lang/Object`.
    pub super_class: Option<String>,
    /// The binary names of the directly implemented interfaces.
    pub interfaces: Vec<String>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub constant_pool: ConstantPool,
}

impl ClassModel {
    /// Parses a class file.
    ///
    /// Unlike the conversion from a [`ClassFile`], every `Code` attribute is decoded from
    /// `bytes` directly, so exception table offsets are kept exactly as written.
    ///
    /// # Errors
    /// If the bytes are not a well formed class file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let class_file = ClassFile::from_bytes(&mut Cursor::new(bytes.to_vec()))?;
        let mut class = Self::try_from(&class_file)?;
        let attributes = code_attributes(&class.constant_pool, bytes)
            .map_err(|error| Error::InvalidClassFile(format!("{}: {error}", class.this_class)))?;
        if attributes.len() != class.methods.len() {
            return Err(Error::InvalidClassFile(format!(
                "{}: expected {} methods, found {}",
                class.this_class,
                class.methods.len(),
                attributes.len()
            )));
        }

        for (method, attribute) in class.methods.iter_mut().zip(attributes) {
            if let Some(attribute) = attribute {
                method.code = Some(method.decode_code(&class.constant_pool, attribute)?);
            }
        }
        debug!(
            "Read class {} with {} method(s)",
            class.this_class,
            class.methods.len()
        );
        Ok(class)
    }

    /// Looks a method up by name and descriptor.
    ///
    /// # Errors
    /// If the class declares no such method.
    pub fn method(&self, name: &str, descriptor: &str) -> Result<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
            .ok_or_else(|| Error::NoSuchMethod(format!("{name}{descriptor}")))
    }

    /// Returns `true` if this class declares a field with the given name and descriptor.
    pub fn has_field(&self, name: &str, descriptor: &str) -> bool {
        self.fields
            .iter()
            .any(|field| field.name == name && field.descriptor == descriptor)
    }

    /// Returns `true` if this class is an interface.
    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(ClassAccessFlags::INTERFACE)
    }

    /// Describes this class for a [`ClassHierarchyResolver`](crate::ClassHierarchyResolver).
    pub fn hierarchy_info(&self) -> ClassHierarchyInfo {
        ClassHierarchyInfo {
            is_interface: self.is_interface(),
            super_class: self.super_class.clone(),
        }
    }
}

impl TryFrom<&ClassFile> for ClassModel {
    type Error = Error;

    fn try_from(class_file: &ClassFile) -> Result<Self> {
        let constant_pool = &class_file.constant_pool;
        let this_class = constant_pool.try_get_class(class_file.this_class)?;
        let super_class = match class_file.super_class {
            0 => None,
            index => Some(constant_pool.try_get_class(index)?.to_string()),
        };
        let interfaces = class_file
            .interfaces
            .iter()
            .map(|index| constant_pool.try_get_class(*index).map(ToString::to_string))
            .collect::<ristretto_classfile::Result<Vec<_>>>()?;
        let fields = class_file
            .fields
            .iter()
            .map(|field| {
                Ok(Field {
                    name: constant_pool.try_get_utf8(field.name_index)?.to_string(),
                    descriptor: constant_pool.try_get_utf8(field.descriptor_index)?.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let methods = class_file
            .methods
            .iter()
            .map(|definition| Method::try_from(class_file, definition))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: class_file.version.major(),
            access_flags: class_file.access_flags,
            this_class: this_class.to_string(),
            super_class,
            interfaces,
            fields,
            methods,
            constant_pool: constant_pool.clone(),
        })
    }
}

const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELD_REF: u8 = 9;
const CONSTANT_METHOD_REF: u8 = 10;
const CONSTANT_INTERFACE_METHOD_REF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

fn skip(cursor: &mut Cursor<&[u8]>, length: u64) -> io::Result<()> {
    let position = cursor.position() + length;
    if position > cursor.get_ref().len() as u64 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    cursor.set_position(position);
    Ok(())
}

/// Skips an `attributes` table.
fn skip_attributes(cursor: &mut Cursor<&[u8]>) -> io::Result<()> {
    let count = cursor.read_u16::<BigEndian>()?;
    for _ in 0..count {
        skip(cursor, 2)?;
        let length = cursor.read_u32::<BigEndian>()?;
        skip(cursor, u64::from(length))?;
    }
    Ok(())
}

/// Walks a class file and returns the complete `Code` attribute of every method, in
/// declaration order.
fn code_attributes<'a>(
    pool: &ConstantPool,
    bytes: &'a [u8],
) -> io::Result<Vec<Option<&'a [u8]>>> {
    let mut cursor = Cursor::new(bytes);
    // magic, minor_version, major_version
    skip(&mut cursor, 8)?;

    let constant_pool_count = cursor.read_u16::<BigEndian>()?;
    let mut index = 1;
    while index < constant_pool_count {
        let length = match cursor.read_u8()? {
            CONSTANT_UTF8 => u64::from(cursor.read_u16::<BigEndian>()?),
            CONSTANT_CLASS | CONSTANT_STRING | CONSTANT_METHOD_TYPE | CONSTANT_MODULE
            | CONSTANT_PACKAGE => 2,
            CONSTANT_METHOD_HANDLE => 3,
            CONSTANT_INTEGER
            | CONSTANT_FLOAT
            | CONSTANT_FIELD_REF
            | CONSTANT_METHOD_REF
            | CONSTANT_INTERFACE_METHOD_REF
            | CONSTANT_NAME_AND_TYPE
            | CONSTANT_DYNAMIC
            | CONSTANT_INVOKE_DYNAMIC => 4,
            CONSTANT_LONG | CONSTANT_DOUBLE => {
                // Eight byte constants take two entries.
                index += 1;
                8
            }
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown constant pool tag {tag}"),
                ))
            }
        };
        skip(&mut cursor, length)?;
        index += 1;
    }

    // access_flags, this_class, super_class
    skip(&mut cursor, 6)?;
    let interfaces_count = cursor.read_u16::<BigEndian>()?;
    skip(&mut cursor, 2 * u64::from(interfaces_count))?;

    let fields_count = cursor.read_u16::<BigEndian>()?;
    for _ in 0..fields_count {
        skip(&mut cursor, 6)?;
        skip_attributes(&mut cursor)?;
    }

    let methods_count = cursor.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(usize::from(methods_count));
    for _ in 0..methods_count {
        skip(&mut cursor, 6)?;
        let mut code = None;
        let attributes_count = cursor.read_u16::<BigEndian>()?;
        for _ in 0..attributes_count {
            let start = cursor.position() as usize;
            let name_index = cursor.read_u16::<BigEndian>()?;
            let length = cursor.read_u32::<BigEndian>()?;
            skip(&mut cursor, u64::from(length))?;
            if pool.try_get_utf8(name_index).is_ok_and(|name| name == "Code") {
                code = Some(&bytes[start..cursor.position() as usize]);
            }
        }
        methods.push(code);
    }
    Ok(methods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::opcodes::*,
        testing::{ClassBuilder, CodeBuilder, StackMapEncoder, VType},
        verify, ClassHierarchy, Code, TryCatchBlock,
    };
    use ristretto_classfile::MethodAccessFlags;

    const STATIC: MethodAccessFlags = MethodAccessFlags::PUBLIC.union(MethodAccessFlags::STATIC);

    fn switch(opcode: u8, padding: &[u8], values: &[i32]) -> Vec<u8> {
        let mut bytes = vec![opcode];
        bytes.extend_from_slice(padding);
        for value in values {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes
    }

    /// Reads the class bytes directly, and through [`ClassFile`].
    fn read(builder: &ClassBuilder) -> (ClassModel, ClassModel) {
        let bytes = builder.to_bytes();
        let exact = ClassModel::from_bytes(&bytes).unwrap();
        let class_file = ClassFile::from_bytes(&mut Cursor::new(bytes)).unwrap();
        let converted = ClassModel::try_from(&class_file).unwrap();
        (exact, converted)
    }

    fn code<'a>(class: &'a ClassModel, name: &str, descriptor: &str) -> &'a Code {
        class.method(name, descriptor).unwrap().code.as_ref().unwrap()
    }

    /// A constructor, two try/catch blocks and both switch forms.
    fn sample() -> (ClassBuilder, u16, u16) {
        let mut builder = ClassBuilder::new("pkg/Sample");
        let pool = builder.pool_mut();
        let throwable = pool.add_class("java/lang/Throwable").unwrap();
        let runtime_exception = pool.add_class("java/lang/RuntimeException").unwrap();
        let object = pool.add_class("java/lang/Object").unwrap();
        let object_init = pool.add_method_ref(object, "<init>", "()V").unwrap();

        // public Sample() { super(); }
        let constructor = CodeBuilder::new(1, 1)
            .code(&[ALOAD_0])
            .indexed(INVOKESPECIAL, object_init)
            .code(&[RETURN]);
        // try { int x = 1; } catch (Throwable t) { return; } return;
        // The try range ends on a three byte goto, the handler stores into local 4.
        let guarded = CodeBuilder::new(1, 5)
            .code(&[ICONST_1, POP, GOTO, 0, 6, ASTORE, 4, RETURN, RETURN])
            .handler(TryCatchBlock::new(0..2, 5, throwable))
            .stack_map(
                StackMapEncoder::default()
                    .same_locals_1(5, VType::Object(throwable))
                    .same(2),
            );
        // static int divide(int a, int b, int c, int d) {
        //     try { a /= b; } catch (RuntimeException e) { a = -1; }
        //     return a + c + d;
        // }
        let divide = CodeBuilder::new(2, 5)
            .code(&[ILOAD_0, ILOAD_1, IDIV, ISTORE_0, GOTO, 0, 7, ASTORE, 4, ICONST_M1, ISTORE_0])
            .code(&[ILOAD_0, ILOAD_2, IADD, ILOAD_3, IADD, IRETURN])
            .handler(TryCatchBlock::new(0..4, 7, runtime_exception))
            .stack_map(
                StackMapEncoder::default()
                    .same_locals_1(7, VType::Object(runtime_exception))
                    .same(3),
            );
        let mut select = vec![ILOAD_0];
        select.extend(switch(TABLESWITCH, &[0, 0], &[23, 0, 1, 23, 23]));
        select.push(ILOAD_0);
        select.extend(switch(LOOKUPSWITCH, &[0, 0], &[27, 2, -1, 27, 5, 27]));
        select.push(RETURN);
        let select = CodeBuilder::new(1, 1)
            .code(&select)
            .stack_map(StackMapEncoder::default().same(24).same(27));

        let builder = builder
            .method(MethodAccessFlags::PUBLIC, "<init>", "()V", Some(constructor.build()))
            .method(STATIC, "guarded", "()V", Some(guarded.build()))
            .method(STATIC, "divide", "(IIII)I", Some(divide.build()))
            .method(STATIC, "select", "(I)V", Some(select.build()));
        (builder, throwable, runtime_exception)
    }

    #[test]
    fn test_read_class_file() {
        let (builder, throwable, runtime_exception) = sample();
        let expected = builder.clone().build();
        let (exact, converted) = read(&builder);
        let resolver = ClassHierarchy::default();

        for class in [&exact, &converted] {
            assert_eq!(class.version, 52);
            assert_eq!(class.this_class, "pkg/Sample");
            assert_eq!(class.super_class.as_deref(), Some("java/lang/Object"));
            assert_eq!(class.methods.len(), 4);
            assert_eq!(
                code(class, "guarded", "()V").exception_table,
                vec![TryCatchBlock::new(0..2, 5, throwable)]
            );
            assert_eq!(
                code(class, "divide", "(IIII)I").exception_table,
                vec![TryCatchBlock::new(0..4, 7, runtime_exception)]
            );
            for (name, descriptor) in [
                ("<init>", "()V"),
                ("guarded", "()V"),
                ("divide", "(IIII)I"),
                ("select", "(I)V"),
            ] {
                assert_eq!(
                    code(class, name, descriptor),
                    code(&expected, name, descriptor),
                    "{name}{descriptor}"
                );
            }
            assert_eq!(verify(class, &resolver), Vec::new());
        }
    }

    #[test]
    fn test_exception_range_ending_at_code_end() {
        let mut builder = ClassBuilder::new("pkg/Rethrow");
        let throwable = builder.pool_mut().add_class("java/lang/Throwable").unwrap();
        // The handler covers itself, the way a synchronized block's catch-all does.
        let rethrow = CodeBuilder::new(1, 1)
            .code(&[ACONST_NULL, ATHROW, ASTORE_0, ALOAD_0, ATHROW])
            .handler(TryCatchBlock::new(0..5, 2, 0))
            .stack_map(StackMapEncoder::default().same_locals_1(2, VType::Object(throwable)));
        let builder = builder.method(STATIC, "rethrow", "()V", Some(rethrow.build()));
        let (exact, converted) = read(&builder);

        assert_eq!(
            code(&exact, "rethrow", "()V").exception_table,
            vec![TryCatchBlock::new(0..5, 2, 0)]
        );
        // Instruction indices cannot tell the end of the code from the last instruction.
        assert_eq!(
            code(&converted, "rethrow", "()V").exception_table,
            vec![TryCatchBlock::new(0..4, 2, 0)]
        );

        let resolver = ClassHierarchy::default();
        assert_eq!(verify(&exact, &resolver), Vec::new());
        assert_eq!(verify(&converted, &resolver), Vec::new());
    }

    #[test]
    fn test_malformed_class_bytes() {
        let (builder, ..) = sample();
        let bytes = builder.to_bytes();
        assert!(ClassModel::from_bytes(&bytes[..bytes.len() - 8]).is_err());

        let unknown_tag = [0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 2, 99];
        let error = code_attributes(&ConstantPool::default(), &unknown_tag).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);

        let truncated = [0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 2, CONSTANT_UTF8, 0, 9];
        let error = code_attributes(&ConstantPool::default(), &truncated).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_method_lookup() {
        let class = ClassBuilder::new("pkg/Lookup")
            .field("count", "I")
            .method(MethodAccessFlags::PUBLIC, "run", "()V", None)
            .build();

        assert!(class.method("run", "()V").is_ok());
        assert_eq!(
            class.method("run", "(I)V").err(),
            Some(Error::NoSuchMethod("run(I)V".into()))
        );
        assert!(class.has_field("count", "I"));
        assert!(!class.has_field("count", "J"));
    }

    #[test]
    fn test_hierarchy_info() {
        let class = ClassBuilder::new("pkg/Api")
            .access_flags(ClassAccessFlags::INTERFACE | ClassAccessFlags::ABSTRACT)
            .build();
        assert_eq!(
            class.hierarchy_info(),
            ClassHierarchyInfo {
                is_interface: true,
                super_class: Some("java/lang/Object".into()),
            }
        );
    }
}
