use jclassfile::attributes::Attribute;
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::methods::{MethodFlags, MethodInfo};
use tracing::{debug, warn};

use crate::bytecode::{self, ConstantPoolResolver, MemberRef};
use crate::descriptor::{ClassDescriptor, DescriptorFactory};
use crate::error::{AnalysisError, Result};
use crate::ir::{Class, ConstantOperand, ExceptionHandler, Method, MethodAccess};

/// Parses class bytes into the analysis IR, interning descriptors through
/// `descriptors`. `label` names the input in errors until the class name is
/// known.
///
/// A method whose code does not decode keeps the failure in
/// [`Method::decode_error`]; the rest of the class still loads.
pub fn parse_class(data: &[u8], label: &str, descriptors: &DescriptorFactory) -> Result<Class> {
    let class_file = class_file::parse(data).map_err(|err| AnalysisError::MalformedClass {
        class: label.to_string(),
        message: err.to_string(),
    })?;
    let pool = PoolResolver {
        pool: class_file.constant_pool(),
        label,
    };
    let class_name = pool.class_name(class_file.this_class())?;
    let super_name = match class_file.super_class() {
        0 => None,
        index => Some(pool.class_name(index)?),
    };
    let descriptor = descriptors.class_descriptor(&class_name);
    let pool = PoolResolver {
        pool: class_file.constant_pool(),
        label: &class_name,
    };

    let mut methods = Vec::with_capacity(class_file.methods().len());
    for method in class_file.methods() {
        methods.push(parse_method(method, &pool, &descriptor, descriptors)?);
    }
    debug!(class = %descriptor, methods = methods.len(), "parsed class");

    Ok(Class {
        descriptor,
        super_name,
        methods,
    })
}

fn parse_method(
    method: &MethodInfo,
    pool: &PoolResolver<'_>,
    class: &ClassDescriptor,
    descriptors: &DescriptorFactory,
) -> Result<Method> {
    let flags = method.access_flags();
    let access = MethodAccess {
        is_public: flags.contains(MethodFlags::ACC_PUBLIC),
        is_static: flags.contains(MethodFlags::ACC_STATIC),
        is_abstract: flags.contains(MethodFlags::ACC_ABSTRACT),
        is_native: flags.contains(MethodFlags::ACC_NATIVE),
        is_synchronized: flags.contains(MethodFlags::ACC_SYNCHRONIZED),
    };
    let name = pool.utf8(method.name_index())?;
    let signature = pool.utf8(method.descriptor_index())?;
    let descriptor = descriptors.method_descriptor(class.class_name(), &name, &signature, access.is_static);
    let label = descriptor.to_string();

    let mut parsed = Method {
        descriptor,
        access,
        max_locals: 0,
        max_stack: 0,
        code_length: 0,
        instructions: Vec::new(),
        decode_error: None,
        exception_handlers: Vec::new(),
        declared_exceptions: Vec::new(),
    };

    for attribute in method.attributes() {
        match attribute {
            Attribute::Code {
                max_stack,
                max_locals,
                code,
                exception_table,
                ..
            } => {
                parsed.max_stack = *max_stack;
                parsed.max_locals = *max_locals;
                parsed.code_length = code.len() as u32;
                match bytecode::decode(code, pool, descriptors, &label) {
                    Ok(instructions) => parsed.instructions = instructions,
                    Err(err) => {
                        warn!(method = %label, error = %err, "method code does not decode");
                        parsed.decode_error = Some(err);
                    }
                }
                for record in exception_table {
                    let catch_type = match record.catch_type() {
                        0 => None,
                        index => Some(pool.class_name(index)?),
                    };
                    parsed.exception_handlers.push(ExceptionHandler {
                        start_pc: u32::from(record.start_pc()),
                        end_pc: u32::from(record.end_pc()),
                        handler_pc: u32::from(record.handler_pc()),
                        catch_type,
                    });
                }
            }
            Attribute::Exceptions {
                exception_index_table,
            } => {
                for index in exception_index_table {
                    parsed.declared_exceptions.push(pool.class_name(*index)?);
                }
            }
            _ => {}
        }
    }
    Ok(parsed)
}

/// Constant pool view over a parsed class file.
struct PoolResolver<'a> {
    pool: &'a [ConstantPool],
    label: &'a str,
}

impl PoolResolver<'_> {
    fn entry(&self, index: u16) -> Result<&ConstantPool> {
        match self.pool.get(usize::from(index)) {
            Some(ConstantPool::Empty) | None => Err(self.invalid(index, "missing constant")),
            Some(entry) => Ok(entry),
        }
    }

    fn utf8(&self, index: u16) -> Result<String> {
        match self.entry(index)? {
            ConstantPool::Utf8 { value } => Ok(value.clone()),
            _ => Err(self.invalid(index, "expected Utf8")),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.entry(index)? {
            ConstantPool::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(self.invalid(index, "expected NameAndType")),
        }
    }

    fn member(&self, class_index: u16, name_and_type_index: u16) -> Result<MemberRef> {
        let owner = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(name_and_type_index)?;
        Ok(MemberRef {
            owner,
            name,
            descriptor,
        })
    }

    fn invalid(&self, index: u16, message: &str) -> AnalysisError {
        AnalysisError::MalformedClass {
            class: self.label.to_string(),
            message: format!("{message} at constant pool index {index}"),
        }
    }
}

impl ConstantPoolResolver for PoolResolver<'_> {
    fn class_name(&self, index: u16) -> Result<String> {
        match self.entry(index)? {
            ConstantPool::Class { name_index } => self.utf8(*name_index),
            _ => Err(self.invalid(index, "expected Class")),
        }
    }

    fn field_ref(&self, index: u16) -> Result<MemberRef> {
        match self.entry(index)? {
            ConstantPool::Fieldref {
                class_index,
                name_and_type_index,
            } => self.member(*class_index, *name_and_type_index),
            _ => Err(self.invalid(index, "expected Fieldref")),
        }
    }

    fn method_ref(&self, index: u16) -> Result<MemberRef> {
        match self.entry(index)? {
            ConstantPool::Methodref {
                class_index,
                name_and_type_index,
            }
            | ConstantPool::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => self.member(*class_index, *name_and_type_index),
            _ => Err(self.invalid(index, "expected Methodref")),
        }
    }

    fn invoke_dynamic(&self, index: u16) -> Result<(String, String)> {
        match self.entry(index)? {
            ConstantPool::InvokeDynamic {
                name_and_type_index,
                ..
            } => self.name_and_type(*name_and_type_index),
            _ => Err(self.invalid(index, "expected InvokeDynamic")),
        }
    }

    fn constant(&self, index: u16) -> Result<ConstantOperand> {
        let constant = match self.entry(index)? {
            ConstantPool::Integer { value } => ConstantOperand::Int(*value),
            ConstantPool::Float { value } => ConstantOperand::Float(*value),
            ConstantPool::Long { value } => ConstantOperand::Long(*value),
            ConstantPool::Double { value } => ConstantOperand::Double(*value),
            ConstantPool::String { string_index } => {
                ConstantOperand::String(self.utf8(*string_index)?)
            }
            ConstantPool::Class { name_index } => ConstantOperand::Class(self.utf8(*name_index)?),
            ConstantPool::MethodHandle { .. }
            | ConstantPool::MethodType { .. }
            | ConstantPool::Dynamic { .. } => ConstantOperand::Other,
            _ => return Err(self.invalid(index, "expected loadable constant")),
        };
        Ok(constant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(value: &str) -> ConstantPool {
        ConstantPool::Utf8 {
            value: value.to_string(),
        }
    }

    fn sample_pool() -> Vec<ConstantPool> {
        vec![
            ConstantPool::Empty,
            utf8("java/io/PrintStream"),
            ConstantPool::Class { name_index: 1 },
            utf8("println"),
            utf8("(Ljava/lang/String;)V"),
            ConstantPool::NameAndType {
                name_index: 3,
                descriptor_index: 4,
            },
            ConstantPool::Methodref {
                class_index: 2,
                name_and_type_index: 5,
            },
            utf8("hello"),
            ConstantPool::String { string_index: 7 },
            ConstantPool::Long { value: 42 },
            ConstantPool::Empty,
        ]
    }

    #[test]
    fn resolves_method_references() {
        let pool = sample_pool();
        let resolver = PoolResolver {
            pool: &pool,
            label: "Sample",
        };
        let member = resolver.method_ref(6).expect("method ref");
        assert_eq!(member.owner, "java/io/PrintStream");
        assert_eq!(member.name, "println");
        assert_eq!(member.descriptor, "(Ljava/lang/String;)V");
    }

    #[test]
    fn resolves_loadable_constants() {
        let pool = sample_pool();
        let resolver = PoolResolver {
            pool: &pool,
            label: "Sample",
        };
        assert_eq!(
            resolver.constant(8).expect("string"),
            ConstantOperand::String("hello".to_string())
        );
        assert_eq!(resolver.constant(9).expect("long"), ConstantOperand::Long(42));
        assert_eq!(
            resolver.constant(2).expect("class literal"),
            ConstantOperand::Class("java/io/PrintStream".to_string())
        );
    }

    #[test]
    fn rejects_wrong_entry_kinds() {
        let pool = sample_pool();
        let resolver = PoolResolver {
            pool: &pool,
            label: "Sample",
        };
        assert!(resolver.field_ref(6).is_err());
        let err = resolver.constant(10).expect_err("padding slot");
        assert_eq!(err.category(), "MalformedClass");
    }

    #[test]
    fn rejects_bytes_without_magic() {
        let err = parse_class(b"nope", "bad.class", &DescriptorFactory::new()).expect_err("invalid");
        match err {
            AnalysisError::MalformedClass { class, .. } => assert_eq!(class, "bad.class"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
