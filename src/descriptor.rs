//! Stable identities for classes, methods and fields.
//!
//! Descriptors compare and hash structurally, so they serve directly as cache
//! keys and graph labels. Names use the JVM internal (slashed) form.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use jdescriptor::{MethodDescriptor as ParsedMethodDescriptor, TypeDescriptor};
use serde::Serialize;

use crate::error::{AnalysisError, Result};

/// Identity of a class, in slashed internal form (`java/lang/String`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClassDescriptor {
    class_name: Arc<str>,
}

impl ClassDescriptor {
    /// Creates a descriptor; dotted names are converted to slashed form.
    pub fn new(class_name: &str) -> Self {
        let class_name: String = class_name.replace('.', "/");
        Self {
            class_name: Arc::from(class_name),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn dotted_name(&self) -> String {
        self.class_name.replace('/', ".")
    }

    /// Class name without its package.
    pub fn simple_name(&self) -> &str {
        match self.class_name.rfind('/') {
            Some(index) => &self.class_name[index + 1..],
            None => &self.class_name,
        }
    }

    /// Package in dotted form; empty for the default package.
    pub fn package_name(&self) -> String {
        match self.class_name.rfind('/') {
            Some(index) => self.class_name[..index].replace('/', "."),
            None => String::new(),
        }
    }

    /// Field-type signature of the class (`Ljava/lang/String;`).
    pub fn signature(&self) -> String {
        format!("L{};", self.class_name)
    }
}

impl fmt::Display for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dotted_name())
    }
}

/// Identity of a method: declaring class, name, signature and staticness.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MethodDescriptor {
    class: ClassDescriptor,
    name: Arc<str>,
    signature: Arc<str>,
    is_static: bool,
}

impl MethodDescriptor {
    pub fn new(class: ClassDescriptor, name: &str, signature: &str, is_static: bool) -> Self {
        Self {
            class,
            name: Arc::from(name),
            signature: Arc::from(signature),
            is_static,
        }
    }

    pub fn class(&self) -> &ClassDescriptor {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn parsed_signature(&self) -> Result<ParsedMethodDescriptor> {
        parse_method_signature(&self.signature)
    }

    pub fn parameter_types(&self) -> Result<Vec<TypeDescriptor>> {
        Ok(self.parsed_signature()?.parameter_types().clone())
    }

    /// Number of local slots taken by the arguments, including the receiver of
    /// instance methods.
    pub fn argument_slot_count(&self) -> Result<usize> {
        let receiver = usize::from(!self.is_static);
        Ok(receiver + argument_words(&self.signature)?)
    }

    /// Number of operand stack words the method returns.
    pub fn return_slot_count(&self) -> Result<usize> {
        return_words(&self.signature)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.signature)
    }
}

/// Identity of a field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FieldDescriptor {
    class: ClassDescriptor,
    name: Arc<str>,
    signature: Arc<str>,
    is_static: bool,
}

impl FieldDescriptor {
    pub fn new(class: ClassDescriptor, name: &str, signature: &str, is_static: bool) -> Self {
        Self {
            class,
            name: Arc::from(name),
            signature: Arc::from(signature),
            is_static,
        }
    }

    pub fn class(&self) -> &ClassDescriptor {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Operand stack words a value of this field occupies.
    pub fn slot_size(&self) -> Result<usize> {
        let parsed = TypeDescriptor::from_str(&self.signature).map_err(|err| {
            AnalysisError::InvalidDescriptor {
                descriptor: self.signature.to_string(),
                message: err.to_string(),
            }
        })?;
        Ok(type_words(&parsed))
    }
}

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} : {}", self.class, self.name, self.signature)
    }
}

pub(crate) fn parse_method_signature(signature: &str) -> Result<ParsedMethodDescriptor> {
    ParsedMethodDescriptor::from_str(signature).map_err(|err| AnalysisError::InvalidDescriptor {
        descriptor: signature.to_string(),
        message: err.to_string(),
    })
}

/// Stack words taken by a value of the given type (`long`/`double` take two).
pub(crate) fn type_words(descriptor: &TypeDescriptor) -> usize {
    match descriptor {
        TypeDescriptor::Void => 0,
        TypeDescriptor::Long | TypeDescriptor::Double => 2,
        _ => 1,
    }
}

/// Stack words taken by the arguments of a method signature, receiver excluded.
pub(crate) fn argument_words(signature: &str) -> Result<usize> {
    let parsed = parse_method_signature(signature)?;
    Ok(parsed.parameter_types().iter().map(type_words).sum())
}

pub(crate) fn return_words(signature: &str) -> Result<usize> {
    let parsed = parse_method_signature(signature)?;
    Ok(type_words(parsed.return_type()))
}

/// Interns descriptors so every discovered class and method shares one identity.
#[derive(Debug, Default)]
pub struct DescriptorFactory {
    classes: DashMap<String, ClassDescriptor>,
    methods: DashMap<(ClassDescriptor, String, String, bool), MethodDescriptor>,
    fields: DashMap<(ClassDescriptor, String, String, bool), FieldDescriptor>,
}

impl DescriptorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class_descriptor(&self, class_name: &str) -> ClassDescriptor {
        let key = class_name.replace('.', "/");
        if let Some(existing) = self.classes.get(&key) {
            return existing.value().clone();
        }
        self.classes
            .entry(key.clone())
            .or_insert_with(|| ClassDescriptor::new(&key))
            .value()
            .clone()
    }

    pub fn method_descriptor(
        &self,
        class_name: &str,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> MethodDescriptor {
        let class = self.class_descriptor(class_name);
        let key = (class.clone(), name.to_string(), signature.to_string(), is_static);
        self.methods
            .entry(key)
            .or_insert_with(|| MethodDescriptor::new(class, name, signature, is_static))
            .value()
            .clone()
    }

    pub fn field_descriptor(
        &self,
        class_name: &str,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> FieldDescriptor {
        let class = self.class_descriptor(class_name);
        let key = (class.clone(), name.to_string(), signature.to_string(), is_static);
        self.fields
            .entry(key)
            .or_insert_with(|| FieldDescriptor::new(class, name, signature, is_static))
            .value()
            .clone()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}
