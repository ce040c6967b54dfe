//! Assembles class-file bytes in memory for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// Code attribute contents for one method.
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytes: Vec<u8>,
    /// `(start_pc, end_pc, handler_pc, catch_type)`; `None` catches anything.
    pub handlers: Vec<(u16, u16, u16, Option<&'static str>)>,
}

impl Code {
    pub fn new(max_stack: u16, max_locals: u16, bytes: Vec<u8>) -> Self {
        Self {
            max_stack,
            max_locals,
            bytes,
            handlers: Vec::new(),
        }
    }
}

struct MethodEntry {
    access: u16,
    name: u16,
    descriptor: u16,
    code: Option<(Code, Vec<(u16, u16, u16, u16)>)>,
    throws: Vec<u16>,
}

pub struct ClassFileBuilder {
    pool: Vec<u8>,
    pool_count: u16,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
    this_class: u16,
    super_class: u16,
    methods: Vec<MethodEntry>,
}

impl ClassFileBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = Self {
            pool: Vec::new(),
            pool_count: 1,
            utf8: HashMap::new(),
            classes: HashMap::new(),
            this_class: 0,
            super_class: 0,
            methods: Vec::new(),
        };
        builder.this_class = builder.class(name);
        builder.super_class = builder.class("java/lang/Object");
        builder
    }

    fn push_entry(&mut self, bytes: &[u8]) -> u16 {
        let index = self.pool_count;
        self.pool.extend_from_slice(bytes);
        self.pool_count += 1;
        index
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        if let Some(index) = self.utf8.get(value) {
            return *index;
        }
        let mut entry = vec![1];
        entry.extend_from_slice(&(value.len() as u16).to_be_bytes());
        entry.extend_from_slice(value.as_bytes());
        let index = self.push_entry(&entry);
        self.utf8.insert(value.to_string(), index);
        index
    }

    pub fn class(&mut self, name: &str) -> u16 {
        if let Some(index) = self.classes.get(name) {
            return *index;
        }
        let name_index = self.utf8(name);
        let mut entry = vec![7];
        entry.extend_from_slice(&name_index.to_be_bytes());
        let index = self.push_entry(&entry);
        self.classes.insert(name.to_string(), index);
        index
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let string_index = self.utf8(value);
        let mut entry = vec![8];
        entry.extend_from_slice(&string_index.to_be_bytes());
        self.push_entry(&entry)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push_entry(&entry)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut entry = vec![12];
        entry.extend_from_slice(&name_index.to_be_bytes());
        entry.extend_from_slice(&descriptor_index.to_be_bytes());
        self.push_entry(&entry)
    }

    fn member(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let name_and_type = self.name_and_type(name, descriptor);
        let mut entry = vec![tag];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&name_and_type.to_be_bytes());
        self.push_entry(&entry)
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(9, owner, name, descriptor)
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.member(10, owner, name, descriptor)
    }

    /// Adds a method; `code` is `None` for abstract or native methods.
    pub fn method(&mut self, access: u16, name: &str, descriptor: &str, code: Option<Code>, throws: &[&str]) {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let code = code.map(|code| {
            let handlers = code
                .handlers
                .iter()
                .map(|(start, end, handler, catch_type)| {
                    let catch_type = catch_type.map_or(0, |name| self.class(name));
                    (*start, *end, *handler, catch_type)
                })
                .collect();
            (code, handlers)
        });
        let throws = throws.iter().map(|name| self.class(name)).collect();
        self.utf8("Code");
        self.utf8("Exceptions");
        self.methods.push(MethodEntry {
            access,
            name,
            descriptor,
            code,
            throws,
        });
    }

    pub fn build(mut self) -> Vec<u8> {
        let code_name = self.utf8("Code");
        let exceptions_name = self.utf8("Exceptions");

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&self.pool_count.to_be_bytes());
        out.extend_from_slice(&self.pool);
        out.extend_from_slice(&(ACC_PUBLIC | 0x0020).to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());

        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend_from_slice(&method.access.to_be_bytes());
            out.extend_from_slice(&method.name.to_be_bytes());
            out.extend_from_slice(&method.descriptor.to_be_bytes());

            let attribute_count = u16::from(method.code.is_some()) + u16::from(!method.throws.is_empty());
            out.extend_from_slice(&attribute_count.to_be_bytes());

            if let Some((code, handlers)) = &method.code {
                let mut body = Vec::new();
                body.extend_from_slice(&code.max_stack.to_be_bytes());
                body.extend_from_slice(&code.max_locals.to_be_bytes());
                body.extend_from_slice(&(code.bytes.len() as u32).to_be_bytes());
                body.extend_from_slice(&code.bytes);
                body.extend_from_slice(&(handlers.len() as u16).to_be_bytes());
                for (start, end, handler, catch_type) in handlers {
                    for value in [start, end, handler, catch_type] {
                        body.extend_from_slice(&value.to_be_bytes());
                    }
                }
                body.extend_from_slice(&0u16.to_be_bytes());

                out.extend_from_slice(&code_name.to_be_bytes());
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&body);
            }

            if !method.throws.is_empty() {
                out.extend_from_slice(&exceptions_name.to_be_bytes());
                out.extend_from_slice(&(2 + 2 * method.throws.len() as u32).to_be_bytes());
                out.extend_from_slice(&(method.throws.len() as u16).to_be_bytes());
                for index in &method.throws {
                    out.extend_from_slice(&index.to_be_bytes());
                }
            }
        }

        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }
}

/// Big-endian bytes of a constant pool index, for splicing into code.
pub fn index(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}
