//! Fixtures shared by unit tests: an in-memory constant pool and a method builder.

use std::collections::HashMap;

use crate::bytecode::{self, ConstantPoolResolver, MemberRef};
use crate::cfg::{BlockId, Edge, EdgeFlags, EdgeId, EdgeKind};
use crate::dataflow::DataflowAnalysis;
use crate::descriptor::{ClassDescriptor, DescriptorFactory, MethodDescriptor};
use crate::error::{AnalysisError, Result};
use crate::ir::{ConstantOperand, ExceptionHandler, Method, MethodAccess};

#[derive(Default)]
pub(crate) struct FakePool {
    pub(crate) classes: HashMap<u16, String>,
    pub(crate) members: HashMap<u16, MemberRef>,
    pub(crate) constants: HashMap<u16, ConstantOperand>,
}

impl FakePool {
    pub(crate) fn with_member(mut self, index: u16, owner: &str, name: &str, descriptor: &str) -> Self {
        self.members.insert(
            index,
            MemberRef {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            },
        );
        self
    }

    pub(crate) fn with_class(mut self, index: u16, name: &str) -> Self {
        self.classes.insert(index, name.to_string());
        self
    }

    pub(crate) fn with_constant(mut self, index: u16, constant: ConstantOperand) -> Self {
        self.constants.insert(index, constant);
        self
    }
}

impl ConstantPoolResolver for FakePool {
    fn class_name(&self, index: u16) -> Result<String> {
        self.classes.get(&index).cloned().ok_or_else(|| missing(index))
    }

    fn field_ref(&self, index: u16) -> Result<MemberRef> {
        self.members.get(&index).cloned().ok_or_else(|| missing(index))
    }

    fn method_ref(&self, index: u16) -> Result<MemberRef> {
        self.members.get(&index).cloned().ok_or_else(|| missing(index))
    }

    fn invoke_dynamic(&self, index: u16) -> Result<(String, String)> {
        self.members
            .get(&index)
            .map(|member| (member.name.clone(), member.descriptor.clone()))
            .ok_or_else(|| missing(index))
    }

    fn constant(&self, index: u16) -> Result<ConstantOperand> {
        self.constants.get(&index).cloned().ok_or_else(|| missing(index))
    }
}

fn missing(index: u16) -> AnalysisError {
    AnalysisError::MalformedClass {
        class: "Fake".to_string(),
        message: format!("no constant at {index}"),
    }
}

/// Builds a decoded [`Method`] from raw bytecode.
pub(crate) struct MethodBuilder {
    name: String,
    signature: String,
    is_static: bool,
    is_synchronized: bool,
    max_locals: u16,
    code: Vec<u8>,
    handlers: Vec<ExceptionHandler>,
    declared: Vec<String>,
    pool: FakePool,
}

impl MethodBuilder {
    pub(crate) fn new(signature: &str, code: &[u8]) -> Self {
        Self {
            name: "test".to_string(),
            signature: signature.to_string(),
            is_static: true,
            is_synchronized: false,
            max_locals: 4,
            code: code.to_vec(),
            handlers: Vec::new(),
            declared: Vec::new(),
            pool: FakePool::default(),
        }
    }

    pub(crate) fn instance(mut self) -> Self {
        self.is_static = false;
        self
    }

    pub(crate) fn synchronized(mut self) -> Self {
        self.is_synchronized = true;
        self
    }

    pub(crate) fn max_locals(mut self, max_locals: u16) -> Self {
        self.max_locals = max_locals;
        self
    }

    pub(crate) fn handler(mut self, start_pc: u32, end_pc: u32, handler_pc: u32, catch_type: Option<&str>) -> Self {
        self.handlers.push(ExceptionHandler {
            start_pc,
            end_pc,
            handler_pc,
            catch_type: catch_type.map(str::to_string),
        });
        self
    }

    pub(crate) fn throws(mut self, exception: &str) -> Self {
        self.declared.push(exception.to_string());
        self
    }

    pub(crate) fn pool(mut self, pool: FakePool) -> Self {
        self.pool = pool;
        self
    }

    pub(crate) fn build(self) -> Method {
        let descriptor = MethodDescriptor::new(
            ClassDescriptor::new("com/example/Sample"),
            &self.name,
            &self.signature,
            self.is_static,
        );
        let instructions = bytecode::decode(&self.code, &self.pool, &DescriptorFactory::new(), &descriptor.to_string())
            .expect("decode test code");
        Method {
            descriptor,
            access: MethodAccess {
                is_public: true,
                is_static: self.is_static,
                is_abstract: false,
                is_native: false,
                is_synchronized: self.is_synchronized,
            },
            max_locals: self.max_locals,
            max_stack: 8,
            code_length: self.code.len() as u32,
            instructions,
            decode_error: None,
            exception_handlers: self.handlers,
            declared_exceptions: self.declared,
        }
    }
}

/// A detached edge for calling `meet_into` directly.
pub(crate) fn edge(kind: EdgeKind) -> Edge {
    Edge {
        id: EdgeId(0),
        source: BlockId(1),
        target: BlockId(2),
        kind,
        flags: EdgeFlags::empty(),
    }
}

/// `meet(a, b)` as a fresh fact.
pub(crate) fn meet<A: DataflowAnalysis>(analysis: &A, a: &A::Fact, b: &A::Fact) -> A::Fact {
    let mut accumulator = a.clone();
    analysis
        .meet_into(b, &edge(EdgeKind::FallThrough), &mut accumulator)
        .expect("meet");
    accumulator
}

/// Checks identity, absorption, commutativity and associativity of the meet.
pub(crate) fn assert_meet_laws<A: DataflowAnalysis>(
    analysis: &A,
    top: &A::Fact,
    bottom: &A::Fact,
    a: &A::Fact,
    b: &A::Fact,
    c: &A::Fact,
) {
    assert!(analysis.same(&meet(analysis, a, top), a), "a meet TOP == a");
    assert!(analysis.same(&meet(analysis, top, a), a), "TOP meet a == a");
    assert!(analysis.same(&meet(analysis, a, bottom), bottom), "a meet BOTTOM == BOTTOM");
    assert!(
        analysis.same(&meet(analysis, a, b), &meet(analysis, b, a)),
        "meet is commutative"
    );
    let left = meet(analysis, &meet(analysis, a, b), c);
    let right = meet(analysis, a, &meet(analysis, b, c));
    assert!(analysis.same(&left, &right), "meet is associative");
}
