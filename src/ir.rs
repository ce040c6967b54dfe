use crate::descriptor::{
    ClassDescriptor, FieldDescriptor, MethodDescriptor, argument_words, return_words,
};
use crate::error::{AnalysisError, Result};
use crate::opcodes;

/// Intermediate representation for a parsed JVM class.
#[derive(Clone, Debug)]
pub struct Class {
    pub descriptor: ClassDescriptor,
    pub super_name: Option<String>,
    pub methods: Vec<Method>,
}

impl Class {
    pub fn find_method(&self, name: &str, signature: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.descriptor.name() == name && method.descriptor.signature() == signature)
    }
}

/// Intermediate representation for a method and its decoded bytecode.
#[derive(Clone, Debug)]
pub struct Method {
    pub descriptor: MethodDescriptor,
    pub access: MethodAccess,
    pub max_locals: u16,
    pub max_stack: u16,
    pub code_length: u32,
    pub instructions: Vec<Instruction>,
    /// Why the code array could not be decoded. Raised when the method's CFG
    /// is built, so the failure stays with this method.
    pub decode_error: Option<AnalysisError>,
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Exception classes named in the `throws` clause.
    pub declared_exceptions: Vec<String>,
}

impl Method {
    pub fn has_code(&self) -> bool {
        self.code_length > 0
    }

    pub fn instruction_at(&self, offset: u32) -> Option<&Instruction> {
        self.instructions
            .binary_search_by_key(&offset, |inst| inst.offset)
            .ok()
            .map(|index| &self.instructions[index])
    }
}

/// Method access flags used by the analyses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MethodAccess {
    pub is_public: bool,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_native: bool,
    pub is_synchronized: bool,
}

/// Exception handler metadata from the Code attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    /// `None` catches any throwable (`finally` blocks).
    pub catch_type: Option<String>,
}

impl ExceptionHandler {
    pub fn covers(&self, offset: u32) -> bool {
        offset >= self.start_pc && offset < self.end_pc
    }
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub offset: u32,
    pub length: u32,
    pub opcode: u8,
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn next_offset(&self) -> u32 {
        self.offset + self.length
    }
}

/// Computational type of a value as the instruction set distinguishes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl ValueKind {
    /// Stack words a value of this kind occupies.
    pub fn words(self) -> usize {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }
}

/// Literal pushed by a constant instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstantOperand {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// Class literal (`Foo.class`), by internal name.
    Class(String),
    /// Method handles, method types and dynamic constants.
    Other,
}

impl ConstantOperand {
    pub fn words(&self) -> usize {
        match self {
            ConstantOperand::Long(_) | ConstantOperand::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

impl ArithmeticOp {
    /// Integer division and remainder raise `ArithmeticException`.
    pub fn can_throw(self, kind: ValueKind) -> bool {
        matches!(self, ArithmeticOp::Div | ArithmeticOp::Rem)
            && matches!(kind, ValueKind::Int | ValueKind::Long)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackOp {
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
}

/// Condition tested by a conditional branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    Null,
    NonNull,
}

/// Instruction kinds, one variant per opcode family.
#[derive(Clone, Debug, PartialEq)]
pub enum InstructionKind {
    Nop,
    Constant(ConstantOperand),
    Load { slot: u16, kind: ValueKind },
    Store { slot: u16, kind: ValueKind },
    Increment { slot: u16, delta: i32 },
    ArrayLoad(ValueKind),
    ArrayStore(ValueKind),
    Stack(StackOp),
    Arithmetic { op: ArithmeticOp, kind: ValueKind },
    Negate(ValueKind),
    Convert { from: ValueKind, to: ValueKind },
    /// `lcmp`, `fcmpl`, `fcmpg`, `dcmpl`, `dcmpg`.
    Compare(ValueKind),
    /// Conditional branch. `operands` is 1 for `if<cond>`/`ifnull`, 2 for `if_<x>cmp<cond>`.
    Branch { condition: Condition, operands: u8, target: u32 },
    Goto { target: u32 },
    Jsr { target: u32 },
    Ret { slot: u16 },
    Switch { default: u32, targets: Vec<u32> },
    Return(Option<ValueKind>),
    Throw,
    GetField(FieldDescriptor),
    PutField(FieldDescriptor),
    Invoke(CallSite),
    InvokeDynamic { name: String, signature: String },
    New(String),
    NewArray { dimensions: u8 },
    ArrayLength,
    CheckCast(String),
    InstanceOf(String),
    MonitorEnter,
    MonitorExit,
}

impl InstructionKind {
    /// Branch, jump and switch targets, in encoding order.
    pub fn branch_targets(&self) -> Vec<u32> {
        match self {
            InstructionKind::Branch { target, .. }
            | InstructionKind::Goto { target }
            | InstructionKind::Jsr { target } => vec![*target],
            InstructionKind::Switch { default, targets } => {
                let mut all = Vec::with_capacity(targets.len() + 1);
                all.push(*default);
                all.extend(targets.iter().copied());
                all
            }
            _ => Vec::new(),
        }
    }

    /// Whether control never continues to the next instruction.
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            InstructionKind::Goto { .. }
                | InstructionKind::Jsr { .. }
                | InstructionKind::Ret { .. }
                | InstructionKind::Switch { .. }
                | InstructionKind::Return(_)
                | InstructionKind::Throw
        )
    }

    /// Whether the instruction transfers control anywhere but the next instruction.
    pub fn is_control_transfer(&self) -> bool {
        self.ends_flow() || matches!(self, InstructionKind::Branch { .. })
    }

    /// Whether the instruction can raise an exception (a PEI).
    pub fn can_throw(&self, method_is_synchronized: bool) -> bool {
        match self {
            InstructionKind::ArrayLoad(_)
            | InstructionKind::ArrayStore(_)
            | InstructionKind::Throw
            | InstructionKind::GetField(_)
            | InstructionKind::PutField(_)
            | InstructionKind::Invoke(_)
            | InstructionKind::InvokeDynamic { .. }
            | InstructionKind::New(_)
            | InstructionKind::NewArray { .. }
            | InstructionKind::ArrayLength
            | InstructionKind::CheckCast(_)
            | InstructionKind::MonitorEnter
            | InstructionKind::MonitorExit => true,
            InstructionKind::Constant(ConstantOperand::Class(_)) => true,
            InstructionKind::Arithmetic { op, kind } => op.can_throw(*kind),
            InstructionKind::Return(_) => method_is_synchronized,
            _ => false,
        }
    }

    /// Operand stack words consumed and produced, when the effect does not
    /// depend on the values involved.
    pub fn stack_effect(&self, opcode: u8) -> Result<(usize, usize)> {
        let effect = match self {
            InstructionKind::Nop
            | InstructionKind::Goto { .. }
            | InstructionKind::Ret { .. }
            | InstructionKind::Increment { .. } => (0, 0),
            InstructionKind::Constant(value) => (0, value.words()),
            InstructionKind::Load { kind, .. } => (0, kind.words()),
            InstructionKind::Store { kind, .. } => (kind.words(), 0),
            InstructionKind::ArrayLoad(kind) => (2, kind.words()),
            InstructionKind::ArrayStore(kind) => (2 + kind.words(), 0),
            InstructionKind::Stack(op) => match op {
                StackOp::Pop => (1, 0),
                StackOp::Pop2 => (2, 0),
                StackOp::Dup => (1, 2),
                StackOp::DupX1 => (2, 3),
                StackOp::DupX2 => (3, 4),
                StackOp::Dup2 => (2, 4),
                StackOp::Dup2X1 => (3, 5),
                StackOp::Dup2X2 => (4, 6),
                StackOp::Swap => (2, 2),
            },
            InstructionKind::Arithmetic { op, kind } => match op {
                // Shift distances are always a single int.
                ArithmeticOp::Shl | ArithmeticOp::Shr | ArithmeticOp::Ushr => {
                    (kind.words() + 1, kind.words())
                }
                _ => (kind.words() * 2, kind.words()),
            },
            InstructionKind::Negate(kind) => (kind.words(), kind.words()),
            InstructionKind::Convert { from, to } => (from.words(), to.words()),
            InstructionKind::Compare(kind) => (kind.words() * 2, 1),
            InstructionKind::Branch { operands, .. } => (*operands as usize, 0),
            InstructionKind::Jsr { .. } => (0, 1),
            InstructionKind::Switch { .. } => (1, 0),
            InstructionKind::Return(kind) => (kind.map_or(0, ValueKind::words), 0),
            InstructionKind::Throw => (1, 0),
            InstructionKind::GetField(field) => {
                let receiver = usize::from(!field.is_static());
                (receiver, field.slot_size()?)
            }
            InstructionKind::PutField(field) => {
                let receiver = usize::from(!field.is_static());
                (receiver + field.slot_size()?, 0)
            }
            InstructionKind::Invoke(call) => {
                let receiver = usize::from(call.kind != CallKind::Static);
                (
                    receiver + argument_words(&call.descriptor)?,
                    return_words(&call.descriptor)?,
                )
            }
            InstructionKind::InvokeDynamic { signature, .. } => {
                (argument_words(signature)?, return_words(signature)?)
            }
            InstructionKind::New(_) => (0, 1),
            InstructionKind::NewArray { dimensions } => {
                // newarray and anewarray take one count, multianewarray one per dimension.
                let counts = if opcode == opcodes::MULTIANEWARRAY {
                    *dimensions as usize
                } else {
                    1
                };
                (counts, 1)
            }
            InstructionKind::ArrayLength => (1, 1),
            InstructionKind::CheckCast(_) => (1, 1),
            InstructionKind::InstanceOf(_) => (1, 1),
            InstructionKind::MonitorEnter | InstructionKind::MonitorExit => (1, 0),
        };
        Ok(effect)
    }
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub kind: CallKind,
    pub offset: u32,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_targets_start_with_default() {
        let kind = InstructionKind::Switch {
            default: 40,
            targets: vec![20, 30],
        };
        assert_eq!(kind.branch_targets(), vec![40, 20, 30]);
        assert!(kind.ends_flow());
    }

    #[test]
    fn returns_throw_only_in_synchronized_methods() {
        let kind = InstructionKind::Return(None);
        assert!(!kind.can_throw(false));
        assert!(kind.can_throw(true));
        let division = InstructionKind::Arithmetic {
            op: ArithmeticOp::Div,
            kind: ValueKind::Int,
        };
        assert!(division.can_throw(false));
        let float_division = InstructionKind::Arithmetic {
            op: ArithmeticOp::Div,
            kind: ValueKind::Double,
        };
        assert!(!float_division.can_throw(false));
    }

    #[test]
    fn invoke_stack_effect_counts_receiver_and_wide_arguments() {
        let call = CallSite {
            owner: "java/io/PrintStream".to_string(),
            name: "println".to_string(),
            descriptor: "(J)V".to_string(),
            kind: CallKind::Virtual,
            offset: 0,
        };
        let effect = InstructionKind::Invoke(call)
            .stack_effect(opcodes::INVOKEVIRTUAL)
            .expect("effect");
        assert_eq!(effect, (3, 0));
    }

    #[test]
    fn long_shift_consumes_int_distance() {
        let shift = InstructionKind::Arithmetic {
            op: ArithmeticOp::Shl,
            kind: ValueKind::Long,
        };
        assert_eq!(shift.stack_effect(opcodes::LSHL).expect("effect"), (3, 2));
    }
}
