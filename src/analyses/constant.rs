//! Constant propagation over frames.
//!
//! Each slot holds either a known literal or [`Constant::NotConstant`]. Two
//! literals survive a join only when they are the same type and value.

use std::fmt;

use crate::dataflow::frame::{Frame, FrameDataflow, FrameModel};
use crate::error::Result;
use crate::ir::{ArithmeticOp, ConstantOperand, Instruction, ValueKind};

/// Abstract value of one frame slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    NotConstant,
    Int(i32),
    Long(i64),
    /// Raw IEEE bits, so equal literals compare equal (NaN included).
    Float(u32),
    Double(u64),
    String(String),
}

impl Constant {
    pub fn float(value: f32) -> Self {
        Constant::Float(value.to_bits())
    }

    pub fn double(value: f64) -> Self {
        Constant::Double(value.to_bits())
    }

    pub fn is_constant(&self) -> bool {
        !matches!(self, Constant::NotConstant)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Constant::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Constant::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::String(value) => Some(value),
            _ => None,
        }
    }

    fn from_operand(operand: &ConstantOperand) -> Self {
        match operand {
            ConstantOperand::Int(value) => Constant::Int(*value),
            ConstantOperand::Long(value) => Constant::Long(*value),
            ConstantOperand::Float(value) => Constant::float(*value),
            ConstantOperand::Double(value) => Constant::double(*value),
            ConstantOperand::String(value) => Constant::String(value.clone()),
            ConstantOperand::Null | ConstantOperand::Class(_) | ConstantOperand::Other => Constant::NotConstant,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::NotConstant => f.write_str("NOT_CONSTANT"),
            Constant::Int(value) => write!(f, "{value}"),
            Constant::Long(value) => write!(f, "{value}L"),
            Constant::Float(bits) => write!(f, "{}f", f32::from_bits(*bits)),
            Constant::Double(bits) => write!(f, "{}d", f64::from_bits(*bits)),
            Constant::String(value) => write!(f, "{value:?}"),
        }
    }
}

/// Per-slot semantics of constant propagation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantModel;

/// Forward constant propagation for one method.
pub type ConstantAnalysis = FrameDataflow<ConstantModel>;

impl ConstantModel {
    fn push(&self, value: Constant, kind: ValueKind, frame: &mut Frame<Constant>) -> Result<()> {
        frame.push(value)?;
        if kind.words() == 2 {
            frame.push(self.default_value())?;
        }
        Ok(())
    }

    fn pop(&self, kind: ValueKind, frame: &mut Frame<Constant>) -> Result<Constant> {
        if kind.words() == 2 {
            frame.pop()?;
        }
        frame.pop()
    }
}

fn fold(op: ArithmeticOp, left: &Constant, right: &Constant) -> Constant {
    match (op, left, right) {
        (ArithmeticOp::Add, Constant::Int(a), Constant::Int(b)) => Constant::Int(a.wrapping_add(*b)),
        (ArithmeticOp::Sub, Constant::Int(a), Constant::Int(b)) => Constant::Int(a.wrapping_sub(*b)),
        (ArithmeticOp::Mul, Constant::Int(a), Constant::Int(b)) => Constant::Int(a.wrapping_mul(*b)),
        (ArithmeticOp::Add, Constant::Long(a), Constant::Long(b)) => Constant::Long(a.wrapping_add(*b)),
        (ArithmeticOp::Sub, Constant::Long(a), Constant::Long(b)) => Constant::Long(a.wrapping_sub(*b)),
        (ArithmeticOp::Mul, Constant::Long(a), Constant::Long(b)) => Constant::Long(a.wrapping_mul(*b)),
        _ => Constant::NotConstant,
    }
}

impl FrameModel for ConstantModel {
    type Value = Constant;
    const NAME: &'static str = "constant";

    fn default_value(&self) -> Constant {
        Constant::NotConstant
    }

    fn merge_values(&self, _: usize, incoming: &Constant, accumulator: &mut Constant) {
        if incoming != accumulator {
            *accumulator = Constant::NotConstant;
        }
    }

    fn model_constant(&self, constant: &ConstantOperand, frame: &mut Frame<Constant>) -> Result<()> {
        frame.push(Constant::from_operand(constant))?;
        if constant.words() == 2 {
            frame.push(self.default_value())?;
        }
        Ok(())
    }

    fn model_increment(&self, slot: u16, delta: i32, frame: &mut Frame<Constant>) -> Result<()> {
        let slot = usize::from(slot);
        let value = match frame.local(slot)? {
            Constant::Int(value) => Constant::Int(value.wrapping_add(delta)),
            _ => Constant::NotConstant,
        };
        frame.set_local(slot, value)
    }

    fn model_arithmetic(
        &self,
        op: ArithmeticOp,
        kind: ValueKind,
        instruction: &Instruction,
        frame: &mut Frame<Constant>,
    ) -> Result<()> {
        if !matches!(op, ArithmeticOp::Add | ArithmeticOp::Sub | ArithmeticOp::Mul)
            || !matches!(kind, ValueKind::Int | ValueKind::Long)
        {
            return self.model_default(instruction, frame);
        }
        let right = self.pop(kind, frame)?;
        let left = self.pop(kind, frame)?;
        self.push(fold(op, &left, &right), kind, frame)
    }

    fn model_negate(&self, kind: ValueKind, instruction: &Instruction, frame: &mut Frame<Constant>) -> Result<()> {
        if !matches!(kind, ValueKind::Int | ValueKind::Long) {
            return self.model_default(instruction, frame);
        }
        let negated = match frame.peek(kind.words() - 1)? {
            Constant::Int(value) => Constant::Int(value.wrapping_neg()),
            Constant::Long(value) => Constant::Long(value.wrapping_neg()),
            _ => Constant::NotConstant,
        };
        self.pop(kind, frame)?;
        self.push(negated, kind, frame)
    }
}
