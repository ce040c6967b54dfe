//! Frames: facts shaped as a vector of per-slot values (locals, then stack).
//!
//! A [`FrameModel`] supplies the per-slot semantics; [`FrameDataflow`] turns
//! any model into a forward [`DataflowAnalysis`]. Long and double values take
//! two slots: the value followed by a `default_value()` filler, so the stack
//! manipulation opcodes can work on words.

use std::fmt;

use super::{DataflowAnalysis, Direction, FactState};
use crate::cfg::{BasicBlock, Edge, EdgeKind};
use crate::descriptor::{FieldDescriptor, MethodDescriptor};
use crate::error::{AnalysisError, Result};
use crate::ir::{ArithmeticOp, CallSite, ConstantOperand, Instruction, InstructionKind, Method, StackOp, ValueKind};

/// Per-slot value vector with TOP/BOTTOM/VALID state.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame<V> {
    state: FactState,
    num_locals: usize,
    max_stack: usize,
    slots: Vec<V>,
}

impl<V: Clone + PartialEq + fmt::Debug> Frame<V> {
    /// A TOP frame for a method with `num_locals` local slots.
    pub fn new(num_locals: usize, max_stack: usize) -> Self {
        Self {
            state: FactState::Top,
            num_locals,
            max_stack,
            slots: Vec::with_capacity(num_locals + max_stack),
        }
    }

    pub fn state(&self) -> FactState {
        self.state
    }

    pub fn is_top(&self) -> bool {
        self.state == FactState::Top
    }

    pub fn is_bottom(&self) -> bool {
        self.state == FactState::Bottom
    }

    pub fn is_valid(&self) -> bool {
        self.state == FactState::Valid
    }

    pub fn set_top(&mut self) {
        self.state = FactState::Top;
        self.slots.clear();
    }

    pub fn set_bottom(&mut self) {
        self.state = FactState::Bottom;
        self.slots.clear();
    }

    /// Makes the frame VALID with the given local values and an empty stack.
    pub fn set_valid(&mut self, locals: impl IntoIterator<Item = V>) {
        self.state = FactState::Valid;
        self.slots.clear();
        self.slots.extend(locals);
        self.num_locals = self.slots.len();
    }

    pub fn num_locals(&self) -> usize {
        self.num_locals
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn stack_depth(&self) -> usize {
        self.slots.len().saturating_sub(self.num_locals)
    }

    pub fn slots(&self) -> &[V] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&V> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut V> {
        self.slots.get_mut(index)
    }

    pub fn local(&self, index: usize) -> Result<&V> {
        if index >= self.num_locals {
            return Err(frame_error(format!("local {index} out of range")));
        }
        self.slots
            .get(index)
            .ok_or_else(|| frame_error(format!("local {index} read from invalid frame")))
    }

    pub fn set_local(&mut self, index: usize, value: V) -> Result<()> {
        if index >= self.num_locals {
            return Err(frame_error(format!("local {index} out of range")));
        }
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(frame_error(format!("local {index} written to invalid frame"))),
        }
    }

    pub fn push(&mut self, value: V) -> Result<()> {
        if self.max_stack > 0 && self.stack_depth() >= self.max_stack {
            return Err(frame_error(format!("operand stack overflow beyond {}", self.max_stack)));
        }
        self.slots.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<V> {
        if self.stack_depth() == 0 {
            return Err(frame_error("operand stack underflow".to_string()));
        }
        self.slots
            .pop()
            .ok_or_else(|| frame_error("operand stack underflow".to_string()))
    }

    /// Pops `count` words, discarding them.
    pub fn pop_n(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.pop()?;
        }
        Ok(())
    }

    /// Value `depth` words below the top of the stack.
    pub fn peek(&self, depth: usize) -> Result<&V> {
        if depth >= self.stack_depth() {
            return Err(frame_error(format!("no stack value at depth {depth}")));
        }
        Ok(&self.slots[self.slots.len() - 1 - depth])
    }

    pub fn clear_stack(&mut self) {
        self.slots.truncate(self.num_locals);
    }

    pub fn same_as(&self, other: &Self) -> bool {
        self.state == other.state && (self.state != FactState::Valid || self.slots == other.slots)
    }

    /// Applies a word-level stack manipulation opcode.
    pub fn apply_stack_op(&mut self, op: StackOp) -> Result<()> {
        match op {
            StackOp::Pop => self.pop_n(1),
            StackOp::Pop2 => self.pop_n(2),
            StackOp::Dup => {
                let v1 = self.peek(0)?.clone();
                self.push(v1)
            }
            StackOp::DupX1 => {
                let [v1, v2] = self.pop_words()?;
                self.push_words([v1.clone(), v2, v1])
            }
            StackOp::DupX2 => {
                let [v1, v2, v3] = self.pop_words()?;
                self.push_words([v1.clone(), v3, v2, v1])
            }
            StackOp::Dup2 => {
                let [v1, v2] = self.pop_words()?;
                self.push_words([v2.clone(), v1.clone(), v2, v1])
            }
            StackOp::Dup2X1 => {
                let [v1, v2, v3] = self.pop_words()?;
                self.push_words([v2.clone(), v1.clone(), v3, v2, v1])
            }
            StackOp::Dup2X2 => {
                let [v1, v2, v3, v4] = self.pop_words()?;
                self.push_words([v2.clone(), v1.clone(), v4, v3, v2, v1])
            }
            StackOp::Swap => {
                let [v1, v2] = self.pop_words()?;
                self.push_words([v1, v2])
            }
        }
    }

    /// Pops `N` words; element 0 is the former top of stack.
    fn pop_words<const N: usize>(&mut self) -> Result<[V; N]> {
        let mut words = Vec::with_capacity(N);
        for _ in 0..N {
            words.push(self.pop()?);
        }
        words
            .try_into()
            .map_err(|_| frame_error("operand stack underflow".to_string()))
    }

    /// Pushes words in order; the last element ends on top.
    fn push_words<const N: usize>(&mut self, words: [V; N]) -> Result<()> {
        for word in words {
            self.push(word)?;
        }
        Ok(())
    }
}

fn frame_error(message: String) -> AnalysisError {
    AnalysisError::InvalidFrame {
        method: String::new(),
        message,
    }
}

/// Per-slot semantics of a frame-based analysis.
///
/// Only `default_value` and `merge_values` are required. Every `model_*` hook
/// defaults to the conservative word-level effect of the instruction: consumed
/// words are popped and produced words are `default_value()`. Loads, stores and
/// stack manipulation move values between slots unchanged.
pub trait FrameModel {
    type Value: Clone + PartialEq + fmt::Debug;

    const NAME: &'static str;

    /// Value for anything the model does not track.
    fn default_value(&self) -> Self::Value;

    /// Merges `incoming` into `accumulator` for one slot at a join point.
    fn merge_values(&self, slot: usize, incoming: &Self::Value, accumulator: &mut Self::Value);

    /// Initial value of a local slot at method entry.
    fn entry_value(&self, slot: usize) -> Self::Value {
        let _ = slot;
        self.default_value()
    }

    /// Value pushed at a handler entry for the caught exception.
    fn exception_value(&self) -> Self::Value {
        self.default_value()
    }

    fn model_constant(&self, constant: &ConstantOperand, frame: &mut Frame<Self::Value>) -> Result<()> {
        for _ in 0..constant.words() {
            frame.push(self.default_value())?;
        }
        Ok(())
    }

    fn model_load(&self, slot: u16, kind: ValueKind, frame: &mut Frame<Self::Value>) -> Result<()> {
        for word in 0..kind.words() {
            let value = frame.local(usize::from(slot) + word)?.clone();
            frame.push(value)?;
        }
        Ok(())
    }

    fn model_store(&self, slot: u16, kind: ValueKind, frame: &mut Frame<Self::Value>) -> Result<()> {
        let words = kind.words();
        for word in (0..words).rev() {
            let value = frame.pop()?;
            frame.set_local(usize::from(slot) + word, value)?;
        }
        Ok(())
    }

    fn model_increment(&self, slot: u16, delta: i32, frame: &mut Frame<Self::Value>) -> Result<()> {
        let _ = delta;
        frame.set_local(usize::from(slot), self.default_value())
    }

    fn model_arithmetic(
        &self,
        op: ArithmeticOp,
        kind: ValueKind,
        instruction: &Instruction,
        frame: &mut Frame<Self::Value>,
    ) -> Result<()> {
        let _ = (op, kind);
        self.model_default(instruction, frame)
    }

    fn model_negate(&self, kind: ValueKind, instruction: &Instruction, frame: &mut Frame<Self::Value>) -> Result<()> {
        let _ = kind;
        self.model_default(instruction, frame)
    }

    fn model_invoke(&self, call: &CallSite, instruction: &Instruction, frame: &mut Frame<Self::Value>) -> Result<()> {
        let _ = call;
        self.model_default(instruction, frame)
    }

    fn model_field_load(
        &self,
        field: &FieldDescriptor,
        instruction: &Instruction,
        frame: &mut Frame<Self::Value>,
    ) -> Result<()> {
        let _ = field;
        self.model_default(instruction, frame)
    }

    fn model_field_store(
        &self,
        field: &FieldDescriptor,
        instruction: &Instruction,
        frame: &mut Frame<Self::Value>,
    ) -> Result<()> {
        let _ = field;
        self.model_default(instruction, frame)
    }

    /// Word-level effect with `default_value()` results.
    fn model_default(&self, instruction: &Instruction, frame: &mut Frame<Self::Value>) -> Result<()> {
        let (consumed, produced) = instruction.kind.stack_effect(instruction.opcode)?;
        frame.pop_n(consumed)?;
        for _ in 0..produced {
            frame.push(self.default_value())?;
        }
        Ok(())
    }
}

/// Dispatches one instruction to the matching [`FrameModel`] hook.
pub fn model_instruction<M: FrameModel + ?Sized>(
    model: &M,
    instruction: &Instruction,
    frame: &mut Frame<M::Value>,
) -> Result<()> {
    match &instruction.kind {
        InstructionKind::Nop => Ok(()),
        InstructionKind::Constant(constant) => model.model_constant(constant, frame),
        InstructionKind::Load { slot, kind } => model.model_load(*slot, *kind, frame),
        InstructionKind::Store { slot, kind } => model.model_store(*slot, *kind, frame),
        InstructionKind::Increment { slot, delta } => model.model_increment(*slot, *delta, frame),
        InstructionKind::Stack(op) => frame.apply_stack_op(*op),
        InstructionKind::Arithmetic { op, kind } => model.model_arithmetic(*op, *kind, instruction, frame),
        InstructionKind::Negate(kind) => model.model_negate(*kind, instruction, frame),
        InstructionKind::GetField(field) => model.model_field_load(field, instruction, frame),
        InstructionKind::PutField(field) => model.model_field_store(field, instruction, frame),
        InstructionKind::Invoke(call) => model.model_invoke(call, instruction, frame),
        InstructionKind::ArrayLoad(_)
        | InstructionKind::ArrayStore(_)
        | InstructionKind::Convert { .. }
        | InstructionKind::Compare(_)
        | InstructionKind::Branch { .. }
        | InstructionKind::Goto { .. }
        | InstructionKind::Jsr { .. }
        | InstructionKind::Ret { .. }
        | InstructionKind::Switch { .. }
        | InstructionKind::Return(_)
        | InstructionKind::Throw
        | InstructionKind::InvokeDynamic { .. }
        | InstructionKind::New(_)
        | InstructionKind::NewArray { .. }
        | InstructionKind::ArrayLength
        | InstructionKind::CheckCast(_)
        | InstructionKind::InstanceOf(_)
        | InstructionKind::MonitorEnter
        | InstructionKind::MonitorExit => model.model_default(instruction, frame),
    }
}

/// Forward dataflow over frames of a [`FrameModel`].
pub struct FrameDataflow<M> {
    model: M,
    method: MethodDescriptor,
    num_locals: usize,
    max_stack: usize,
}

impl<M: FrameModel> FrameDataflow<M> {
    pub fn new(model: M, method: &Method) -> Self {
        Self {
            model,
            method: method.descriptor.clone(),
            num_locals: usize::from(method.max_locals),
            max_stack: usize::from(method.max_stack),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn locate(&self, err: AnalysisError, instruction: &Instruction) -> AnalysisError {
        match err {
            AnalysisError::InvalidFrame { message, .. } => AnalysisError::InvalidFrame {
                method: self.method.to_string(),
                message: format!("{message} at offset {}", instruction.offset),
            },
            other => other,
        }
    }
}

impl<M: FrameModel> DataflowAnalysis for FrameDataflow<M> {
    type Fact = Frame<M::Value>;
    const NAME: &'static str = M::NAME;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn create_fact(&self) -> Self::Fact {
        Frame::new(self.num_locals, self.max_stack)
    }

    fn init_entry_fact(&self, fact: &mut Self::Fact) -> Result<()> {
        fact.set_valid((0..self.num_locals).map(|slot| self.model.entry_value(slot)));
        Ok(())
    }

    fn make_fact_top(&self, fact: &mut Self::Fact) {
        fact.set_top();
    }

    fn is_top(&self, fact: &Self::Fact) -> bool {
        fact.is_top()
    }

    fn is_fact_valid(&self, fact: &Self::Fact) -> bool {
        fact.is_valid()
    }

    fn same(&self, a: &Self::Fact, b: &Self::Fact) -> bool {
        a.same_as(b)
    }

    fn transfer_instruction(&self, instruction: &Instruction, _: &BasicBlock, fact: &mut Self::Fact) -> Result<()> {
        if !fact.is_valid() {
            return Ok(());
        }
        model_instruction(&self.model, instruction, fact).map_err(|err| self.locate(err, instruction))
    }

    fn edge_transfer(&self, edge: &Edge, fact: &mut Self::Fact) -> Result<()> {
        if !fact.is_valid() {
            return Ok(());
        }
        match edge.kind {
            EdgeKind::Exception => {
                fact.clear_stack();
                fact.push(self.model.exception_value())?;
            }
            // Values left on the stack are discarded when control leaves the method.
            EdgeKind::Return | EdgeKind::UnhandledException => fact.clear_stack(),
            _ => {}
        }
        Ok(())
    }

    fn meet_into(&self, incoming: &Self::Fact, _: &Edge, accumulator: &mut Self::Fact) -> Result<()> {
        if incoming.is_top() || accumulator.is_bottom() {
            return Ok(());
        }
        if accumulator.is_top() {
            accumulator.clone_from(incoming);
            return Ok(());
        }
        if incoming.is_bottom() || incoming.num_slots() != accumulator.num_slots() {
            accumulator.set_bottom();
            return Ok(());
        }
        for (slot, value) in incoming.slots.iter().enumerate() {
            self.model.merge_values(slot, value, &mut accumulator.slots[slot]);
        }
        Ok(())
    }
}
