//! Call-sequence tracking: the calls made on every path to a program point.

use std::fmt;

use serde::Serialize;

use crate::cfg::{BasicBlock, Edge};
use crate::dataflow::{DataflowAnalysis, Direction, FactState};
use crate::error::Result;
use crate::ir::{CallSite, Instruction, InstructionKind};

/// One invoked method.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Call {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

impl Call {
    pub fn new(class_name: &str, method_name: &str, signature: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            signature: signature.to_string(),
        }
    }
}

impl From<&CallSite> for Call {
    fn from(call: &CallSite) -> Self {
        Self::new(&call.owner, &call.name, &call.descriptor)
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.method_name, self.signature)
    }
}

/// Ordered calls common to every path reaching a point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallList {
    state: FactState,
    calls: Vec<Call>,
}

impl CallList {
    pub fn top() -> Self {
        Self {
            state: FactState::Top,
            calls: Vec::new(),
        }
    }

    pub fn bottom() -> Self {
        Self {
            state: FactState::Bottom,
            calls: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            state: FactState::Valid,
            calls: Vec::new(),
        }
    }

    pub fn from_calls(calls: Vec<Call>) -> Self {
        Self {
            state: FactState::Valid,
            calls,
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

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn push(&mut self, call: Call) {
        if self.is_valid() {
            self.calls.push(call);
        }
    }

    /// Keeps the longest common prefix of both lists.
    pub fn merge_with(&mut self, other: &CallList) {
        match (self.state, other.state) {
            (_, FactState::Top) | (FactState::Bottom, _) => {}
            (FactState::Top, _) => self.clone_from(other),
            (_, FactState::Bottom) => *self = CallList::bottom(),
            (FactState::Valid, FactState::Valid) => {
                let common = self
                    .calls
                    .iter()
                    .zip(&other.calls)
                    .take_while(|(left, right)| left == right)
                    .count();
                self.calls.truncate(common);
            }
        }
    }
}

impl fmt::Display for CallList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            FactState::Top => f.write_str("TOP"),
            FactState::Bottom => f.write_str("BOTTOM"),
            FactState::Valid => {
                f.write_str("[")?;
                for (index, call) in self.calls.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{call}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Forward analysis appending each invoked method to the call list.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallListAnalysis;

impl DataflowAnalysis for CallListAnalysis {
    type Fact = CallList;
    const NAME: &'static str = "call-list";

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn create_fact(&self) -> CallList {
        CallList::top()
    }

    fn init_entry_fact(&self, fact: &mut CallList) -> Result<()> {
        *fact = CallList::empty();
        Ok(())
    }

    fn make_fact_top(&self, fact: &mut CallList) {
        *fact = CallList::top();
    }

    fn is_top(&self, fact: &CallList) -> bool {
        fact.is_top()
    }

    fn is_fact_valid(&self, fact: &CallList) -> bool {
        fact.is_valid()
    }

    fn same(&self, a: &CallList, b: &CallList) -> bool {
        a == b
    }

    fn transfer_instruction(&self, instruction: &Instruction, _: &BasicBlock, fact: &mut CallList) -> Result<()> {
        if let InstructionKind::Invoke(call) = &instruction.kind {
            fact.push(Call::from(call));
        }
        Ok(())
    }

    fn meet_into(&self, incoming: &CallList, _: &Edge, accumulator: &mut CallList) -> Result<()> {
        accumulator.merge_with(incoming);
        Ok(())
    }
}
