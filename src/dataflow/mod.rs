//! Generic dataflow framework.
//!
//! A concrete analysis implements [`DataflowAnalysis`]; [`Dataflow`] iterates
//! it to a fixpoint over a [`Cfg`](crate::cfg::Cfg) and freezes the result in
//! a [`DataflowResult`]. Facts are mutated in place, and only through `copy`,
//! `meet_into` and the transfer functions.

mod engine;
pub mod frame;

use std::fmt;

use serde::Serialize;

use crate::cfg::{BasicBlock, Edge};
use crate::error::Result;
use crate::ir::Instruction;

pub use engine::{DEFAULT_MAX_ITERATIONS, Dataflow, DataflowResult};

/// Direction in which facts flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Forward,
    Backward,
}

/// Three-level classification shared by most fact types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FactState {
    /// No information yet; identity of the meet.
    Top,
    /// Contradictory or unknown; absorbs every meet.
    Bottom,
    /// Carries a payload.
    Valid,
}

/// A dataflow analysis over facts of type [`DataflowAnalysis::Fact`].
pub trait DataflowAnalysis {
    type Fact: Clone + fmt::Debug;

    /// Name used in logs and errors.
    const NAME: &'static str;

    fn direction(&self) -> Direction;

    fn is_forward(&self) -> bool {
        self.direction() == Direction::Forward
    }

    /// A new fact; its value is meaningless until initialized.
    fn create_fact(&self) -> Self::Fact;

    /// Seeds the fact at the logical entry (the CFG exit for backward analyses).
    fn init_entry_fact(&self, fact: &mut Self::Fact) -> Result<()>;

    /// Seeds a block result before the first pass.
    fn init_result_fact(&self, fact: &mut Self::Fact) {
        self.make_fact_top(fact);
    }

    fn make_fact_top(&self, fact: &mut Self::Fact);

    fn is_top(&self, fact: &Self::Fact) -> bool;

    fn is_fact_valid(&self, fact: &Self::Fact) -> bool;

    fn same(&self, a: &Self::Fact, b: &Self::Fact) -> bool;

    fn copy(&self, source: &Self::Fact, dest: &mut Self::Fact) {
        dest.clone_from(source);
    }

    /// Applies one instruction's effect to `fact` in place.
    fn transfer_instruction(
        &self,
        instruction: &Instruction,
        block: &BasicBlock,
        fact: &mut Self::Fact,
    ) -> Result<()>;

    /// Applies a whole block, visiting instructions in analysis direction.
    fn transfer_block(&self, block: &BasicBlock, fact: &mut Self::Fact) -> Result<()> {
        if self.is_forward() {
            for instruction in &block.instructions {
                self.transfer_instruction(instruction, block, fact)?;
            }
        } else {
            for instruction in block.instructions.iter().rev() {
                self.transfer_instruction(instruction, block, fact)?;
            }
        }
        Ok(())
    }

    /// Adjusts a fact as it crosses `edge`, before the meet.
    fn edge_transfer(&self, edge: &Edge, fact: &mut Self::Fact) -> Result<()> {
        let _ = (edge, fact);
        Ok(())
    }

    /// Whether facts flow along `edge` at all.
    fn follows_edge(&self, edge: &Edge) -> bool {
        let _ = edge;
        true
    }

    /// Merges the fact flowing along `edge` into `accumulator`.
    fn meet_into(&self, incoming: &Self::Fact, edge: &Edge, accumulator: &mut Self::Fact) -> Result<()>;
}
