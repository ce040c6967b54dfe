use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{DataflowAnalysis, Direction};
use crate::cfg::{BlockId, Cfg, EdgeFilter, EdgeKind, Location};
use crate::error::{AnalysisError, Result};
use crate::ir::Instruction;
use crate::order::BlockOrder;

/// Passes after which an analysis is considered divergent.
pub const DEFAULT_MAX_ITERATIONS: usize = 97 + 9;

/// Fixpoint driver for one analysis over one CFG.
pub struct Dataflow<A: DataflowAnalysis> {
    cfg: Arc<Cfg>,
    analysis: A,
    max_iterations: usize,
}

impl<A: DataflowAnalysis> Dataflow<A> {
    pub fn new(cfg: Arc<Cfg>, analysis: A) -> Self {
        Self {
            cfg,
            analysis,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn analysis(&self) -> &A {
        &self.analysis
    }

    /// Runs passes in block order until no block fact changes.
    pub fn execute(self) -> Result<DataflowResult<A::Fact>> {
        let cfg = &self.cfg;
        let analysis = &self.analysis;
        let direction = analysis.direction();
        let forward = direction == Direction::Forward;
        let order = BlockOrder::for_direction(cfg, direction, EdgeFilter::ALL);
        let logical_entry = if forward { cfg.entry() } else { cfg.exit() };

        let count = cfg.num_blocks();
        let mut start_facts = Vec::with_capacity(count);
        let mut result_facts = Vec::with_capacity(count);
        for _ in 0..count {
            let mut start = analysis.create_fact();
            analysis.make_fact_top(&mut start);
            start_facts.push(start);
            let mut result = analysis.create_fact();
            analysis.init_result_fact(&mut result);
            result_facts.push(result);
        }

        let mut start = analysis.create_fact();
        let mut result = analysis.create_fact();
        let mut edge_fact = analysis.create_fact();
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            if iterations > self.max_iterations {
                warn!(
                    analysis = A::NAME,
                    method = %cfg.method(),
                    iterations,
                    "dataflow did not converge"
                );
                return Err(AnalysisError::AnalysisDiverged {
                    analysis: A::NAME,
                    method: cfg.method().to_string(),
                    iterations,
                });
            }

            let mut changed = false;
            for block_id in order.iter() {
                analysis.make_fact_top(&mut start);
                if block_id == logical_entry {
                    analysis.init_entry_fact(&mut start)?;
                } else {
                    let edges: Vec<_> = if forward {
                        cfg.incoming(block_id).collect()
                    } else {
                        cfg.outgoing(block_id).collect()
                    };
                    for edge in edges {
                        if !analysis.follows_edge(edge) {
                            continue;
                        }
                        // The throwing instruction begins its block, so the
                        // handler sees the state before it.
                        let source = match (forward, edge.kind == EdgeKind::Exception) {
                            (true, true) => &start_facts[edge.source.0],
                            (true, false) => &result_facts[edge.source.0],
                            // Joined before the thrower, after the block transfer.
                            (false, true) => continue,
                            (false, false) => &result_facts[edge.target.0],
                        };
                        analysis.copy(source, &mut edge_fact);
                        analysis.edge_transfer(edge, &mut edge_fact)?;
                        analysis.meet_into(&edge_fact, edge, &mut start)?;
                    }
                }

                analysis.copy(&start, &mut result);
                if !analysis.is_top(&start) {
                    analysis.transfer_block(cfg.block(block_id), &mut result)?;
                }
                if !forward {
                    self.join_handlers(block_id, &result_facts, &mut result)?;
                }

                let index = block_id.0;
                if !analysis.same(&start, &start_facts[index]) {
                    analysis.copy(&start, &mut start_facts[index]);
                    changed = true;
                }
                if !analysis.same(&result, &result_facts[index]) {
                    analysis.copy(&result, &mut result_facts[index]);
                    changed = true;
                }
            }
            trace!(analysis = A::NAME, method = %cfg.method(), iterations, changed, "dataflow pass");
            if !changed {
                break;
            }
        }
        debug!(
            analysis = A::NAME,
            method = %cfg.method(),
            iterations,
            "dataflow converged"
        );

        let (facts_at, facts_after) = self.location_facts(&start_facts, &result_facts)?;
        Ok(DataflowResult {
            cfg: Arc::clone(&self.cfg),
            analysis: A::NAME,
            direction,
            iterations,
            start_facts,
            result_facts,
            facts_at,
            facts_after,
        })
    }

    /// Backward only: meets the facts of exception handlers reachable from
    /// `block` into the state before its first instruction, which is the
    /// thrower. What follows the thrower in the block never kills them.
    fn join_handlers(&self, block: BlockId, result_facts: &[A::Fact], fact: &mut A::Fact) -> Result<()> {
        let analysis = &self.analysis;
        let mut edge_fact = analysis.create_fact();
        for edge in self.cfg.outgoing(block) {
            if edge.kind != EdgeKind::Exception || !analysis.follows_edge(edge) {
                continue;
            }
            analysis.copy(&result_facts[edge.target.0], &mut edge_fact);
            analysis.edge_transfer(edge, &mut edge_fact)?;
            analysis.meet_into(&edge_fact, edge, fact)?;
        }
        Ok(())
    }

    /// Replays each block from its converged start fact to record the fact
    /// before and after every instruction, in program order.
    #[allow(clippy::type_complexity)]
    fn location_facts(
        &self,
        start_facts: &[A::Fact],
        result_facts: &[A::Fact],
    ) -> Result<(HashMap<Location, A::Fact>, HashMap<Location, A::Fact>)> {
        let analysis = &self.analysis;
        let forward = analysis.is_forward();
        let mut facts_at = HashMap::new();
        let mut facts_after = HashMap::new();

        for block in self.cfg.blocks() {
            let mut fact = analysis.create_fact();
            analysis.copy(&start_facts[block.id.0], &mut fact);
            let top = analysis.is_top(&fact);
            let first_offset = block.start_offset();
            let instructions: Box<dyn Iterator<Item = &Instruction>> = if forward {
                Box::new(block.instructions.iter())
            } else {
                Box::new(block.instructions.iter().rev())
            };
            for instruction in instructions {
                let location = Location {
                    block: block.id,
                    offset: instruction.offset,
                };
                let before = fact.clone();
                if !top {
                    analysis.transfer_instruction(instruction, block, &mut fact)?;
                }
                if !forward && first_offset == Some(instruction.offset) {
                    self.join_handlers(block.id, result_facts, &mut fact)?;
                }
                let after = fact.clone();
                // Backward facts flow against program order.
                let (at, past) = if forward { (before, after) } else { (after, before) };
                facts_at.insert(location, at);
                facts_after.insert(location, past);
            }
        }
        Ok((facts_at, facts_after))
    }
}

/// Converged facts of one analysis run, read-only.
#[derive(Clone, Debug)]
pub struct DataflowResult<F> {
    cfg: Arc<Cfg>,
    analysis: &'static str,
    direction: Direction,
    iterations: usize,
    start_facts: Vec<F>,
    result_facts: Vec<F>,
    facts_at: HashMap<Location, F>,
    facts_after: HashMap<Location, F>,
}

impl<F> DataflowResult<F> {
    pub fn cfg(&self) -> &Arc<Cfg> {
        &self.cfg
    }

    pub fn analysis_name(&self) -> &'static str {
        self.analysis
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Full passes performed, including the final pass that changed nothing.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Fact where the block is entered in analysis direction.
    pub fn start_fact(&self, block: BlockId) -> &F {
        &self.start_facts[block.0]
    }

    /// Fact after the block has been transferred in analysis direction.
    pub fn result_fact(&self, block: BlockId) -> &F {
        &self.result_facts[block.0]
    }

    /// Fact immediately before the instruction at `location` executes.
    pub fn fact_at_location(&self, location: Location) -> Result<&F> {
        self.facts_at
            .get(&location)
            .ok_or_else(|| AnalysisError::UnknownLocation(location.to_string()))
    }

    /// Fact immediately after the instruction at `location` executes.
    pub fn fact_after_location(&self, location: Location) -> Result<&F> {
        self.facts_after
            .get(&location)
            .ok_or_else(|| AnalysisError::UnknownLocation(location.to_string()))
    }

    /// Fact reaching the exit block (forward) or the entry block (backward).
    pub fn fact_at_end(&self) -> &F {
        match self.direction {
            Direction::Forward => self.start_fact(self.cfg.exit()),
            Direction::Backward => self.start_fact(self.cfg.entry()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::cfg::{BasicBlock, Edge, build_cfg};
    use crate::dataflow::FactState;
    use crate::ir::InstructionKind;
    use crate::opcodes::*;
    use crate::testing::MethodBuilder;

    /// Reaching stores: the set of local slots written on some path.
    struct StoredSlots;

    #[derive(Clone, Debug, PartialEq)]
    struct Slots {
        state: FactState,
        slots: BTreeSet<u16>,
    }

    impl DataflowAnalysis for StoredSlots {
        type Fact = Slots;
        const NAME: &'static str = "stored-slots";

        fn direction(&self) -> Direction {
            Direction::Forward
        }

        fn create_fact(&self) -> Slots {
            Slots {
                state: FactState::Top,
                slots: BTreeSet::new(),
            }
        }

        fn init_entry_fact(&self, fact: &mut Slots) -> Result<()> {
            fact.state = FactState::Valid;
            fact.slots.clear();
            Ok(())
        }

        fn make_fact_top(&self, fact: &mut Slots) {
            fact.state = FactState::Top;
            fact.slots.clear();
        }

        fn is_top(&self, fact: &Slots) -> bool {
            fact.state == FactState::Top
        }

        fn is_fact_valid(&self, fact: &Slots) -> bool {
            fact.state == FactState::Valid
        }

        fn same(&self, a: &Slots, b: &Slots) -> bool {
            a == b
        }

        fn transfer_instruction(&self, instruction: &Instruction, _: &BasicBlock, fact: &mut Slots) -> Result<()> {
            if let InstructionKind::Store { slot, .. } | InstructionKind::Increment { slot, .. } = instruction.kind {
                fact.slots.insert(slot);
            }
            Ok(())
        }

        fn meet_into(&self, incoming: &Slots, _: &Edge, accumulator: &mut Slots) -> Result<()> {
            match (incoming.state, accumulator.state) {
                (FactState::Top, _) => {}
                (_, FactState::Top) => accumulator.clone_from(incoming),
                _ => accumulator.slots.extend(incoming.slots.iter().copied()),
            }
            Ok(())
        }
    }

    /// Live locals: slots read on some path before being overwritten.
    struct LiveLocals;

    impl DataflowAnalysis for LiveLocals {
        type Fact = Slots;
        const NAME: &'static str = "live-locals";

        fn direction(&self) -> Direction {
            Direction::Backward
        }

        fn create_fact(&self) -> Slots {
            StoredSlots.create_fact()
        }

        fn init_entry_fact(&self, fact: &mut Slots) -> Result<()> {
            StoredSlots.init_entry_fact(fact)
        }

        fn make_fact_top(&self, fact: &mut Slots) {
            StoredSlots.make_fact_top(fact);
        }

        fn is_top(&self, fact: &Slots) -> bool {
            fact.state == FactState::Top
        }

        fn is_fact_valid(&self, fact: &Slots) -> bool {
            fact.state == FactState::Valid
        }

        fn same(&self, a: &Slots, b: &Slots) -> bool {
            a == b
        }

        fn transfer_instruction(&self, instruction: &Instruction, _: &BasicBlock, fact: &mut Slots) -> Result<()> {
            match instruction.kind {
                InstructionKind::Load { slot, .. } | InstructionKind::Increment { slot, .. } => {
                    fact.slots.insert(slot);
                }
                InstructionKind::Store { slot, .. } => {
                    fact.slots.remove(&slot);
                }
                _ => {}
            }
            Ok(())
        }

        fn meet_into(&self, incoming: &Slots, edge: &Edge, accumulator: &mut Slots) -> Result<()> {
            StoredSlots.meet_into(incoming, edge, accumulator)
        }
    }

    /// Flips a flag on every pass; never converges.
    struct Oscillating;

    impl DataflowAnalysis for Oscillating {
        type Fact = (bool, u64);
        const NAME: &'static str = "oscillating";

        fn direction(&self) -> Direction {
            Direction::Forward
        }

        fn create_fact(&self) -> (bool, u64) {
            (true, 0)
        }

        fn init_entry_fact(&self, fact: &mut (bool, u64)) -> Result<()> {
            *fact = (false, 0);
            Ok(())
        }

        fn make_fact_top(&self, fact: &mut (bool, u64)) {
            *fact = (true, 0);
        }

        fn is_top(&self, fact: &(bool, u64)) -> bool {
            fact.0
        }

        fn is_fact_valid(&self, fact: &(bool, u64)) -> bool {
            !fact.0
        }

        fn same(&self, a: &(bool, u64), b: &(bool, u64)) -> bool {
            a == b
        }

        fn transfer_instruction(&self, _: &Instruction, _: &BasicBlock, fact: &mut (bool, u64)) -> Result<()> {
            fact.1 += 1;
            Ok(())
        }

        fn meet_into(&self, incoming: &(bool, u64), _: &Edge, accumulator: &mut (bool, u64)) -> Result<()> {
            if !incoming.0 {
                *accumulator = (false, accumulator.1.max(incoming.1));
            }
            Ok(())
        }
    }

    // 0: iload_0; 1: ifeq -> 10; 4: iconst_1; 5: istore_1; 6: goto -> 10
    // 9: nop (dead); 10: iconst_2; 11: istore_2; 12: return
    fn diamond_code() -> Vec<u8> {
        vec![
            ILOAD_0, IFEQ, 0, 9, ICONST_1, ISTORE_1, GOTO, 0, 4, NOP, ICONST_2, ISTORE_2, RETURN,
        ]
    }

    #[test]
    fn forward_analysis_merges_at_join() {
        let cfg = Arc::new(build_cfg(&MethodBuilder::new("(I)V", &diamond_code()).build()).expect("cfg"));
        let result = Dataflow::new(Arc::clone(&cfg), StoredSlots).execute().expect("converges");

        let join = cfg.block_starting_at(10).expect("join");
        let at_join = result.start_fact(join);
        assert_eq!(at_join.state, FactState::Valid);
        assert_eq!(at_join.slots, BTreeSet::from([1]));

        let exit_fact = result.fact_at_end();
        assert_eq!(exit_fact.slots, BTreeSet::from([1, 2]));
        assert!(result.iterations() >= 2);
    }

    #[test]
    fn location_facts_are_before_and_after_instruction() {
        let cfg = Arc::new(build_cfg(&MethodBuilder::new("(I)V", &diamond_code()).build()).expect("cfg"));
        let result = Dataflow::new(Arc::clone(&cfg), StoredSlots).execute().expect("converges");

        let store = cfg.location_of(11).expect("istore_2");
        assert!(!result.fact_at_location(store).expect("at").slots.contains(&2));
        assert!(result.fact_after_location(store).expect("after").slots.contains(&2));

        let bogus = Location {
            block: store.block,
            offset: 999,
        };
        let err = result.fact_at_location(bogus).expect_err("unknown");
        assert!(matches!(err, AnalysisError::UnknownLocation(_)));
    }

    #[test]
    fn unreachable_blocks_stay_top() {
        let cfg = Arc::new(build_cfg(&MethodBuilder::new("(I)V", &diamond_code()).build()).expect("cfg"));
        let result = Dataflow::new(Arc::clone(&cfg), StoredSlots).execute().expect("converges");
        let dead = cfg.block_starting_at(9).expect("dead nop");
        assert_eq!(result.start_fact(dead).state, FactState::Top);
    }

    #[test]
    fn exceeding_iteration_cap_reports_divergence() {
        // A loop keeps increasing the counter so facts never stabilize.
        let code = [NOP, GOTO, 0xff, 0xff];
        let cfg = Arc::new(build_cfg(&MethodBuilder::new("()V", &code).build()).expect("cfg"));
        let err = Dataflow::new(cfg, Oscillating)
            .with_max_iterations(5)
            .execute()
            .expect_err("diverges");

        match err {
            AnalysisError::AnalysisDiverged {
                analysis,
                iterations,
                ..
            } => {
                assert_eq!(analysis, "oscillating");
                assert_eq!(iterations, 6);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn backward_handler_facts_hold_before_the_throwing_instruction() {
        // 0: iconst_5; 1: istore_1; 2: aload_0; 3: arraylength; 4: istore_1
        // 5: iload_1; 6: ireturn; handler [3, 4) -> 7: astore_2; 8: iload_1; 9: ireturn
        let code = [
            ICONST_5, ISTORE_1, ALOAD_0, ARRAYLENGTH, ISTORE_1, ILOAD_1, IRETURN, ASTORE_2, ILOAD_1, IRETURN,
        ];
        let method = MethodBuilder::new("([I)I", &code)
            .max_locals(3)
            .handler(3, 4, 7, None)
            .build();
        let cfg = Arc::new(build_cfg(&method).expect("cfg"));
        let result = Dataflow::new(Arc::clone(&cfg), LiveLocals).execute().expect("converges");

        // If arraylength throws, the handler reads the first store to slot 1.
        let thrower = cfg.location_of(3).expect("arraylength");
        assert!(result.fact_at_location(thrower).expect("at").slots.contains(&1));
        let load = cfg.location_of(2).expect("aload_0");
        assert_eq!(result.fact_at_location(load).expect("at").slots, BTreeSet::from([0, 1]));

        // Past the thrower the second store kills slot 1 on the normal path.
        let store = cfg.location_of(4).expect("istore_1");
        assert!(!result.fact_at_location(store).expect("at").slots.contains(&1));

        let entry = result.result_fact(cfg.entry());
        assert_eq!(entry.slots, BTreeSet::from([0]));
    }
}
