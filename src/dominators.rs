//! Dominator and post-dominator sets computed as a dataflow analysis.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cfg::{BasicBlock, BlockId, Cfg, Edge, EdgeFilter, EdgeKind};
use crate::dataflow::{Dataflow, DataflowAnalysis, DataflowResult, Direction};
use crate::error::Result;
use crate::ir::Instruction;

/// Set of blocks dominating a program point; `None` is TOP (all blocks).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DominatorSet(Option<BTreeSet<BlockId>>);

impl DominatorSet {
    pub fn contains(&self, block: BlockId) -> bool {
        match &self.0 {
            Some(blocks) => blocks.contains(&block),
            None => true,
        }
    }

    pub fn blocks(&self) -> Option<&BTreeSet<BlockId>> {
        self.0.as_ref()
    }
}

/// Dominators (forward) or post-dominators (backward).
///
/// The meet is set intersection; each block adds itself on transfer. For
/// post-dominators an [`EdgeFilter`] can drop implicit exception edges so
/// runtime exceptions do not weaken the result.
pub struct DominatorsAnalysis {
    direction: Direction,
    filter: EdgeFilter,
}

impl DominatorsAnalysis {
    pub fn dominators() -> Self {
        Self {
            direction: Direction::Forward,
            filter: EdgeFilter::ALL,
        }
    }

    pub fn post_dominators(filter: EdgeFilter) -> Self {
        Self {
            direction: Direction::Backward,
            filter,
        }
    }
}

impl DataflowAnalysis for DominatorsAnalysis {
    type Fact = DominatorSet;
    const NAME: &'static str = "dominators";

    fn direction(&self) -> Direction {
        self.direction
    }

    fn create_fact(&self) -> DominatorSet {
        DominatorSet(None)
    }

    fn init_entry_fact(&self, fact: &mut DominatorSet) -> Result<()> {
        fact.0 = Some(BTreeSet::new());
        Ok(())
    }

    fn make_fact_top(&self, fact: &mut DominatorSet) {
        fact.0 = None;
    }

    fn is_top(&self, fact: &DominatorSet) -> bool {
        fact.0.is_none()
    }

    fn is_fact_valid(&self, fact: &DominatorSet) -> bool {
        fact.0.is_some()
    }

    fn same(&self, a: &DominatorSet, b: &DominatorSet) -> bool {
        a == b
    }

    fn transfer_instruction(&self, _: &Instruction, block: &BasicBlock, fact: &mut DominatorSet) -> Result<()> {
        if let Some(blocks) = &mut fact.0 {
            blocks.insert(block.id);
        }
        Ok(())
    }

    fn transfer_block(&self, block: &BasicBlock, fact: &mut DominatorSet) -> Result<()> {
        if let Some(blocks) = &mut fact.0 {
            blocks.insert(block.id);
        }
        Ok(())
    }

    fn edge_transfer(&self, edge: &Edge, fact: &mut DominatorSet) -> Result<()> {
        // Exception edges join at the thrower's start, so the thrower is
        // added here in both directions.
        if edge.kind == EdgeKind::Exception {
            if let Some(blocks) = &mut fact.0 {
                blocks.insert(edge.source);
            }
        }
        Ok(())
    }

    fn follows_edge(&self, edge: &Edge) -> bool {
        self.filter.accepts(edge)
    }

    fn meet_into(&self, incoming: &DominatorSet, _: &Edge, accumulator: &mut DominatorSet) -> Result<()> {
        let Some(blocks) = &incoming.0 else {
            return Ok(());
        };
        if let Some(acc) = &mut accumulator.0 {
            acc.retain(|block| blocks.contains(block));
        } else {
            accumulator.0 = Some(blocks.clone());
        }
        Ok(())
    }
}

/// Dominance relation of a CFG, queryable per block.
#[derive(Clone, Debug)]
pub struct DominatorTree {
    direction: Direction,
    result: DataflowResult<DominatorSet>,
}

impl DominatorTree {
    pub fn compute_dominators(cfg: Arc<Cfg>, max_iterations: usize) -> Result<Self> {
        let result = Dataflow::new(cfg, DominatorsAnalysis::dominators())
            .with_max_iterations(max_iterations)
            .execute()?;
        Ok(Self {
            direction: Direction::Forward,
            result,
        })
    }

    pub fn compute_post_dominators(
        cfg: Arc<Cfg>,
        filter: EdgeFilter,
        max_iterations: usize,
    ) -> Result<Self> {
        let result = Dataflow::new(cfg, DominatorsAnalysis::post_dominators(filter))
            .with_max_iterations(max_iterations)
            .execute()?;
        Ok(Self {
            direction: Direction::Backward,
            result,
        })
    }

    pub fn is_post_dominance(&self) -> bool {
        self.direction == Direction::Backward
    }

    /// All blocks dominating `block`, itself included. `None` when `block` is
    /// unreachable from the root.
    pub fn dominators_of(&self, block: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.result.result_fact(block).blocks()
    }

    pub fn dominates(&self, dominator: BlockId, block: BlockId) -> bool {
        self.dominators_of(block)
            .is_some_and(|blocks| blocks.contains(&dominator))
    }

    /// The closest strict dominator of `block`.
    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        let dominators = self.dominators_of(block)?;
        dominators
            .iter()
            .copied()
            .filter(|candidate| *candidate != block)
            .max_by_key(|candidate| self.dominators_of(*candidate).map_or(0, BTreeSet::len))
    }

    /// Blocks whose immediate dominator is `block`.
    pub fn children(&self, block: BlockId) -> Vec<BlockId> {
        (0..self.result.cfg().num_blocks())
            .map(BlockId)
            .filter(|candidate| self.immediate_dominator(*candidate) == Some(block))
            .collect()
    }

    pub fn dataflow(&self) -> &DataflowResult<DominatorSet> {
        &self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::dataflow::DEFAULT_MAX_ITERATIONS;
    use crate::opcodes::*;
    use crate::testing::MethodBuilder;

    // 0: iload_0; 1: ifeq -> 8; 4: iconst_1; 5: istore_1; 6: nop; 7: nop; 8: return
    fn diamond() -> Arc<Cfg> {
        let code = [ILOAD_0, IFEQ, 0, 7, ICONST_1, ISTORE_1, NOP, NOP, RETURN];
        Arc::new(build_cfg(&MethodBuilder::new("(I)V", &code).build()).expect("cfg"))
    }

    #[test]
    fn branch_head_dominates_both_arms_and_join() {
        let cfg = diamond();
        let tree = DominatorTree::compute_dominators(Arc::clone(&cfg), DEFAULT_MAX_ITERATIONS).expect("dominators");
        let head = cfg.block_starting_at(0).expect("head");
        let arm = cfg.block_starting_at(4).expect("arm");
        let join = cfg.block_starting_at(8).expect("join");

        assert!(tree.dominates(head, arm));
        assert!(tree.dominates(head, join));
        assert!(!tree.dominates(arm, join));
        assert_eq!(tree.immediate_dominator(join), Some(head));
        assert_eq!(tree.immediate_dominator(head), Some(cfg.entry()));
        assert_eq!(tree.immediate_dominator(cfg.entry()), None);
        let mut children = tree.children(head);
        children.sort();
        assert_eq!(children, vec![arm, join]);
    }

    #[test]
    fn join_post_dominates_branch_head() {
        let cfg = diamond();
        let tree = DominatorTree::compute_post_dominators(
            Arc::clone(&cfg),
            EdgeFilter::without_implicit_exceptions(),
            DEFAULT_MAX_ITERATIONS,
        )
        .expect("post dominators");
        let head = cfg.block_starting_at(0).expect("head");
        let arm = cfg.block_starting_at(4).expect("arm");
        let join = cfg.block_starting_at(8).expect("join");

        assert!(tree.is_post_dominance());
        assert!(tree.dominates(join, head));
        assert!(!tree.dominates(arm, head));
        assert_eq!(tree.immediate_dominator(head), Some(join));
        assert!(tree.dominates(cfg.exit(), cfg.entry()));
    }

    #[test]
    fn implicit_exception_edges_can_be_ignored_for_post_dominance() {
        // 0: aload_0; 1: arraylength; 2: pop; 3: goto -> 6; 6: return
        // 7: astore_1; 8: return   handler [1, 2) -> 7 catch any
        let code = [ALOAD_0, ARRAYLENGTH, POP, GOTO, 0, 3, RETURN, ASTORE_1, RETURN];
        let method = MethodBuilder::new("([I)V", &code).handler(1, 2, 7, None).build();
        let cfg = Arc::new(build_cfg(&method).expect("cfg"));
        let thrower = cfg.block_starting_at(1).expect("thrower");
        let handler = cfg.block_starting_at(7).expect("handler");

        let with_all = DominatorTree::compute_post_dominators(Arc::clone(&cfg), EdgeFilter::ALL, DEFAULT_MAX_ITERATIONS)
            .expect("post dominators");
        let filtered = DominatorTree::compute_post_dominators(
            Arc::clone(&cfg),
            EdgeFilter::without_implicit_exceptions(),
            DEFAULT_MAX_ITERATIONS,
        )
        .expect("post dominators");

        // The thrower block is post-dominated by its normal successor only when
        // the implicit exception edge is ignored.
        let normal = cfg
            .successors(thrower, EdgeFilter::without_implicit_exceptions())
            .into_iter()
            .next()
            .expect("normal successor");
        assert_ne!(normal, handler);
        assert!(!with_all.dominates(normal, thrower));
        assert!(filtered.dominates(normal, thrower));
        assert!(with_all.dominates(thrower, thrower));
        assert!(!with_all.dominates(handler, thrower));
    }

    #[test]
    fn dominator_meet_is_intersection_with_top_identity() {
        let analysis = DominatorsAnalysis::dominators();
        let cfg = diamond();
        let edge = cfg.edges()[0];
        let mut acc = analysis.create_fact();
        let a = DominatorSet(Some(BTreeSet::from([BlockId(0), BlockId(1), BlockId(2)])));
        let b = DominatorSet(Some(BTreeSet::from([BlockId(0), BlockId(2)])));

        analysis.meet_into(&a, &edge, &mut acc).expect("meet");
        assert_eq!(acc, a);
        analysis.meet_into(&b, &edge, &mut acc).expect("meet");
        assert_eq!(acc, b);
        analysis.meet_into(&DominatorSet(None), &edge, &mut acc).expect("meet");
        assert_eq!(acc, b);
    }
}
