//! Depth-first search over a [`Cfg`] and the block orders derived from it.

use crate::cfg::{BlockId, Cfg, Edge, EdgeFilter, EdgeId};
use crate::dataflow::Direction;

/// Depth-first spanning forest of a CFG, or of its reverse.
///
/// The search starts at the entry block (forward) or the exit block
/// (backward). Blocks it cannot reach become additional roots, visited in id
/// order, so dead code still receives discovery and finish times.
#[derive(Clone, Debug)]
pub struct DepthFirstSearch {
    direction: Direction,
    roots: Vec<BlockId>,
    discovery: Vec<usize>,
    finish: Vec<usize>,
    tree_edges: Vec<EdgeId>,
    back_edges: Vec<EdgeId>,
    postorder: Vec<BlockId>,
}

impl DepthFirstSearch {
    pub fn forward(cfg: &Cfg, filter: EdgeFilter) -> Self {
        Self::search(cfg, Direction::Forward, filter)
    }

    /// Search of the reversed graph, rooted at the exit.
    pub fn backward(cfg: &Cfg, filter: EdgeFilter) -> Self {
        Self::search(cfg, Direction::Backward, filter)
    }

    fn search(cfg: &Cfg, direction: Direction, filter: EdgeFilter) -> Self {
        let count = cfg.num_blocks();
        let neighbors: Vec<Vec<&Edge>> = (0..count)
            .map(|index| {
                let block = BlockId(index);
                match direction {
                    Direction::Forward => cfg.outgoing(block).filter(|edge| filter.accepts(edge)).collect(),
                    Direction::Backward => cfg.incoming(block).filter(|edge| filter.accepts(edge)).collect(),
                }
            })
            .collect();
        let far_end = |edge: &Edge| match direction {
            Direction::Forward => edge.target,
            Direction::Backward => edge.source,
        };

        let mut search = Self {
            direction,
            roots: Vec::new(),
            discovery: vec![usize::MAX; count],
            finish: vec![usize::MAX; count],
            tree_edges: Vec::new(),
            back_edges: Vec::new(),
            postorder: Vec::with_capacity(count),
        };
        let first_root = match direction {
            Direction::Forward => cfg.entry(),
            Direction::Backward => cfg.exit(),
        };
        let candidates = std::iter::once(first_root).chain((0..count).map(BlockId));

        let mut clock = 0usize;
        let mut stack: Vec<(BlockId, usize)> = Vec::new();
        for root in candidates {
            if search.discovery[root.0] != usize::MAX {
                continue;
            }
            search.roots.push(root);
            search.discovery[root.0] = clock;
            clock += 1;
            stack.push((root, 0));

            while let Some((block, next)) = stack.last_mut() {
                let block = *block;
                if let Some(edge) = neighbors[block.0].get(*next) {
                    *next += 1;
                    let successor = far_end(edge);
                    if search.discovery[successor.0] == usize::MAX {
                        search.discovery[successor.0] = clock;
                        clock += 1;
                        search.tree_edges.push(edge.id);
                        stack.push((successor, 0));
                    } else if search.finish[successor.0] == usize::MAX {
                        // Successor is still on the stack.
                        search.back_edges.push(edge.id);
                    }
                } else {
                    search.finish[block.0] = clock;
                    clock += 1;
                    search.postorder.push(block);
                    stack.pop();
                }
            }
        }
        search
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }

    pub fn discovery_time(&self, block: BlockId) -> usize {
        self.discovery[block.0]
    }

    pub fn finish_time(&self, block: BlockId) -> usize {
        self.finish[block.0]
    }

    pub fn tree_edges(&self) -> &[EdgeId] {
        &self.tree_edges
    }

    pub fn back_edges(&self) -> &[EdgeId] {
        &self.back_edges
    }

    pub fn is_back_edge(&self, edge: EdgeId) -> bool {
        self.back_edges.contains(&edge)
    }

    /// Whether the block is reachable from the first root (entry or exit).
    pub fn is_reachable(&self, block: BlockId) -> bool {
        match self.roots.get(1) {
            Some(second_root) => self.discovery[block.0] < self.discovery[second_root.0],
            None => true,
        }
    }

    pub fn postorder(&self) -> &[BlockId] {
        &self.postorder
    }

    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        self.postorder.iter().rev().copied().collect()
    }
}

/// Order in which the fixpoint engine visits blocks.
///
/// Forward analyses use reverse postorder of the CFG; backward analyses use
/// reverse postorder of the reversed CFG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockOrder {
    blocks: Vec<BlockId>,
}

impl BlockOrder {
    pub fn for_direction(cfg: &Cfg, direction: Direction, filter: EdgeFilter) -> Self {
        let search = match direction {
            Direction::Forward => DepthFirstSearch::forward(cfg, filter),
            Direction::Backward => DepthFirstSearch::backward(cfg, filter),
        };
        Self {
            blocks: search.reverse_postorder(),
        }
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::opcodes::*;
    use crate::testing::MethodBuilder;

    // 0: iload_0
    // 1: ifeq +10 (-> 11)
    // 4: iinc 0, -1
    // 7: goto -7 (-> 0)
    // 10: nop (dead)
    // 11: return
    fn loop_cfg() -> Cfg {
        let code = [ILOAD_0, IFEQ, 0, 10, IINC, 0, 0xff, GOTO, 0xff, 0xf9, NOP, RETURN];
        build_cfg(&MethodBuilder::new("(I)V", &code).build()).expect("cfg")
    }

    #[test]
    fn forward_search_finds_loop_back_edge() {
        let cfg = loop_cfg();
        let dfs = DepthFirstSearch::forward(&cfg, EdgeFilter::ALL);

        let head = cfg.block_starting_at(0).expect("head");
        let body = cfg.block_starting_at(4).expect("body");
        assert_eq!(dfs.back_edges().len(), 1);
        let back = cfg.edge(dfs.back_edges()[0]);
        assert_eq!((back.source, back.target), (body, head));
        assert!(dfs.discovery_time(head) < dfs.discovery_time(body));
        assert!(dfs.finish_time(body) < dfs.finish_time(head));
    }

    #[test]
    fn dead_blocks_become_extra_roots() {
        let cfg = loop_cfg();
        let dfs = DepthFirstSearch::forward(&cfg, EdgeFilter::ALL);
        let dead = cfg.block_starting_at(10).expect("dead block");

        assert_eq!(dfs.roots()[0], cfg.entry());
        assert!(dfs.roots().contains(&dead));
        assert!(!dfs.is_reachable(dead));
        assert!(dfs.is_reachable(cfg.exit()));
        assert_eq!(dfs.postorder().len(), cfg.num_blocks());
    }

    #[test]
    fn reverse_postorder_visits_entry_first_and_predecessors_early() {
        let cfg = loop_cfg();
        let order = BlockOrder::for_direction(&cfg, Direction::Forward, EdgeFilter::ALL);
        let head = cfg.block_starting_at(0).expect("head");
        let position = |block: BlockId| order.iter().position(|b| b == block).expect("present");

        assert_eq!(order.blocks()[0], cfg.entry());
        assert!(position(cfg.entry()) < position(head));
        assert!(position(head) < position(cfg.exit()));
    }

    #[test]
    fn backward_order_starts_at_exit() {
        let cfg = loop_cfg();
        let order = BlockOrder::for_direction(&cfg, Direction::Backward, EdgeFilter::ALL);
        let ret = cfg.block_starting_at(11).expect("return block");
        let head = cfg.block_starting_at(0).expect("head");
        let position = |block: BlockId| order.iter().position(|b| b == block).expect("present");

        assert_eq!(order.blocks()[0], cfg.exit());
        assert!(position(ret) < position(head));
        assert!(position(head) < position(cfg.entry()));
    }
}
