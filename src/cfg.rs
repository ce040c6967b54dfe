//! Control flow graphs over decoded method bytecode.
//!
//! Block 0 is a synthetic entry and the last block a synthetic exit; every
//! other block holds a non-empty run of instructions. Blocks start at offset 0,
//! at branch targets, after control transfers, at handler entries, and at
//! every instruction that can throw inside a protected range. The last rule
//! makes the start fact of a throwing block the state before the throw.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use bitflags::bitflags;
use serde::Serialize;
use tracing::trace;

use crate::descriptor::MethodDescriptor;
use crate::error::{Result, malformed_cfg};
use crate::ir::{Instruction, InstructionKind, Method};

/// Index of a block within its CFG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockId(pub usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Index of an edge within its CFG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EdgeId(pub usize);

/// An instruction together with the block containing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Location {
    pub block: BlockId,
    pub offset: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.block, self.offset)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BlockKind {
    Entry,
    Exit,
    Body,
}

/// Maximal straight-line run of instructions.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    pub instructions: Vec<Instruction>,
    /// Whether the block begins an exception handler.
    pub is_handler: bool,
}

impl BasicBlock {
    pub fn start_offset(&self) -> Option<u32> {
        self.instructions.first().map(|inst| inst.offset)
    }

    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Kind of control transfer an edge represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EdgeKind {
    Start,
    FallThrough,
    BranchTaken,
    BranchNotTaken,
    Goto,
    Switch,
    SwitchDefault,
    Jsr,
    Ret,
    Exception,
    UnhandledException,
    Return,
}

impl EdgeKind {
    pub fn is_exception(self) -> bool {
        matches!(self, EdgeKind::Exception | EdgeKind::UnhandledException)
    }
}

bitflags! {
    /// Classification of exception edges.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EdgeFlags: u8 {
        /// Raised by the runtime (null dereference, bounds, ...) and not declared.
        const IMPLICIT_EXCEPTION = 0x01;
        /// Thrown by `athrow` or declared in the method's `throws` clause.
        const EXPLICIT_EXCEPTION = 0x02;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Edge {
    pub id: EdgeId,
    pub source: BlockId,
    pub target: BlockId,
    pub kind: EdgeKind,
    pub flags: EdgeFlags,
}

impl Edge {
    pub fn is_implicit_exception(&self) -> bool {
        self.flags.contains(EdgeFlags::IMPLICIT_EXCEPTION)
    }
}

/// Selects which edges a traversal follows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EdgeFilter {
    pub ignore_implicit_exceptions: bool,
}

impl EdgeFilter {
    pub const ALL: EdgeFilter = EdgeFilter {
        ignore_implicit_exceptions: false,
    };

    pub fn without_implicit_exceptions() -> Self {
        Self {
            ignore_implicit_exceptions: true,
        }
    }

    pub fn accepts(&self, edge: &Edge) -> bool {
        !(self.ignore_implicit_exceptions && edge.is_implicit_exception())
    }
}

/// Control flow graph of one method. Immutable once built.
#[derive(Clone, Debug)]
pub struct Cfg {
    method: MethodDescriptor,
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<EdgeId>>,
    incoming: Vec<Vec<EdgeId>>,
    block_by_offset: BTreeMap<u32, BlockId>,
}

impl Cfg {
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn exit(&self) -> BlockId {
        BlockId(self.blocks.len() - 1)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0]
    }

    pub fn outgoing(&self, id: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.outgoing[id.0].iter().map(|edge| &self.edges[edge.0])
    }

    pub fn incoming(&self, id: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.incoming[id.0].iter().map(|edge| &self.edges[edge.0])
    }

    pub fn successors(&self, id: BlockId, filter: EdgeFilter) -> Vec<BlockId> {
        self.outgoing(id)
            .filter(|edge| filter.accepts(edge))
            .map(|edge| edge.target)
            .collect()
    }

    pub fn predecessors(&self, id: BlockId, filter: EdgeFilter) -> Vec<BlockId> {
        self.incoming(id)
            .filter(|edge| filter.accepts(edge))
            .map(|edge| edge.source)
            .collect()
    }

    /// Finds the edge `source -> target` of the given kind.
    pub fn find_edge(&self, source: BlockId, target: BlockId, kind: EdgeKind) -> Option<&Edge> {
        self.outgoing(source)
            .find(|edge| edge.target == target && edge.kind == kind)
    }

    /// Block whose first instruction is at `offset`.
    pub fn block_starting_at(&self, offset: u32) -> Option<BlockId> {
        self.block_by_offset.get(&offset).copied()
    }

    /// Location of the instruction at `offset`.
    pub fn location_of(&self, offset: u32) -> Option<Location> {
        let (_, block) = self.block_by_offset.range(..=offset).next_back()?;
        self.blocks[block.0]
            .instructions
            .iter()
            .any(|inst| inst.offset == offset)
            .then_some(Location {
                block: *block,
                offset,
            })
    }

    /// Every instruction location, in block order.
    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.blocks.iter().flat_map(|block| {
            block.instructions.iter().map(move |inst| Location {
                block: block.id,
                offset: inst.offset,
            })
        })
    }

    pub fn instruction(&self, location: Location) -> Option<&Instruction> {
        self.blocks
            .get(location.block.0)?
            .instructions
            .iter()
            .find(|inst| inst.offset == location.offset)
    }
}

/// Build a control flow graph from a decoded method.
pub fn build_cfg(method: &Method) -> Result<Cfg> {
    let label = &method.descriptor;
    if let Some(err) = &method.decode_error {
        return Err(err.clone());
    }
    if method.instructions.is_empty() {
        return Err(malformed_cfg!(label, "method has no code"));
    }
    let code_length = method.code_length;
    let boundaries: HashSet<u32> = method.instructions.iter().map(|inst| inst.offset).collect();
    let synchronized = method.access.is_synchronized;

    for inst in &method.instructions {
        for target in inst.kind.branch_targets() {
            if !boundaries.contains(&target) {
                return Err(malformed_cfg!(
                    label,
                    "branch at offset {} targets {} which is not an instruction",
                    inst.offset,
                    target
                ));
            }
        }
    }
    for handler in &method.exception_handlers {
        let end_ok = handler.end_pc == code_length || boundaries.contains(&handler.end_pc);
        if handler.start_pc >= handler.end_pc
            || handler.end_pc > code_length
            || !boundaries.contains(&handler.start_pc)
            || !end_ok
            || !boundaries.contains(&handler.handler_pc)
        {
            return Err(malformed_cfg!(
                label,
                "ill-formed exception handler range [{}, {}) -> {}",
                handler.start_pc,
                handler.end_pc,
                handler.handler_pc
            ));
        }
    }

    let protected = |offset: u32| {
        method
            .exception_handlers
            .iter()
            .any(|handler| handler.covers(offset))
    };

    let mut leaders = BTreeSet::new();
    leaders.insert(0u32);
    for handler in &method.exception_handlers {
        leaders.insert(handler.handler_pc);
    }
    for inst in &method.instructions {
        for target in inst.kind.branch_targets() {
            leaders.insert(target);
        }
        if inst.kind.is_control_transfer() {
            leaders.insert(inst.next_offset());
        }
        if inst.kind.can_throw(synchronized) && protected(inst.offset) {
            leaders.insert(inst.offset);
        }
    }
    leaders.retain(|offset| *offset < code_length);

    // Blocks: entry, one per leader in offset order, exit.
    let handler_entries: HashSet<u32> = method
        .exception_handlers
        .iter()
        .map(|handler| handler.handler_pc)
        .collect();
    let mut blocks = vec![BasicBlock {
        id: BlockId(0),
        kind: BlockKind::Entry,
        instructions: Vec::new(),
        is_handler: false,
    }];
    let mut block_by_offset = BTreeMap::new();
    for inst in &method.instructions {
        if leaders.contains(&inst.offset) {
            let id = BlockId(blocks.len());
            block_by_offset.insert(inst.offset, id);
            blocks.push(BasicBlock {
                id,
                kind: BlockKind::Body,
                instructions: Vec::new(),
                is_handler: handler_entries.contains(&inst.offset),
            });
        }
        if let Some(block) = blocks.last_mut() {
            block.instructions.push(inst.clone());
        }
    }
    let exit = BlockId(blocks.len());
    blocks.push(BasicBlock {
        id: exit,
        kind: BlockKind::Exit,
        instructions: Vec::new(),
        is_handler: false,
    });

    let jsr_return_sites: Vec<u32> = method
        .instructions
        .iter()
        .filter(|inst| matches!(inst.kind, InstructionKind::Jsr { .. }))
        .map(Instruction::next_offset)
        .collect();

    let mut edges = EdgeSet::default();
    edges.add(BlockId(0), BlockId(1), EdgeKind::Start, EdgeFlags::empty());

    for block in &blocks[1..blocks.len() - 1] {
        let (Some(first), Some(last)) = (block.instructions.first(), block.instructions.last()) else {
            continue;
        };
        let block_of = |offset: u32| {
            block_by_offset
                .get(&offset)
                .copied()
                .ok_or_else(|| malformed_cfg!(label, "no block starts at offset {}", offset))
        };
        let next_block = || {
            let next = last.next_offset();
            if next >= code_length {
                Err(malformed_cfg!(
                    label,
                    "control falls off the end of the code after offset {}",
                    last.offset
                ))
            } else {
                block_of(next)
            }
        };

        match &last.kind {
            InstructionKind::Branch { target, .. } => {
                edges.add(block.id, block_of(*target)?, EdgeKind::BranchTaken, EdgeFlags::empty());
                edges.add(block.id, next_block()?, EdgeKind::BranchNotTaken, EdgeFlags::empty());
            }
            InstructionKind::Goto { target } => {
                edges.add(block.id, block_of(*target)?, EdgeKind::Goto, EdgeFlags::empty());
            }
            InstructionKind::Jsr { target } => {
                if last.next_offset() >= code_length {
                    return Err(malformed_cfg!(label, "jsr at offset {} has no return site", last.offset));
                }
                edges.add(block.id, block_of(*target)?, EdgeKind::Jsr, EdgeFlags::empty());
            }
            InstructionKind::Ret { .. } => {
                if jsr_return_sites.is_empty() {
                    return Err(malformed_cfg!(label, "ret at offset {} without any jsr", last.offset));
                }
                for site in &jsr_return_sites {
                    edges.add(block.id, block_of(*site)?, EdgeKind::Ret, EdgeFlags::empty());
                }
            }
            InstructionKind::Switch { default, targets } => {
                for target in targets {
                    edges.add(block.id, block_of(*target)?, EdgeKind::Switch, EdgeFlags::empty());
                }
                edges.add(block.id, block_of(*default)?, EdgeKind::SwitchDefault, EdgeFlags::empty());
            }
            InstructionKind::Return(_) => {
                edges.add(block.id, exit, EdgeKind::Return, EdgeFlags::empty());
            }
            InstructionKind::Throw => {
                let caught_by_any = method
                    .exception_handlers
                    .iter()
                    .any(|handler| handler.covers(last.offset) && handler.catch_type.is_none());
                if !caught_by_any {
                    edges.add(
                        block.id,
                        exit,
                        EdgeKind::UnhandledException,
                        EdgeFlags::EXPLICIT_EXCEPTION,
                    );
                }
            }
            _ => {
                edges.add(block.id, next_block()?, EdgeKind::FallThrough, EdgeFlags::empty());
            }
        }

        // Only the first instruction of a block can throw into a handler.
        if first.kind.can_throw(synchronized) {
            let is_throw = matches!(first.kind, InstructionKind::Throw);
            for handler in method
                .exception_handlers
                .iter()
                .filter(|handler| handler.covers(first.offset))
            {
                let explicit = is_throw
                    || handler
                        .catch_type
                        .as_ref()
                        .is_some_and(|catch| method.declared_exceptions.contains(catch));
                let flags = if explicit {
                    EdgeFlags::EXPLICIT_EXCEPTION
                } else {
                    EdgeFlags::IMPLICIT_EXCEPTION
                };
                edges.add(block.id, block_of(handler.handler_pc)?, EdgeKind::Exception, flags);
                if handler.catch_type.is_none() {
                    break;
                }
            }
        }
    }

    let edges = edges.into_edges();
    let mut outgoing = vec![Vec::new(); blocks.len()];
    let mut incoming = vec![Vec::new(); blocks.len()];
    for edge in &edges {
        outgoing[edge.source.0].push(edge.id);
        incoming[edge.target.0].push(edge.id);
    }
    trace!(
        method = %method.descriptor,
        blocks = blocks.len(),
        edges = edges.len(),
        "built cfg"
    );

    Ok(Cfg {
        method: method.descriptor.clone(),
        blocks,
        edges,
        outgoing,
        incoming,
        block_by_offset,
    })
}

/// Edge list that collapses duplicates of (source, target, kind).
#[derive(Default)]
struct EdgeSet {
    edges: Vec<Edge>,
    seen: HashSet<(BlockId, BlockId, EdgeKind)>,
}

impl EdgeSet {
    fn add(&mut self, source: BlockId, target: BlockId, kind: EdgeKind, flags: EdgeFlags) {
        if !self.seen.insert((source, target, kind)) {
            // A handler reached both implicitly and explicitly keeps the explicit flag.
            if flags.contains(EdgeFlags::EXPLICIT_EXCEPTION) {
                if let Some(edge) = self
                    .edges
                    .iter_mut()
                    .find(|edge| edge.source == source && edge.target == target && edge.kind == kind)
                {
                    edge.flags = EdgeFlags::EXPLICIT_EXCEPTION;
                }
            }
            return;
        }
        self.edges.push(Edge {
            id: EdgeId(self.edges.len()),
            source,
            target,
            kind,
            flags,
        });
    }

    fn into_edges(self) -> Vec<Edge> {
        self.edges
    }
}
