//! Field access summaries: which fields a method loads or stores on every path.

use std::collections::BTreeSet;

use crate::cfg::{BasicBlock, Edge};
use crate::dataflow::{DataflowAnalysis, Direction, FactState};
use crate::descriptor::FieldDescriptor;
use crate::error::Result;
use crate::ir::{Instruction, InstructionKind};

/// Set of fields with TOP/BOTTOM. BOTTOM means "any field may be touched".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSet {
    state: FactState,
    fields: BTreeSet<FieldDescriptor>,
}

impl FieldSet {
    pub fn top() -> Self {
        Self {
            state: FactState::Top,
            fields: BTreeSet::new(),
        }
    }

    pub fn bottom() -> Self {
        Self {
            state: FactState::Bottom,
            fields: BTreeSet::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            state: FactState::Valid,
            fields: BTreeSet::new(),
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

    pub fn fields(&self) -> &BTreeSet<FieldDescriptor> {
        &self.fields
    }

    /// Whether `field` may be accessed: always true for BOTTOM.
    pub fn may_contain(&self, field: &FieldDescriptor) -> bool {
        self.is_bottom() || self.fields.contains(field)
    }

    pub fn insert(&mut self, field: FieldDescriptor) {
        if self.is_valid() {
            self.fields.insert(field);
        }
    }

    pub fn set_bottom(&mut self) {
        *self = FieldSet::bottom();
    }

    pub fn merge_with(&mut self, other: &FieldSet) {
        match (self.state, other.state) {
            (_, FactState::Top) | (FactState::Bottom, _) => {}
            (FactState::Top, _) => self.clone_from(other),
            (_, FactState::Bottom) => self.set_bottom(),
            (FactState::Valid, FactState::Valid) => self.fields.extend(other.fields.iter().cloned()),
        }
    }
}

impl FromIterator<FieldDescriptor> for FieldSet {
    fn from_iter<I: IntoIterator<Item = FieldDescriptor>>(iter: I) -> Self {
        Self {
            state: FactState::Valid,
            fields: iter.into_iter().collect(),
        }
    }
}

/// Decides which field accesses a [`FieldSetAnalysis`] records.
pub trait FieldAccessHook {
    const NAME: &'static str;

    fn saw_load(&self, field: &FieldDescriptor, fact: &mut FieldSet) {
        let _ = (field, fact);
    }

    fn saw_store(&self, field: &FieldDescriptor, fact: &mut FieldSet) {
        let _ = (field, fact);
    }
}

/// Records loaded fields only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadedFields;

impl FieldAccessHook for LoadedFields {
    const NAME: &'static str = "loaded-fields";

    fn saw_load(&self, field: &FieldDescriptor, fact: &mut FieldSet) {
        fact.insert(field.clone());
    }
}

/// Records stored fields only.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoredFields;

impl FieldAccessHook for StoredFields {
    const NAME: &'static str = "stored-fields";

    fn saw_store(&self, field: &FieldDescriptor, fact: &mut FieldSet) {
        fact.insert(field.clone());
    }
}

/// Forward field-set analysis; any call makes the fact BOTTOM.
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldSetAnalysis<H> {
    hook: H,
}

impl<H: FieldAccessHook> FieldSetAnalysis<H> {
    pub fn new(hook: H) -> Self {
        Self { hook }
    }
}

impl FieldSetAnalysis<LoadedFields> {
    pub fn loads() -> Self {
        Self::new(LoadedFields)
    }
}

impl FieldSetAnalysis<StoredFields> {
    pub fn stores() -> Self {
        Self::new(StoredFields)
    }
}

impl<H: FieldAccessHook> DataflowAnalysis for FieldSetAnalysis<H> {
    type Fact = FieldSet;
    const NAME: &'static str = H::NAME;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn create_fact(&self) -> FieldSet {
        FieldSet::top()
    }

    fn init_entry_fact(&self, fact: &mut FieldSet) -> Result<()> {
        *fact = FieldSet::empty();
        Ok(())
    }

    fn make_fact_top(&self, fact: &mut FieldSet) {
        *fact = FieldSet::top();
    }

    fn is_top(&self, fact: &FieldSet) -> bool {
        fact.is_top()
    }

    fn is_fact_valid(&self, fact: &FieldSet) -> bool {
        fact.is_valid()
    }

    fn same(&self, a: &FieldSet, b: &FieldSet) -> bool {
        a == b
    }

    fn transfer_instruction(&self, instruction: &Instruction, _: &BasicBlock, fact: &mut FieldSet) -> Result<()> {
        match &instruction.kind {
            InstructionKind::GetField(field) => self.hook.saw_load(field, fact),
            InstructionKind::PutField(field) => self.hook.saw_store(field, fact),
            // The callee may touch any field.
            InstructionKind::Invoke(_) | InstructionKind::InvokeDynamic { .. } => fact.set_bottom(),
            _ => {}
        }
        Ok(())
    }

    fn meet_into(&self, incoming: &FieldSet, _: &Edge, accumulator: &mut FieldSet) -> Result<()> {
        accumulator.merge_with(incoming);
        Ok(())
    }
}
