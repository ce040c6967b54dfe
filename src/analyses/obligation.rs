//! Obligation (resource balance) tracking.
//!
//! An [`Obligation`] is a resource type that must be released once acquired,
//! such as an open stream. Along each path the analysis keeps a signed count
//! per obligation ("acquired minus released"). Facts are sets of such count
//! vectors, one per distinct path state, merged by union. A state reaching the
//! exit with a non-zero count is unbalanced.
//!
//! Which instructions acquire or release what is decided by an
//! [`ObligationPolicy`]; [`CallPolicy`] is a simple table keyed by callee.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::cfg::{BasicBlock, Cfg, Edge, EdgeKind};
use crate::dataflow::{DataflowAnalysis, DataflowResult, Direction, FactState};
use crate::error::{AnalysisError, Result};
use crate::ir::{CallKind, CallSite, Instruction, InstructionKind};

/// A resource type, identified by the class that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Obligation {
    id: usize,
    class_name: String,
}

impl Obligation {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }
}

impl fmt::Display for Obligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.id)
    }
}

/// Creates obligations; ids are dense and unique per factory.
#[derive(Debug, Default)]
pub struct ObligationFactory {
    obligations: Mutex<Vec<Obligation>>,
}

impl ObligationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the obligation for `class_name`, creating it on first use.
    pub fn obligation(&self, class_name: &str) -> Obligation {
        let mut obligations = self.obligations.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = obligations.iter().find(|o| o.class_name == class_name) {
            return existing.clone();
        }
        let obligation = Obligation {
            id: obligations.len(),
            class_name: class_name.to_string(),
        };
        obligations.push(obligation.clone());
        obligation
    }

    pub fn get(&self, id: usize) -> Option<Obligation> {
        self.obligations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.obligations.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Count per obligation id, saturating at `±limit`.
///
/// Trailing zero counts are never stored, so equal states compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObligationSet {
    counts: Vec<i32>,
}

impl ObligationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, obligation: &Obligation) -> i32 {
        self.counts.get(obligation.id).copied().unwrap_or(0)
    }

    pub fn add(&mut self, obligation: &Obligation, limit: i32) {
        self.adjust(obligation.id, 1, limit);
    }

    pub fn delete(&mut self, obligation: &Obligation, limit: i32) {
        self.adjust(obligation.id, -1, limit);
    }

    /// True when every count is zero.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Non-zero counts as `(obligation id, count)`.
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, i32)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count != 0)
            .map(|(id, count)| (id, *count))
    }

    fn adjust(&mut self, id: usize, delta: i32, limit: i32) {
        if self.counts.len() <= id {
            self.counts.resize(id + 1, 0);
        }
        self.counts[id] = (self.counts[id] + delta).clamp(-limit, limit);
        while self.counts.last() == Some(&0) {
            self.counts.pop();
        }
    }
}

/// Path states reaching a point: TOP, BOTTOM, or a set of [`ObligationSet`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSet {
    state: FactState,
    states: BTreeSet<ObligationSet>,
}

impl StateSet {
    pub fn top() -> Self {
        Self {
            state: FactState::Top,
            states: BTreeSet::new(),
        }
    }

    pub fn bottom() -> Self {
        Self {
            state: FactState::Bottom,
            states: BTreeSet::new(),
        }
    }

    /// The entry state: one path holding no obligations.
    pub fn balanced() -> Self {
        Self::from_states([ObligationSet::new()])
    }

    pub fn from_states(states: impl IntoIterator<Item = ObligationSet>) -> Self {
        Self {
            state: FactState::Valid,
            states: states.into_iter().collect(),
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

    pub fn states(&self) -> &BTreeSet<ObligationSet> {
        &self.states
    }

    pub fn set_top(&mut self) {
        *self = StateSet::top();
    }

    /// Applies `effect` to every path state.
    pub fn apply(&mut self, effect: &ObligationEffect, limit: i32) {
        if !self.is_valid() {
            return;
        }
        self.states = std::mem::take(&mut self.states)
            .into_iter()
            .map(|mut set| {
                match effect {
                    ObligationEffect::Add(obligation) => set.add(obligation, limit),
                    ObligationEffect::Delete(obligation) => set.delete(obligation, limit),
                }
                set
            })
            .collect();
    }

    pub fn merge_with(&mut self, other: &StateSet) {
        match (self.state, other.state) {
            (_, FactState::Top) | (FactState::Bottom, _) => {}
            (FactState::Top, _) => self.clone_from(other),
            (_, FactState::Bottom) => *self = StateSet::bottom(),
            (FactState::Valid, FactState::Valid) => self.states.extend(other.states.iter().cloned()),
        }
    }
}

/// What one instruction does to an obligation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObligationEffect {
    Add(Obligation),
    Delete(Obligation),
}

impl ObligationEffect {
    pub fn is_delete(&self) -> bool {
        matches!(self, ObligationEffect::Delete(_))
    }
}

/// Source of obligation effects.
///
/// Returning [`AnalysisError::UnresolvedDependency`] means the policy lacks the
/// information to decide; the analysis then treats the instruction as having
/// no effect.
pub trait ObligationPolicy: Send + Sync {
    fn effects(&self, instruction: &Instruction) -> Result<Vec<ObligationEffect>>;
}

#[derive(Clone, Debug)]
struct CallRule {
    owner: String,
    name: String,
    effect: ObligationEffect,
}

/// Table of calls that acquire or release obligations.
///
/// Rules match the callee's owner or, through registered supertypes, any of its
/// ancestors. A call whose name appears in some rule but whose owner is neither
/// matched nor has a known supertype chain is unresolved.
#[derive(Clone, Debug, Default)]
pub struct CallPolicy {
    rules: Vec<CallRule>,
    supertypes: HashMap<String, Vec<String>>,
}

impl CallPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams and readers from `java.io`, acquired by their constructors and
    /// released by `close`.
    pub fn standard(factory: &ObligationFactory) -> Self {
        let input = factory.obligation("java/io/InputStream");
        let output = factory.obligation("java/io/OutputStream");
        let reader = factory.obligation("java/io/Reader");
        let writer = factory.obligation("java/io/Writer");
        let mut policy = Self::new();
        for (base, obligation, concrete) in [
            (
                "java/io/InputStream",
                &input,
                ["java/io/FileInputStream", "java/util/zip/ZipInputStream"],
            ),
            (
                "java/io/OutputStream",
                &output,
                ["java/io/FileOutputStream", "java/util/zip/ZipOutputStream"],
            ),
            ("java/io/Reader", &reader, ["java/io/FileReader", "java/io/InputStreamReader"]),
            ("java/io/Writer", &writer, ["java/io/FileWriter", "java/io/OutputStreamWriter"]),
        ] {
            policy = policy.releases(base, "close", obligation.clone());
            for class in concrete {
                policy = policy
                    .acquires(class, "<init>", obligation.clone())
                    .with_supertype(class, base);
            }
        }
        policy
    }

    pub fn acquires(mut self, owner: &str, name: &str, obligation: Obligation) -> Self {
        self.rules.push(CallRule {
            owner: owner.to_string(),
            name: name.to_string(),
            effect: ObligationEffect::Add(obligation),
        });
        self
    }

    pub fn releases(mut self, owner: &str, name: &str, obligation: Obligation) -> Self {
        self.rules.push(CallRule {
            owner: owner.to_string(),
            name: name.to_string(),
            effect: ObligationEffect::Delete(obligation),
        });
        self
    }

    /// Declares `supertype` as a direct supertype of `class`.
    pub fn with_supertype(mut self, class: &str, supertype: &str) -> Self {
        self.add_supertype(class, supertype);
        self
    }

    pub fn add_supertype(&mut self, class: &str, supertype: &str) {
        let supertypes = self.supertypes.entry(class.to_string()).or_default();
        if !supertypes.iter().any(|known| known == supertype) {
            supertypes.push(supertype.to_string());
        }
    }

    fn call_effects(&self, call: &CallSite) -> Result<Vec<ObligationEffect>> {
        let candidates: Vec<&CallRule> = self.rules.iter().filter(|rule| rule.name == call.name).collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        // Constructors are not inherited.
        if call.kind == CallKind::Special && call.name == "<init>" {
            return Ok(candidates
                .into_iter()
                .filter(|rule| rule.owner == call.owner)
                .map(|rule| rule.effect.clone())
                .collect());
        }

        let mut effects = Vec::new();
        let mut visited = BTreeSet::new();
        let mut pending = vec![call.owner.as_str()];
        let mut resolved = false;
        while let Some(class) = pending.pop() {
            if !visited.insert(class) {
                continue;
            }
            let direct: Vec<_> = candidates.iter().filter(|rule| rule.owner == class).collect();
            if !direct.is_empty() {
                effects.extend(direct.into_iter().map(|rule| rule.effect.clone()));
                resolved = true;
                continue;
            }
            if let Some(supertypes) = self.supertypes.get(class) {
                resolved = true;
                pending.extend(supertypes.iter().map(String::as_str));
            }
        }
        if !resolved {
            return Err(AnalysisError::UnresolvedDependency(format!(
                "supertypes of {} needed to match {}",
                call.owner, call.name
            )));
        }
        Ok(effects)
    }
}

impl ObligationPolicy for CallPolicy {
    fn effects(&self, instruction: &Instruction) -> Result<Vec<ObligationEffect>> {
        match &instruction.kind {
            InstructionKind::Invoke(call) => self.call_effects(call),
            _ => Ok(Vec::new()),
        }
    }
}

/// Forward obligation analysis for one method.
pub struct ObligationAnalysis {
    cfg: Arc<Cfg>,
    policy: Arc<dyn ObligationPolicy>,
    limit: i32,
    ignore_unhandled_exception_paths: bool,
}

impl ObligationAnalysis {
    pub fn new(cfg: Arc<Cfg>, policy: Arc<dyn ObligationPolicy>, limit: u8) -> Self {
        Self {
            cfg,
            policy,
            limit: i32::from(limit.max(1)),
            ignore_unhandled_exception_paths: true,
        }
    }

    /// Whether paths leaving the method by an uncaught `athrow` are dropped.
    pub fn ignore_unhandled_exception_paths(mut self, ignore: bool) -> Self {
        self.ignore_unhandled_exception_paths = ignore;
        self
    }

    fn effects(&self, instruction: &Instruction) -> Result<Vec<ObligationEffect>> {
        match self.policy.effects(instruction) {
            Err(AnalysisError::UnresolvedDependency(what)) => {
                debug!(
                    method = %self.cfg.method(),
                    offset = instruction.offset,
                    "no obligation effect: unresolved {what}"
                );
                Ok(Vec::new())
            }
            other => other,
        }
    }
}

impl DataflowAnalysis for ObligationAnalysis {
    type Fact = StateSet;
    const NAME: &'static str = "obligation";

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn create_fact(&self) -> StateSet {
        StateSet::top()
    }

    fn init_entry_fact(&self, fact: &mut StateSet) -> Result<()> {
        *fact = StateSet::balanced();
        Ok(())
    }

    fn make_fact_top(&self, fact: &mut StateSet) {
        fact.set_top();
    }

    fn is_top(&self, fact: &StateSet) -> bool {
        fact.is_top()
    }

    fn is_fact_valid(&self, fact: &StateSet) -> bool {
        fact.is_valid()
    }

    fn same(&self, a: &StateSet, b: &StateSet) -> bool {
        a == b
    }

    fn transfer_instruction(&self, instruction: &Instruction, _: &BasicBlock, fact: &mut StateSet) -> Result<()> {
        if !fact.is_valid() {
            return Ok(());
        }
        for effect in self.effects(instruction)? {
            fact.apply(&effect, self.limit);
        }
        Ok(())
    }

    fn edge_transfer(&self, edge: &Edge, fact: &mut StateSet) -> Result<()> {
        match edge.kind {
            EdgeKind::Exception if edge.is_implicit_exception() => fact.set_top(),
            EdgeKind::Exception => {
                // A call that fails while releasing still counts as released.
                if let Some(thrower) = self.cfg.block(edge.source).instructions.first() {
                    for effect in self.effects(thrower)?.iter().filter(|effect| effect.is_delete()) {
                        fact.apply(effect, self.limit);
                    }
                }
            }
            EdgeKind::UnhandledException if self.ignore_unhandled_exception_paths => fact.set_top(),
            _ => {}
        }
        Ok(())
    }

    fn meet_into(&self, incoming: &StateSet, _: &Edge, accumulator: &mut StateSet) -> Result<()> {
        accumulator.merge_with(incoming);
        Ok(())
    }
}

/// Converged obligation facts of a method.
#[derive(Clone, Debug)]
pub struct ObligationResult {
    dataflow: DataflowResult<StateSet>,
}

impl ObligationResult {
    pub fn new(dataflow: DataflowResult<StateSet>) -> Self {
        Self { dataflow }
    }

    pub fn dataflow(&self) -> &DataflowResult<StateSet> {
        &self.dataflow
    }

    /// Path states reaching the exit with a non-zero count.
    pub fn unbalanced(&self) -> Vec<&ObligationSet> {
        let exit = self.dataflow.fact_at_end();
        if !exit.is_valid() {
            return Vec::new();
        }
        exit.states().iter().filter(|set| !set.is_empty()).collect()
    }

    /// Obligation ids with a non-zero count on some path to the exit.
    pub fn unbalanced_ids(&self) -> BTreeSet<usize> {
        self.unbalanced()
            .into_iter()
            .flat_map(|set| set.nonzero().map(|(id, _)| id))
            .collect()
    }
}
