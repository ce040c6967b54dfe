//! Memoized analysis results keyed by (entity descriptor, analysis kind).
//!
//! Engines register once; [`AnalysisCache::get`] computes a result on first
//! request and hands out shared snapshots afterwards. At most one computation
//! runs per key: concurrent requesters block until it finishes. A failed
//! computation leaves the slot empty so a later request retries it.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::context::AnalysisContext;
use crate::descriptor::{ClassDescriptor, MethodDescriptor};
use crate::error::{AnalysisError, Result};

/// The program entity a cached result belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Class(ClassDescriptor),
    Method(MethodDescriptor),
}

impl EntityKey {
    /// Internal name of the owning class.
    pub fn class_name(&self) -> &str {
        match self {
            EntityKey::Class(class) => class.class_name(),
            EntityKey::Method(method) => method.class().class_name(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Class(class) => write!(f, "{class}"),
            EntityKey::Method(method) => write!(f, "{method}"),
        }
    }
}

/// Descriptor types an engine can be keyed by.
pub trait CacheKey: Clone + fmt::Display + Send + Sync + 'static {
    fn entity_key(&self) -> EntityKey;
}

impl CacheKey for ClassDescriptor {
    fn entity_key(&self) -> EntityKey {
        EntityKey::Class(self.clone())
    }
}

impl CacheKey for MethodDescriptor {
    fn entity_key(&self) -> EntityKey {
        EntityKey::Method(self.clone())
    }
}

/// Computes one kind of analysis result for one descriptor.
pub trait AnalysisEngine: Send + Sync + 'static {
    type Descriptor: CacheKey;
    type Output: Send + Sync + 'static;

    /// Analysis kind; unique among registered engines.
    const NAME: &'static str;

    /// Kinds this engine requests while computing.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether results are kept after the first request. Engines returning
    /// `false` recompute on every request.
    fn retain_analysis_results(&self) -> bool {
        true
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &Self::Descriptor) -> Result<Self::Output>;
}

type Shared = Arc<dyn Any + Send + Sync>;
type SlotKey = (EntityKey, &'static str);

struct Registration {
    engine: Shared,
    dependencies: &'static [&'static str],
    retain: bool,
}

#[derive(Default)]
struct CacheSlot {
    value: OnceLock<Shared>,
    in_flight: Mutex<Option<ThreadId>>,
    finished: Condvar,
}

impl CacheSlot {
    fn get_or_compute(&self, key: &str, compute: impl FnOnce() -> Result<Shared>) -> Result<Shared> {
        let current = thread::current().id();
        {
            let mut owner = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(value) = self.value.get() {
                    return Ok(Arc::clone(value));
                }
                match *owner {
                    None => {
                        *owner = Some(current);
                        break;
                    }
                    Some(computing) if computing == current => {
                        return Err(AnalysisError::DependencyCycle(format!("{key} requested while computing itself")));
                    }
                    Some(_) => {
                        owner = self.finished.wait(owner).unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }

        let _release = InFlight { slot: self };
        let value = compute()?;
        Ok(Arc::clone(self.value.get_or_init(|| value)))
    }
}

/// Clears the in-flight marker and wakes waiters, also on error or panic.
struct InFlight<'a> {
    slot: &'a CacheSlot,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut owner = self.slot.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *owner = None;
        self.slot.finished.notify_all();
    }
}

/// Marks an unretained computation as running on this thread until dropped.
struct Running<'a> {
    running: &'a DashSet<(SlotKey, ThreadId)>,
    key: (SlotKey, ThreadId),
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.key);
    }
}

/// Registry of engines plus their memoized results.
#[derive(Default)]
pub struct AnalysisCache {
    engines: DashMap<&'static str, Registration>,
    slots: DashMap<SlotKey, Arc<CacheSlot>>,
    /// Unretained computations in progress, per requesting thread.
    running: DashSet<(SlotKey, ThreadId)>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `engine`, replacing any engine of the same kind.
    ///
    /// Fails with [`AnalysisError::DependencyCycle`] when the declared
    /// dependencies of registered engines would form a cycle; the engine is not
    /// registered in that case.
    pub fn register<E: AnalysisEngine>(&self, engine: E) -> Result<()> {
        let dependencies = engine.dependencies();
        if let Some(cycle) = self.find_cycle(E::NAME, dependencies) {
            return Err(AnalysisError::DependencyCycle(cycle.join(" -> ")));
        }
        let retain = engine.retain_analysis_results();
        self.engines.insert(
            E::NAME,
            Registration {
                engine: Arc::new(engine),
                dependencies,
                retain,
            },
        );
        debug!(kind = E::NAME, ?dependencies, retain, "registered analysis engine");
        Ok(())
    }

    /// Dependency path from `name` back to itself, if registering `name` with
    /// `dependencies` closes a cycle.
    fn find_cycle(&self, name: &'static str, dependencies: &'static [&'static str]) -> Option<Vec<&'static str>> {
        let mut graph: BTreeMap<&'static str, &'static [&'static str]> = self
            .engines
            .iter()
            .map(|entry| (*entry.key(), entry.value().dependencies))
            .collect();
        graph.insert(name, dependencies);

        let mut visited = BTreeSet::new();
        let mut stack = vec![(name, vec![name])];
        while let Some((kind, path)) = stack.pop() {
            for &dependency in graph.get(kind).copied().unwrap_or_default() {
                if dependency == name {
                    let mut cycle = path.clone();
                    cycle.push(name);
                    return Some(cycle);
                }
                if visited.insert(dependency) {
                    let mut next = path.clone();
                    next.push(dependency);
                    stack.push((dependency, next));
                }
            }
        }
        None
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Result of `E` for `descriptor`, computing it on first request.
    pub fn get<E: AnalysisEngine>(&self, ctx: &AnalysisContext, descriptor: &E::Descriptor) -> Result<Arc<E::Output>> {
        let (engine, retain) = {
            let registration = self
                .engines
                .get(E::NAME)
                .ok_or(AnalysisError::UnregisteredAnalysis(E::NAME))?;
            (Arc::clone(&registration.engine), registration.retain)
        };
        let key = (descriptor.entity_key(), E::NAME);
        if retain {
            let cached = self
                .slots
                .get(&key)
                .and_then(|slot| slot.value.get().map(Arc::clone));
            if let Some(shared) = cached {
                return downcast_output::<E>(shared);
            }
        }
        let engine = engine
            .downcast::<E>()
            .map_err(|_| AnalysisError::UnregisteredAnalysis(E::NAME))?;

        let compute = || -> Result<Shared> {
            let started = Instant::now();
            let output = engine.analyze(ctx, descriptor);
            ctx.profiler().record(E::NAME, started.elapsed());
            match output {
                Ok(output) => {
                    debug!(kind = E::NAME, %descriptor, "computed analysis");
                    Ok(Arc::new(output))
                }
                Err(err) => Err(AnalysisError::CacheComputation {
                    kind: E::NAME,
                    descriptor: descriptor.to_string(),
                    source: Box::new(err),
                }),
            }
        };

        let shared = if retain {
            let slot = Arc::clone(self.slots.entry(key).or_default().value());
            slot.get_or_compute(E::NAME, compute)?
        } else {
            let marker = (key, thread::current().id());
            if !self.running.insert(marker.clone()) {
                return Err(AnalysisError::DependencyCycle(format!(
                    "{} requested while computing itself",
                    E::NAME
                )));
            }
            let _running = Running {
                running: &self.running,
                key: marker,
            };
            compute()?
        };
        downcast_output::<E>(shared)
    }

    /// Installs an already computed result of `E` for `descriptor`.
    ///
    /// Returns `false`, leaving the cache untouched, when `E` is not the
    /// registered engine for its kind, does not retain results, or a result is
    /// already cached.
    pub fn seed<E: AnalysisEngine>(&self, descriptor: &E::Descriptor, output: E::Output) -> bool {
        let retained = self
            .engines
            .get(E::NAME)
            .is_some_and(|registration| registration.retain && registration.engine.is::<E>());
        if !retained {
            return false;
        }
        let slot = Arc::clone(self.slots.entry((descriptor.entity_key(), E::NAME)).or_default().value());
        let seeded = slot.value.set(Arc::new(output)).is_ok();
        if seeded {
            debug!(kind = E::NAME, %descriptor, "seeded analysis result");
        }
        seeded
    }

    /// Whether a result of `E` for `descriptor` is currently cached.
    pub fn contains<E: AnalysisEngine>(&self, descriptor: &E::Descriptor) -> bool {
        self.slots
            .get(&(descriptor.entity_key(), E::NAME))
            .is_some_and(|slot| slot.value.get().is_some())
    }

    /// Drops every entry keyed under `class_name`; returns how many were dropped.
    ///
    /// A computation already in flight finishes into its detached slot, so its
    /// result is never served after the invalidation.
    pub fn invalidate_class(&self, class_name: &str) -> usize {
        let before = self.slots.len();
        self.slots.retain(|(entity, _), _| entity.class_name() != class_name);
        let dropped = before.saturating_sub(self.slots.len());
        debug!(class = class_name, dropped, "invalidated cached analyses");
        dropped
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Number of slots, computed or pending.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn downcast_output<E: AnalysisEngine>(shared: Shared) -> Result<Arc<E::Output>> {
    shared
        .downcast::<E::Output>()
        .map_err(|_| AnalysisError::UnregisteredAnalysis(E::NAME))
}
