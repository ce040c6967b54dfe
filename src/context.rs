//! The [`AnalysisContext`]: everything one analysis run shares.
//!
//! A context owns the class bytes, the analysis cache, the profiler and the
//! configuration. Engines receive it explicitly; there is no global state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::analyses::obligation::{CallPolicy, ObligationFactory, ObligationPolicy};
use crate::cache::{AnalysisCache, AnalysisEngine};
use crate::classfile::parse_class;
use crate::config::AnalysisConfig;
use crate::descriptor::{ClassDescriptor, DescriptorFactory};
use crate::engines::{self, ClassInfoEngine};
use crate::error::{AnalysisError, Result};
use crate::hash::ClassHash;

/// Invocation counts and cumulative time per analysis kind.
#[derive(Debug, Default)]
pub struct Profiler {
    entries: DashMap<&'static str, ProfileEntry>,
}

/// Totals for one analysis kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileEntry {
    pub invocations: usize,
    pub elapsed: Duration,
}

impl Profiler {
    pub fn record(&self, kind: &'static str, elapsed: Duration) {
        let mut entry = self.entries.entry(kind).or_default();
        entry.invocations += 1;
        entry.elapsed += elapsed;
    }

    pub fn count(&self, kind: &str) -> usize {
        self.entries.get(kind).map_or(0, |entry| entry.invocations)
    }

    /// All entries, ordered by kind.
    pub fn snapshot(&self) -> BTreeMap<&'static str, ProfileEntry> {
        self.entries.iter().map(|entry| (*entry.key(), *entry.value())).collect()
    }
}

struct ClassEntry {
    bytes: Arc<[u8]>,
    hash: ClassHash,
}

/// Shared state of one analysis run.
pub struct AnalysisContext {
    config: AnalysisConfig,
    descriptors: DescriptorFactory,
    classes: DashMap<ClassDescriptor, ClassEntry>,
    cache: AnalysisCache,
    profiler: Profiler,
    obligations: Arc<ObligationFactory>,
    obligation_policy: Arc<dyn ObligationPolicy>,
}

impl AnalysisContext {
    /// A context with every built-in engine registered.
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        let obligations = Arc::new(ObligationFactory::new());
        let obligation_policy: Arc<dyn ObligationPolicy> = Arc::new(CallPolicy::standard(&obligations));
        let context = Self {
            config,
            descriptors: DescriptorFactory::new(),
            classes: DashMap::new(),
            cache: AnalysisCache::new(),
            profiler: Profiler::default(),
            obligations,
            obligation_policy,
        };
        engines::register_all(&context.cache)?;
        Ok(context)
    }

    /// Replaces the policy used by the obligation engine.
    pub fn with_obligation_policy(mut self, policy: Arc<dyn ObligationPolicy>) -> Self {
        self.obligation_policy = policy;
        self.cache.clear();
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn descriptors(&self) -> &DescriptorFactory {
        &self.descriptors
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn obligation_factory(&self) -> &Arc<ObligationFactory> {
        &self.obligations
    }

    pub fn obligation_policy(&self) -> &Arc<dyn ObligationPolicy> {
        &self.obligation_policy
    }

    /// Result of engine `E` for `descriptor`, through the cache.
    pub fn get<E: AnalysisEngine>(&self, descriptor: &E::Descriptor) -> Result<Arc<E::Output>> {
        self.cache.get::<E>(self, descriptor)
    }

    /// Adds class bytes, returning the class they define.
    ///
    /// If the class is already present this behaves like
    /// [`reload_class`](Self::reload_class).
    pub fn add_class(&self, bytes: Vec<u8>, label: &str) -> Result<ClassDescriptor> {
        let class = parse_class(&bytes, label, &self.descriptors)?;
        let descriptor = class.descriptor.clone();
        self.reload_class(&descriptor, bytes);
        // The parse is the class-info result; keep it instead of decoding twice.
        self.cache.seed::<ClassInfoEngine>(&descriptor, class);
        Ok(descriptor)
    }

    /// Installs new bytes for `class`. Cached results for the class are dropped
    /// only when the digest changed; returns whether that happened.
    pub fn reload_class(&self, class: &ClassDescriptor, bytes: Vec<u8>) -> bool {
        let hash = ClassHash::compute(&bytes);
        let entry = ClassEntry {
            bytes: Arc::from(bytes),
            hash: hash.clone(),
        };
        let changed = self
            .classes
            .insert(class.clone(), entry)
            .is_some_and(|previous| previous.hash != hash);
        if changed {
            let dropped = self.cache.invalidate_class(class.class_name());
            info!(class = %class, dropped, "class changed; cached analyses invalidated");
        } else {
            debug!(class = %class, "class bytes installed");
        }
        changed
    }

    /// Removes a class and every cached result keyed under it.
    pub fn remove_class(&self, class: &ClassDescriptor) -> bool {
        let removed = self.classes.remove(class).is_some();
        self.cache.invalidate_class(class.class_name());
        removed
    }

    pub fn class_bytes(&self, class: &ClassDescriptor) -> Result<Arc<[u8]>> {
        self.classes
            .get(class)
            .map(|entry| Arc::clone(&entry.bytes))
            .ok_or_else(|| AnalysisError::UnresolvedDependency(format!("class {class} is not loaded")))
    }

    pub fn class_hash(&self, class: &ClassDescriptor) -> Option<ClassHash> {
        self.classes.get(class).map(|entry| entry.hash.clone())
    }

    /// Loaded classes in name order.
    pub fn classes(&self) -> Vec<ClassDescriptor> {
        let mut classes: Vec<_> = self.classes.iter().map(|entry| entry.key().clone()).collect();
        classes.sort();
        classes
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}
