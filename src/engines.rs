//! Built-in engines: every analysis reachable through the cache.

use std::sync::Arc;

use tracing::debug;

use crate::analyses::call_list::{CallList, CallListAnalysis};
use crate::analyses::constant::{Constant, ConstantAnalysis, ConstantModel};
use crate::analyses::field_set::{FieldSet, FieldSetAnalysis};
use crate::analyses::obligation::{ObligationAnalysis, ObligationResult};
use crate::cache::{AnalysisCache, AnalysisEngine};
use crate::cfg::{Cfg, EdgeFilter, build_cfg};
use crate::classfile::parse_class;
use crate::context::AnalysisContext;
use crate::dataflow::frame::Frame;
use crate::dataflow::{Dataflow, DataflowAnalysis, DataflowResult};
use crate::descriptor::{ClassDescriptor, MethodDescriptor};
use crate::dominators::DominatorTree;
use crate::error::{AnalysisError, Result};
use crate::ir::{Class, Method};
use crate::order::DepthFirstSearch;

/// Registers every built-in engine.
pub fn register_all(cache: &AnalysisCache) -> Result<()> {
    cache.register(ClassInfoEngine)?;
    cache.register(MethodInfoEngine)?;
    cache.register(CfgEngine)?;
    cache.register(DepthFirstSearchEngine)?;
    cache.register(ReverseDepthFirstSearchEngine)?;
    cache.register(DominatorsEngine)?;
    cache.register(PostDominatorsEngine)?;
    cache.register(ConstantDataflowEngine)?;
    cache.register(CallListDataflowEngine)?;
    cache.register(LoadedFieldSetEngine)?;
    cache.register(StoredFieldSetEngine)?;
    cache.register(ObligationDataflowEngine)?;
    Ok(())
}

fn run<A: DataflowAnalysis>(ctx: &AnalysisContext, cfg: Arc<Cfg>, analysis: A) -> Result<DataflowResult<A::Fact>> {
    Dataflow::new(cfg, analysis)
        .with_max_iterations(ctx.config().max_iterations)
        .execute()
}

/// Decoded class from the context's bytes.
pub struct ClassInfoEngine;

impl AnalysisEngine for ClassInfoEngine {
    type Descriptor = ClassDescriptor;
    type Output = Class;
    const NAME: &'static str = "class-info";

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &ClassDescriptor) -> Result<Class> {
        let bytes = ctx.class_bytes(descriptor)?;
        parse_class(&bytes, descriptor.class_name(), ctx.descriptors())
    }
}

/// One decoded method of a loaded class.
pub struct MethodInfoEngine;

impl AnalysisEngine for MethodInfoEngine {
    type Descriptor = MethodDescriptor;
    type Output = Method;
    const NAME: &'static str = "method-info";

    fn dependencies(&self) -> &'static [&'static str] {
        &[ClassInfoEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<Method> {
        let class = ctx.get::<ClassInfoEngine>(descriptor.class())?;
        class
            .find_method(descriptor.name(), descriptor.signature())
            .cloned()
            .ok_or_else(|| AnalysisError::UnresolvedDependency(format!("method {descriptor} not found")))
    }
}

pub struct CfgEngine;

impl AnalysisEngine for CfgEngine {
    type Descriptor = MethodDescriptor;
    type Output = Cfg;
    const NAME: &'static str = "cfg";

    fn dependencies(&self) -> &'static [&'static str] {
        &[MethodInfoEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<Cfg> {
        let method = ctx.get::<MethodInfoEngine>(descriptor)?;
        build_cfg(&method)
    }
}

/// Forward depth-first search. Cheap, so never retained.
pub struct DepthFirstSearchEngine;

impl AnalysisEngine for DepthFirstSearchEngine {
    type Descriptor = MethodDescriptor;
    type Output = DepthFirstSearch;
    const NAME: &'static str = "depth-first-search";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn retain_analysis_results(&self) -> bool {
        false
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<DepthFirstSearch> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        Ok(DepthFirstSearch::forward(&cfg, EdgeFilter::ALL))
    }
}

/// Depth-first search of the reversed CFG.
pub struct ReverseDepthFirstSearchEngine;

impl AnalysisEngine for ReverseDepthFirstSearchEngine {
    type Descriptor = MethodDescriptor;
    type Output = DepthFirstSearch;
    const NAME: &'static str = "reverse-depth-first-search";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn retain_analysis_results(&self) -> bool {
        false
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<DepthFirstSearch> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        Ok(DepthFirstSearch::backward(&cfg, EdgeFilter::ALL))
    }
}

pub struct DominatorsEngine;

impl AnalysisEngine for DominatorsEngine {
    type Descriptor = MethodDescriptor;
    type Output = DominatorTree;
    const NAME: &'static str = "dominators";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<DominatorTree> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        DominatorTree::compute_dominators(cfg, ctx.config().max_iterations)
    }
}

/// Post-dominators; implicit exception edges are skipped when configured.
pub struct PostDominatorsEngine;

impl AnalysisEngine for PostDominatorsEngine {
    type Descriptor = MethodDescriptor;
    type Output = DominatorTree;
    const NAME: &'static str = "post-dominators";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<DominatorTree> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        DominatorTree::compute_post_dominators(cfg, ctx.config().post_dominator_filter(), ctx.config().max_iterations)
    }
}

pub struct ConstantDataflowEngine;

impl AnalysisEngine for ConstantDataflowEngine {
    type Descriptor = MethodDescriptor;
    type Output = DataflowResult<Frame<Constant>>;
    const NAME: &'static str = "constant-dataflow";

    fn dependencies(&self) -> &'static [&'static str] {
        &[MethodInfoEngine::NAME, CfgEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<Self::Output> {
        let method = ctx.get::<MethodInfoEngine>(descriptor)?;
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        run(ctx, cfg, ConstantAnalysis::new(ConstantModel, &method))
    }
}

pub struct CallListDataflowEngine;

impl AnalysisEngine for CallListDataflowEngine {
    type Descriptor = MethodDescriptor;
    type Output = DataflowResult<CallList>;
    const NAME: &'static str = "call-list-dataflow";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<Self::Output> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        run(ctx, cfg, CallListAnalysis)
    }
}

pub struct LoadedFieldSetEngine;

impl AnalysisEngine for LoadedFieldSetEngine {
    type Descriptor = MethodDescriptor;
    type Output = DataflowResult<FieldSet>;
    const NAME: &'static str = "loaded-field-set";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<Self::Output> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        run(ctx, cfg, FieldSetAnalysis::loads())
    }
}

pub struct StoredFieldSetEngine;

impl AnalysisEngine for StoredFieldSetEngine {
    type Descriptor = MethodDescriptor;
    type Output = DataflowResult<FieldSet>;
    const NAME: &'static str = "stored-field-set";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<Self::Output> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        run(ctx, cfg, FieldSetAnalysis::stores())
    }
}

/// Obligation balance using the context's policy.
pub struct ObligationDataflowEngine;

impl AnalysisEngine for ObligationDataflowEngine {
    type Descriptor = MethodDescriptor;
    type Output = ObligationResult;
    const NAME: &'static str = "obligation-dataflow";

    fn dependencies(&self) -> &'static [&'static str] {
        &[CfgEngine::NAME]
    }

    fn analyze(&self, ctx: &AnalysisContext, descriptor: &MethodDescriptor) -> Result<ObligationResult> {
        let cfg = ctx.get::<CfgEngine>(descriptor)?;
        let analysis = ObligationAnalysis::new(
            Arc::clone(&cfg),
            Arc::clone(ctx.obligation_policy()),
            ctx.config().obligation_count_limit,
        )
        .ignore_unhandled_exception_paths(ctx.config().obligation_ignore_unhandled_exception_paths);
        run(ctx, cfg, analysis).map(ObligationResult::new)
    }
}

/// What the driver reports for one analyzed method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSummary {
    pub blocks: usize,
    pub edges: usize,
    pub back_edges: usize,
    pub unbalanced_obligations: usize,
}

/// Requests every method-level analysis for `method`.
///
/// Methods without code (abstract or native) have nothing to analyze and
/// yield `None`.
pub fn analyze_method(ctx: &AnalysisContext, method: &MethodDescriptor) -> Result<Option<MethodSummary>> {
    let info = ctx.get::<MethodInfoEngine>(method)?;
    if !info.has_code() {
        return Ok(None);
    }
    let cfg = ctx.get::<CfgEngine>(method)?;
    let dfs = ctx.get::<DepthFirstSearchEngine>(method)?;
    ctx.get::<ReverseDepthFirstSearchEngine>(method)?;
    ctx.get::<DominatorsEngine>(method)?;
    ctx.get::<PostDominatorsEngine>(method)?;
    ctx.get::<ConstantDataflowEngine>(method)?;
    ctx.get::<CallListDataflowEngine>(method)?;
    ctx.get::<LoadedFieldSetEngine>(method)?;
    ctx.get::<StoredFieldSetEngine>(method)?;
    let obligations = ctx.get::<ObligationDataflowEngine>(method)?;

    let summary = MethodSummary {
        blocks: cfg.num_blocks(),
        edges: cfg.edges().len(),
        back_edges: dfs.back_edges().len(),
        unbalanced_obligations: obligations.unbalanced().len(),
    };
    debug!(%method, ?summary, "analyzed method");
    Ok(Some(summary))
}

/// Analyzes every method of `class`, collecting per-method outcomes.
///
/// Fails only when the class itself cannot be decoded.
pub fn analyze_class(
    ctx: &AnalysisContext,
    class: &ClassDescriptor,
) -> Result<Vec<(MethodDescriptor, Result<Option<MethodSummary>>)>> {
    let info = ctx.get::<ClassInfoEngine>(class)?;
    Ok(info
        .methods
        .iter()
        .map(|method| {
            let descriptor = method.descriptor.clone();
            let outcome = analyze_method(ctx, &descriptor);
            (descriptor, outcome)
        })
        .collect())
}
