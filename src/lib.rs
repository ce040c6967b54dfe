//! Dataflow analysis over JVM bytecode.
//!
//! Class bytes are decoded into [`ir`] methods, turned into control flow
//! graphs by [`cfg`], ordered by [`order`] and iterated to a fixpoint by the
//! [`dataflow`] engine. Results are memoized per descriptor and analysis kind
//! in the [`cache`], reached through an [`AnalysisContext`].
//!
//! ```rust,ignore
//! let ctx = AnalysisContext::new(AnalysisConfig::default())?;
//! let class = ctx.add_class(bytes, "Sample.class")?;
//! for (method, summary) in engines::analyze_class(&ctx, &class)? {
//!     println!("{method}: {:?}", summary?);
//! }
//! ```

pub mod analyses;
pub mod bytecode;
pub mod cache;
pub mod cfg;
pub mod classfile;
pub mod config;
pub mod context;
pub mod dataflow;
pub mod descriptor;
pub mod dominators;
pub mod engines;
pub mod error;
pub mod hash;
pub mod ir;
pub mod opcodes;
pub mod order;

#[cfg(test)]
pub(crate) mod testing;

pub use config::AnalysisConfig;
pub use context::AnalysisContext;
pub use error::{AnalysisError, Result};
