use thiserror::Error;

/// Builds an [`AnalysisError::MalformedControlFlow`] for a method.
///
/// ```rust,ignore
/// return Err(malformed_cfg!(method, "branch target {} out of range", target));
/// ```
macro_rules! malformed_cfg {
    ($method:expr, $msg:expr) => {
        $crate::error::AnalysisError::MalformedControlFlow {
            method: $method.to_string(),
            message: $msg.to_string(),
        }
    };

    ($method:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::error::AnalysisError::MalformedControlFlow {
            method: $method.to_string(),
            message: format!($fmt, $($arg)*),
        }
    };
}

pub(crate) use malformed_cfg;

/// Every failure the analysis framework can report.
///
/// Failures are scoped: a method-local failure (`MalformedControlFlow`,
/// `InvalidFrame`, `AnalysisDiverged`) aborts the analysis of that method only,
/// a class-local failure (`MalformedClass`) skips that class. Consumers receive
/// the structured reason and are expected to degrade gracefully.
///
/// # Error Categories
///
/// ## Method input
/// - [`AnalysisError::MalformedControlFlow`] - invalid branch target or handler range
/// - [`AnalysisError::InvalidFrame`] - operand stack underflow/overflow while modeling
///
/// ## Engine
/// - [`AnalysisError::AnalysisDiverged`] - fixpoint iteration exceeded its cap
/// - [`AnalysisError::UnresolvedDependency`] - information about a class or method is unavailable
/// - [`AnalysisError::UnknownLocation`] - a location outside the analyzed CFG was queried
///
/// ## Cache
/// - [`AnalysisError::CacheComputation`] - the registered engine for a key failed
/// - [`AnalysisError::DependencyCycle`] - analysis kinds depend on each other
/// - [`AnalysisError::UnregisteredAnalysis`] - no engine for the requested kind
///
/// ## Input data
/// - [`AnalysisError::MalformedClass`] - class bytes could not be decoded
/// - [`AnalysisError::InvalidDescriptor`] - a type or method descriptor did not parse
/// - [`AnalysisError::InvalidDigest`] - a hex digest did not decode
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// The instruction stream references an invalid branch target or carries an
    /// ill-formed exception handler range.
    #[error("malformed control flow in {method}: {message}")]
    MalformedControlFlow {
        /// Method whose code is malformed
        method: String,
        /// What was wrong
        message: String,
    },

    /// The fixpoint iteration exceeded its cap. This indicates a non-monotonic
    /// meet in the analysis, not a property of the input.
    #[error("{analysis} did not converge after {iterations} iterations in {method}")]
    AnalysisDiverged {
        /// Name of the dataflow analysis
        analysis: &'static str,
        /// Method being analyzed
        method: String,
        /// Passes performed before giving up
        iterations: usize,
    },

    /// A transfer function needs information that is not on the analysis path.
    #[error("unresolved dependency: {0}")]
    UnresolvedDependency(String),

    /// The engine registered for a cache key failed. The entry stays invalid and a
    /// later request retries the computation.
    #[error("computing {kind} for {descriptor} failed: {source}")]
    CacheComputation {
        /// Analysis kind that was requested
        kind: &'static str,
        /// Descriptor the analysis was requested for
        descriptor: String,
        /// The engine's failure
        #[source]
        source: Box<AnalysisError>,
    },

    /// Analysis kinds form a dependency cycle.
    #[error("analysis dependency cycle: {0}")]
    DependencyCycle(String),

    /// No engine is registered for the requested analysis kind.
    #[error("no engine registered for analysis {0}")]
    UnregisteredAnalysis(&'static str),

    /// Operand stack modeling failed (underflow, overflow, bad slot).
    #[error("invalid frame in {method}: {message}")]
    InvalidFrame {
        /// Method being modeled
        method: String,
        /// What was wrong
        message: String,
    },

    /// The bytes of a class could not be decoded.
    #[error("malformed class {class}: {message}")]
    MalformedClass {
        /// Class name, or the input name when the class name is unknown
        class: String,
        /// What was wrong
        message: String,
    },

    /// A JVM type or method descriptor could not be parsed.
    #[error("invalid descriptor {descriptor}: {message}")]
    InvalidDescriptor {
        /// The descriptor text
        descriptor: String,
        /// Parser message
        message: String,
    },

    /// A location that does not belong to the analyzed CFG was queried.
    #[error("no fact recorded for location {0}")]
    UnknownLocation(String),

    /// A digest string was not valid hex.
    #[error("invalid digest {digest}: {message}")]
    InvalidDigest {
        /// The rejected input
        digest: String,
        /// Decoder message
        message: String,
    },
}

impl AnalysisError {
    /// Returns the innermost failure, unwrapping cache layers.
    pub fn root_cause(&self) -> &AnalysisError {
        match self {
            AnalysisError::CacheComputation { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the failure is confined to a single method.
    pub fn is_method_local(&self) -> bool {
        matches!(
            self.root_cause(),
            AnalysisError::MalformedControlFlow { .. }
                | AnalysisError::InvalidFrame { .. }
                | AnalysisError::AnalysisDiverged { .. }
                | AnalysisError::UnknownLocation(_)
        )
    }

    /// Short machine-readable name of the failure category.
    pub fn category(&self) -> &'static str {
        match self.root_cause() {
            AnalysisError::MalformedControlFlow { .. } => "MalformedControlFlow",
            AnalysisError::AnalysisDiverged { .. } => "AnalysisDiverged",
            AnalysisError::UnresolvedDependency(_) => "UnresolvedDependency",
            AnalysisError::CacheComputation { .. } => "CacheComputation",
            AnalysisError::DependencyCycle(_) => "DependencyCycle",
            AnalysisError::UnregisteredAnalysis(_) => "UnregisteredAnalysis",
            AnalysisError::InvalidFrame { .. } => "InvalidFrame",
            AnalysisError::MalformedClass { .. } => "MalformedClass",
            AnalysisError::InvalidDescriptor { .. } => "InvalidDescriptor",
            AnalysisError::UnknownLocation(_) => "UnknownLocation",
            AnalysisError::InvalidDigest { .. } => "InvalidDigest",
        }
    }
}

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_cfg_macro_formats_message() {
        let err = malformed_cfg!("A.m()V", "branch target {} out of range", 42);
        assert_eq!(
            err.to_string(),
            "malformed control flow in A.m()V: branch target 42 out of range"
        );
        assert!(err.is_method_local());
    }

    #[test]
    fn root_cause_unwraps_cache_layers() {
        let inner = AnalysisError::AnalysisDiverged {
            analysis: "constants",
            method: "A.m()V".to_string(),
            iterations: 107,
        };
        let wrapped = AnalysisError::CacheComputation {
            kind: "constants",
            descriptor: "A.m()V".to_string(),
            source: Box::new(AnalysisError::CacheComputation {
                kind: "cfg",
                descriptor: "A.m()V".to_string(),
                source: Box::new(inner.clone()),
            }),
        };

        assert_eq!(wrapped.root_cause(), &inner);
        assert_eq!(wrapped.category(), "AnalysisDiverged");
        assert!(wrapped.is_method_local());
    }

    #[test]
    fn class_failures_are_not_method_local() {
        let err = AnalysisError::MalformedClass {
            class: "bad.class".to_string(),
            message: "bad magic".to_string(),
        };
        assert!(!err.is_method_local());
    }
}
