//! Concrete analyses built on the fixpoint engine.

pub mod call_list;
pub mod constant;
pub mod field_set;
pub mod obligation;

pub use call_list::{Call, CallList, CallListAnalysis};
pub use constant::{Constant, ConstantModel};
pub use field_set::{FieldAccessHook, FieldSet, FieldSetAnalysis, LoadedFields, StoredFields};
pub use obligation::{
    CallPolicy, Obligation, ObligationAnalysis, ObligationEffect, ObligationFactory, ObligationPolicy,
    ObligationResult, ObligationSet, StateSet,
};
