#![forbid(unsafe_code)]

//! Turns runtime values seen by the tracer into symbolic variables, and
//! records the guards, graph inputs and tracked objects a compiled artifact
//! depends on.
//!
//! A pass starts with [`TraceContext::new`], wraps inputs with
//! [`TraceContext::wrap`], re-wraps computed results with
//! [`TraceContext::materialize`] and ends with [`TraceContext::finish`].

pub mod builder;
pub mod classify;
pub mod context;
pub mod graph_args;
pub mod materialize;
pub mod side_effects;
pub mod variable;

pub use builder::{VariableBuilder, is_common_constant};
pub use classify::{DefaultClassifier, ValueClassifier};
pub use context::{TraceContext, TraceOutput, TraceSummary};
pub use graph_args::{GraphArg, GraphArgRegistry, TrackedFake};
pub use materialize::{Example, ProxyOptions, ProxyTarget, wrap_fx_proxy, wrap_fx_proxy_cls};
pub use side_effects::{Mutation, MutationReplay, SideEffects};
pub use variable::{
    CallableKind, HelperKind, MapKey, ModuleKind, OpaqueKind, SequenceKind, TensorVar, VarRef,
    Variable, VariableKind,
};
