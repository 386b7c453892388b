//! Mutable state of one tracing pass.
//!
//! A `TraceContext` is created per pass, threaded by `&mut` through every
//! recursive wrap, and consumed by [`TraceContext::finish`].

use crate::builder::VariableBuilder;
use crate::classify::{DefaultClassifier, ValueClassifier};
use crate::graph_args::{GraphArg, GraphArgRegistry, TrackedFake};
use crate::materialize::{self, Example, ProxyOptions};
use crate::side_effects::{MutationReplay, SideEffects};
use crate::variable::{ModuleKind, VarRef, Variable, VariableKind};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::rc::Rc;
use vt_cache::{GraphArgSignature, GuardKey, GuardKeyInput, build_guard_key};
use vt_core::{
    FrameBindings, GuardKind, GuardSet, ObjectId, OpTarget, Source, TensorClass, TraceConfig,
    TraceError, Value, make_guards,
};
use vt_fake::{
    FakeTensorMode, FakeValue, KernelRegistry, RngState, SharedRng, SymbolEnv, SymbolRecord,
};
use vt_graph::{Atom, NodeId, TraceGraph, sanitize_name};
use vt_ledger::{DecisionLedger, DecisionRecord, WrapDecision};

const CONTEXT_LOG_TARGET: &str = "vt_builder::context";

#[derive(Debug)]
pub struct TraceContext {
    pub(crate) config: TraceConfig,
    pub(crate) frame: FrameBindings,
    pub(crate) graph: TraceGraph,
    pub(crate) guards: GuardSet,
    pub(crate) graph_args: GraphArgRegistry,
    pub(crate) tracked_fakes: Vec<TrackedFake>,
    pub(crate) side_effects: SideEffects,
    pub(crate) fake: FakeTensorMode,
    pub(crate) classifier: Box<dyn ValueClassifier>,
    pub(crate) ledger: DecisionLedger,
    /// Containers whose children are being wrapped right now.
    pub(crate) in_progress: FxHashSet<ObjectId>,
    sub_components: BTreeMap<String, Value>,
    registered: FxHashMap<ObjectId, String>,
}

impl TraceContext {
    /// Starts a pass with a fresh random state seeded with zero.
    pub fn new(config: TraceConfig, frame: FrameBindings) -> Result<Self, TraceError> {
        Self::with_rng(config, frame, RngState::shared(0))
    }

    /// Starts a pass sharing `rng` with the interpreter. Contradictory
    /// flags are rejected here, before anything is wrapped.
    pub fn with_rng(
        config: TraceConfig,
        frame: FrameBindings,
        rng: SharedRng,
    ) -> Result<Self, TraceError> {
        config.validate()?;
        let fake =
            FakeTensorMode::new(rng).with_capture_scalar_outputs(config.capture_scalar_outputs);
        Ok(Self {
            config,
            frame,
            graph: TraceGraph::new(),
            guards: GuardSet::new(),
            graph_args: GraphArgRegistry::new(),
            tracked_fakes: Vec::new(),
            side_effects: SideEffects::new(),
            fake,
            classifier: Box::new(DefaultClassifier::new()),
            ledger: DecisionLedger::new(),
            in_progress: FxHashSet::default(),
            sub_components: BTreeMap::new(),
            registered: FxHashMap::default(),
        })
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Box<dyn ValueClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn kernels_mut(&mut self) -> &mut KernelRegistry {
        self.fake.kernels_mut()
    }

    #[must_use]
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    #[must_use]
    pub fn frame(&self) -> &FrameBindings {
        &self.frame
    }

    #[must_use]
    pub fn graph(&self) -> &TraceGraph {
        &self.graph
    }

    /// Union of every guard attached so far.
    #[must_use]
    pub fn guards(&self) -> &GuardSet {
        &self.guards
    }

    #[must_use]
    pub fn graph_args(&self) -> &GraphArgRegistry {
        &self.graph_args
    }

    #[must_use]
    pub fn tracked_fakes(&self) -> &[TrackedFake] {
        &self.tracked_fakes
    }

    #[must_use]
    pub fn side_effects(&self) -> &SideEffects {
        &self.side_effects
    }

    pub fn side_effects_mut(&mut self) -> &mut SideEffects {
        &mut self.side_effects
    }

    #[must_use]
    pub fn ledger(&self) -> &DecisionLedger {
        &self.ledger
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolEnv {
        self.fake.env()
    }

    #[must_use]
    pub fn sub_components(&self) -> &BTreeMap<String, Value> {
        &self.sub_components
    }

    /// Translates a runtime value reachable through `source`.
    pub fn wrap(&mut self, value: &Value, source: Rc<Source>) -> Result<VarRef, TraceError> {
        VariableBuilder::new(self, source).wrap(value)
    }

    pub fn create_graph_input(&mut self, name: &str, type_name: &str) -> NodeId {
        self.graph.create_graph_input(&sanitize_name(name), type_name)
    }

    pub fn create_call(
        &mut self,
        target: OpTarget,
        args: smallvec::SmallVec<[Atom; 4]>,
        params: BTreeMap<String, String>,
    ) -> Result<NodeId, TraceError> {
        Ok(self.graph.create_call(target, args, params)?)
    }

    /// Wraps the result of a traced operation. Without an example the
    /// node is executed abstractly.
    pub fn materialize(
        &mut self,
        node: NodeId,
        example: Option<Example>,
    ) -> Result<VarRef, TraceError> {
        let variable = materialize::wrap_fx_proxy(self, node, example, ProxyOptions::default())?;
        let name = self.graph.node(node)?.name().to_owned();
        self.ledger.record(
            name,
            variable.category(),
            WrapDecision::Materialized,
            Vec::new(),
        );
        Ok(variable)
    }

    /// Parks a non-literal mapping key in a global slot and returns the
    /// weak reference used to index through it.
    pub fn store_dict_key(&mut self, name: &str, key: &Value) -> Rc<Source> {
        self.frame.bind_global(name, key.clone());
        Source::weak_global(name)
    }

    pub(crate) fn add_guards(&mut self, guards: &GuardSet) {
        self.guards.extend(guards.iter().cloned());
    }

    pub(crate) fn push_graph_arg(&mut self, arg: GraphArg) -> Result<(), TraceError> {
        self.graph_args.push(arg)
    }

    fn component_name(&mut self, value: &Value, name: &str) -> String {
        if let Some(existing) = value.identity().and_then(|id| self.registered.get(&id)) {
            return existing.clone();
        }
        let base = sanitize_name(name);
        let mut candidate = base.clone();
        let mut suffix = 1_u32;
        while self.sub_components.contains_key(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        if let Some(id) = value.identity() {
            self.registered.insert(id, candidate.clone());
        }
        self.sub_components.insert(candidate.clone(), value.clone());
        candidate
    }

    /// Binds `value` as a named sub-component of the compiled artifact
    /// instead of a plain graph input.
    pub fn register_attr_or_module(
        &mut self,
        value: &Value,
        name: &str,
        source: Option<Rc<Source>>,
    ) -> Result<VarRef, TraceError> {
        let key = self.component_name(value, name);
        tracing::debug!(
            target: CONTEXT_LOG_TARGET,
            "register {key} ({})",
            value.type_name()
        );
        let guards_for = |kind: GuardKind| {
            source
                .as_ref()
                .and_then(|source| make_guards(source, &[kind]))
                .unwrap_or_default()
        };

        match value {
            Value::Tensor(tensor) => {
                let guards = guards_for(GuardKind::TensorMatch);
                let ignore_subclass = matches!(
                    &tensor.class,
                    TensorClass::Subclass(name) if self.config.is_traceable_subclass(name)
                );
                let node = self.graph.create_get_attr(&key);
                materialize::wrap_fx_proxy(
                    self,
                    node,
                    Some(Example::Real(value.clone())),
                    ProxyOptions {
                        source,
                        guards,
                        should_specialize: false,
                        ignore_subclass,
                    },
                )
            }
            Value::Module(_) => {
                let guards = guards_for(GuardKind::IdMatch);
                self.add_guards(&guards);
                Ok(Variable::new(
                    VariableKind::Module {
                        value: value.clone(),
                        kind: ModuleKind::Registered { name: key },
                    },
                    source.as_ref().map(Source::composite),
                    guards,
                ))
            }
            Value::SymInt(_) | Value::SymFloat(_) => {
                let example = FakeValue::from_value(value).ok_or_else(|| {
                    TraceError::invariant(format!("{key} has no abstract counterpart"))
                })?;
                let node = self.graph.create_get_attr(&key);
                self.graph.set_example(node, example.clone())?;
                Ok(Variable::new(
                    VariableKind::SymNumber { node, example },
                    source,
                    GuardSet::new(),
                ))
            }
            _ => {
                self.frame.bind_global(&key, value.clone());
                self.wrap(value, Source::constant(&key))
            }
        }
    }

    /// Ends the pass: checks the graph, fingerprints the guards and hands
    /// over everything the code generator needs.
    pub fn finish(self) -> Result<TraceOutput, TraceError> {
        self.graph.validate_well_formed()?;
        let input = GuardKeyInput {
            guards: self.guards.clone(),
            graph_args: self.graph_args.signatures(),
            config: self.config.clone(),
            graph_fingerprint: self.graph.canonical_fingerprint(),
        };
        let guard_key = build_guard_key(&input)?;
        let symbols = self.fake.env().records().to_vec();
        Ok(TraceOutput {
            guard_key,
            guards: self.guards,
            graph: self.graph,
            graph_args: self.graph_args.into_args(),
            tracked_fakes: self.tracked_fakes,
            sub_components: self.sub_components,
            replay: self.side_effects.into_replay(),
            ledger: self.ledger,
            symbols,
        })
    }
}

#[derive(Debug)]
pub struct TraceOutput {
    pub guard_key: GuardKey,
    pub guards: GuardSet,
    pub graph: TraceGraph,
    pub graph_args: Vec<GraphArg>,
    pub tracked_fakes: Vec<TrackedFake>,
    pub sub_components: BTreeMap<String, Value>,
    pub replay: MutationReplay,
    pub ledger: DecisionLedger,
    pub symbols: Vec<SymbolRecord>,
}

/// Serializable digest of a finished pass.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub guard_key: String,
    pub guards: Vec<String>,
    pub graph_args: Vec<GraphArgSignature>,
    pub sub_components: Vec<String>,
    pub mutations: Vec<String>,
    pub symbols: Vec<SymbolRecord>,
    pub decisions: Vec<DecisionRecord>,
}

impl TraceOutput {
    #[must_use]
    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            guard_key: self.guard_key.as_string(),
            guards: self.guards.iter().map(ToString::to_string).collect(),
            graph_args: self.graph_args.iter().map(GraphArg::signature).collect(),
            sub_components: self.sub_components.keys().cloned().collect(),
            mutations: self.replay.describe(),
            symbols: self.symbols.clone(),
            decisions: self.ledger.entries().to_vec(),
        }
    }
}
