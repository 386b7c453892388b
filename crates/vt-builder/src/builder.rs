//! Translates runtime values into symbolic variables.
//!
//! Dispatch goes through [`WRAP_RULES`], an ordered table; the first rule
//! whose predicate accepts the value handles it. Several predicates overlap
//! (a tuple of literals is also a literal), so the order is significant.

use crate::context::TraceContext;
use crate::graph_args::{GraphArg, TrackedFake};
use crate::materialize::{self, Example, ProxyOptions, ProxyTarget};
use crate::variable::{
    CallableKind, HelperKind, MapKey, ModuleKind, OpaqueKind, SequenceKind, VarRef, Variable,
    VariableKind,
};
use std::rc::Rc;
use vt_core::{
    DType, FunctionKind, GuardKind, GuardSet, IndexKey, ModuleOrigin, Source, TensorClass,
    TraceError, Value, make_guards,
};
use vt_fake::{FakeTensor, FakeValue};
use vt_ledger::WrapDecision;

const WRAP_LOG_TARGET: &str = "vt_builder::wrap";

/// Integers that recur often enough to be worth specializing even when
/// numbers are otherwise left as inputs. Everything in `0..=16` is included
/// as well.
const COMMON_INTS: [i64; 15] = [
    20, 30, 40, 32, 64, 96, 128, 144, 240, 256, 672, 1024, 2048, 4096, 800,
];
const COMMON_FLOATS: [f64; 7] = [
    0.1,
    0.01,
    0.001,
    0.5,
    0.05,
    1.873_536_229_133_606,
    4.135_166_556_742_356,
];

fn is_common_int(value: i64) -> bool {
    (0..=16).contains(&value) || COMMON_INTS.contains(&value)
}

#[must_use]
pub fn is_common_constant(value: &Value) -> bool {
    match value {
        Value::Int(v) => is_common_int(*v),
        Value::Float(v) => COMMON_FLOATS.contains(v),
        _ => false,
    }
}

/// Global slot holding a mapping key that cannot be spelled as a literal.
fn global_key_name(key: &Value) -> Result<String, TraceError> {
    key.identity()
        .map(|id| format!("__dict_key_{}", id.0))
        .ok_or_else(|| {
            TraceError::unrepresentable(
                "wrap_mapping",
                key.type_name(),
                "mapping key is neither a literal nor an object with identity",
            )
        })
}

struct Wrapped {
    variable: VarRef,
    decision: WrapDecision,
}

impl Wrapped {
    fn new(variable: VarRef, decision: WrapDecision) -> Self {
        Self { variable, decision }
    }
}

type Matcher = fn(&VariableBuilder<'_>, &Value) -> bool;
type Handler = fn(&mut VariableBuilder<'_>, &Value) -> Result<Wrapped, TraceError>;

struct WrapRule {
    name: &'static str,
    matches: Matcher,
    wrap: Handler,
}

static WRAP_RULES: [WrapRule; 19] = [
    WrapRule {
        name: "sym_number",
        matches: |_, value| matches!(value, Value::SymInt(_) | Value::SymFloat(_)),
        wrap: wrap_sym,
    },
    WrapRule {
        name: "tensor",
        matches: |_, value| matches!(value, Value::Tensor(_)),
        wrap: wrap_tensor,
    },
    WrapRule {
        name: "sequence",
        matches: |_, value| {
            matches!(value, Value::Tuple(_) | Value::NamedTuple(_) | Value::List(_))
        },
        wrap: wrap_sequence,
    },
    WrapRule {
        name: "tuple_iterator",
        matches: |_, value| matches!(value, Value::TupleIter(_)),
        wrap: wrap_tuple_iterator,
    },
    WrapRule {
        name: "slice_range",
        matches: |_, value| matches!(value, Value::Slice(_) | Value::Range(_)),
        wrap: wrap_slice_range,
    },
    WrapRule {
        name: "mapping",
        matches: is_wrappable_mapping,
        wrap: wrap_mapping,
    },
    WrapRule {
        name: "module",
        matches: |_, value| matches!(value, Value::Module(_)),
        wrap: wrap_module,
    },
    WrapRule {
        name: "literal",
        matches: |_, value| {
            value.is_literal()
                || matches!(value, Value::Size(_) | Value::Device(_) | Value::DType(_))
        },
        wrap: wrap_literal,
    },
    WrapRule {
        name: "frozenset",
        matches: |builder, value| match value {
            Value::FrozenSet(set) => set
                .members
                .iter()
                .all(|member| member.is_literal() || builder.ctx.classifier.is_allowed(member)),
            _ => false,
        },
        wrap: |builder, value| {
            let guards = builder.guards(&[GuardKind::IdMatch]);
            let kind = VariableKind::Constant(value.clone());
            Ok(builder.leaf(kind, guards, WrapDecision::Specialized))
        },
    },
    WrapRule {
        name: "enum",
        matches: |_, value| matches!(value, Value::Enum(_)),
        wrap: |builder, value| {
            let guards = builder.guards(&[GuardKind::IdMatch]);
            let kind = VariableKind::Enum(value.clone());
            Ok(builder.leaf(kind, guards, WrapDecision::Specialized))
        },
    },
    WrapRule {
        name: "library_callable",
        matches: |builder, value| {
            helper_kind(value).is_some()
                || builder.ctx.classifier.is_builtin_callable(value)
                || builder.ctx.classifier.is_allowed(value)
        },
        wrap: wrap_library_callable,
    },
    WrapRule {
        name: "typing",
        matches: |_, value| matches!(value, Value::Typing(_)),
        wrap: |builder, value| {
            let guards = builder.guards(&[GuardKind::IdMatch]);
            let kind = VariableKind::Opaque(OpaqueKind::Typing(value.clone()));
            Ok(builder.leaf(kind, guards, WrapDecision::Opaque))
        },
    },
    WrapRule {
        name: "autograd_function",
        matches: |_, value| matches!(value, Value::Class(class) if class.autograd_function),
        wrap: |builder, value| {
            let guards = builder.guards(&[GuardKind::FunctionMatch]);
            let kind = VariableKind::Callable(CallableKind::AutogradFunction(value.clone()));
            Ok(builder.leaf(kind, guards, WrapDecision::Opaque))
        },
    },
    WrapRule {
        name: "autograd_apply",
        matches: |_, value| matches!(value, Value::Method(method) if method.is_autograd_apply()),
        wrap: wrap_autograd_apply,
    },
    WrapRule {
        name: "operator",
        matches: |_, value| {
            matches!(value, Value::Function(function) if function.kind == FunctionKind::Operator)
        },
        wrap: |builder, value| {
            let guards = builder.guards(&[GuardKind::TypeMatch, GuardKind::NameMatch]);
            let kind = VariableKind::Callable(CallableKind::Operator(value.clone()));
            Ok(builder.leaf(kind, guards, WrapDecision::Opaque))
        },
    },
    WrapRule {
        name: "function_or_class",
        matches: |builder, value| match value {
            Value::Function(_) => true,
            Value::Class(class) => {
                !class.force_inline && builder.ctx.classifier.is_skipped_file(&class.file)
            }
            _ => false,
        },
        wrap: wrap_function_or_class,
    },
    WrapRule {
        name: "python_module",
        matches: |_, value| matches!(value, Value::PyModule(_)),
        wrap: |builder, value| {
            let guards = builder.guards(&[GuardKind::ModuleMatch]);
            let kind = VariableKind::Opaque(OpaqueKind::PyModule(value.clone()));
            Ok(builder.leaf(kind, guards, WrapDecision::Opaque))
        },
    },
    WrapRule {
        name: "class",
        matches: |_, value| matches!(value, Value::Class(_)),
        wrap: |builder, value| {
            let guards = builder.guards(&[GuardKind::FunctionMatch]);
            let kind = VariableKind::Callable(CallableKind::UserClass(value.clone()));
            Ok(builder.leaf(kind, guards, WrapDecision::Opaque))
        },
    },
    WrapRule {
        name: "user_object",
        matches: |_, _| true,
        wrap: wrap_user_object,
    },
];

/// Wraps one value reachable through `source`. Children are wrapped by
/// builders that reborrow the same context.
pub struct VariableBuilder<'a> {
    ctx: &'a mut TraceContext,
    source: Rc<Source>,
}

impl<'a> VariableBuilder<'a> {
    pub fn new(ctx: &'a mut TraceContext, source: Rc<Source>) -> Self {
        Self { ctx, source }
    }

    #[must_use]
    pub fn source(&self) -> &Rc<Source> {
        &self.source
    }

    fn child(&mut self, source: Rc<Source>) -> VariableBuilder<'_> {
        VariableBuilder {
            ctx: &mut *self.ctx,
            source,
        }
    }

    fn guards(&self, kinds: &[GuardKind]) -> GuardSet {
        make_guards(&self.source, kinds).unwrap_or_default()
    }

    fn leaf(&self, kind: VariableKind, guards: GuardSet, decision: WrapDecision) -> Wrapped {
        Wrapped::new(
            Variable::new(kind, Some(Rc::clone(&self.source)), guards),
            decision,
        )
    }

    pub fn wrap(&mut self, value: &Value) -> Result<VarRef, TraceError> {
        let name = self.source.name();
        let Some(id) = value.identity() else {
            return self.dispatch(value, name);
        };
        if let Some(tracked) = self.ctx.side_effects.get(id) {
            tracing::debug!(target: WRAP_LOG_TARGET, "{name}: aliases tracked {id}");
            self.ctx
                .ledger
                .record(name, "aliased", WrapDecision::Aliased, Vec::new());
            return Ok(tracked);
        }
        if !self.ctx.in_progress.insert(id) {
            return Err(TraceError::unrepresentable(
                "wrap",
                value.type_name(),
                format!("{name} refers back to a container still being wrapped"),
            ));
        }
        let result = self.dispatch(value, name);
        self.ctx.in_progress.remove(&id);
        result
    }

    fn dispatch(&mut self, value: &Value, name: String) -> Result<VarRef, TraceError> {
        let rule = {
            let this: &VariableBuilder<'_> = self;
            WRAP_RULES.iter().find(|rule| (rule.matches)(this, value))
        }
        .ok_or_else(|| {
            TraceError::invariant(format!("no wrap rule accepts {}", value.type_name()))
        })?;
        let Wrapped { variable, decision } = (rule.wrap)(self, value)?;
        self.ctx.add_guards(variable.guards());
        tracing::debug!(
            target: WRAP_LOG_TARGET,
            "{name}: {} -> {}",
            rule.name,
            variable.category()
        );
        let guard_kinds = variable.guard_kinds_on(&name);
        self.ctx.ledger.record(name, rule.name, decision, guard_kinds);
        Ok(variable)
    }

    /// Optimizer parameters reached as `opt.param_groups[i]['params'][j]`
    /// keep their concrete value available.
    fn tensor_should_specialize(&self) -> bool {
        let Source::Index { base: params, .. } = self.source.as_ref() else {
            return false;
        };
        let Source::Index {
            base: group,
            key: IndexKey::Str(key),
        } = params.as_ref()
        else {
            return false;
        };
        let Source::Index { base: groups, .. } = group.as_ref() else {
            return false;
        };
        let Source::Attribute {
            base: owner,
            member,
        } = groups.as_ref()
        else {
            return false;
        };
        let Source::Local { name } = owner.as_ref() else {
            return false;
        };
        if key != "params" || member != "param_groups" {
            return false;
        }
        match self.ctx.frame.locals.get(name) {
            None => true,
            Some(Value::Object(object)) => object.is_instance_of("Optimizer"),
            Some(_) => false,
        }
    }

    /// Parameters, and any tensor keying an optimizer's `state` mapping.
    fn tensor_can_be_dict_key(&self, key: &Value) -> bool {
        let Value::Tensor(tensor) = key else {
            return false;
        };
        tensor.is_parameter()
            || matches!(
                self.source.as_ref(),
                Source::Attribute { base, member }
                    if member == "state" && matches!(base.as_ref(), Source::Local { .. })
            )
    }

    /// Passes a number through as a runtime input instead of baking it in.
    /// Wrapping the same source twice returns the first variable.
    pub fn wrap_unspecialized_primitive(&mut self, value: &Value) -> Result<VarRef, TraceError> {
        let name = self.source.name();
        if let Some(existing) = self.ctx.graph_args.lookup(&name) {
            return Ok(existing);
        }
        let constant_source = self.source.provenance().is_constant();
        let example = match value {
            Value::Int(hint) if self.ctx.config.symbolic_shapes && !constant_source => {
                let sym = self.ctx.fake.env_mut().create_symint(*hint, Some(name.as_str()));
                let example = FakeValue::SymInt(sym);
                self.ctx.tracked_fakes.push(TrackedFake {
                    fake: example.clone(),
                    source: Rc::clone(&self.source),
                });
                example
            }
            Value::Int(_) => FakeValue::Tensor(FakeTensor::scalar(DType::I64)),
            Value::Float(_) => FakeValue::Tensor(FakeTensor::scalar(DType::F32)),
            Value::Bool(_) => FakeValue::Tensor(FakeTensor::scalar(DType::Bool)),
            other => {
                return Err(TraceError::unrepresentable(
                    "wrap_unspecialized_primitive",
                    other.type_name(),
                    "only numbers can be left unspecialized",
                ));
            }
        };
        let guards = if self.source.is_random() {
            GuardSet::new()
        } else {
            self.guards(&[GuardKind::TypeMatch])
        };

        let node = self.ctx.create_graph_input(&name, &value.type_name());
        let variable = materialize::wrap_fx_proxy_cls(
            self.ctx,
            ProxyTarget::Unspecialized { raw: value.clone() },
            node,
            Some(Example::Abstract(example)),
            ProxyOptions {
                source: Some(Rc::clone(&self.source)),
                guards,
                ..ProxyOptions::default()
            },
        )?;
        if !constant_source {
            let fake = self
                .ctx
                .graph
                .example(node)
                .and_then(FakeValue::as_tensor)
                .cloned();
            self.ctx.push_graph_arg(GraphArg::new(
                Rc::clone(&self.source),
                value.clone(),
                fake,
                true,
                false,
            )?)?;
        }
        self.ctx.graph_args.remember(name, Rc::clone(&variable));
        Ok(variable)
    }
}

fn wrong_shape(rule: &str, value: &Value) -> TraceError {
    TraceError::invariant(format!("{rule} rule dispatched on {}", value.type_name()))
}

fn wrap_sym(builder: &mut VariableBuilder<'_>, value: &Value) -> Result<Wrapped, TraceError> {
    let name = builder.source.name();
    if builder.source.provenance().is_constant() {
        let variable = builder.ctx.register_attr_or_module(value, &name, None)?;
        return Ok(Wrapped::new(variable, WrapDecision::SubComponent));
    }
    if let Some(existing) = builder.ctx.graph_args.lookup(&name) {
        return Ok(Wrapped::new(existing, WrapDecision::GraphInput));
    }
    let example = FakeValue::from_value(value).ok_or_else(|| wrong_shape("sym_number", value))?;
    builder.ctx.push_graph_arg(GraphArg::new(
        Rc::clone(&builder.source),
        value.clone(),
        None,
        false,
        false,
    )?)?;
    let node = builder.ctx.create_graph_input(&name, &value.type_name());
    builder.ctx.graph.set_example(node, example.clone())?;
    let variable = Variable::new(
        VariableKind::SymNumber { node, example },
        Some(Rc::clone(&builder.source)),
        GuardSet::new(),
    );
    builder.ctx.graph_args.remember(name, Rc::clone(&variable));
    Ok(Wrapped::new(variable, WrapDecision::GraphInput))
}

fn wrap_tensor(builder: &mut VariableBuilder<'_>, value: &Value) -> Result<Wrapped, TraceError> {
    let Value::Tensor(tensor) = value else {
        return Err(wrong_shape("tensor", value));
    };
    let name = builder.source.name();
    let provenance = builder.source.provenance();
    if provenance.is_composite() || provenance.is_constant() {
        let variable = builder.ctx.register_attr_or_module(
            value,
            &name,
            Some(Rc::clone(&builder.source)),
        )?;
        return Ok(Wrapped::new(variable, WrapDecision::SubComponent));
    }
    if let Some(existing) = builder.ctx.graph_args.lookup(&name) {
        return Ok(Wrapped::new(existing, WrapDecision::GraphInput));
    }

    let ignore_subclass = match &tensor.class {
        TensorClass::Subclass(subclass) if builder.ctx.config.is_traceable_subclass(subclass) => {
            true
        }
        TensorClass::Subclass(subclass) => {
            return Err(TraceError::unrepresentable(
                "wrap_tensor",
                subclass.clone(),
                format!("{name} holds a tensor subtype that is not registered as traceable"),
            ));
        }
        TensorClass::Base | TensorClass::Parameter => false,
    };
    let should_specialize = builder.tensor_should_specialize();
    let guards = builder.guards(&[GuardKind::TensorMatch]);
    let node = builder.ctx.create_graph_input(&name, tensor.type_name());
    let variable = materialize::wrap_fx_proxy(
        builder.ctx,
        node,
        Some(Example::Real(value.clone())),
        ProxyOptions {
            source: Some(Rc::clone(&builder.source)),
            guards,
            should_specialize,
            ignore_subclass,
        },
    )?;
    let fake = builder
        .ctx
        .graph
        .example(node)
        .and_then(FakeValue::as_tensor)
        .cloned();
    builder.ctx.push_graph_arg(GraphArg::new(
        Rc::clone(&builder.source),
        value.clone(),
        fake,
        false,
        true,
    )?)?;
    builder.ctx.graph_args.remember(name, Rc::clone(&variable));
    Ok(Wrapped::new(variable, WrapDecision::GraphInput))
}

/// Wraps `items` under `item_source`. With `pinned` set the parent's
/// equality guard already fixes every item, so items become bare constants.
fn wrap_items(
    builder: &mut VariableBuilder<'_>,
    items: &[Value],
    pinned: bool,
    item_source: impl Fn(&Rc<Source>, usize) -> Rc<Source>,
    guards: &mut GuardSet,
) -> Result<Vec<VarRef>, TraceError> {
    let mut wrapped = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let source = item_source(&builder.source, idx);
        let child = if pinned {
            Variable::new(VariableKind::Constant(item.clone()), Some(source), GuardSet::new())
        } else {
            builder.child(source).wrap(item)?
        };
        guards.extend(child.guards().iter().cloned());
        wrapped.push(child);
    }
    Ok(wrapped)
}

fn wrap_sequence(builder: &mut VariableBuilder<'_>, value: &Value) -> Result<Wrapped, TraceError> {
    let (kind, items) = match value {
        Value::Tuple(items) => (SequenceKind::Tuple, items.to_vec()),
        Value::NamedTuple(record) => (
            SequenceKind::NamedTuple {
                type_name: record.type_name.clone(),
                fields: record.fields.clone(),
            },
            record.values.clone(),
        ),
        Value::List(list) => (SequenceKind::List, list.items.borrow().clone()),
        _ => return Err(wrong_shape("sequence", value)),
    };
    let pinned = items.iter().all(Value::is_int_or_none);
    let mut guards = builder.guards(&[if pinned {
        GuardKind::EqualsMatch
    } else {
        GuardKind::LengthMatch
    }]);
    let children = wrap_items(builder, &items, pinned, Source::item, &mut guards)?;

    let mutable = kind.is_mutable();
    let variable = Variable::new(
        VariableKind::Sequence {
            kind,
            items: children,
        },
        Some(Rc::clone(&builder.source)),
        guards,
    );
    let variable = match value.identity() {
        Some(id) if mutable => builder.ctx.side_effects.track(id, variable),
        _ => variable,
    };
    Ok(Wrapped::new(variable, WrapDecision::Container))
}

/// Snapshots whatever the iterator has left; the snapshot is tracked so a
/// second wrap of the same iterator sees the same elements.
fn wrap_tuple_iterator(
    builder: &mut VariableBuilder<'_>,
    value: &Value,
) -> Result<Wrapped, TraceError> {
    let Value::TupleIter(iter) = value else {
        return Err(wrong_shape("tuple_iterator", value));
    };
    let start = iter.position.get();
    let remaining = iter.items.get(start..).unwrap_or_default().to_vec();
    let mut guards = builder.guards(&[GuardKind::LengthMatch]);
    let children = wrap_items(
        builder,
        &remaining,
        false,
        |base, offset| Source::iterator_position(base, start + offset),
        &mut guards,
    )?;
    let variable = Variable::new(
        VariableKind::Sequence {
            kind: SequenceKind::ListIterator,
            items: children,
        },
        Some(Rc::clone(&builder.source)),
        guards,
    );
    let variable = builder.ctx.side_effects.track(iter.id, variable);
    Ok(Wrapped::new(variable, WrapDecision::Container))
}

const SLICE_FIELDS: [&str; 3] = ["start", "stop", "step"];

fn wrap_slice_range(
    builder: &mut VariableBuilder<'_>,
    value: &Value,
) -> Result<Wrapped, TraceError> {
    let (kind, parts, guard, pinned) = match value {
        Value::Slice(slice) => (
            SequenceKind::Slice,
            vec![slice.start.clone(), slice.stop.clone(), slice.step.clone()],
            GuardKind::TypeMatch,
            false,
        ),
        Value::Range(range) => (
            SequenceKind::Range,
            vec![
                Value::Int(range.start),
                Value::Int(range.stop),
                Value::Int(range.step),
            ],
            GuardKind::EqualsMatch,
            true,
        ),
        _ => return Err(wrong_shape("slice_range", value)),
    };
    let mut guards = builder.guards(&[guard]);
    let children = wrap_items(
        builder,
        &parts,
        pinned,
        |base, idx| Source::attr(base, SLICE_FIELDS[idx]),
        &mut guards,
    )?;
    let variable = Variable::new(
        VariableKind::Sequence {
            kind,
            items: children,
        },
        Some(Rc::clone(&builder.source)),
        guards,
    );
    Ok(Wrapped::new(variable, WrapDecision::Container))
}

fn is_wrappable_mapping(builder: &VariableBuilder<'_>, value: &Value) -> bool {
    let Value::Dict(dict) = value else {
        return false;
    };
    dict.entries
        .borrow()
        .iter()
        .all(|(key, _)| key.is_literal() || builder.tensor_can_be_dict_key(key))
}

fn wrap_mapping(builder: &mut VariableBuilder<'_>, value: &Value) -> Result<Wrapped, TraceError> {
    let Value::Dict(dict) = value else {
        return Err(wrong_shape("mapping", value));
    };
    let entries = dict.entries.borrow().clone();
    let mut guards = builder.guards(&[GuardKind::DictKeys]);
    let mut wrapped = Vec::with_capacity(entries.len());
    for (key, item) in &entries {
        let (index, key_source) = match IndexKey::from_literal(key) {
            Some(index) => (index, None),
            None => {
                let slot = global_key_name(key)?;
                let weak = builder.ctx.store_dict_key(&slot, key);
                (IndexKey::Source(Rc::clone(&weak)), Some(weak))
            }
        };
        let source = Source::index(&builder.source, index);
        let child = builder.child(source).wrap(item)?;
        guards.extend(child.guards().iter().cloned());
        wrapped.push((
            MapKey {
                value: key.clone(),
                source: key_source,
            },
            child,
        ));
    }
    let variable = Variable::new(
        VariableKind::Mapping {
            kind: dict.kind.clone(),
            entries: wrapped,
        },
        Some(Rc::clone(&builder.source)),
        guards,
    );
    let variable = builder.ctx.side_effects.track(dict.id, variable);
    Ok(Wrapped::new(variable, WrapDecision::Container))
}

fn wrap_module(builder: &mut VariableBuilder<'_>, value: &Value) -> Result<Wrapped, TraceError> {
    let Value::Module(module) = value else {
        return Err(wrong_shape("module", value));
    };
    let tracked = match module.origin {
        ModuleOrigin::Dynamic => !module.custom_setattr,
        ModuleOrigin::Distributed => false,
        ModuleOrigin::Static => {
            if builder.ctx.classifier.is_traceable_module_type(&module.type_name) {
                let name = builder.source.name();
                let variable = builder.ctx.register_attr_or_module(
                    value,
                    &name,
                    Some(Rc::clone(&builder.source)),
                )?;
                return Ok(Wrapped::new(variable, WrapDecision::SubComponent));
            }
            false
        }
    };
    let guards = builder.guards(&[GuardKind::TypeMatch]);
    let Wrapped { variable, decision } = builder.leaf(
        VariableKind::Module {
            value: value.clone(),
            kind: ModuleKind::Unspecialized,
        },
        guards,
        WrapDecision::Opaque,
    );
    let variable = if tracked {
        builder.ctx.side_effects.track(module.id, variable)
    } else {
        variable
    };
    Ok(Wrapped::new(variable, decision))
}

fn wrap_literal(builder: &mut VariableBuilder<'_>, value: &Value) -> Result<Wrapped, TraceError> {
    let source = builder.source.as_ref();
    let index_derived = matches!(
        source,
        Source::Index { .. } | Source::IteratorPosition { .. }
    );
    let specialize = !matches!(value, Value::Int(_) | Value::Float(_))
        || builder.ctx.config.specialize_numbers
        || is_common_constant(value)
        || source.is_global_or_attr_of_global()
        || index_derived
        || source.provenance().is_constant();
    if specialize {
        let guards = builder.guards(&[GuardKind::ConstantMatch]);
        return Ok(builder.leaf(
            VariableKind::Constant(value.clone()),
            guards,
            WrapDecision::Specialized,
        ));
    }
    let variable = builder.wrap_unspecialized_primitive(value)?;
    Ok(Wrapped::new(variable, WrapDecision::Unspecialized))
}

fn helper_kind(value: &Value) -> Option<HelperKind> {
    let Value::Function(function) = value else {
        return None;
    };
    match function.full_name().as_str() {
        "inspect.signature" => Some(HelperKind::InspectSignature),
        "dataclasses.fields" => Some(HelperKind::DataclassFields),
        _ => None,
    }
}

fn wrap_library_callable(
    builder: &mut VariableBuilder<'_>,
    value: &Value,
) -> Result<Wrapped, TraceError> {
    let kind = if let Some(helper) = helper_kind(value) {
        CallableKind::Helper(helper)
    } else if builder.ctx.classifier.is_builtin_callable(value) {
        CallableKind::Builtin(value.clone())
    } else {
        CallableKind::Allowed(value.clone())
    };
    let guards = builder.guards(&[GuardKind::FunctionMatch]);
    Ok(builder.leaf(VariableKind::Callable(kind), guards, WrapDecision::Opaque))
}

fn wrap_function_or_class(
    builder: &mut VariableBuilder<'_>,
    value: &Value,
) -> Result<Wrapped, TraceError> {
    let skipped = match value {
        Value::Function(function) => {
            !function.force_inline && builder.ctx.classifier.is_skipped_file(&function.file)
        }
        Value::Class(_) => true,
        _ => return Err(wrong_shape("function_or_class", value)),
    };
    let kind = if skipped {
        CallableKind::Skipped(value.clone())
    } else {
        CallableKind::UserFunction(value.clone())
    };
    let guards = builder.guards(&[GuardKind::FunctionMatch]);
    Ok(builder.leaf(VariableKind::Callable(kind), guards, WrapDecision::Opaque))
}

/// The guard sits on the method's own source; the class is reached
/// through it and needs no guard of its own.
fn wrap_autograd_apply(
    builder: &mut VariableBuilder<'_>,
    value: &Value,
) -> Result<Wrapped, TraceError> {
    let Value::Method(method) = value else {
        return Err(wrong_shape("autograd_apply", value));
    };
    let guards = builder.guards(&[GuardKind::FunctionMatch]);
    let kind = CallableKind::AutogradApply(method.receiver.clone());
    Ok(builder.leaf(VariableKind::Callable(kind), guards, WrapDecision::Opaque))
}

fn wrap_user_object(
    builder: &mut VariableBuilder<'_>,
    value: &Value,
) -> Result<Wrapped, TraceError> {
    let guards = builder.guards(&[GuardKind::TypeMatch]);
    let Wrapped { variable, decision } = builder.leaf(
        VariableKind::Opaque(OpaqueKind::UserObject(value.clone())),
        guards,
        WrapDecision::Opaque,
    );
    let untrackable = matches!(value, Value::Object(object) if object.custom_setattr);
    let variable = match value.identity() {
        Some(id) if !untrackable => builder.ctx.side_effects.track(id, variable),
        _ => variable,
    };
    Ok(Wrapped::new(variable, decision))
}

#[cfg(test)]
mod tests {
    use super::is_common_constant;
    use crate::context::TraceContext;
    use crate::variable::{CallableKind, HelperKind, ModuleKind, OpaqueKind, VariableKind};
    use std::cell::RefCell;
    use std::rc::Rc;
    use vt_core::{
        ClassObj, FrameBindings, FunctionKind, FunctionObj, GuardKind, MethodObj, ModuleObj,
        ModuleOrigin, ObjectId, RangeObj, Source, TraceConfig, TraceError, UserObject, Value,
    };
    use vt_ledger::WrapDecision;

    fn context() -> TraceContext {
        TraceContext::new(TraceConfig::default(), FrameBindings::new()).expect("ctx")
    }

    fn function(module: &str, qualname: &str, file: &str) -> Value {
        Value::Function(Rc::new(FunctionObj {
            id: ObjectId(40),
            module: module.to_owned(),
            qualname: qualname.to_owned(),
            file: file.to_owned(),
            kind: FunctionKind::Function,
            force_inline: false,
        }))
    }

    fn module(id: u64, origin: ModuleOrigin, custom_setattr: bool) -> Value {
        Value::Module(Rc::new(ModuleObj {
            id: ObjectId(id),
            type_name: "Block".to_owned(),
            origin,
            custom_setattr,
            attrs: RefCell::new(Vec::new()),
        }))
    }

    #[test]
    fn common_constants_cover_small_ints_and_listed_floats() {
        for value in [0, 7, 16, 32, 1024] {
            assert!(is_common_constant(&Value::Int(value)));
        }
        assert!(is_common_constant(&Value::Float(0.001)));
        assert!(!is_common_constant(&Value::Float(5.0)));
        assert!(!is_common_constant(&Value::Float(64.0)));
        assert!(!is_common_constant(&Value::Int(17)));
        assert!(!is_common_constant(&Value::Float(5.0 + 0.25)));
        assert!(!is_common_constant(&Value::str("8")));
    }

    #[test]
    fn non_pinned_sequences_guard_length_and_children() {
        let mut ctx = context();
        let value = Value::tuple(vec![Value::str("a"), Value::Float(0.5)]);
        let var = ctx.wrap(&value, Source::local("t")).expect("tuple");
        assert_eq!(var.guard_kinds_on("L['t']"), vec![GuardKind::LengthMatch]);
        assert_eq!(var.guard_kinds_on("L['t'][0]"), vec![GuardKind::ConstantMatch]);
        assert_eq!(ctx.guards().len(), 3);
    }

    #[test]
    fn lists_are_tracked_and_aliased() {
        let mut ctx = context();
        let list = Value::list(ObjectId(11), vec![Value::str("a")]);
        let first = ctx.wrap(&list, Source::local("xs")).expect("list");
        let second = ctx.wrap(&list, Source::global("alias")).expect("alias");
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(ctx.ledger().count(WrapDecision::Aliased), 1);
    }

    #[test]
    fn tuple_keyed_mappings_guard_their_keys() {
        let mut ctx = context();
        let key = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let mapping = Value::dict(ObjectId(14), vec![(key.clone(), Value::str("v"))]);
        let var = ctx.wrap(&mapping, Source::local("d")).expect("mapping");
        let VariableKind::Mapping { entries, .. } = var.kind() else {
            panic!("expected a mapping, got {}", var.category());
        };
        assert_eq!(entries[0].0.value, key);
        assert!(entries[0].0.source.is_none());
        assert_eq!(
            entries[0].1.source().map(|s| s.name()),
            Some("L['d'][(1, 2)]".to_owned())
        );
        assert_eq!(var.guard_kinds_on("L['d']"), vec![GuardKind::DictKeys]);
    }

    #[test]
    fn self_referencing_list_is_unrepresentable() {
        let mut ctx = context();
        let list = Value::list(ObjectId(12), vec![]);
        if let Value::List(inner) = &list {
            inner.items.borrow_mut().push(list.clone());
        }
        let err = ctx.wrap(&list, Source::local("xs")).expect_err("cycle");
        assert!(matches!(err, TraceError::Unrepresentable { .. }));
        if let Value::List(inner) = &list {
            inner.items.borrow_mut().clear();
        }
    }

    #[test]
    fn ranges_pin_their_bounds() {
        let mut ctx = context();
        let range = Value::Range(RangeObj {
            start: 0,
            stop: 37,
            step: 3,
        });
        let var = ctx.wrap(&range, Source::local("r")).expect("range");
        assert_eq!(var.guard_kinds_on("L['r']"), vec![GuardKind::EqualsMatch]);
        assert_eq!(ctx.guards().len(), 1);
        assert_eq!(var.items().map(<[_]>::len), Some(3));
        assert!(ctx.graph_args().is_empty());
    }

    #[test]
    fn modules_follow_origin() {
        let mut ctx = context();
        let dynamic = ctx
            .wrap(&module(1, ModuleOrigin::Dynamic, false), Source::local("m"))
            .expect("dynamic");
        assert!(matches!(
            dynamic.kind(),
            VariableKind::Module { kind: ModuleKind::Unspecialized, .. }
        ));
        assert!(ctx.side_effects().contains(ObjectId(1)));

        ctx.wrap(&module(2, ModuleOrigin::Distributed, false), Source::local("d"))
            .expect("distributed");
        assert!(!ctx.side_effects().contains(ObjectId(2)));

        let block = Source::attr(&Source::local("self"), "block");
        let static_module = ctx
            .wrap(&module(3, ModuleOrigin::Static, false), block)
            .expect("static");
        assert!(matches!(
            static_module.kind(),
            VariableKind::Module { kind: ModuleKind::Registered { .. }, .. }
        ));
        assert!(ctx.sub_components().contains_key("L_self_block"));
    }

    #[test]
    fn helpers_win_over_skip_classification() {
        let mut ctx = context();
        let signature = function("inspect", "signature", "/usr/lib/python3.11/inspect.py");
        let var = ctx.wrap(&signature, Source::global("sig")).expect("helper");
        assert!(matches!(
            var.kind(),
            VariableKind::Callable(CallableKind::Helper(HelperKind::InspectSignature))
        ));

        let skipped = function("json", "dumps", "/usr/lib/python3.11/json/__init__.py");
        let var = ctx.wrap(&skipped, Source::global("dumps")).expect("skipped");
        assert!(matches!(var.kind(), VariableKind::Callable(CallableKind::Skipped(_))));

        let user = function("app", "step", "/app/train.py");
        let var = ctx.wrap(&user, Source::global("step")).expect("user");
        assert!(matches!(var.kind(), VariableKind::Callable(CallableKind::UserFunction(_))));
        assert_eq!(var.guard_kinds_on("G['step']"), vec![GuardKind::FunctionMatch]);
    }

    #[test]
    fn operators_and_autograd_functions_get_dedicated_rules() {
        let mut ctx = context();
        let cond = Value::Function(Rc::new(FunctionObj {
            id: ObjectId(50),
            module: "torch.ops.higher_order".to_owned(),
            qualname: "cond".to_owned(),
            file: "/usr/lib/python3.11/site-packages/torch/_ops.py".to_owned(),
            kind: FunctionKind::Operator,
            force_inline: false,
        }));
        let var = ctx.wrap(&cond, Source::global("cond")).expect("operator");
        assert!(matches!(var.kind(), VariableKind::Callable(CallableKind::Operator(_))));
        assert_eq!(
            var.guard_kinds_on("G['cond']"),
            vec![GuardKind::TypeMatch, GuardKind::NameMatch]
        );

        let scale = Value::Class(Rc::new(ClassObj {
            id: ObjectId(51),
            module: "app.autograd".to_owned(),
            qualname: "ScaleGrad".to_owned(),
            file: "/app/autograd.py".to_owned(),
            force_inline: false,
            autograd_function: true,
        }));
        let var = ctx.wrap(&scale, Source::global("ScaleGrad")).expect("autograd class");
        assert!(matches!(
            var.kind(),
            VariableKind::Callable(CallableKind::AutogradFunction(_))
        ));
        assert_eq!(var.guard_kinds_on("G['ScaleGrad']"), vec![GuardKind::FunctionMatch]);

        let apply = Value::Method(Rc::new(MethodObj {
            id: ObjectId(52),
            name: "apply".to_owned(),
            receiver: scale.clone(),
        }));
        let var = ctx.wrap(&apply, Source::global("scale_grad")).expect("aliased apply");
        let VariableKind::Callable(CallableKind::AutogradApply(class)) = var.kind() else {
            panic!("expected aliased apply, got {}", var.category());
        };
        assert_eq!(class, &scale);
        assert_eq!(var.guard_kinds_on("G['scale_grad']"), vec![GuardKind::FunctionMatch]);

        let forward = Value::Method(Rc::new(MethodObj {
            id: ObjectId(53),
            name: "forward".to_owned(),
            receiver: scale,
        }));
        let var = ctx.wrap(&forward, Source::global("fwd")).expect("other method");
        assert!(matches!(var.kind(), VariableKind::Opaque(OpaqueKind::UserObject(_))));
        assert_eq!(var.guard_kinds_on("G['fwd']"), vec![GuardKind::TypeMatch]);
    }

    #[test]
    fn objects_with_custom_setattr_are_not_tracked() {
        let mut ctx = context();
        let object = |id, custom_setattr| {
            Value::Object(Rc::new(UserObject {
                id: ObjectId(id),
                type_name: "Config".to_owned(),
                bases: Vec::new(),
                custom_setattr,
                attrs: RefCell::new(Vec::new()),
            }))
        };
        ctx.wrap(&object(20, false), Source::local("a")).expect("plain");
        ctx.wrap(&object(21, true), Source::local("b")).expect("custom");
        assert!(ctx.side_effects().contains(ObjectId(20)));
        assert!(!ctx.side_effects().contains(ObjectId(21)));
    }

    #[test]
    fn random_sources_get_no_type_guard() {
        let mut ctx = context();
        let var = ctx.wrap(&Value::Float(0.731), Source::random(0)).expect("random");
        assert!(matches!(var.kind(), VariableKind::Unspecialized { .. }));
        assert!(ctx.guards().is_empty());
        assert_eq!(ctx.graph_args().len(), 1);
    }
}
