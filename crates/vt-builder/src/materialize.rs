//! Turns the example result attached to a graph node back into a variable.
//!
//! When no example is supplied the node is executed abstractly with the
//! random state saved and restored around the call.

use crate::context::TraceContext;
use crate::graph_args::TrackedFake;
use crate::variable::{
    CallableKind, OpaqueKind, SequenceKind, TensorVar, VarRef, Variable, VariableKind,
};
use std::collections::BTreeMap;
use std::rc::Rc;
use vt_core::{DType, GuardSet, OpTarget, Source, TensorClass, TensorObj, TraceError, Value};
use vt_fake::{AbstractTensorFactory, Dim, FakeTensor, FakeValue};
use vt_graph::{Atom, GraphError, NodeId, NodeOp};

const MATERIALIZE_LOG_TARGET: &str = "vt_builder::materialize";

#[derive(Debug, Clone)]
pub enum Example {
    /// Value observed at runtime.
    Real(Value),
    /// Result of an earlier abstract execution.
    Abstract(FakeValue),
}

/// Variable family a tensor-shaped example is wrapped into.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyTarget {
    Tensor,
    Unspecialized { raw: Value },
    FakeItem,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub source: Option<Rc<Source>>,
    pub guards: GuardSet,
    pub should_specialize: bool,
    pub ignore_subclass: bool,
}

pub fn wrap_fx_proxy(
    ctx: &mut TraceContext,
    node: NodeId,
    example: Option<Example>,
    options: ProxyOptions,
) -> Result<VarRef, TraceError> {
    wrap_fx_proxy_cls(ctx, ProxyTarget::Tensor, node, example, options)
}

pub fn wrap_fx_proxy_cls(
    ctx: &mut TraceContext,
    target: ProxyTarget,
    node: NodeId,
    example: Option<Example>,
    options: ProxyOptions,
) -> Result<VarRef, TraceError> {
    ctx.add_guards(&options.guards);

    let graph_node = ctx.graph.node(node)?;
    if graph_node.example().is_some() {
        return Err(GraphError::DuplicateExampleValue {
            node: graph_node.name().to_owned(),
        }
        .into());
    }
    let op_target = graph_node.target().cloned();
    let operation = graph_node.op().describe();
    let node_name = graph_node.name().to_owned();

    let initial = match &example {
        Some(Example::Real(Value::Tensor(tensor))) => Some(Rc::clone(tensor)),
        _ => None,
    };
    let example = match example {
        None => fake_value_of(ctx, node)?,
        Some(Example::Abstract(value)) => value,
        Some(Example::Real(Value::Tensor(tensor))) => {
            fakeify_tensor(ctx, &target, node, &tensor, &options)?
        }
        Some(Example::Real(other)) => {
            FakeValue::from_value(&other).unwrap_or_else(|| FakeValue::Opaque {
                type_name: other.type_name(),
            })
        }
    };

    let variable = classify(
        ctx,
        Classify {
            target,
            node,
            op_target: op_target.as_ref(),
            operation: &operation,
            initial,
            options,
        },
        example,
    )?;
    tracing::debug!(
        target: MATERIALIZE_LOG_TARGET,
        "{node_name}: {} -> {}",
        operation,
        variable.category()
    );
    Ok(variable)
}

fn missing_example(id: NodeId, operation: &str) -> TraceError {
    TraceError::invariant(format!(
        "argument n{} of {operation} has no example value",
        id.0
    ))
}

/// Runs the node's operation on the abstract examples of its inputs.
fn fake_value_of(ctx: &mut TraceContext, node: NodeId) -> Result<FakeValue, TraceError> {
    let graph_node = ctx.graph.node(node)?;
    let operation = graph_node.op().describe();
    match graph_node.op().clone() {
        NodeOp::Call {
            target,
            args,
            params,
        } => {
            let inputs = args
                .iter()
                .map(|atom| match atom {
                    Atom::Node(id) => ctx
                        .graph
                        .example(*id)
                        .cloned()
                        .ok_or_else(|| missing_example(*id, &operation)),
                    Atom::Lit(literal) => Ok(FakeValue::from_literal(*literal)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ctx.fake.run_preserving_rng(&target, &inputs, &params)?)
        }
        NodeOp::GetItem { base, index } => {
            let container = ctx
                .graph
                .example(base)
                .cloned()
                .ok_or_else(|| missing_example(base, &operation))?;
            let index = i64::try_from(index)
                .map_err(|_| TraceError::invariant(format!("index {index} out of range")))?;
            Ok(ctx.fake.run_preserving_rng(
                &OpTarget::GetItem,
                &[container, FakeValue::Int(index)],
                &BTreeMap::new(),
            )?)
        }
        NodeOp::Placeholder { .. } | NodeOp::GetAttr { .. } => Err(TraceError::invariant(
            format!("{operation} needs a concrete example value"),
        )),
    }
}

fn fakeify_tensor(
    ctx: &mut TraceContext,
    target: &ProxyTarget,
    node: NodeId,
    tensor: &Rc<TensorObj>,
    options: &ProxyOptions,
) -> Result<FakeValue, TraceError> {
    if tensor.is_fake {
        return Err(TraceError::invariant(format!(
            "abstract tensor {} supplied as a concrete example",
            tensor.id
        )));
    }
    if ctx.config.export_mode {
        ctx.graph.cache_real_value(node, TensorObj::clone(tensor))?;
    }
    if let TensorClass::Subclass(name) = &tensor.class
        && !options.ignore_subclass
    {
        return Err(TraceError::unrepresentable(
            "wrap_to_fake",
            name.clone(),
            "tensor subtype is not registered as traceable",
        ));
    }

    let is_tensor = *target == ProxyTarget::Tensor;
    let source = options
        .source
        .as_ref()
        .filter(|source| !source.provenance().is_constant());
    let static_shapes =
        source.is_none() || tensor.is_parameter() || !ctx.config.symbolic_shapes || !is_tensor;
    let fake = ctx.fake.from_real(tensor, static_shapes, source.map(Rc::as_ref))?;
    if is_tensor && let Some(source) = source {
        ctx.tracked_fakes.push(TrackedFake {
            fake: FakeValue::Tensor(fake.clone()),
            source: Rc::clone(source),
        });
    }
    Ok(FakeValue::Tensor(fake))
}

struct Classify<'a> {
    target: ProxyTarget,
    node: NodeId,
    op_target: Option<&'a OpTarget>,
    operation: &'a str,
    initial: Option<Rc<TensorObj>>,
    options: ProxyOptions,
}

fn classify(
    ctx: &mut TraceContext,
    call: Classify<'_>,
    example: FakeValue,
) -> Result<VarRef, TraceError> {
    let Classify {
        target,
        node,
        op_target,
        operation,
        initial,
        options,
    } = call;
    let symbolic = ctx.config.symbolic_shapes;
    let is_op = |predicate: fn(&OpTarget) -> bool| op_target.is_some_and(predicate);

    match example {
        FakeValue::Tensor(fake) => {
            let specialized_value = if fake.is_parameter || options.should_specialize {
                initial
            } else {
                None
            };
            let class_type = if fake.is_parameter { "Parameter" } else { "Tensor" };
            ctx.graph.set_example(node, FakeValue::Tensor(fake.clone()))?;

            let mut payload = fake;
            let subclass = payload.subclass.take();
            let kind = match target {
                ProxyTarget::Tensor => {
                    let tensor = TensorVar {
                        node,
                        example: payload,
                        class_type: class_type.to_owned(),
                        specialized_value,
                    };
                    match subclass {
                        None => VariableKind::Tensor(tensor),
                        Some(subclass) if ctx.config.is_traceable_subclass(&subclass) => {
                            VariableKind::TensorOverride {
                                hook: format!("{subclass}.__torch_function__"),
                                tensor,
                                subclass,
                            }
                        }
                        Some(subclass) => {
                            return Err(TraceError::unrepresentable(
                                operation,
                                subclass,
                                "result is a tensor subtype that is not traceable",
                            ));
                        }
                    }
                }
                ProxyTarget::Unspecialized { raw } => VariableKind::Unspecialized {
                    node,
                    raw,
                    example: payload,
                },
                ProxyTarget::FakeItem => VariableKind::FakeItem {
                    node,
                    example: payload,
                },
            };
            Ok(Variable::new(kind, options.source, options.guards))
        }
        _ if is_op(OpTarget::returns_rng_handle) => {
            let handle = op_target.cloned().unwrap_or(OpTarget::SetRngState);
            Ok(Variable::new(
                VariableKind::Callable(CallableKind::Torch(handle)),
                options.source,
                options.guards,
            ))
        }
        _ if is_op(OpTarget::returns_opaque_object) => Ok(Variable::new(
            VariableKind::Opaque(OpaqueKind::Result {
                type_name: example.type_name(),
            }),
            options.source,
            options.guards,
        )),
        FakeValue::Int(_) | FakeValue::Bool(_) | FakeValue::Float(_) if symbolic => {
            sym_number(ctx, node, example, options)
        }
        FakeValue::Size(dims) if symbolic => {
            ctx.graph.set_example(node, FakeValue::Size(dims.clone()))?;
            let mut items = Vec::with_capacity(dims.len());
            for (idx, dim) in dims.iter().enumerate() {
                let item_node = ctx.graph.create_getitem(node, idx)?;
                let value = match dim {
                    Dim::Static(size) => FakeValue::Int(*size),
                    Dim::Symbolic(sym) => FakeValue::SymInt(*sym),
                };
                ctx.graph.set_example(item_node, value.clone())?;
                items.push(Variable::new(
                    VariableKind::SymNumber {
                        node: item_node,
                        example: value,
                    },
                    None,
                    options.guards.clone(),
                ));
            }
            Ok(Variable::new(
                VariableKind::Sequence {
                    kind: SequenceKind::Size,
                    items,
                },
                options.source,
                options.guards,
            ))
        }
        FakeValue::Int(value) if is_op(OpTarget::is_int_query) => Ok(Variable::new(
            VariableKind::Constant(Value::Int(value)),
            options.source,
            options.guards,
        )),
        FakeValue::Size(dims) if dims.iter().all(|dim| dim.as_static().is_some()) => {
            let items = dims
                .iter()
                .filter_map(|dim| dim.as_static())
                .map(|size| Variable::constant(Value::Int(size)))
                .collect();
            Ok(Variable::new(
                VariableKind::Sequence {
                    kind: SequenceKind::Size,
                    items,
                },
                options.source,
                options.guards,
            ))
        }
        FakeValue::Tuple(_) | FakeValue::List(_) | FakeValue::NamedTuple { .. } => {
            unpack_sequence(ctx, node, operation, example, options)
        }
        FakeValue::None => Ok(Variable::new(
            VariableKind::Constant(Value::None),
            options.source,
            options.guards,
        )),
        _ if op_target == Some(&OpTarget::ManualSeed) => Ok(Variable::new(
            VariableKind::Constant(Value::None),
            options.source,
            options.guards,
        )),
        FakeValue::Int(value) if op_target == Some(&OpTarget::ElementSize) => {
            ctx.graph.set_example(node, FakeValue::Int(value))?;
            Ok(Variable::new(
                VariableKind::Constant(Value::Int(value)),
                options.source,
                options.guards,
            ))
        }
        FakeValue::Int(_) | FakeValue::Bool(_) | FakeValue::Float(_)
            if is_op(OpTarget::is_scalar_capture) && ctx.config.capture_scalar_outputs =>
        {
            let dtype = match example {
                FakeValue::Float(_) => DType::F32,
                FakeValue::Bool(_) => DType::Bool,
                _ => DType::I64,
            };
            wrap_fx_proxy_cls(
                ctx,
                ProxyTarget::FakeItem,
                node,
                Some(Example::Abstract(FakeValue::Tensor(FakeTensor::scalar(dtype)))),
                ProxyOptions {
                    source: options.source,
                    guards: options.guards,
                    ..ProxyOptions::default()
                },
            )
        }
        FakeValue::SymInt(_) | FakeValue::SymFloat(_) => sym_number(ctx, node, example, options),
        other => Err(TraceError::unrepresentable(
            operation,
            other.type_name(),
            "operation result has no symbolic representation",
        )),
    }
}

fn sym_number(
    ctx: &mut TraceContext,
    node: NodeId,
    example: FakeValue,
    options: ProxyOptions,
) -> Result<VarRef, TraceError> {
    ctx.graph.set_example(node, example.clone())?;
    Ok(Variable::new(
        VariableKind::SymNumber { node, example },
        options.source,
        options.guards,
    ))
}

fn unpack_sequence(
    ctx: &mut TraceContext,
    node: NodeId,
    operation: &str,
    example: FakeValue,
    options: ProxyOptions,
) -> Result<VarRef, TraceError> {
    ctx.graph.set_example(node, example.clone())?;
    let (kind, values) = match example {
        FakeValue::Tuple(values) => (SequenceKind::Tuple, values),
        FakeValue::List(values) => (SequenceKind::List, values),
        FakeValue::NamedTuple {
            type_name,
            fields,
            values,
        } => {
            if fields.len() != values.len() {
                return Err(TraceError::invariant(format!(
                    "{operation} returned record {type_name} with {} fields and {} values",
                    fields.len(),
                    values.len()
                )));
            }
            (SequenceKind::NamedTuple { type_name, fields }, values)
        }
        other => {
            return Err(TraceError::invariant(format!(
                "{operation} result {} is not a sequence",
                other.type_name()
            )));
        }
    };

    let mut items = Vec::with_capacity(values.len());
    for (idx, value) in values.into_iter().enumerate() {
        if value == FakeValue::None {
            items.push(Variable::new(
                VariableKind::Constant(Value::None),
                None,
                options.guards.clone(),
            ));
            continue;
        }
        let item_node = ctx.graph.create_getitem(node, idx)?;
        items.push(wrap_fx_proxy(
            ctx,
            item_node,
            Some(Example::Abstract(value)),
            ProxyOptions {
                guards: options.guards.clone(),
                ..ProxyOptions::default()
            },
        )?);
    }
    Ok(Variable::new(
        VariableKind::Sequence { kind, items },
        options.source,
        options.guards,
    ))
}
