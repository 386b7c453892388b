//! Symbolic variables handed back to the interpreter.

use std::rc::Rc;
use vt_core::{DictKind, GuardKind, GuardSet, ObjectId, OpTarget, Source, TensorObj, Value};
use vt_fake::{FakeTensor, FakeValue};
use vt_graph::NodeId;

pub type VarRef = Rc<Variable>;

#[derive(Debug, Clone)]
pub struct TensorVar {
    pub node: NodeId,
    /// Abstract payload; any subtype tag is stripped.
    pub example: FakeTensor,
    pub class_type: String,
    /// Concrete value kept available for dimension binding.
    pub specialized_value: Option<Rc<TensorObj>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceKind {
    Tuple,
    List,
    NamedTuple {
        type_name: String,
        fields: Vec<String>,
    },
    ListIterator,
    Slice,
    Range,
    Size,
}

impl SequenceKind {
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::List | Self::ListIterator)
    }
}

#[derive(Debug, Clone)]
pub struct MapKey {
    pub value: Value,
    /// Set when the key lives in an auxiliary global slot.
    pub source: Option<Rc<Source>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    InspectSignature,
    DataclassFields,
}

#[derive(Debug, Clone)]
pub enum CallableKind {
    Builtin(Value),
    Allowed(Value),
    Helper(HelperKind),
    Skipped(Value),
    UserFunction(Value),
    UserClass(Value),
    AutogradFunction(Value),
    /// `apply` looked up on an autograd function class; holds the class.
    AutogradApply(Value),
    /// Operator object dispatched by name.
    Operator(Value),
    /// Runtime entry point returned by a state-setting operation.
    Torch(OpTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleKind {
    /// Named sub-component of the compiled artifact.
    Registered { name: String },
    Unspecialized,
}

#[derive(Debug, Clone)]
pub enum OpaqueKind {
    Typing(Value),
    PyModule(Value),
    UserObject(Value),
    /// Operation result kept as an opaque handle.
    Result { type_name: String },
}

#[derive(Debug, Clone)]
pub enum VariableKind {
    Constant(Value),
    SymNumber {
        node: NodeId,
        example: FakeValue,
    },
    Tensor(TensorVar),
    /// Tensor-like subtype simulated by composition.
    TensorOverride {
        tensor: TensorVar,
        subclass: String,
        hook: String,
    },
    /// Number passed as a runtime input instead of being baked in.
    Unspecialized {
        node: NodeId,
        raw: Value,
        example: FakeTensor,
    },
    /// Scalar pulled out of a tensor.
    FakeItem {
        node: NodeId,
        example: FakeTensor,
    },
    Sequence {
        kind: SequenceKind,
        items: Vec<VarRef>,
    },
    Mapping {
        kind: DictKind,
        entries: Vec<(MapKey, VarRef)>,
    },
    Enum(Value),
    Module {
        value: Value,
        kind: ModuleKind,
    },
    Callable(CallableKind),
    Opaque(OpaqueKind),
}

#[derive(Debug)]
pub struct Variable {
    kind: VariableKind,
    source: Option<Rc<Source>>,
    guards: GuardSet,
}

impl Variable {
    #[must_use]
    pub fn new(kind: VariableKind, source: Option<Rc<Source>>, guards: GuardSet) -> VarRef {
        Rc::new(Self {
            kind,
            source,
            guards,
        })
    }

    #[must_use]
    pub fn constant(value: Value) -> VarRef {
        Self::new(VariableKind::Constant(value), None, GuardSet::new())
    }

    #[must_use]
    pub fn kind(&self) -> &VariableKind {
        &self.kind
    }

    #[must_use]
    pub fn source(&self) -> Option<&Rc<Source>> {
        self.source.as_ref()
    }

    /// Guards of this variable and of everything it contains.
    #[must_use]
    pub fn guards(&self) -> &GuardSet {
        &self.guards
    }

    /// Guard kinds attached directly to `source_name`.
    #[must_use]
    pub fn guard_kinds_on(&self, source_name: &str) -> Vec<GuardKind> {
        self.guards
            .iter()
            .filter(|guard| guard.source().name() == source_name)
            .map(|guard| guard.kind())
            .collect()
    }

    /// Graph node backing this variable, if any.
    #[must_use]
    pub fn node(&self) -> Option<NodeId> {
        match &self.kind {
            VariableKind::SymNumber { node, .. }
            | VariableKind::Unspecialized { node, .. }
            | VariableKind::FakeItem { node, .. } => Some(*node),
            VariableKind::Tensor(tensor) | VariableKind::TensorOverride { tensor, .. } => {
                Some(tensor.node)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_constant(&self) -> Option<&Value> {
        match &self.kind {
            VariableKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn items(&self) -> Option<&[VarRef]> {
        match &self.kind {
            VariableKind::Sequence { items, .. } => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorVar> {
        match &self.kind {
            VariableKind::Tensor(tensor) | VariableKind::TensorOverride { tensor, .. } => {
                Some(tensor)
            }
            _ => None,
        }
    }

    /// Short category name used in logs and ledger records.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match &self.kind {
            VariableKind::Constant(_) => "constant",
            VariableKind::SymNumber { .. } => "sym_number",
            VariableKind::Tensor(_) => "tensor",
            VariableKind::TensorOverride { .. } => "tensor_override",
            VariableKind::Unspecialized { .. } => "unspecialized",
            VariableKind::FakeItem { .. } => "fake_item",
            VariableKind::Sequence { .. } => "sequence",
            VariableKind::Mapping { .. } => "mapping",
            VariableKind::Enum(_) => "enum",
            VariableKind::Module { .. } => "module",
            VariableKind::Callable(_) => "callable",
            VariableKind::Opaque(_) => "opaque",
        }
    }

    /// Rebuilds a runtime value from constants, sequences and mappings.
    /// Containers get `fresh_id` identities since lists and dicts compare
    /// by contents.
    #[must_use]
    pub fn as_value(&self) -> Option<Value> {
        match &self.kind {
            VariableKind::Constant(value) | VariableKind::Enum(value) => Some(value.clone()),
            VariableKind::Sequence { kind, items } => {
                let values = items
                    .iter()
                    .map(|item| item.as_value())
                    .collect::<Option<Vec<_>>>()?;
                match kind {
                    SequenceKind::Tuple => Some(Value::tuple(values)),
                    SequenceKind::List => Some(Value::list(fresh_id(), values)),
                    SequenceKind::NamedTuple { type_name, fields } => {
                        Some(Value::NamedTuple(Rc::new(vt_core::NamedTupleObj {
                            type_name: type_name.clone(),
                            fields: fields.clone(),
                            values,
                        })))
                    }
                    SequenceKind::Size => values
                        .iter()
                        .map(|value| match value {
                            Value::Int(dim) => Some(*dim),
                            _ => None,
                        })
                        .collect::<Option<Vec<_>>>()
                        .map(|dims| Value::Size(Rc::from(dims))),
                    SequenceKind::ListIterator | SequenceKind::Slice | SequenceKind::Range => {
                        None
                    }
                }
            }
            VariableKind::Mapping { kind, entries } => {
                let rebuilt = entries
                    .iter()
                    .map(|(key, value)| Some((key.value.clone(), value.as_value()?)))
                    .collect::<Option<Vec<_>>>()?;
                Some(Value::Dict(Rc::new(vt_core::DictObj {
                    id: fresh_id(),
                    kind: kind.clone(),
                    entries: std::cell::RefCell::new(rebuilt),
                })))
            }
            _ => None,
        }
    }
}

fn fresh_id() -> ObjectId {
    ObjectId(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{SequenceKind, Variable, VariableKind};
    use vt_core::{GuardKind, GuardSet, ObjectId, Source, Value, make_guards};

    #[test]
    fn sequence_rebuilds_nested_constants() {
        let inner = Variable::new(
            VariableKind::Sequence {
                kind: SequenceKind::List,
                items: vec![Variable::constant(Value::Int(2)), Variable::constant(Value::None)],
            },
            None,
            GuardSet::new(),
        );
        let outer = Variable::new(
            VariableKind::Sequence {
                kind: SequenceKind::Tuple,
                items: vec![Variable::constant(Value::str("a")), inner],
            },
            None,
            GuardSet::new(),
        );
        let expected = Value::tuple(vec![
            Value::str("a"),
            Value::list(ObjectId(9), vec![Value::Int(2), Value::None]),
        ]);
        assert_eq!(outer.as_value(), Some(expected));
        assert_eq!(outer.category(), "sequence");
        assert!(outer.node().is_none());
    }

    #[test]
    fn guard_kinds_filter_by_source_name() {
        let x = Source::local("x");
        let guards = make_guards(&x, &[GuardKind::EqualsMatch]).expect("guardable");
        let var = Variable::new(VariableKind::Constant(Value::Int(1)), Some(x), guards);
        assert_eq!(var.guard_kinds_on("L['x']"), vec![GuardKind::EqualsMatch]);
        assert!(var.guard_kinds_on("L['y']").is_empty());
    }

    #[test]
    fn opaque_variables_do_not_rebuild() {
        let var = Variable::new(
            VariableKind::Sequence {
                kind: SequenceKind::Slice,
                items: vec![Variable::constant(Value::None)],
            },
            None,
            GuardSet::new(),
        );
        assert!(var.as_value().is_none());
        assert!(!SequenceKind::Tuple.is_mutable());
        assert!(SequenceKind::List.is_mutable());
    }
}
