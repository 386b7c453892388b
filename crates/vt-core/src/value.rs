//! Runtime values as the interpreter hands them to the tracer.
//!
//! Tensors carry metadata only; the tracer never reads element data.
//! Objects with identity carry an interpreter-allocated [`ObjectId`].

use crate::{DType, SymFloat, SymInt};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorClass {
    Base,
    Parameter,
    /// A tensor-like subtype, named by its type.
    Subclass(String),
}

#[derive(Debug, Clone)]
pub struct TensorObj {
    pub id: ObjectId,
    pub shape: Vec<i64>,
    pub strides: Vec<i64>,
    pub storage_offset: i64,
    pub dtype: DType,
    pub device: String,
    pub requires_grad: bool,
    pub class: TensorClass,
    /// Set on abstract placeholders; such values must never reach an
    /// example-value slot.
    pub is_fake: bool,
}

impl TensorObj {
    #[must_use]
    pub fn new(id: ObjectId, shape: Vec<i64>, dtype: DType) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            id,
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device: "cpu".to_owned(),
            requires_grad: false,
            class: TensorClass::Base,
            is_fake: false,
        }
    }

    #[must_use]
    pub fn parameter(id: ObjectId, shape: Vec<i64>, dtype: DType) -> Self {
        Self {
            requires_grad: true,
            class: TensorClass::Parameter,
            ..Self::new(id, shape, dtype)
        }
    }

    #[must_use]
    pub fn with_class(mut self, class: TensorClass) -> Self {
        self.class = class;
        self
    }

    #[must_use]
    pub fn with_strides(mut self, strides: Vec<i64>) -> Self {
        self.strides = strides;
        self
    }

    #[must_use]
    pub fn is_parameter(&self) -> bool {
        self.class == TensorClass::Parameter
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.shape)
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        match &self.class {
            TensorClass::Base => "Tensor",
            TensorClass::Parameter => "Parameter",
            TensorClass::Subclass(name) => name,
        }
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1_i64; shape.len()];
    let mut running = 1_i64;
    for (idx, dim) in shape.iter().enumerate().rev() {
        strides[idx] = running;
        running = running.saturating_mul((*dim).max(1));
    }
    strides
}

#[derive(Debug)]
pub struct ListObj {
    pub id: ObjectId,
    pub items: RefCell<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictKind {
    Plain,
    Ordered,
    Default { factory: String },
}

#[derive(Debug)]
pub struct DictObj {
    pub id: ObjectId,
    pub kind: DictKind,
    pub entries: RefCell<Vec<(Value, Value)>>,
}

impl DictObj {
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

/// Iterator over a fixed tuple; `position` is the next index to yield.
#[derive(Debug)]
pub struct TupleIterObj {
    pub id: ObjectId,
    pub items: Rc<[Value]>,
    pub position: Cell<usize>,
}

impl TupleIterObj {
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.position.get())
    }
}

#[derive(Debug)]
pub struct NamedTupleObj {
    pub type_name: String,
    pub fields: Vec<String>,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub struct SliceObj {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeObj {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// Part of the program's static structure.
    Static,
    /// Constructed while the traced function runs.
    Dynamic,
    /// Wrapped by a distributed/sharded container.
    Distributed,
}

#[derive(Debug)]
pub struct ModuleObj {
    pub id: ObjectId,
    pub type_name: String,
    pub origin: ModuleOrigin,
    pub custom_setattr: bool,
    pub attrs: RefCell<Vec<(String, Value)>>,
}

#[derive(Debug)]
pub struct FrozenSetObj {
    pub id: ObjectId,
    pub members: Vec<Value>,
}

#[derive(Debug)]
pub struct EnumMember {
    pub id: ObjectId,
    pub enum_type: String,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Function,
    /// Operator object dispatched by name rather than by identity.
    Operator,
}

#[derive(Debug)]
pub struct FunctionObj {
    pub id: ObjectId,
    pub module: String,
    pub qualname: String,
    pub file: String,
    pub kind: FunctionKind,
    /// Marked for inlining even when its file is skipped.
    pub force_inline: bool,
}

impl FunctionObj {
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.module.is_empty() {
            self.qualname.clone()
        } else {
            format!("{}.{}", self.module, self.qualname)
        }
    }
}

#[derive(Debug)]
pub struct ClassObj {
    pub id: ObjectId,
    pub module: String,
    pub qualname: String,
    pub file: String,
    pub force_inline: bool,
    /// Subclass of `torch.autograd.Function`.
    pub autograd_function: bool,
}

/// Function bound to a receiver, e.g. `MyFn.apply`.
#[derive(Debug)]
pub struct MethodObj {
    pub id: ObjectId,
    pub name: String,
    pub receiver: Value,
}

impl MethodObj {
    /// The `apply` entry point of an autograd function class.
    #[must_use]
    pub fn is_autograd_apply(&self) -> bool {
        self.name == "apply"
            && matches!(&self.receiver, Value::Class(class) if class.autograd_function)
    }
}

#[derive(Debug)]
pub struct TypingObj {
    pub id: ObjectId,
    pub name: String,
}

#[derive(Debug)]
pub struct PyModuleObj {
    pub id: ObjectId,
    pub name: String,
}

#[derive(Debug)]
pub struct UserObject {
    pub id: ObjectId,
    pub type_name: String,
    /// Type lineage, nearest base first.
    pub bases: Vec<String>,
    pub custom_setattr: bool,
    pub attrs: RefCell<Vec<(String, Value)>>,
}

impl UserObject {
    #[must_use]
    pub fn is_instance_of(&self, type_name: &str) -> bool {
        self.type_name == type_name || self.bases.iter().any(|base| base == type_name)
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    SymInt(SymInt),
    SymFloat(SymFloat),
    Tensor(Rc<TensorObj>),
    Tuple(Rc<[Value]>),
    NamedTuple(Rc<NamedTupleObj>),
    List(Rc<ListObj>),
    TupleIter(Rc<TupleIterObj>),
    Slice(Rc<SliceObj>),
    Range(RangeObj),
    Dict(Rc<DictObj>),
    Module(Rc<ModuleObj>),
    FrozenSet(Rc<FrozenSetObj>),
    Enum(Rc<EnumMember>),
    Function(Rc<FunctionObj>),
    Class(Rc<ClassObj>),
    Method(Rc<MethodObj>),
    Typing(Rc<TypingObj>),
    PyModule(Rc<PyModuleObj>),
    Device(Rc<str>),
    DType(DType),
    Size(Rc<[i64]>),
    Object(Rc<UserObject>),
}

impl Value {
    #[must_use]
    pub fn str(text: &str) -> Self {
        Self::Str(Rc::from(text))
    }

    #[must_use]
    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Rc::from(items))
    }

    #[must_use]
    pub fn list(id: ObjectId, items: Vec<Value>) -> Self {
        Self::List(Rc::new(ListObj {
            id,
            items: RefCell::new(items),
        }))
    }

    #[must_use]
    pub fn dict(id: ObjectId, entries: Vec<(Value, Value)>) -> Self {
        Self::Dict(Rc::new(DictObj {
            id,
            kind: DictKind::Plain,
            entries: RefCell::new(entries),
        }))
    }

    #[must_use]
    pub fn tuple_iter(id: ObjectId, items: Vec<Value>) -> Self {
        Self::TupleIter(Rc::new(TupleIterObj {
            id,
            items: Rc::from(items),
            position: Cell::new(0),
        }))
    }

    #[must_use]
    pub fn tensor(tensor: TensorObj) -> Self {
        Self::Tensor(Rc::new(tensor))
    }

    #[must_use]
    pub fn object(id: ObjectId, type_name: &str) -> Self {
        Self::Object(Rc::new(UserObject {
            id,
            type_name: type_name.to_owned(),
            bases: Vec::new(),
            custom_setattr: false,
            attrs: RefCell::new(Vec::new()),
        }))
    }

    /// Stable identity for values that have one.
    #[must_use]
    pub fn identity(&self) -> Option<ObjectId> {
        match self {
            Self::Tensor(t) => Some(t.id),
            Self::List(l) => Some(l.id),
            Self::TupleIter(it) => Some(it.id),
            Self::Dict(d) => Some(d.id),
            Self::Module(m) => Some(m.id),
            Self::FrozenSet(s) => Some(s.id),
            Self::Enum(e) => Some(e.id),
            Self::Function(f) => Some(f.id),
            Self::Class(c) => Some(c.id),
            Self::Method(m) => Some(m.id),
            Self::Typing(t) => Some(t.id),
            Self::PyModule(m) => Some(m.id),
            Self::Object(o) => Some(o.id),
            Self::None
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::Str(_)
            | Self::SymInt(_)
            | Self::SymFloat(_)
            | Self::Tuple(_)
            | Self::NamedTuple(_)
            | Self::Slice(_)
            | Self::Range(_)
            | Self::Device(_)
            | Self::DType(_)
            | Self::Size(_) => None,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::None => "NoneType".to_owned(),
            Self::Bool(_) => "bool".to_owned(),
            Self::Int(_) => "int".to_owned(),
            Self::Float(_) => "float".to_owned(),
            Self::Str(_) => "str".to_owned(),
            Self::SymInt(_) => "SymInt".to_owned(),
            Self::SymFloat(_) => "SymFloat".to_owned(),
            Self::Tensor(t) => t.type_name().to_owned(),
            Self::Tuple(_) => "tuple".to_owned(),
            Self::NamedTuple(nt) => nt.type_name.clone(),
            Self::List(_) => "list".to_owned(),
            Self::TupleIter(_) => "tuple_iterator".to_owned(),
            Self::Slice(_) => "slice".to_owned(),
            Self::Range(_) => "range".to_owned(),
            Self::Dict(d) => match d.kind {
                DictKind::Plain => "dict".to_owned(),
                DictKind::Ordered => "OrderedDict".to_owned(),
                DictKind::Default { .. } => "defaultdict".to_owned(),
            },
            Self::Module(m) => m.type_name.clone(),
            Self::FrozenSet(_) => "frozenset".to_owned(),
            Self::Enum(e) => e.enum_type.clone(),
            Self::Function(_) => "function".to_owned(),
            Self::Class(_) => "type".to_owned(),
            Self::Method(_) => "method".to_owned(),
            Self::Typing(_) => "typing".to_owned(),
            Self::PyModule(_) => "module".to_owned(),
            Self::Device(_) => "device".to_owned(),
            Self::DType(_) => "dtype".to_owned(),
            Self::Size(_) => "Size".to_owned(),
            Self::Object(o) => o.type_name.clone(),
        }
    }

    /// Scalars and strings that can be baked into a graph verbatim.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        match self {
            Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) => true,
            Self::Tuple(items) => items.iter().all(Value::is_literal),
            _ => false,
        }
    }

    /// Integer-like literal (bool included) or None.
    #[must_use]
    pub fn is_int_or_none(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Bool(_) | Self::None)
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&Rc<TensorObj>> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Structural equality for data, identity for objects.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::SymInt(a), Self::SymInt(b)) => a == b,
            (Self::SymFloat(a), Self::SymFloat(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::NamedTuple(a), Self::NamedTuple(b)) => {
                a.type_name == b.type_name && a.fields == b.fields && a.values == b.values
            }
            (Self::List(a), Self::List(b)) => *a.items.borrow() == *b.items.borrow(),
            (Self::Dict(a), Self::Dict(b)) => {
                a.kind == b.kind && *a.entries.borrow() == *b.entries.borrow()
            }
            (Self::Slice(a), Self::Slice(b)) => {
                a.start == b.start && a.stop == b.stop && a.step == b.step
            }
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Device(a), Self::Device(b)) => a == b,
            (Self::DType(a), Self::DType(b)) => a == b,
            (Self::Size(a), Self::Size(b)) => a == b,
            (lhs, rhs) => match (lhs.identity(), rhs.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}
