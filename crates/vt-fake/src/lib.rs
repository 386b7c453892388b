#![forbid(unsafe_code)]

//! Data-free execution of traced operations.
//!
//! A [`FakeTensor`] keeps the metadata of a tensor (shape, strides, dtype,
//! device) and nothing else. Kernels in [`kernels`] compute result metadata
//! for the operations the tracer records.

pub mod kernels;
pub mod mode;
pub mod promotion;
pub mod rng;
pub mod symbols;

pub use kernels::{CustomKernel, KernelRegistry};
pub use mode::{AbstractTensorFactory, FakeTensorMode};
pub use rng::{PreservedRng, RngSnapshot, RngState, SharedRng};
pub use symbols::{SymbolEnv, SymbolRecord};

use smallvec::SmallVec;
use std::fmt;
use vt_core::{DType, Literal, SymFloat, SymInt, TraceError, Value, contiguous_strides};

pub type Shape = SmallVec<[Dim; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(i64),
    Symbolic(SymInt),
}

impl Dim {
    /// Concrete size if known, or the symbol's hint.
    #[must_use]
    pub fn hint(self) -> Option<i64> {
        match self {
            Self::Static(size) => Some(size),
            Self::Symbolic(sym) => sym.hint,
        }
    }

    #[must_use]
    pub fn as_static(self) -> Option<i64> {
        match self {
            Self::Static(size) => Some(size),
            Self::Symbolic(_) => None,
        }
    }

    #[must_use]
    pub fn is_symbolic(self) -> bool {
        matches!(self, Self::Symbolic(_))
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(size) => write!(f, "{size}"),
            Self::Symbolic(sym) => write!(f, "{}", sym.symbol),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeTensor {
    pub shape: Shape,
    pub strides: SmallVec<[i64; 4]>,
    pub storage_offset: i64,
    pub dtype: DType,
    pub device: String,
    pub requires_grad: bool,
    pub is_parameter: bool,
    /// Tag of the tensor-like subtype this payload stands in for.
    pub subclass: Option<String>,
}

impl FakeTensor {
    /// Contiguous tensor with the given shape; strides come from size hints.
    #[must_use]
    pub fn contiguous(shape: Shape, dtype: DType, device: &str) -> Self {
        let hints = shape
            .iter()
            .map(|dim| dim.hint().unwrap_or(1))
            .collect::<Vec<_>>();
        Self {
            strides: contiguous_strides(&hints).into_iter().collect(),
            shape,
            storage_offset: 0,
            dtype,
            device: device.to_owned(),
            requires_grad: false,
            is_parameter: false,
            subclass: None,
        }
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self::contiguous(Shape::new(), dtype, "cpu")
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn size_hints(&self) -> Vec<i64> {
        self.shape
            .iter()
            .map(|dim| dim.hint().unwrap_or(1))
            .collect()
    }

    /// Element count from the size hints, `None` when it overflows `i64`.
    #[must_use]
    pub fn numel_hint(&self) -> Option<i64> {
        self.size_hints()
            .iter()
            .try_fold(1_i64, |acc, dim| acc.checked_mul(*dim))
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.strides.as_slice() == contiguous_strides(&self.size_hints()).as_slice()
    }

    #[must_use]
    pub fn has_symbolic_dims(&self) -> bool {
        self.shape.iter().any(|dim| dim.is_symbolic())
    }

    /// Same metadata with new shape, dtype and fresh contiguous strides.
    #[must_use]
    pub fn derive(&self, shape: Shape, dtype: DType) -> Self {
        Self {
            requires_grad: self.requires_grad,
            subclass: self.subclass.clone(),
            ..Self::contiguous(shape, dtype, &self.device)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FakeValue {
    Tensor(FakeTensor),
    Int(i64),
    Float(f64),
    Bool(bool),
    SymInt(SymInt),
    SymFloat(SymFloat),
    Size(Shape),
    Tuple(Vec<FakeValue>),
    List(Vec<FakeValue>),
    NamedTuple {
        type_name: String,
        fields: Vec<String>,
        values: Vec<FakeValue>,
    },
    None,
    /// Result that is neither a tensor nor a structure the tracer models.
    Opaque { type_name: String },
}

impl FakeValue {
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::Tensor(t) => t.subclass.clone().unwrap_or_else(|| "FakeTensor".to_owned()),
            Self::Int(_) => "int".to_owned(),
            Self::Float(_) => "float".to_owned(),
            Self::Bool(_) => "bool".to_owned(),
            Self::SymInt(_) => "SymInt".to_owned(),
            Self::SymFloat(_) => "SymFloat".to_owned(),
            Self::Size(_) => "Size".to_owned(),
            Self::Tuple(_) => "tuple".to_owned(),
            Self::List(_) => "list".to_owned(),
            Self::NamedTuple { type_name, .. } | Self::Opaque { type_name } => type_name.clone(),
            Self::None => "NoneType".to_owned(),
        }
    }

    #[must_use]
    pub fn from_literal(literal: Literal) -> Self {
        match literal {
            Literal::I64(v) => Self::Int(v),
            Literal::Bool(v) => Self::Bool(v),
            Literal::F64Bits(bits) => Self::Float(f64::from_bits(bits)),
            Literal::None => Self::None,
        }
    }

    /// Data-free view of a scalar or structured runtime value. Tensors are
    /// not converted here; they go through [`AbstractTensorFactory`].
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::None => Some(Self::None),
            Value::Bool(v) => Some(Self::Bool(*v)),
            Value::Int(v) => Some(Self::Int(*v)),
            Value::Float(v) => Some(Self::Float(*v)),
            Value::SymInt(v) => Some(Self::SymInt(*v)),
            Value::SymFloat(v) => Some(Self::SymFloat(*v)),
            Value::Size(dims) => Some(Self::Size(dims.iter().map(|d| Dim::Static(*d)).collect())),
            Value::Tuple(items) => items
                .iter()
                .map(Self::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Self::Tuple),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&FakeTensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeError {
    UnsupportedOperator {
        op: String,
    },
    ArityMismatch {
        op: String,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        op: String,
        detail: String,
    },
    ShapeMismatch {
        op: String,
        left: String,
        right: String,
    },
    InvalidParam {
        op: String,
        key: String,
        raw: String,
    },
    IndexOutOfRange {
        op: String,
        index: i64,
        len: usize,
    },
    /// Result depends on tensor contents, which fake execution never sees.
    DataDependent {
        op: String,
    },
}

impl FakeError {
    #[must_use]
    pub fn op(&self) -> &str {
        match self {
            Self::UnsupportedOperator { op }
            | Self::ArityMismatch { op, .. }
            | Self::TypeMismatch { op, .. }
            | Self::ShapeMismatch { op, .. }
            | Self::InvalidParam { op, .. }
            | Self::IndexOutOfRange { op, .. }
            | Self::DataDependent { op } => op,
        }
    }
}

impl fmt::Display for FakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOperator { op } => write!(f, "no fake kernel for operator {op}"),
            Self::ArityMismatch {
                op,
                expected,
                actual,
            } => write!(f, "arity mismatch for {op}: expected {expected}, got {actual}"),
            Self::TypeMismatch { op, detail } => write!(f, "type mismatch for {op}: {detail}"),
            Self::ShapeMismatch { op, left, right } => {
                write!(f, "shape mismatch for {op}: {left} vs {right}")
            }
            Self::InvalidParam { op, key, raw } => {
                write!(f, "invalid parameter {key}={raw:?} for {op}")
            }
            Self::IndexOutOfRange { op, index, len } => {
                write!(f, "index {index} out of range for {op} of length {len}")
            }
            Self::DataDependent { op } => {
                write!(f, "{op} depends on tensor data and cannot be executed abstractly")
            }
        }
    }
}

impl std::error::Error for FakeError {}

impl From<FakeError> for TraceError {
    fn from(value: FakeError) -> Self {
        TraceError::unrepresentable(
            format!("call_function {}", value.op()),
            "FakeTensor",
            value.to_string(),
        )
    }
}

#[must_use]
pub fn format_shape(shape: &[Dim]) -> String {
    let dims = shape.iter().map(ToString::to_string).collect::<Vec<_>>();
    format!("[{}]", dims.join(", "))
}
