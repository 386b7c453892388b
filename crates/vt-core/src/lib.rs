#![forbid(unsafe_code)]

//! Shared vocabulary of the tracer core: runtime values handed over by the
//! interpreter, provenance sources, guard predicates, configuration and
//! the error taxonomy.

pub mod config;
pub mod error;
pub mod guard;
pub mod source;
pub mod value;

pub use config::{ConfigError, TraceConfig};
pub use error::TraceError;
pub use guard::{Guard, GuardKind, GuardSet, make_guards, union_guards};
pub use source::{FrameBindings, IndexKey, Provenance, Source};
pub use value::{
    ClassObj, DictKind, DictObj, EnumMember, FrozenSetObj, FunctionKind, FunctionObj, ListObj,
    MethodObj, ModuleObj, ModuleOrigin, NamedTupleObj, ObjectId, PyModuleObj, RangeObj,
    SliceObj, TensorClass, TensorObj, TupleIterObj, TypingObj, UserObject, Value,
    contiguous_strides,
};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    U8,
    I32,
    I64,
    F16,
    F32,
    F64,
    Complex64,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "uint8",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F16 => "float16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::Complex64 => "complex64",
        }
    }

    /// Size of one element in bytes.
    #[must_use]
    pub fn itemsize(self) -> i64 {
        match self {
            Self::Bool | Self::U8 => 1,
            Self::F16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 | Self::Complex64 => 8,
        }
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::F16 | Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::U8 | Self::I32 | Self::I64)
    }

    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Self::Complex64)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "bool" => Some(Self::Bool),
            "uint8" => Some(Self::U8),
            "int32" => Some(Self::I32),
            "int64" => Some(Self::I64),
            "float16" => Some(Self::F16),
            "float32" => Some(Self::F32),
            "float64" => Some(Self::F64),
            "complex64" => Some(Self::Complex64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbol allocated by the shared symbol environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Integer represented by a symbol; `hint` is absent for unbacked symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymInt {
    pub symbol: SymbolId,
    pub hint: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymFloat {
    pub symbol: SymbolId,
    pub hint: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
    None,
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) | Self::None => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(value) => Some(i64::from(value)),
            Self::F64Bits(_) | Self::None => None,
        }
    }
}

/// Operation a call node in the trace graph refers to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpTarget {
    // Elementwise
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Relu,
    Sin,
    Cos,
    Exp,
    // Linear algebra, reduction, layout
    Matmul,
    Sum,
    Reshape,
    Transpose,
    // Metadata queries
    Size,
    SizeAt,
    ElementSize,
    // Structured results
    GetItem,
    MaxDim,
    Split,
    // Scalar extraction and scalar math
    Item,
    Sqrt,
    Pow,
    Mod,
    // Randomness
    Seed,
    ManualSeed,
    Rand,
    Dropout,
    SetRngState,
    GeneratorSetState,
    // Runtime queries
    GetRank,
    GetWorldSize,
    DisableFuncTorch,
    IsInBadFork,
    /// Kernel looked up by name in the fake-kernel registry.
    Custom(String),
}

impl OpTarget {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Neg => "neg",
            Self::Relu => "relu",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Exp => "exp",
            Self::Matmul => "matmul",
            Self::Sum => "sum",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
            Self::Size => "size",
            Self::SizeAt => "size_at",
            Self::ElementSize => "element_size",
            Self::GetItem => "getitem",
            Self::MaxDim => "max_dim",
            Self::Split => "split",
            Self::Item => "item",
            Self::Sqrt => "sqrt",
            Self::Pow => "pow",
            Self::Mod => "mod",
            Self::Seed => "seed",
            Self::ManualSeed => "manual_seed",
            Self::Rand => "rand",
            Self::Dropout => "dropout",
            Self::SetRngState => "set_rng_state",
            Self::GeneratorSetState => "generator.set_state",
            Self::GetRank => "get_rank",
            Self::GetWorldSize => "get_world_size",
            Self::DisableFuncTorch => "disable_functorch",
            Self::IsInBadFork => "is_in_bad_fork",
            Self::Custom(name) => name,
        }
    }

    /// Operations whose result is an RNG/generator state handle.
    #[must_use]
    pub fn returns_rng_handle(&self) -> bool {
        matches!(self, Self::SetRngState | Self::GeneratorSetState)
    }

    /// Runtime queries whose result is kept opaque.
    #[must_use]
    pub fn returns_opaque_object(&self) -> bool {
        matches!(self, Self::DisableFuncTorch | Self::IsInBadFork)
    }

    /// Integer-returning runtime queries that may be symbolized.
    #[must_use]
    pub fn is_int_query(&self) -> bool {
        matches!(
            self,
            Self::Seed | Self::Mod | Self::GetRank | Self::GetWorldSize
        )
    }

    /// Scalar-producing operations eligible for scalar-output capture.
    #[must_use]
    pub fn is_scalar_capture(&self) -> bool {
        matches!(self, Self::Item | Self::Sqrt | Self::Pow)
    }
}

impl fmt::Display for OpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{DType, Literal, OpTarget};

    #[test]
    fn dtype_parse_round_trips_names() {
        for dtype in [
            DType::Bool,
            DType::U8,
            DType::I32,
            DType::I64,
            DType::F16,
            DType::F32,
            DType::F64,
            DType::Complex64,
        ] {
            assert_eq!(DType::parse(dtype.as_str()), Some(dtype));
        }
        assert_eq!(DType::parse("float128"), None);
    }

    #[test]
    fn literal_numeric_views() {
        assert_eq!(Literal::I64(3).as_f64(), Some(3.0));
        assert_eq!(Literal::from_f64(2.5).as_f64(), Some(2.5));
        assert_eq!(Literal::Bool(true).as_i64(), Some(1));
        assert_eq!(Literal::None.as_f64(), None);
    }

    #[test]
    fn op_target_categories() {
        assert!(OpTarget::SetRngState.returns_rng_handle());
        assert!(OpTarget::Seed.is_int_query());
        assert!(OpTarget::Item.is_scalar_capture());
        assert!(!OpTarget::Add.is_scalar_capture());
        assert_eq!(OpTarget::Custom("my_op".to_owned()).as_str(), "my_op");
    }
}
