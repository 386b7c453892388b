//! Metadata kernels: one per traced operation, computing result shape,
//! dtype and structure from abstract inputs.

use crate::promotion::{
    broadcast_shapes, dims_agree, normalize_axis, promote_types, promote_with_scalar, to_floating,
};
use crate::rng::SharedRng;
use crate::symbols::SymbolEnv;
use crate::{Dim, FakeError, FakeTensor, FakeValue, Shape, format_shape};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use vt_core::{DType, OpTarget};

pub type CustomKernel =
    Box<dyn Fn(&[FakeValue], &BTreeMap<String, String>) -> Result<FakeValue, FakeError>>;

/// User-registered kernels looked up by operator name.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: FxHashMap<String, CustomKernel>,
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, kernel: CustomKernel) {
        self.kernels.insert(name.to_owned(), kernel);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CustomKernel> {
        self.kernels.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.kernels.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("KernelRegistry")
            .field("kernels", &names)
            .finish()
    }
}

pub struct KernelCtx<'a> {
    pub env: &'a mut SymbolEnv,
    pub rng: &'a SharedRng,
    pub custom: &'a KernelRegistry,
    pub capture_scalar_outputs: bool,
}

pub fn execute(
    target: &OpTarget,
    args: &[FakeValue],
    params: &BTreeMap<String, String>,
    ctx: &mut KernelCtx<'_>,
) -> Result<FakeValue, FakeError> {
    let op = target.as_str();
    match target {
        OpTarget::Add
        | OpTarget::Sub
        | OpTarget::Mul
        | OpTarget::Div
        | OpTarget::Mod
        | OpTarget::Pow => {
            expect_arity(op, args, 2)?;
            binary(target, &args[0], &args[1], ctx.env)
        }
        OpTarget::Neg
        | OpTarget::Relu
        | OpTarget::Sin
        | OpTarget::Cos
        | OpTarget::Exp
        | OpTarget::Sqrt => {
            expect_arity(op, args, 1)?;
            unary(target, &args[0], ctx.env)
        }
        OpTarget::Matmul => {
            expect_arity(op, args, 2)?;
            matmul(tensor_arg(op, &args[0])?, tensor_arg(op, &args[1])?)
        }
        OpTarget::Sum => {
            expect_arity(op, args, 1)?;
            sum(tensor_arg(op, &args[0])?, params)
        }
        OpTarget::Reshape => {
            expect_arity(op, args, 1)?;
            reshape(tensor_arg(op, &args[0])?, params)
        }
        OpTarget::Transpose => {
            expect_arity(op, args, 1)?;
            transpose(tensor_arg(op, &args[0])?, params)
        }
        OpTarget::Size => {
            expect_arity(op, args, 1)?;
            Ok(FakeValue::Size(tensor_arg(op, &args[0])?.shape.clone()))
        }
        OpTarget::SizeAt => {
            expect_arity(op, args, 1)?;
            let tensor = tensor_arg(op, &args[0])?;
            let axis = required_i64(op, params, "dim")?;
            let dim = tensor.shape[normalize_axis(op, axis, tensor.rank())?];
            Ok(dim_value(dim))
        }
        OpTarget::ElementSize => {
            expect_arity(op, args, 1)?;
            Ok(FakeValue::Int(tensor_arg(op, &args[0])?.dtype.itemsize()))
        }
        OpTarget::GetItem => getitem(args, params),
        OpTarget::MaxDim => {
            expect_arity(op, args, 1)?;
            max_dim(tensor_arg(op, &args[0])?, params)
        }
        OpTarget::Split => {
            expect_arity(op, args, 1)?;
            split(tensor_arg(op, &args[0])?, params)
        }
        OpTarget::Item => {
            expect_arity(op, args, 1)?;
            item(tensor_arg(op, &args[0])?, ctx)
        }
        OpTarget::Seed => {
            expect_arity(op, args, 0)?;
            Ok(FakeValue::Int(ctx.rng.borrow_mut().reseed()))
        }
        OpTarget::ManualSeed => {
            expect_arity(op, args, 1)?;
            let seed = match &args[0] {
                FakeValue::Int(seed) => *seed,
                other => return Err(type_mismatch(op, "integer seed", other)),
            };
            ctx.rng.borrow_mut().manual_seed(seed as u64);
            Ok(FakeValue::None)
        }
        OpTarget::Rand => rand(args, params, ctx),
        OpTarget::Dropout => {
            expect_arity(op, args, 1)?;
            dropout(tensor_arg(op, &args[0])?, params, ctx)
        }
        OpTarget::SetRngState | OpTarget::GeneratorSetState => {
            expect_arity(op, args, 1)?;
            Ok(FakeValue::None)
        }
        OpTarget::GetRank => Ok(FakeValue::Int(optional_i64(op, params, "rank")?.unwrap_or(0))),
        OpTarget::GetWorldSize => Ok(FakeValue::Int(
            optional_i64(op, params, "world_size")?.unwrap_or(1),
        )),
        OpTarget::DisableFuncTorch => Ok(FakeValue::Opaque {
            type_name: "_DisableFuncTorch".to_owned(),
        }),
        OpTarget::IsInBadFork => Ok(FakeValue::Bool(false)),
        OpTarget::Custom(name) => match ctx.custom.get(name) {
            Some(kernel) => kernel(args, params),
            None => Err(FakeError::UnsupportedOperator { op: name.clone() }),
        },
    }
}

fn expect_arity(op: &str, args: &[FakeValue], expected: usize) -> Result<(), FakeError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(FakeError::ArityMismatch {
            op: op.to_owned(),
            expected,
            actual: args.len(),
        })
    }
}

fn type_mismatch(op: &str, expected: &str, actual: &FakeValue) -> FakeError {
    FakeError::TypeMismatch {
        op: op.to_owned(),
        detail: format!("expected {expected}, got {}", actual.type_name()),
    }
}

fn tensor_arg<'v>(op: &str, value: &'v FakeValue) -> Result<&'v FakeTensor, FakeError> {
    value
        .as_tensor()
        .ok_or_else(|| type_mismatch(op, "tensor", value))
}

fn optional_i64(
    op: &str,
    params: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<i64>, FakeError> {
    params
        .get(key)
        .map(|raw| {
            raw.trim().parse::<i64>().map_err(|_| FakeError::InvalidParam {
                op: op.to_owned(),
                key: key.to_owned(),
                raw: raw.clone(),
            })
        })
        .transpose()
}

fn required_i64(op: &str, params: &BTreeMap<String, String>, key: &str) -> Result<i64, FakeError> {
    optional_i64(op, params, key)?.ok_or_else(|| FakeError::InvalidParam {
        op: op.to_owned(),
        key: key.to_owned(),
        raw: String::new(),
    })
}

fn param_bool(
    op: &str,
    params: &BTreeMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, FakeError> {
    match params.get(key).map(|raw| raw.trim()) {
        None => Ok(default),
        Some("true" | "1") => Ok(true),
        Some("false" | "0") => Ok(false),
        Some(raw) => Err(FakeError::InvalidParam {
            op: op.to_owned(),
            key: key.to_owned(),
            raw: raw.to_owned(),
        }),
    }
}

fn param_shape(
    op: &str,
    params: &BTreeMap<String, String>,
    key: &str,
) -> Result<Vec<i64>, FakeError> {
    let raw = params.get(key).ok_or_else(|| FakeError::InvalidParam {
        op: op.to_owned(),
        key: key.to_owned(),
        raw: String::new(),
    })?;
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>().map_err(|_| FakeError::InvalidParam {
                op: op.to_owned(),
                key: key.to_owned(),
                raw: raw.clone(),
            })
        })
        .collect()
}

fn dim_value(dim: Dim) -> FakeValue {
    match dim {
        Dim::Static(size) => FakeValue::Int(size),
        Dim::Symbolic(sym) => FakeValue::SymInt(sym),
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(Option<i64>),
    Float(Option<f64>),
}

impl Num {
    fn as_f64(self) -> Option<f64> {
        match self {
            Self::Int(v) => v.map(|x| x as f64),
            Self::Float(v) => v,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Self::Float(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct Scalar {
    num: Num,
    symbolic: bool,
    is_bool: bool,
}

fn scalar_of(value: &FakeValue) -> Option<Scalar> {
    let (num, symbolic, is_bool) = match value {
        FakeValue::Int(v) => (Num::Int(Some(*v)), false, false),
        FakeValue::Bool(v) => (Num::Int(Some(i64::from(*v))), false, true),
        FakeValue::Float(v) => (Num::Float(Some(*v)), false, false),
        FakeValue::SymInt(s) => (Num::Int(s.hint), true, false),
        FakeValue::SymFloat(s) => (Num::Float(s.hint), true, false),
        _ => return None,
    };
    Some(Scalar {
        num,
        symbolic,
        is_bool,
    })
}

fn scalar_result(num: Num, symbolic: bool, env: &mut SymbolEnv) -> FakeValue {
    match (num, symbolic) {
        (Num::Int(Some(v)), false) => FakeValue::Int(v),
        (Num::Float(Some(v)), false) => FakeValue::Float(v),
        (Num::Int(Some(hint)), true) => FakeValue::SymInt(env.create_symint(hint, None)),
        (Num::Float(Some(hint)), true) => FakeValue::SymFloat(env.create_symfloat(hint, None)),
        (Num::Int(None), _) => FakeValue::SymInt(env.create_unbacked_symint()),
        (Num::Float(None), _) => FakeValue::SymFloat(env.create_unbacked_symfloat()),
    }
}

fn python_mod(op: &str, x: i64, y: i64) -> Result<i64, FakeError> {
    if y == 0 {
        return Err(FakeError::TypeMismatch {
            op: op.to_owned(),
            detail: "integer modulo by zero".to_owned(),
        });
    }
    let r = x.wrapping_rem(y);
    Ok(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r })
}

fn int_binary(target: &OpTarget, x: i64, y: i64) -> Result<Option<i64>, FakeError> {
    let op = target.as_str();
    let out = match target {
        OpTarget::Add => x.checked_add(y),
        OpTarget::Sub => x.checked_sub(y),
        OpTarget::Mul => x.checked_mul(y),
        OpTarget::Mod => Some(python_mod(op, x, y)?),
        OpTarget::Pow => u32::try_from(y).ok().and_then(|e| x.checked_pow(e)),
        _ => None,
    };
    out.map(Some).ok_or_else(|| FakeError::TypeMismatch {
        op: op.to_owned(),
        detail: "integer overflow".to_owned(),
    })
}

fn float_binary(target: &OpTarget, x: f64, y: f64) -> f64 {
    match target {
        OpTarget::Add => x + y,
        OpTarget::Sub => x - y,
        OpTarget::Mul => x * y,
        OpTarget::Div => x / y,
        OpTarget::Pow => x.powf(y),
        OpTarget::Mod => x - y * (x / y).floor(),
        _ => f64::NAN,
    }
}

fn scalar_binary(
    target: &OpTarget,
    lhs: Scalar,
    rhs: Scalar,
    env: &mut SymbolEnv,
) -> Result<FakeValue, FakeError> {
    let symbolic = lhs.symbolic || rhs.symbolic;
    let int_result = !lhs.num.is_float()
        && !rhs.num.is_float()
        && !matches!(target, OpTarget::Div)
        && !(matches!(target, OpTarget::Pow)
            && matches!(rhs.num, Num::Int(Some(e)) if e < 0));
    let num = if int_result {
        match (lhs.num, rhs.num) {
            (Num::Int(Some(x)), Num::Int(Some(y))) => Num::Int(int_binary(target, x, y)?),
            _ => Num::Int(None),
        }
    } else {
        Num::Float(
            lhs.num
                .as_f64()
                .zip(rhs.num.as_f64())
                .map(|(x, y)| float_binary(target, x, y)),
        )
    };
    Ok(scalar_result(num, symbolic, env))
}

fn binary(
    target: &OpTarget,
    lhs: &FakeValue,
    rhs: &FakeValue,
    env: &mut SymbolEnv,
) -> Result<FakeValue, FakeError> {
    let op = target.as_str();
    match (lhs, rhs) {
        (FakeValue::Tensor(a), FakeValue::Tensor(b)) => {
            let shape = broadcast_shapes(op, &a.shape, &b.shape)?;
            let mut dtype = promote_types(a.dtype, b.dtype);
            if matches!(target, OpTarget::Div) {
                dtype = to_floating(dtype);
            }
            let mut out = a.derive(shape, dtype);
            out.requires_grad = a.requires_grad || b.requires_grad;
            out.subclass = a.subclass.clone().or_else(|| b.subclass.clone());
            Ok(FakeValue::Tensor(out))
        }
        (FakeValue::Tensor(t), other) | (other, FakeValue::Tensor(t)) => {
            let scalar =
                scalar_of(other).ok_or_else(|| type_mismatch(op, "tensor or number", other))?;
            let mut dtype = promote_with_scalar(t.dtype, scalar.num.is_float(), scalar.is_bool);
            if matches!(target, OpTarget::Div) {
                dtype = to_floating(dtype);
            }
            Ok(FakeValue::Tensor(t.derive(t.shape.clone(), dtype)))
        }
        (a, b) => {
            let lhs = scalar_of(a).ok_or_else(|| type_mismatch(op, "number", a))?;
            let rhs = scalar_of(b).ok_or_else(|| type_mismatch(op, "number", b))?;
            scalar_binary(target, lhs, rhs, env)
        }
    }
}

fn unary(
    target: &OpTarget,
    value: &FakeValue,
    env: &mut SymbolEnv,
) -> Result<FakeValue, FakeError> {
    let op = target.as_str();
    if let FakeValue::Tensor(t) = value {
        let dtype = match target {
            OpTarget::Neg | OpTarget::Relu => t.dtype,
            _ => to_floating(t.dtype),
        };
        return Ok(FakeValue::Tensor(t.derive(t.shape.clone(), dtype)));
    }
    let scalar = scalar_of(value).ok_or_else(|| type_mismatch(op, "tensor or number", value))?;
    let num = match (target, scalar.num) {
        (OpTarget::Neg, Num::Int(v)) => Num::Int(v.map(i64::wrapping_neg)),
        (OpTarget::Neg, Num::Float(v)) => Num::Float(v.map(|x| -x)),
        (OpTarget::Relu, _) => return Err(type_mismatch(op, "tensor", value)),
        (OpTarget::Sqrt, n) => Num::Float(n.as_f64().map(f64::sqrt)),
        (OpTarget::Sin, n) => Num::Float(n.as_f64().map(f64::sin)),
        (OpTarget::Cos, n) => Num::Float(n.as_f64().map(f64::cos)),
        (OpTarget::Exp, n) => Num::Float(n.as_f64().map(f64::exp)),
        _ => return Err(FakeError::UnsupportedOperator { op: op.to_owned() }),
    };
    Ok(scalar_result(num, scalar.symbolic, env))
}

fn matmul(a: &FakeTensor, b: &FakeTensor) -> Result<FakeValue, FakeError> {
    let op = "matmul";
    if a.rank() == 0 || b.rank() == 0 {
        return Err(FakeError::TypeMismatch {
            op: op.to_owned(),
            detail: "both operands must be at least 1-D".to_owned(),
        });
    }
    let mut lhs = a.shape.clone();
    if a.rank() == 1 {
        lhs.insert(0, Dim::Static(1));
    }
    let mut rhs = b.shape.clone();
    if b.rank() == 1 {
        rhs.push(Dim::Static(1));
    }
    let (m, k_lhs) = (lhs[lhs.len() - 2], lhs[lhs.len() - 1]);
    let (k_rhs, n) = (rhs[rhs.len() - 2], rhs[rhs.len() - 1]);
    if !dims_agree(k_lhs, k_rhs) {
        return Err(FakeError::ShapeMismatch {
            op: op.to_owned(),
            left: format_shape(&a.shape),
            right: format_shape(&b.shape),
        });
    }
    let mut shape = broadcast_shapes(op, &lhs[..lhs.len() - 2], &rhs[..rhs.len() - 2])?;
    if a.rank() > 1 {
        shape.push(m);
    }
    if b.rank() > 1 {
        shape.push(n);
    }
    let mut out = a.derive(shape, promote_types(a.dtype, b.dtype));
    out.requires_grad = a.requires_grad || b.requires_grad;
    Ok(FakeValue::Tensor(out))
}

fn reduced_shape(shape: &[Dim], axis: Option<usize>, keepdim: bool) -> Shape {
    match axis {
        None if keepdim => shape.iter().map(|_| Dim::Static(1)).collect(),
        None => Shape::new(),
        Some(axis) => shape
            .iter()
            .enumerate()
            .filter_map(|(idx, dim)| {
                if idx != axis {
                    Some(*dim)
                } else if keepdim {
                    Some(Dim::Static(1))
                } else {
                    None
                }
            })
            .collect(),
    }
}

fn sum(t: &FakeTensor, params: &BTreeMap<String, String>) -> Result<FakeValue, FakeError> {
    let op = "sum";
    let axis = optional_i64(op, params, "dim")?
        .map(|axis| normalize_axis(op, axis, t.rank()))
        .transpose()?;
    let keepdim = param_bool(op, params, "keepdim", false)?;
    let dtype = if t.dtype == DType::Bool || t.dtype.is_integral() {
        DType::I64
    } else {
        t.dtype
    };
    Ok(FakeValue::Tensor(
        t.derive(reduced_shape(&t.shape, axis, keepdim), dtype),
    ))
}

fn max_dim(t: &FakeTensor, params: &BTreeMap<String, String>) -> Result<FakeValue, FakeError> {
    let op = "max_dim";
    let axis = normalize_axis(op, required_i64(op, params, "dim")?, t.rank())?;
    let keepdim = param_bool(op, params, "keepdim", false)?;
    let shape = reduced_shape(&t.shape, Some(axis), keepdim);
    let values = t.derive(shape.clone(), t.dtype);
    let mut indices = t.derive(shape, DType::I64);
    indices.requires_grad = false;
    Ok(FakeValue::NamedTuple {
        type_name: "torch.return_types.max".to_owned(),
        fields: vec!["values".to_owned(), "indices".to_owned()],
        values: vec![FakeValue::Tensor(values), FakeValue::Tensor(indices)],
    })
}

fn numel(op: &str, t: &FakeTensor) -> Result<i64, FakeError> {
    t.numel_hint().ok_or_else(|| FakeError::ShapeMismatch {
        op: op.to_owned(),
        left: format_shape(&t.shape),
        right: "element count overflows i64".to_owned(),
    })
}

fn reshape(t: &FakeTensor, params: &BTreeMap<String, String>) -> Result<FakeValue, FakeError> {
    let op = "reshape";
    let requested = param_shape(op, params, "shape")?;
    let total = numel(op, t)?;
    let inferred_count = requested.iter().filter(|dim| **dim == -1).count();
    let mismatch = || FakeError::ShapeMismatch {
        op: op.to_owned(),
        left: format_shape(&t.shape),
        right: format!("{requested:?}"),
    };
    if inferred_count > 1 || requested.iter().any(|dim| *dim < -1) {
        return Err(mismatch());
    }
    let known = requested
        .iter()
        .filter(|dim| **dim != -1)
        .try_fold(1_i64, |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(mismatch)?;
    let shape = if inferred_count == 1 {
        if known == 0 || total % known != 0 {
            return Err(mismatch());
        }
        requested
            .iter()
            .map(|dim| Dim::Static(if *dim == -1 { total / known } else { *dim }))
            .collect::<Shape>()
    } else {
        if known != total {
            return Err(mismatch());
        }
        requested.iter().map(|dim| Dim::Static(*dim)).collect()
    };
    Ok(FakeValue::Tensor(t.derive(shape, t.dtype)))
}

fn transpose(t: &FakeTensor, params: &BTreeMap<String, String>) -> Result<FakeValue, FakeError> {
    let op = "transpose";
    if t.rank() < 2 {
        return Ok(FakeValue::Tensor(t.clone()));
    }
    let dim0 = normalize_axis(op, optional_i64(op, params, "dim0")?.unwrap_or(-2), t.rank())?;
    let dim1 = normalize_axis(op, optional_i64(op, params, "dim1")?.unwrap_or(-1), t.rank())?;
    let mut out = t.clone();
    out.shape.swap(dim0, dim1);
    out.strides.swap(dim0, dim1);
    out.is_parameter = false;
    Ok(FakeValue::Tensor(out))
}

fn index_into(op: &str, index: i64, len: usize) -> Result<usize, FakeError> {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if index < 0 { index + len_i } else { index };
    if resolved < 0 || resolved >= len_i {
        return Err(FakeError::IndexOutOfRange {
            op: op.to_owned(),
            index,
            len,
        });
    }
    usize::try_from(resolved).map_err(|_| FakeError::IndexOutOfRange {
        op: op.to_owned(),
        index,
        len,
    })
}

fn getitem(args: &[FakeValue], params: &BTreeMap<String, String>) -> Result<FakeValue, FakeError> {
    let op = "getitem";
    let index = match args {
        [_, FakeValue::Int(index)] => *index,
        [_] => required_i64(op, params, "index")?,
        [_, other] => return Err(type_mismatch(op, "integer index", other)),
        _ => {
            return Err(FakeError::ArityMismatch {
                op: op.to_owned(),
                expected: 2,
                actual: args.len(),
            });
        }
    };
    match &args[0] {
        FakeValue::Tuple(items) | FakeValue::List(items) => {
            Ok(items[index_into(op, index, items.len())?].clone())
        }
        FakeValue::NamedTuple { values, .. } => {
            Ok(values[index_into(op, index, values.len())?].clone())
        }
        FakeValue::Size(dims) => Ok(dim_value(dims[index_into(op, index, dims.len())?])),
        FakeValue::Tensor(t) => {
            let len = t
                .shape
                .first()
                .and_then(|dim| dim.hint())
                .and_then(|hint| usize::try_from(hint).ok())
                .ok_or_else(|| type_mismatch(op, "indexable tensor", &args[0]))?;
            let position = index_into(op, index, len)?;
            let mut out = t.clone();
            out.shape.remove(0);
            let stride = out.strides.remove(0);
            out.storage_offset = i64::try_from(position)
                .ok()
                .and_then(|position| stride.checked_mul(position))
                .and_then(|step| out.storage_offset.checked_add(step))
                .ok_or_else(|| FakeError::ShapeMismatch {
                    op: op.to_owned(),
                    left: format_shape(&t.shape),
                    right: format!("storage offset at index {index}"),
                })?;
            out.is_parameter = false;
            Ok(FakeValue::Tensor(out))
        }
        other => Err(type_mismatch(op, "sequence", other)),
    }
}

fn split(t: &FakeTensor, params: &BTreeMap<String, String>) -> Result<FakeValue, FakeError> {
    let op = "split";
    let split_size = required_i64(op, params, "split_size")?;
    if split_size <= 0 {
        return Err(FakeError::InvalidParam {
            op: op.to_owned(),
            key: "split_size".to_owned(),
            raw: split_size.to_string(),
        });
    }
    let axis = normalize_axis(op, optional_i64(op, params, "dim")?.unwrap_or(0), t.rank())?;
    let Some(length) = t.shape.get(axis).and_then(|dim| dim.as_static()) else {
        return Err(FakeError::DataDependent { op: op.to_owned() });
    };
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < length {
        let size = split_size.min(length - start);
        let mut chunk = t.clone();
        chunk.shape[axis] = Dim::Static(size);
        chunk.storage_offset = start
            .checked_mul(t.strides[axis])
            .and_then(|step| t.storage_offset.checked_add(step))
            .ok_or_else(|| FakeError::ShapeMismatch {
                op: op.to_owned(),
                left: format_shape(&t.shape),
                right: format!("storage offset at chunk start {start}"),
            })?;
        chunk.is_parameter = false;
        chunks.push(FakeValue::Tensor(chunk));
        start += size;
    }
    Ok(FakeValue::Tuple(chunks))
}

fn item(t: &FakeTensor, ctx: &mut KernelCtx<'_>) -> Result<FakeValue, FakeError> {
    let op = "item";
    if t.numel_hint() != Some(1) {
        return Err(FakeError::TypeMismatch {
            op: op.to_owned(),
            detail: format!(
                "only one-element tensors convert to scalars, got {}",
                format_shape(&t.shape)
            ),
        });
    }
    if !ctx.capture_scalar_outputs {
        return Err(FakeError::DataDependent { op: op.to_owned() });
    }
    if t.dtype.is_floating() || t.dtype.is_complex() {
        Ok(FakeValue::SymFloat(ctx.env.create_unbacked_symfloat()))
    } else {
        Ok(FakeValue::SymInt(ctx.env.create_unbacked_symint()))
    }
}

fn rand(
    args: &[FakeValue],
    params: &BTreeMap<String, String>,
    ctx: &mut KernelCtx<'_>,
) -> Result<FakeValue, FakeError> {
    let op = "rand";
    let shape: Shape = if args.is_empty() {
        param_shape(op, params, "shape")?
            .into_iter()
            .map(Dim::Static)
            .collect()
    } else {
        args.iter()
            .map(|arg| match arg {
                FakeValue::Int(size) => Ok(Dim::Static(*size)),
                FakeValue::SymInt(sym) => Ok(Dim::Symbolic(*sym)),
                other => Err(type_mismatch(op, "size", other)),
            })
            .collect::<Result<_, _>>()?
    };
    let dtype = match params.get("dtype") {
        Some(raw) => DType::parse(raw).ok_or_else(|| FakeError::InvalidParam {
            op: op.to_owned(),
            key: "dtype".to_owned(),
            raw: raw.clone(),
        })?,
        None => DType::F32,
    };
    let out = FakeTensor::contiguous(shape, dtype, "cpu");
    let count = numel(op, &out)?;
    ctx.rng.borrow_mut().skip(u64::try_from(count).unwrap_or(0));
    Ok(FakeValue::Tensor(out))
}

fn dropout(
    t: &FakeTensor,
    params: &BTreeMap<String, String>,
    ctx: &mut KernelCtx<'_>,
) -> Result<FakeValue, FakeError> {
    let op = "dropout";
    if let Some(raw) = params.get("p") {
        let p = raw.trim().parse::<f64>().ok().filter(|p| (0.0..=1.0).contains(p));
        if p.is_none() {
            return Err(FakeError::InvalidParam {
                op: op.to_owned(),
                key: "p".to_owned(),
                raw: raw.clone(),
            });
        }
    }
    if param_bool(op, params, "train", true)? {
        let count = numel(op, t)?;
        ctx.rng.borrow_mut().skip(u64::try_from(count).unwrap_or(0));
    }
    Ok(FakeValue::Tensor(t.derive(t.shape.clone(), t.dtype)))
}

#[cfg(test)]
mod tests {
    use super::{KernelCtx, KernelRegistry, execute};
    use crate::rng::RngState;
    use crate::symbols::SymbolEnv;
    use crate::{Dim, FakeError, FakeTensor, FakeValue, Shape};
    use smallvec::smallvec;
    use std::collections::BTreeMap;
    use vt_core::{DType, OpTarget};

    fn tensor(shape: &[i64], dtype: DType) -> FakeValue {
        let shape: Shape = shape.iter().map(|d| Dim::Static(*d)).collect();
        FakeValue::Tensor(FakeTensor::contiguous(shape, dtype, "cpu"))
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn run(
        target: OpTarget,
        args: &[FakeValue],
        params: &BTreeMap<String, String>,
    ) -> Result<FakeValue, FakeError> {
        let mut env = SymbolEnv::new();
        let rng = RngState::shared(0);
        let custom = KernelRegistry::new();
        let mut ctx = KernelCtx {
            env: &mut env,
            rng: &rng,
            custom: &custom,
            capture_scalar_outputs: false,
        };
        execute(&target, args, params, &mut ctx)
    }

    fn shape_of(value: &FakeValue) -> Vec<i64> {
        value.as_tensor().expect("tensor result").size_hints()
    }

    #[test]
    fn add_broadcasts_and_promotes() {
        let out = run(
            OpTarget::Add,
            &[tensor(&[4, 1], DType::I32), tensor(&[3], DType::F32)],
            &BTreeMap::new(),
        )
        .expect("add");
        assert_eq!(shape_of(&out), vec![4, 3]);
        assert_eq!(out.as_tensor().expect("tensor").dtype, DType::F32);
    }

    #[test]
    fn integer_division_is_true_division() {
        let out = run(OpTarget::Div, &[FakeValue::Int(7), FakeValue::Int(2)], &BTreeMap::new())
            .expect("div");
        assert_eq!(out, FakeValue::Float(3.5));
        let out = run(OpTarget::Mod, &[FakeValue::Int(-7), FakeValue::Int(3)], &BTreeMap::new())
            .expect("mod");
        assert_eq!(out, FakeValue::Int(2));
    }

    #[test]
    fn matmul_shapes() {
        let out = run(
            OpTarget::Matmul,
            &[tensor(&[2, 3, 4], DType::F32), tensor(&[4, 5], DType::F32)],
            &BTreeMap::new(),
        )
        .expect("matmul");
        assert_eq!(shape_of(&out), vec![2, 3, 5]);
        let out = run(
            OpTarget::Matmul,
            &[tensor(&[4], DType::F32), tensor(&[4], DType::F32)],
            &BTreeMap::new(),
        )
        .expect("dot");
        assert_eq!(shape_of(&out), Vec::<i64>::new());
        let err = run(
            OpTarget::Matmul,
            &[tensor(&[2, 3], DType::F32), tensor(&[4, 5], DType::F32)],
            &BTreeMap::new(),
        )
        .expect_err("inner mismatch");
        assert!(matches!(err, FakeError::ShapeMismatch { .. }));
    }

    #[test]
    fn reshape_infers_one_dimension() {
        let out = run(
            OpTarget::Reshape,
            &[tensor(&[2, 6], DType::F32)],
            &params(&[("shape", "3,-1")]),
        )
        .expect("reshape");
        assert_eq!(shape_of(&out), vec![3, 4]);
        assert!(
            run(
                OpTarget::Reshape,
                &[tensor(&[2, 6], DType::F32)],
                &params(&[("shape", "5,-1")]),
            )
            .is_err()
        );
    }

    #[test]
    fn reshape_with_overflowing_extent_is_a_shape_error() {
        let err = run(
            OpTarget::Reshape,
            &[tensor(&[4], DType::F32)],
            &params(&[("shape", "4611686018427387904,4,-1")]),
        )
        .expect_err("extent product overflows");
        assert!(matches!(err, FakeError::ShapeMismatch { ref op, .. } if op == "reshape"));

        let huge = tensor(&[i64::MAX, 2], DType::F32);
        assert_eq!(huge.as_tensor().and_then(FakeTensor::numel_hint), None);
        assert!(matches!(
            run(OpTarget::Reshape, &[huge], &params(&[("shape", "-1")])),
            Err(FakeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn transpose_swaps_strides() {
        let out = run(OpTarget::Transpose, &[tensor(&[2, 3], DType::F32)], &BTreeMap::new())
            .expect("transpose");
        let t = out.as_tensor().expect("tensor");
        assert_eq!(t.size_hints(), vec![3, 2]);
        assert_eq!(t.strides.as_slice(), &[1, 3]);
        assert!(!t.is_contiguous());
    }

    #[test]
    fn max_dim_returns_record() {
        let out = run(
            OpTarget::MaxDim,
            &[tensor(&[4, 5], DType::F32)],
            &params(&[("dim", "1")]),
        )
        .expect("max");
        let FakeValue::NamedTuple { fields, values, .. } = out else {
            panic!("expected record result");
        };
        assert_eq!(fields, vec!["values".to_owned(), "indices".to_owned()]);
        assert_eq!(values[1].as_tensor().expect("tensor").dtype, DType::I64);
        assert_eq!(shape_of(&values[0]), vec![4]);
    }

    #[test]
    fn split_produces_views() {
        let out = run(
            OpTarget::Split,
            &[tensor(&[5, 2], DType::F32)],
            &params(&[("split_size", "2")]),
        )
        .expect("split");
        let FakeValue::Tuple(chunks) = out else {
            panic!("expected tuple");
        };
        assert_eq!(chunks.len(), 3);
        assert_eq!(shape_of(&chunks[2]), vec![1, 2]);
        assert_eq!(chunks[2].as_tensor().expect("tensor").storage_offset, 8);
    }

    #[test]
    fn item_is_data_dependent_without_capture() {
        let err = run(OpTarget::Item, &[tensor(&[], DType::F32)], &BTreeMap::new())
            .expect_err("item");
        assert_eq!(
            err,
            FakeError::DataDependent {
                op: "item".to_owned()
            }
        );
    }

    #[test]
    fn item_under_capture_is_unbacked() {
        let mut env = SymbolEnv::new();
        let rng = RngState::shared(0);
        let custom = KernelRegistry::new();
        let mut ctx = KernelCtx {
            env: &mut env,
            rng: &rng,
            custom: &custom,
            capture_scalar_outputs: true,
        };
        let out = execute(&OpTarget::Item, &[tensor(&[1], DType::I64)], &BTreeMap::new(), &mut ctx)
            .expect("captured");
        let FakeValue::SymInt(sym) = out else {
            panic!("expected symbolic int");
        };
        assert_eq!(sym.hint, None);
    }

    #[test]
    fn size_at_returns_symbol_for_symbolic_dim() {
        let mut env = SymbolEnv::new();
        let dim = env.create_dim(8, None);
        let t = FakeValue::Tensor(FakeTensor::contiguous(
            smallvec![dim, Dim::Static(2)],
            DType::F32,
            "cpu",
        ));
        let out = run(OpTarget::SizeAt, &[t], &params(&[("dim", "0")])).expect("size");
        assert!(matches!(out, FakeValue::SymInt(_)));
    }

    #[test]
    fn custom_kernels_dispatch_by_name() {
        let mut env = SymbolEnv::new();
        let rng = RngState::shared(0);
        let mut custom = KernelRegistry::new();
        custom.register(
            "my_identity",
            Box::new(
                |args: &[FakeValue],
                 _params: &BTreeMap<String, String>|
                 -> Result<FakeValue, FakeError> { Ok(args[0].clone()) },
            ),
        );
        let mut ctx = KernelCtx {
            env: &mut env,
            rng: &rng,
            custom: &custom,
            capture_scalar_outputs: false,
        };
        let out = execute(
            &OpTarget::Custom("my_identity".to_owned()),
            &[FakeValue::Int(3)],
            &BTreeMap::new(),
            &mut ctx,
        )
        .expect("custom");
        assert_eq!(out, FakeValue::Int(3));
        let err = execute(
            &OpTarget::Custom("missing".to_owned()),
            &[],
            &BTreeMap::new(),
            &mut ctx,
        )
        .expect_err("unregistered");
        assert!(matches!(err, FakeError::UnsupportedOperator { .. }));
    }

    #[test]
    fn rand_consumes_rng() {
        let mut env = SymbolEnv::new();
        let rng = RngState::shared(0);
        let custom = KernelRegistry::new();
        let before = rng.borrow().snapshot();
        let mut ctx = KernelCtx {
            env: &mut env,
            rng: &rng,
            custom: &custom,
            capture_scalar_outputs: false,
        };
        let out = execute(&OpTarget::Rand, &[], &params(&[("shape", "2,3")]), &mut ctx)
            .expect("rand");
        assert_eq!(shape_of(&out), vec![2, 3]);
        assert_ne!(rng.borrow().snapshot(), before);
    }
}
