use crate::kernels::{self, KernelCtx, KernelRegistry};
use crate::rng::{PreservedRng, SharedRng};
use crate::symbols::SymbolEnv;
use crate::{Dim, FakeError, FakeTensor, FakeValue, Shape};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use vt_core::{ObjectId, OpTarget, Source, TensorClass, TensorObj};

/// Produces data-free counterparts of real tensors.
pub trait AbstractTensorFactory {
    fn from_real(
        &mut self,
        tensor: &TensorObj,
        static_shapes: bool,
        source: Option<&Source>,
    ) -> Result<FakeTensor, FakeError>;
}

/// Owns the symbol environment and kernel registry of one pass and shares
/// the process random state with the interpreter.
#[derive(Debug)]
pub struct FakeTensorMode {
    env: SymbolEnv,
    rng: SharedRng,
    kernels: KernelRegistry,
    capture_scalar_outputs: bool,
    memo: FxHashMap<ObjectId, FakeTensor>,
}

impl FakeTensorMode {
    #[must_use]
    pub fn new(rng: SharedRng) -> Self {
        Self {
            env: SymbolEnv::new(),
            rng,
            kernels: KernelRegistry::new(),
            capture_scalar_outputs: false,
            memo: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_capture_scalar_outputs(mut self, enabled: bool) -> Self {
        self.capture_scalar_outputs = enabled;
        self
    }

    #[must_use]
    pub fn env(&self) -> &SymbolEnv {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut SymbolEnv {
        &mut self.env
    }

    #[must_use]
    pub fn rng(&self) -> &SharedRng {
        &self.rng
    }

    pub fn kernels_mut(&mut self) -> &mut KernelRegistry {
        &mut self.kernels
    }

    /// Runs the kernel for `target` on abstract arguments.
    pub fn run(
        &mut self,
        target: &OpTarget,
        args: &[FakeValue],
        params: &BTreeMap<String, String>,
    ) -> Result<FakeValue, FakeError> {
        let mut ctx = KernelCtx {
            env: &mut self.env,
            rng: &self.rng,
            custom: &self.kernels,
            capture_scalar_outputs: self.capture_scalar_outputs,
        };
        kernels::execute(target, args, params, &mut ctx)
    }

    /// Like [`Self::run`], with the random state restored afterwards.
    pub fn run_preserving_rng(
        &mut self,
        target: &OpTarget,
        args: &[FakeValue],
        params: &BTreeMap<String, String>,
    ) -> Result<FakeValue, FakeError> {
        let _preserved = PreservedRng::new(&self.rng);
        self.run(target, args, params)
    }
}

impl AbstractTensorFactory for FakeTensorMode {
    fn from_real(
        &mut self,
        tensor: &TensorObj,
        static_shapes: bool,
        source: Option<&Source>,
    ) -> Result<FakeTensor, FakeError> {
        if let Some(cached) = self.memo.get(&tensor.id) {
            return Ok(cached.clone());
        }
        if tensor.shape.iter().any(|dim| *dim < 0) || tensor.strides.len() != tensor.shape.len() {
            return Err(FakeError::TypeMismatch {
                op: "from_real".to_owned(),
                detail: format!(
                    "malformed tensor metadata: shape {:?}, strides {:?}",
                    tensor.shape, tensor.strides
                ),
            });
        }

        let static_shapes = static_shapes || source.is_none();
        let base_name = source.map(Source::name);
        let shape = tensor
            .shape
            .iter()
            .enumerate()
            .map(|(idx, size)| {
                if static_shapes {
                    Dim::Static(*size)
                } else {
                    let name = base_name
                        .as_ref()
                        .map(|base| format!("{base}.size()[{idx}]"));
                    self.env.create_dim(*size, name.as_deref())
                }
            })
            .collect::<Shape>();

        let fake = FakeTensor {
            shape,
            strides: tensor.strides.iter().copied().collect(),
            storage_offset: tensor.storage_offset,
            dtype: tensor.dtype,
            device: tensor.device.clone(),
            requires_grad: tensor.requires_grad,
            is_parameter: tensor.is_parameter(),
            subclass: match &tensor.class {
                TensorClass::Subclass(name) => Some(name.clone()),
                TensorClass::Base | TensorClass::Parameter => None,
            },
        };
        self.memo.insert(tensor.id, fake.clone());
        Ok(fake)
    }
}
