//! Runtime inputs of the compiled artifact and the per-source variable table.

use crate::variable::VarRef;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use vt_cache::GraphArgSignature;
use vt_core::{Source, TraceError, Value};
use vt_fake::{FakeTensor, FakeValue};

/// One runtime input slot.
#[derive(Debug, Clone)]
pub struct GraphArg {
    source: Rc<Source>,
    example: Value,
    fake: Option<FakeTensor>,
    is_unspecialized: bool,
    is_tensor: bool,
}

impl GraphArg {
    /// Rejects abstract examples and tensor examples without an abstract
    /// handle; both indicate a tracer defect.
    pub fn new(
        source: Rc<Source>,
        example: Value,
        fake: Option<FakeTensor>,
        is_unspecialized: bool,
        is_tensor: bool,
    ) -> Result<Self, TraceError> {
        if let Value::Tensor(tensor) = &example {
            if tensor.is_fake {
                return Err(TraceError::invariant(format!(
                    "abstract tensor observed as graph input example for {}",
                    source.name()
                )));
            }
            if fake.is_none() {
                return Err(TraceError::invariant(format!(
                    "tensor graph input {} has no abstract handle",
                    source.name()
                )));
            }
        }
        Ok(Self {
            source,
            example,
            fake,
            is_unspecialized,
            is_tensor,
        })
    }

    #[must_use]
    pub fn source(&self) -> &Rc<Source> {
        &self.source
    }

    #[must_use]
    pub fn example(&self) -> &Value {
        &self.example
    }

    #[must_use]
    pub fn fake(&self) -> Option<&FakeTensor> {
        self.fake.as_ref()
    }

    #[must_use]
    pub fn is_unspecialized(&self) -> bool {
        self.is_unspecialized
    }

    #[must_use]
    pub fn is_tensor(&self) -> bool {
        self.is_tensor
    }

    #[must_use]
    pub fn signature(&self) -> GraphArgSignature {
        GraphArgSignature {
            source: self.source.name(),
            example_type: self.example.type_name(),
            is_tensor: self.is_tensor,
            is_unspecialized: self.is_unspecialized,
        }
    }
}

/// Abstract tensor or symbolic number whose shape guards are derived later.
#[derive(Debug, Clone)]
pub struct TrackedFake {
    pub fake: FakeValue,
    pub source: Rc<Source>,
}

#[derive(Debug, Default)]
pub struct GraphArgRegistry {
    args: Vec<GraphArg>,
    by_source: FxHashMap<String, usize>,
    variables: FxHashMap<String, VarRef>,
}

impl GraphArgRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `arg`; a second input for the same source is an invariant
    /// violation.
    pub fn push(&mut self, arg: GraphArg) -> Result<(), TraceError> {
        let key = arg.source.name();
        if self.by_source.contains_key(&key) {
            return Err(TraceError::invariant(format!(
                "duplicate graph input for source {key}"
            )));
        }
        self.by_source.insert(key, self.args.len());
        self.args.push(arg);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, source_name: &str) -> Option<&GraphArg> {
        self.by_source
            .get(source_name)
            .and_then(|idx| self.args.get(*idx))
    }

    /// Variable already built for a source name.
    #[must_use]
    pub fn lookup(&self, source_name: &str) -> Option<VarRef> {
        self.variables.get(source_name).cloned()
    }

    pub fn remember(&mut self, source_name: String, variable: VarRef) {
        self.variables.insert(source_name, variable);
    }

    #[must_use]
    pub fn args(&self) -> &[GraphArg] {
        &self.args
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    #[must_use]
    pub fn signatures(&self) -> Vec<GraphArgSignature> {
        self.args.iter().map(GraphArg::signature).collect()
    }

    pub(crate) fn into_args(self) -> Vec<GraphArg> {
        self.args
    }
}
