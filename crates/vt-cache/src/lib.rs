#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vt_core::{GuardSet, TraceConfig, TraceError};

/// Shape of one graph input as seen by the compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphArgSignature {
    pub source: String,
    pub example_type: String,
    pub is_tensor: bool,
    pub is_unspecialized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardKeyInput {
    pub guards: GuardSet,
    pub graph_args: Vec<GraphArgSignature>,
    pub config: TraceConfig,
    pub graph_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardKey {
    pub namespace: String,
    pub digest_hex: String,
}

impl GuardKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardKeyError {
    ConstantSourceGuard { guard: String },
}

impl std::fmt::Display for GuardKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConstantSourceGuard { guard } => {
                write!(f, "guard {guard} references a constant-provenance source")
            }
        }
    }
}

impl std::error::Error for GuardKeyError {}

impl From<GuardKeyError> for TraceError {
    fn from(value: GuardKeyError) -> Self {
        TraceError::invariant(value.to_string())
    }
}

pub fn build_guard_key(input: &GuardKeyInput) -> Result<GuardKey, GuardKeyError> {
    if let Some(guard) = input
        .guards
        .iter()
        .find(|guard| guard.source().provenance().is_constant())
    {
        return Err(GuardKeyError::ConstantSourceGuard {
            guard: guard.to_string(),
        });
    }

    let payload = canonical_payload(input);
    let digest = Sha256::digest(payload.as_bytes());

    Ok(GuardKey {
        namespace: "vtg".to_owned(),
        digest_hex: bytes_to_hex(&digest),
    })
}

fn canonical_payload(input: &GuardKeyInput) -> String {
    let guards = input
        .guards
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let graph_args = input
        .graph_args
        .iter()
        .map(|arg| {
            format!(
                "{}:{}:t{}:u{}",
                arg.source,
                arg.example_type,
                u8::from(arg.is_tensor),
                u8::from(arg.is_unspecialized)
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    let subclasses = input
        .config
        .traceable_subclass_types
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "guards={}|args={}|specialize_numbers={}|symbolic_shapes={}|export={}|capture_scalars={}|subclasses={}|graph={}",
        guards,
        graph_args,
        input.config.specialize_numbers,
        input.config.symbolic_shapes,
        input.config.export_mode,
        input.config.capture_scalar_outputs,
        subclasses,
        input.graph_fingerprint,
    )
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{GraphArgSignature, GuardKeyInput, build_guard_key};
    use vt_core::{GuardKind, GuardSet, Source, TraceConfig, make_guards};

    fn input(guards: GuardSet) -> GuardKeyInput {
        GuardKeyInput {
            guards,
            graph_args: vec![GraphArgSignature {
                source: "L['x']".to_owned(),
                example_type: "Tensor".to_owned(),
                is_tensor: true,
                is_unspecialized: false,
            }],
            config: TraceConfig::default(),
            graph_fingerprint: "x=placeholder<Tensor>|".to_owned(),
        }
    }

    #[test]
    fn guard_key_is_stable_for_identical_inputs() {
        let guards =
            make_guards(&Source::local("x"), &[GuardKind::TensorMatch]).expect("guardable");
        let a = build_guard_key(&input(guards.clone())).expect("key");
        let b = build_guard_key(&input(guards)).expect("key");
        assert_eq!(a, b);
        assert!(a.as_string().starts_with("vtg-"));
        assert_eq!(a.digest_hex.len(), 64);
    }

    #[test]
    fn guard_key_changes_with_config() {
        let guards =
            make_guards(&Source::local("x"), &[GuardKind::TensorMatch]).expect("guardable");
        let base = input(guards);
        let mut dynamic = base.clone();
        dynamic.config.symbolic_shapes = true;
        assert_ne!(
            build_guard_key(&base).expect("key"),
            build_guard_key(&dynamic).expect("key")
        );
    }

    #[test]
    fn empty_guard_set_still_hashes() {
        let key = build_guard_key(&input(GuardSet::new())).expect("key");
        assert!(!key.digest_hex.is_empty());
    }
}
