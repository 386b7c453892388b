use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Flags consulted by the wrapping decision tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    pub specialize_numbers: bool,
    pub symbolic_shapes: bool,
    pub traceable_subclass_types: BTreeSet<String>,
    pub export_mode: bool,
    pub capture_scalar_outputs: bool,
}

const KNOWN_KEYS: [&str; 5] = [
    "specialize_numbers",
    "symbolic_shapes",
    "traceable_subclass_types",
    "export_mode",
    "capture_scalar_outputs",
];

const BASE_TENSOR_TYPES: [&str; 2] = ["Tensor", "Parameter"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownOption { key: String },
    InvalidFlag { key: String, raw: String },
    BaseTypeAsSubclass { type_name: String },
    ConflictingFlags { first: &'static str, second: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOption { key } => write!(f, "unknown trace option '{key}'"),
            Self::InvalidFlag { key, raw } => {
                write!(f, "option '{key}' expects a boolean, got '{raw}'")
            }
            Self::BaseTypeAsSubclass { type_name } => write!(
                f,
                "base tensor type '{type_name}' cannot be listed as a traceable subclass"
            ),
            Self::ConflictingFlags { first, second } => {
                write!(f, "options '{first}' and '{second}' cannot both be enabled")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl TraceConfig {
    /// Parses a string-keyed options map. Missing keys keep their defaults.
    pub fn from_options(opts: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        if let Some(key) = opts.keys().find(|key| !KNOWN_KEYS.contains(&key.as_str())) {
            return Err(ConfigError::UnknownOption { key: key.clone() });
        }

        let config = Self {
            specialize_numbers: parse_flag(opts, "specialize_numbers")?,
            symbolic_shapes: parse_flag(opts, "symbolic_shapes")?,
            traceable_subclass_types: parse_type_list(opts, "traceable_subclass_types"),
            export_mode: parse_flag(opts, "export_mode")?,
            capture_scalar_outputs: parse_flag(opts, "capture_scalar_outputs")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(type_name) = self
            .traceable_subclass_types
            .iter()
            .find(|name| BASE_TENSOR_TYPES.contains(&name.as_str()))
        {
            return Err(ConfigError::BaseTypeAsSubclass {
                type_name: type_name.clone(),
            });
        }
        if self.capture_scalar_outputs && self.specialize_numbers {
            return Err(ConfigError::ConflictingFlags {
                first: "capture_scalar_outputs",
                second: "specialize_numbers",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_traceable_subclass(&self, type_name: &str) -> bool {
        self.traceable_subclass_types.contains(type_name)
    }
}

fn parse_flag(opts: &BTreeMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    match opts.get(key) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            _ => Err(ConfigError::InvalidFlag {
                key: key.to_owned(),
                raw: raw.clone(),
            }),
        },
    }
}

fn parse_type_list(opts: &BTreeMap<String, String>, key: &str) -> BTreeSet<String> {
    opts.get(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, TraceConfig};
    use std::collections::BTreeMap;

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn defaults_are_all_off() {
        let config = TraceConfig::from_options(&BTreeMap::new()).expect("empty options parse");
        assert_eq!(config, TraceConfig::default());
    }

    #[test]
    fn parses_flags_and_type_list() {
        let config = TraceConfig::from_options(&opts(&[
            ("symbolic_shapes", "1"),
            ("export_mode", "TRUE"),
            ("traceable_subclass_types", "MaskedTensor, FunctionalTensor"),
        ]))
        .expect("options parse");
        assert!(config.symbolic_shapes);
        assert!(config.export_mode);
        assert!(!config.specialize_numbers);
        assert!(config.is_traceable_subclass("MaskedTensor"));
        assert!(config.is_traceable_subclass("FunctionalTensor"));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_flags() {
        let err = TraceConfig::from_options(&opts(&[("dynamic", "true")])).expect_err("unknown");
        assert_eq!(
            err,
            ConfigError::UnknownOption {
                key: "dynamic".to_owned()
            }
        );
        let err =
            TraceConfig::from_options(&opts(&[("symbolic_shapes", "maybe")])).expect_err("bad");
        assert!(matches!(err, ConfigError::InvalidFlag { .. }));
    }

    #[test]
    fn conflicting_flags_are_reported() {
        let err = TraceConfig::from_options(&opts(&[
            ("capture_scalar_outputs", "true"),
            ("specialize_numbers", "true"),
        ]))
        .expect_err("conflict");
        assert!(matches!(err, ConfigError::ConflictingFlags { .. }));

        let err = TraceConfig::from_options(&opts(&[("traceable_subclass_types", "Parameter")]))
            .expect_err("base type");
        assert_eq!(
            err,
            ConfigError::BaseTypeAsSubclass {
                type_name: "Parameter".to_owned()
            }
        );
    }
}
