use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// The value or operation result has no symbolic form. The caller
    /// abandons the pass and runs the region eagerly.
    Unrepresentable {
        operation: String,
        runtime_type: String,
        detail: String,
    },
    /// Internal consistency failure inside the tracer.
    InvariantViolation { detail: String },
    ConfigurationConflict(ConfigError),
}

impl TraceError {
    #[must_use]
    pub fn unrepresentable(
        operation: impl Into<String>,
        runtime_type: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Unrepresentable {
            operation: operation.into(),
            runtime_type: runtime_type.into(),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            detail: detail.into(),
        }
    }

    /// Only unrepresentable constructs can be handled by eager fallback.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unrepresentable { .. })
    }
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unrepresentable {
                operation,
                runtime_type,
                detail,
            } => {
                write!(
                    f,
                    "no symbolic representation for {runtime_type} from {operation}"
                )?;
                if !detail.is_empty() {
                    write!(f, ": {detail}")?;
                }
                Ok(())
            }
            Self::InvariantViolation { detail } => write!(f, "tracer invariant violated: {detail}"),
            Self::ConfigurationConflict(err) => write!(f, "configuration conflict: {err}"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigurationConflict(err) => Some(err),
            Self::Unrepresentable { .. } | Self::InvariantViolation { .. } => None,
        }
    }
}

impl From<ConfigError> for TraceError {
    fn from(value: ConfigError) -> Self {
        Self::ConfigurationConflict(value)
    }
}

#[cfg(test)]
mod tests {
    use super::TraceError;
    use crate::config::ConfigError;

    #[test]
    fn only_unrepresentable_is_recoverable() {
        assert!(TraceError::unrepresentable("call_function item", "Foo", "").is_recoverable());
        assert!(!TraceError::invariant("duplicate example").is_recoverable());
        let conflict: TraceError = ConfigError::UnknownOption {
            key: "x".to_owned(),
        }
        .into();
        assert!(!conflict.is_recoverable());
    }

    #[test]
    fn display_names_operation_and_type() {
        let err = TraceError::unrepresentable("call_function mystery_op", "Widget", "");
        assert_eq!(
            err.to_string(),
            "no symbolic representation for Widget from call_function mystery_op"
        );
    }
}
