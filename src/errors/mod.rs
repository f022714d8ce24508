use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// A single rejected request field, reported back to the client as part of
/// a 400 response.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failure kinds of the columnar serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerErrorKind {
    /// The running memory estimate exceeded `max_memory_bytes`.
    Memory,
    /// The requested codec failed or was invalid.
    Compression,
    /// A stream marker was dropped without recording an outcome.
    Abandoned,
}

impl SerializerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Compression => "compression",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for SerializerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for flapi operations
#[derive(Error, Debug)]
pub enum FlapiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed for {} field(s)", .0.len())]
    Validation(Vec<FieldError>),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Not found: {0}")]
    RouteNotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Cache refresh failed: {0}")]
    Cache(String),

    #[error("Serializer error ({kind}): {message}")]
    Serializer {
        kind: SerializerErrorKind,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("DataFusion error: {0}")]
    Datafusion(#[from] datafusion::error::DataFusionError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] datafusion::arrow::error::ArrowError),

    #[error("Serde Arrow error: {0}")]
    SerdeArrow(#[from] serde_arrow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Template error: {0}")]
    Minijinja(#[from] minijinja::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Tracing From Env Error: {0}")]
    FromEnv(#[from] FromEnvError),
}

impl FlapiError {
    /// Serializer failure with a kind the metrics facet can attribute.
    pub fn serializer(kind: SerializerErrorKind, message: impl Into<String>) -> Self {
        Self::Serializer {
            kind,
            message: message.into(),
        }
    }

    /// Rewrap an engine-level failure, keeping the original text out of
    /// client responses. The full error is logged by the caller.
    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine(err.to_string())
    }
}

/// Convenience Result type that uses FlapiError
pub type Result<T> = std::result::Result<T, FlapiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlapiError::Config("missing template path".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: missing template path"
        );
    }

    #[test]
    fn test_validation_error_counts_fields() {
        let err = FlapiError::Validation(vec![
            FieldError::new("age", "Integer value is less than the minimum allowed"),
            FieldError::new("name", "String is shorter than the minimum length"),
        ]);
        assert!(err.to_string().contains("2 field(s)"));
    }

    #[test]
    fn test_serializer_error_kind() {
        let err = FlapiError::serializer(SerializerErrorKind::Memory, "limit exceeded");
        assert!(err.to_string().contains("memory"));
    }
}
