//! Error types for Hull

use thiserror::Error;

/// Result type for Hull operations
pub type Result<T> = std::result::Result<T, HullError>;

/// Hull error types
#[derive(Error, Debug)]
pub enum HullError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("too many containers match {0}")]
    TooMany(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Failed to build OCI spec: {0}")]
    Spec(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HullError {
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "container",
            id: id.into(),
        }
    }

    pub fn volume_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "volume",
            id: name.into(),
        }
    }

    pub fn image_not_found(reference: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "image",
            id: reference.into(),
        }
    }

    pub fn exec_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "exec",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Runtime(RuntimeError {
                    kind: RuntimeErrorKind::NotFound,
                    ..
                })
        )
    }

    /// True when the runtime reported that the target process no longer
    /// exists. These races are treated as success by every lifecycle path.
    pub fn is_process_gone(&self) -> bool {
        matches!(
            self,
            Self::Runtime(RuntimeError {
                kind: RuntimeErrorKind::ProcessGone,
                ..
            })
        )
    }

    /// HTTP-equivalent status code used by the API adapters.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::AlreadyExists(_) => 409,
            Self::InvalidParam(_) | Self::TooMany(_) => 400,
            Self::InvalidState(_) => 409,
            Self::ResourceExhausted(_) => 503,
            Self::Runtime(e) if e.kind == RuntimeErrorKind::NotFound => 404,
            _ => 500,
        }
    }
}

impl From<oci_spec::OciSpecError> for HullError {
    fn from(e: oci_spec::OciSpecError) -> Self {
        Self::Spec(e.to_string())
    }
}

/// Classification of errors returned by the runtime client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// The runtime does not know the container, task or snapshot.
    NotFound,
    /// The process already exited ("no such process").
    ProcessGone,
    /// Anything else.
    Other,
}

/// Opaque error from the external runtime.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    #[source]
    pub source: anyhow::Error,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn other(msg: impl std::fmt::Display) -> Self {
        Self::new(RuntimeErrorKind::Other, anyhow::anyhow!("{}", msg))
    }

    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::new(RuntimeErrorKind::NotFound, anyhow::anyhow!("{}", msg))
    }

    pub fn process_gone(msg: impl std::fmt::Display) -> Self {
        Self::new(RuntimeErrorKind::ProcessGone, anyhow::anyhow!("{}", msg))
    }
}
