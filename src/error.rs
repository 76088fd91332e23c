use thiserror::Error;

/// Error kinds surfaced by the engine.
///
/// Only `Config` and `HardImageMismatch` abort a job; everything else is
/// folded into per-pair or per-task results so a run keeps going.
#[derive(Debug, Clone, Error)]
pub enum VrtError {
    #[error("configuration invalid: {}", issues.join("; "))]
    Config { issues: Vec<String> },

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("engine '{engine}' failed: {message}")]
    EngineFailure { engine: String, message: String },

    #[error("capture failed: {0}")]
    CaptureFailure(String),

    #[error("aborted")]
    Aborted,

    #[error("engine binary not found: {0}")]
    MissingEngineBinary(String),

    #[error("required capture images unavailable: {}", missing.join(", "))]
    HardImageMismatch { missing: Vec<String> },

    #[error("vision provider error: {0}")]
    Vision(String),

    #[error("capture worker protocol error: {0}")]
    WorkerProtocol(String),
}

impl VrtError {
    pub fn config(issue: impl Into<String>) -> Self {
        VrtError::Config {
            issues: vec![issue.into()],
        }
    }

    /// Whether the error terminates the whole job rather than one item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VrtError::Config { .. } | VrtError::HardImageMismatch { .. }
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, VrtError::Aborted)
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            VrtError::Config { .. } | VrtError::HardImageMismatch { .. } => ErrorSeverity::High,
            VrtError::MissingEngineBinary(_) => ErrorSeverity::Low,
            VrtError::Aborted => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<std::io::Error> for VrtError {
    fn from(err: std::io::Error) -> Self {
        VrtError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VrtError {
    fn from(err: serde_json::Error) -> Self {
        VrtError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for VrtError {
    fn from(err: image::ImageError) -> Self {
        VrtError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VrtError>;
