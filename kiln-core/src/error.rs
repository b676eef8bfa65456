use thiserror::Error;

use crate::{RequestPhase, ServiceState};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Model initialization failed: {0}")]
    Initialization(String),

    #[error("Image generation model not available (service is {state})")]
    Unavailable { state: ServiceState },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Encoder `{program}` is unavailable: {reason}")]
    EncoderUnavailable { program: String, reason: String },

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Image generation failed while {phase}: {source}")]
    GenerationFailed {
        phase: RequestPhase,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn initialization(err: impl std::fmt::Display) -> Self {
        Self::Initialization(err.to_string())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    /// Wraps a pipeline failure for the response boundary. Rejections that
    /// happen before any work starts pass through untouched.
    pub fn generation_failed(phase: RequestPhase, source: Error) -> Self {
        match source {
            Self::Unavailable { .. } | Self::InvalidArgument(_) | Self::GenerationFailed { .. } => {
                source
            }
            source => Self::GenerationFailed {
                phase,
                source: Box::new(source),
            },
        }
    }

    /// Whether the caller sent something unusable, as opposed to a failure on
    /// our side.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// Text that is safe to hand back to an HTTP caller. The `Display` impl
    /// keeps the full diagnostic for logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::InvalidArgument(msg) => msg.clone(),
            Self::Unavailable { .. } => "Image generation model not available".to_string(),
            Self::GenerationFailed { phase, .. } => {
                format!("Image generation failed while {phase}")
            }
            Self::Initialization(_) => "Image generation model failed to initialize".to_string(),
            Self::EncoderUnavailable { .. } | Self::Encoding(_) => {
                "Image encoding failed".to_string()
            }
            Self::Inference(_) | Self::Io(_) => "Image generation failed".to_string(),
        }
    }
}
