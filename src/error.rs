use std::sync::Arc;

use gif_bus::PipelineError;
use thiserror::Error;

/// Failures reported by the frame encoder.
///
/// `Clone` so that a closed encoder can report the same outcome on every
/// later `close`.
#[derive(Debug, Clone, Error)]
pub enum EncoderError {
    #[error("encoder is closed")]
    Closed,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start encoder: {0}")]
    Setup(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A stage failed; the first failure in frame order.
    #[error("error while writing GIF frame")]
    Frame(#[source] PipelineError),

    /// The close-time flush failed on top of an earlier frame failure.
    #[error("failed to close encoder: {primary}")]
    Close {
        #[source]
        primary: Box<EncoderError>,
        suppressed: PipelineError,
    },
}

impl From<std::io::Error> for EncoderError {
    fn from(e: std::io::Error) -> Self {
        EncoderError::Io(Arc::new(e))
    }
}

impl From<PipelineError> for EncoderError {
    fn from(e: PipelineError) -> Self {
        EncoderError::Frame(e)
    }
}

impl EncoderError {
    /// The underlying stage failure, if this error carries one.
    pub fn pipeline_error(&self) -> Option<&PipelineError> {
        match self {
            EncoderError::Frame(e) => Some(e),
            EncoderError::Close { suppressed, .. } => Some(suppressed),
            _ => None,
        }
    }
}
