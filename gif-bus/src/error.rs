use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the worker pool and the pipeline stages.
///
/// The type is `Clone` because a stage keeps the first failure as its sticky
/// error and hands a copy to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The request never reached the worker, or the worker went away before
    /// replying.
    #[error("failed to dispatch {request} to worker {worker}: {reason}")]
    Transport {
        worker: usize,
        request: String,
        reason: String,
    },

    /// The unit of work ran and failed.
    #[error("worker {worker} failed processing {request}: {message}")]
    Computation {
        worker: usize,
        request: String,
        message: String,
    },

    #[error("timed out after {0:?} waiting for pipeline capacity")]
    BackpressureTimeout(Duration),

    #[error("ordering violation: expected sequence {expected}, received {received}")]
    OrderingViolation { expected: u64, received: u64 },

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("pipeline stage {0} is closed")]
    StageClosed(String),

    /// The result callback of a stage failed (sink I/O, downstream stage).
    #[error("stage {stage} failed to emit sequence {seq}: {message}")]
    Emit {
        stage: String,
        seq: u64,
        message: String,
    },
}

impl PipelineError {
    /// Sequence-independent failures that a caller may see without any item
    /// having been dispatched.
    pub fn is_closed(&self) -> bool {
        matches!(self, PipelineError::PoolClosed | PipelineError::StageClosed(_))
    }
}
