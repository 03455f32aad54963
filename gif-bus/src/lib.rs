//! Worker pool and order-preserving pipeline stages for parallel GIF
//! encoding.

pub mod error;
pub mod message;
pub mod pool;
pub mod processor;
pub mod reorder;
pub mod stage;
pub mod worker;

pub use error::PipelineError;
pub use pool::WorkerPool;
pub use processor::GifProcessor;
pub use stage::{OnResult, PipelineStage};
pub use worker::Processor;
