//! Frame pipeline: merge check, delta planning, then the two worker stages.
//!
//! Data Flow:
//! ```text
//!                     ┌─► merged (progress only)
//!                     │
//! Frame ──► similar? ─┤
//!                     │
//!                     └─► Canvas::plan ──► quantize stage ──► quantized merge? ──► encode stage ──► sink
//! ```

pub mod encoder;
pub mod optimize;
pub mod similarity;
pub mod types;
