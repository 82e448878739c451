//! The stateless memory extraction pipeline, run on demand for one user at a time.

pub mod parsing;
pub mod pipeline;

pub use pipeline::{ExtractionConfig, ExtractionError, ExtractionPipeline};
