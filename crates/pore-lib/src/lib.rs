pub mod detectors;
pub mod export;
pub mod io;
pub mod params;
pub mod pipeline;
pub mod signal;
pub mod store;

pub use params::{validate, DetectionConfig, RawParameters, ValidationError};
pub use pipeline::{Message, PipelineOptions, PipelineRun, RunOutcome};
pub use signal::*;
pub use store::{EventStore, StoreError};
