//! Pipeline execution: log stream, task runner, stages and the engine

pub mod engine;
pub mod log_stream;
pub mod runner;
pub mod stages;

pub use engine::{EngineError, PipelineEngine};
pub use log_stream::{EventHub, LogStream, Subscription};
pub use runner::{SequenceError, TaskError, TaskLogger, TaskRunner, UnitJob, WorkUnit};
