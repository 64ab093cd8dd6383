//! forgeline - a resumable, checkpointed generation pipeline
//!
//! Raw requirements go through six stages (analysis, a human-input gate,
//! visuals, documents, source and audit) to produce an artifact bundle.
//! Progress is persisted after every change so a run can be restored and
//! resumed.

pub mod cli;
pub mod core;
pub mod execution;
pub mod generator;
pub mod persistence;

// Re-export commonly used types
pub use core::{
    EngineConfig, PipelineContext, PipelineSession, PipelineStatus, Stage, Step, StepStatus,
};
pub use execution::{EngineError, LogStream, PipelineEngine, TaskRunner, WorkUnit};
pub use generator::{CommandGenerator, ContentGenerator, GenerationError};
pub use persistence::{InMemorySessionStore, SessionStore};
