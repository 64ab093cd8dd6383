//! Core domain models
//!
//! This module defines the fundamental data structures of a pipeline run:
//! steps, the shared context, log entries and the durable session.

pub mod config;
pub mod context;
pub mod log;
pub mod state;
pub mod step;

pub use config::{EngineConfig, ResumeMode, RetryPolicy};
pub use context::*;
pub use log::*;
pub use state::*;
pub use step::*;
