//! # Vivian Core
//!
//! Configuration and error types shared by the event bus, the scheduler
//! and the `vivian` binary.

pub mod config;
pub mod error;
pub mod util;

pub use config::{EventBusConfig, SchedulerConfig, VivianConfig};
pub use error::{Result, VivianError};
