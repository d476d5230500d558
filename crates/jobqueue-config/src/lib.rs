//! # Jobqueue Config
//!
//! Configuration for the job queue and its demo driver.
//! Supports layered configuration from files and environment variables,
//! validated on every load, with runtime refresh.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
