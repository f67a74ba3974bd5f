//! # rstchart-runtime
//!
//! Async runtime for rstchart.
//!
//! This crate provides:
//! - A tokio-backed scheduler for delayed sends
//! - A session driver feeding events and fired sends into the engine
//! - Runtime configuration loaded from YAML and the environment

pub mod config;
pub mod driver;
pub mod error;
pub mod scheduler;

pub use config::{Config, ConfigError, DriverConfig, EngineConfig};
pub use driver::{DriverHandle, SessionDriver, SessionUpdate};
pub use error::RuntimeError;
pub use scheduler::TokioScheduler;
