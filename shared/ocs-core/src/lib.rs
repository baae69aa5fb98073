//! OCS Core - Shared service infrastructure for the charging platform
//!
//! This crate provides:
//! - The lifecycle trait charging services implement, with a drain phase
//!   for in-flight CDRs and pending account writes
//! - A runtime that serves until shutdown, then drains within a bounded
//!   window
//! - Error handling utilities

pub mod error;
pub mod service;

pub use error::{OcsError, Result};
pub use service::{DependencyStatus, OcsService, ServiceRuntime, ServiceState, ServiceStatus};
