//! Process wiring for the `clusterflow-worker` binary.
//!
//! - [`config`] loads and validates the environment.
//! - [`services`] builds the shared service handles once and spawns the
//!   background tasks for the configured role.

pub mod config;
pub mod services;
