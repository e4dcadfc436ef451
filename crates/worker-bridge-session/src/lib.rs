//! Build lifecycle and session orchestration for the worker bridge.
//!
//! Provides:
//! - `SessionConfig` - explicit session configuration
//! - Environment layering and manifest validation
//! - `BuildLifecycleManager` - dedup, validate, publish and register builds
//! - `SessionOrchestrator` - wires the coordinator to the control server
//! - `LocalCoordinator` - in-process coordinator over a `TaskLauncher`

pub mod config;
pub mod coordinator;
pub mod env;
pub mod lifecycle;
pub mod orchestrator;
pub mod validation;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, SessionConfig};
pub use coordinator::{LaunchOutcome, LocalCoordinator, RunHeartbeat, TaskLauncher};
pub use env::{EnvLayers, NoEnvFile, resolve_environment};
pub use lifecycle::{BuildLifecycleManager, BuildOutcome, LifecycleError, LifecycleEvent};
pub use orchestrator::{SessionError, SessionOrchestrator};
pub use validation::{ValidationIssue, ValidationReport, validate_worker_manifest};
