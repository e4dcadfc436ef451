//! Core types for the worker bridge session.
//!
//! This crate provides the fundamental building blocks:
//! - Identifiers, build manifests and task manifests
//! - `WorkerBundle` / `WorkerRegistry` - registered bundles and their runs
//! - Coordinator event channels
//! - `Outbox` - bounded drop-oldest queue for offline sends
//! - Collaborator traits (coordinator, API client, builder)

pub mod bundle;
pub mod events;
pub mod execution;
pub mod ids;
pub mod manifest;
pub mod outbox;
pub mod traits;

pub use bundle::{BundleSnapshot, WorkerBundle, WorkerRegistry};
pub use events::{CoordinatorEvents, EventEmitter, event_channels};
pub use execution::{
    ExecutionMetric, LazyAttemptPayload, TaskRunCompletion, TaskRunExecution,
    TaskRunExecutionPayload,
};
pub use ids::{RunId, TaskId, WorkerId};
pub use manifest::{BuildManifest, SourceFile, SourceFileMetadata, TaskDescriptor, WorkerManifest};
pub use outbox::Outbox;
pub use traits::{ApiClient, EnvFileSource, WorkerBuilder, WorkerCoordinator};
