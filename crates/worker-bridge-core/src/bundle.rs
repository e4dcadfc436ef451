//! Registered worker bundles and the concurrent set that tracks them.
//!
//! Inbound messages are handled concurrently, so the bundle set is read and
//! written from many tasks at once. The registry lock only guards membership;
//! each bundle's in-progress runs sit behind the bundle's own lock, so runs on
//! different bundles never contend.
//!
//! Only the most recently registered bundle is current. Older bundles are
//! retired as soon as they are idle; a bundle with runs still executing stays
//! tracked, marked draining, until its last run finishes.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};

use crate::{
    ids::{RunId, WorkerId},
    manifest::{BuildManifest, WorkerManifest},
};

/// Server-acknowledged form of a build artifact.
#[derive(Debug)]
pub struct WorkerBundle {
    id: WorkerId,
    build: BuildManifest,
    manifest: WorkerManifest,
    env: HashMap<String, String>,
    in_progress: Mutex<BTreeSet<RunId>>,
    draining: AtomicBool,
}

impl WorkerBundle {
    /// Create a bundle for a build the control plane accepted.
    #[must_use]
    pub fn new(
        id: WorkerId,
        build: BuildManifest,
        manifest: WorkerManifest,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            build,
            manifest,
            env,
            in_progress: Mutex::new(BTreeSet::new()),
            draining: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &WorkerId {
        &self.id
    }

    #[must_use]
    pub const fn build(&self) -> &BuildManifest {
        &self.build
    }

    #[must_use]
    pub const fn manifest(&self) -> &WorkerManifest {
        &self.manifest
    }

    /// Environment the bundle's worker process runs with.
    #[must_use]
    pub const fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Record a run as in progress. Returns `false` if it already was.
    pub fn start_run(&self, run_id: RunId) -> bool {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id)
    }

    /// Clear a run. Returns `false` if it was not in progress.
    pub fn finish_run(&self, run_id: &RunId) -> bool {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)
    }

    /// Runs currently executing under this bundle, in id order.
    #[must_use]
    pub fn in_progress_runs(&self) -> Vec<RunId> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Whether a newer bundle has replaced this one.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn is_idle(&self) -> bool {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> BundleSnapshot {
        BundleSnapshot {
            id: self.id.clone(),
            in_progress_runs: self.in_progress_runs(),
        }
    }
}

/// Point-in-time view of a registered bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSnapshot {
    pub id: WorkerId,
    pub in_progress_runs: Vec<RunId>,
}

/// Set of registered bundles, in registration order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    bundles: RwLock<Vec<Arc<WorkerBundle>>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a bundle. Re-inserting an already tracked id is a no-op and
    /// returns `false`.
    pub fn insert(&self, bundle: Arc<WorkerBundle>) -> bool {
        let mut bundles = self
            .bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if bundles.iter().any(|b| b.id == bundle.id) {
            return false;
        }
        bundles.push(bundle);
        true
    }

    #[must_use]
    pub fn get(&self, id: &WorkerId) -> Option<Arc<WorkerBundle>> {
        self.bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|b| &b.id == id)
            .cloned()
    }

    /// Mark every bundle other than `current` as draining and stop tracking
    /// the ones with no runs in progress. Returns the ids no longer tracked.
    pub fn supersede(&self, current: &WorkerId) -> Vec<WorkerId> {
        let mut bundles = self
            .bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut retired = Vec::new();
        bundles.retain(|bundle| {
            if &bundle.id == current {
                return true;
            }
            bundle.draining.store(true, Ordering::Release);
            if bundle.is_idle() {
                retired.push(bundle.id.clone());
                false
            } else {
                true
            }
        });
        retired
    }

    /// Stop tracking `id` if it is draining and its last run has finished.
    /// Returns `true` if the bundle was retired.
    pub fn retire_if_drained(&self, id: &WorkerId) -> bool {
        let mut bundles = self
            .bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(index) = bundles
            .iter()
            .position(|b| &b.id == id && b.is_draining() && b.is_idle())
        else {
            return false;
        };
        bundles.remove(index);
        true
    }

    /// Snapshot every bundle. Each bundle's run set is read under its own
    /// lock after the membership lock is released.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BundleSnapshot> {
        let bundles: Vec<_> = self
            .bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        bundles.iter().map(|b| b.snapshot()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
