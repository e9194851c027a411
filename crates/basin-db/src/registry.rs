//! # Active Instance Registry
//!
//! Process-wide bookkeeping of live database instances per storage
//! identifier.
//!
//! ## Why Track Instances
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database::open("app.db") ──► reference("app.db")  count = 1            │
//! │  Database::open("app.db") ──► reference("app.db")  count = 2  ⚠ warn    │
//! │                                                                         │
//! │  Database::open("app.db") ──► reference("app.db")  count = 3  ⚠ warn    │
//! │                                                                         │
//! │  All instances keep working. They share one sync lock, so only one      │
//! │  of them streams changes into the file at a time, and one write lock,   │
//! │  so their write leases never overlap.                                   │
//! │                                                                         │
//! │  handle.dispose() / drop(handle)   count - 1, entry removed at 0        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry never holds the database itself, only counters. Handles
//! release themselves on drop if nobody called [`InstanceHandle::dispose`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};

use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
struct Group {
    refcount: usize,
    sync_lock: Arc<Mutex<()>>,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    groups: HashMap<String, Group>,
    warnings: usize,
}

/// Reference-counted table of live instances, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    state: Arc<StdMutex<RegistryState>>,
}

static GLOBAL: OnceLock<InstanceRegistry> = OnceLock::new();

impl InstanceRegistry {
    /// Fresh, empty registry. Tests use this instead of [`InstanceRegistry::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process.
    pub fn global() -> &'static InstanceRegistry {
        GLOBAL.get_or_init(InstanceRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers one more live instance for `identifier`.
    pub fn reference(&self, identifier: impl Into<String>) -> InstanceHandle {
        let identifier = identifier.into();
        let mut state = self.lock();

        let group = state
            .groups
            .entry(identifier.clone())
            .or_insert_with(|| Group {
                refcount: 0,
                sync_lock: Arc::new(Mutex::new(())),
                write_lock: Arc::new(Mutex::new(())),
            });
        group.refcount += 1;
        let refcount = group.refcount;
        let sync_lock = group.sync_lock.clone();
        let write_lock = group.write_lock.clone();

        if refcount > 1 {
            state.warnings += 1;
            warn!(
                identifier = %identifier,
                "Multiple instances for the same database have been detected. \
                 This can cause unexpected results. Close the other instance before opening a new one."
            );
        }
        debug!(identifier = %identifier, refcount, "Database instance referenced");

        InstanceHandle {
            identifier,
            registry: self.clone(),
            sync_lock,
            write_lock,
            disposed: AtomicBool::new(false),
        }
    }

    fn release(&self, identifier: &str) {
        let mut state = self.lock();
        if let Some(group) = state.groups.get_mut(identifier) {
            group.refcount = group.refcount.saturating_sub(1);
            if group.refcount == 0 {
                state.groups.remove(identifier);
            }
        }
        debug!(identifier = %identifier, "Database instance released");
    }

    pub fn live_count(&self, identifier: &str) -> usize {
        self.lock().groups.get(identifier).map_or(0, |g| g.refcount)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().groups.is_empty()
    }

    /// Number of duplicate-instance warnings raised so far.
    pub fn warnings_emitted(&self) -> usize {
        self.lock().warnings
    }
}

/// One registered instance. Releases its slot exactly once.
#[derive(Debug)]
pub struct InstanceHandle {
    identifier: String,
    registry: InstanceRegistry,
    sync_lock: Arc<Mutex<()>>,
    write_lock: Arc<Mutex<()>>,
    disposed: AtomicBool,
}

impl InstanceHandle {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Lock held by whichever instance is currently syncing this identifier.
    pub fn sync_lock(&self) -> Arc<Mutex<()>> {
        self.sync_lock.clone()
    }

    /// Lock taken around every write lease of every instance of this identifier.
    pub fn write_lock(&self) -> Arc<Mutex<()>> {
        self.write_lock.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.registry.release(&self.identifier);
        }
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
