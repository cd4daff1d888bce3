//! The thread list: registered threads plus every way of stopping them.
//!
//! [`ThreadList`] is the runtime context object. Its operations are split by
//! concern:
//!
//! - `suspend`: stop-the-world and single-thread suspension
//! - `debugger`: debugger-driven suspension counters
//! - `checkpoint`: per-thread work without a full stop
//! - `flip`: root flips for concurrent collectors
//! - `scoped`: RAII stop-the-world
//! - `dump`, `shutdown`: diagnostics and teardown

mod checkpoint;
mod debugger;
mod dump;
mod flip;
mod scoped;
mod shutdown;
mod suspend;

use std::sync::Arc;

use crate::{
    config::SuspendConfig,
    error::SuspendResult,
    registry::ThreadRegistry,
    safepoint::{SafepointState, SuspendStats, SuspendStatsSnapshot},
    thread::{ControllerRegion, Peer, ThreadHandle, ThreadOptions, current_handle},
};

pub use flip::FlipCollector;
pub use scoped::ScopedWorldSuspension;

/// Owner of the registry, the global suspend state and the world lock.
///
/// # Examples
///
/// ```
/// use threadlist::{SuspendConfig, ThreadList};
///
/// let list = ThreadList::new(SuspendConfig::default());
/// {
///     let world = list.suspend_all_scoped("heap verification", false);
///     assert!(list.is_world_stopped());
///     assert_eq!(world.cause(), "heap verification");
/// }
/// assert!(!list.is_world_stopped());
/// assert_eq!(list.suspend_all_count(), 0);
/// ```
pub struct ThreadList {
    registry: ThreadRegistry,
    safepoint: Arc<SafepointState>,
    config: SuspendConfig,
    stats: SuspendStats,
}

impl ThreadList {
    pub fn new(config: SuspendConfig) -> Arc<Self> {
        let safepoint = Arc::new(SafepointState::new(config.fatal_action));
        let registry = ThreadRegistry::new(&config, safepoint.clone());
        tracing::debug!(
            max_thread_id = config.max_thread_id,
            suspend_timeout_ms = config.suspend_timeout.as_millis() as u64,
            "thread list created"
        );
        Arc::new(Self {
            registry,
            safepoint,
            config,
            stats: SuspendStats::new(),
        })
    }

    pub fn config(&self) -> &SuspendConfig {
        &self.config
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Register the calling OS thread. See [`ThreadRegistry::register`].
    pub fn register(&self, options: ThreadOptions) -> SuspendResult<ThreadHandle> {
        self.registry.register(options)
    }

    /// Unregister the calling thread. See [`ThreadRegistry::unregister`].
    pub fn unregister(&self, handle: ThreadHandle) {
        self.registry.unregister(handle)
    }

    pub fn snapshot(&self) -> Vec<ThreadHandle> {
        self.registry.snapshot()
    }

    pub fn for_each(&self, f: impl FnMut(&ThreadHandle)) {
        self.registry.for_each(f)
    }

    pub fn find_by_thread_id(&self, id: u16) -> Option<ThreadHandle> {
        self.registry.find_by_thread_id(id)
    }

    pub fn find_by_peer(&self, peer: Peer) -> Option<ThreadHandle> {
        self.registry.find_by_peer(peer)
    }

    pub fn find_by_os_thread(&self, os_thread: std::thread::ThreadId) -> Option<ThreadHandle> {
        self.registry.find_by_os_thread(os_thread)
    }

    pub fn contains(&self, handle: &ThreadHandle) -> bool {
        self.registry.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Current number of outstanding suspend-alls. Lock-free.
    pub fn suspend_all_count(&self) -> u32 {
        self.safepoint.suspend_all_hint()
    }

    pub fn debug_suspend_all_count(&self) -> u32 {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.safepoint.counts.lock().debug_suspend_all_count
    }

    /// True while some controller holds the world lock exclusively.
    pub fn is_world_stopped(&self) -> bool {
        self.safepoint.world.is_locked_exclusive()
    }

    pub fn suspend_stats(&self) -> SuspendStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_suspend_stats(&self) {
        self.stats.reset()
    }

    /// The caller's handle, if it is registered with this list.
    pub(crate) fn own_handle(&self) -> Option<ThreadHandle> {
        current_handle().filter(|handle| handle.belongs_to(&self.safepoint))
    }
}
