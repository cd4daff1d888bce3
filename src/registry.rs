//! Registered threads and thread id allocation.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Condvar;

use crate::{
    config::{FatalAction, MAIN_THREAD_ID, SuspendConfig},
    error::{FatalKind, SuspendError, SuspendResult, fatal},
    locks::{LockLevel, OrderedMutex},
    safepoint::SafepointState,
    thread::{
        ControllerRegion, Peer, ThreadHandle, ThreadOptions, ThreadState, clear_current,
        current_handle, set_current,
    },
};

/// Fixed-capacity id space handing out the lowest free id first.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    capacity: u16,
    next: u32,
    free: BinaryHeap<Reverse<u16>>,
}

impl IdAllocator {
    pub(crate) fn new(capacity: u16) -> Self {
        Self {
            capacity,
            next: u32::from(MAIN_THREAD_ID),
            free: BinaryHeap::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> Option<u16> {
        if let Some(Reverse(id)) = self.free.pop() {
            return Some(id);
        }
        if self.next > u32::from(self.capacity) {
            return None;
        }
        let id = self.next as u16;
        self.next += 1;
        Some(id)
    }

    pub(crate) fn release(&mut self, id: u16) {
        debug_assert!(id >= MAIN_THREAD_ID && u32::from(id) < self.next);
        self.free.push(Reverse(id));
    }

    pub(crate) fn in_use(&self) -> usize {
        (self.next - u32::from(MAIN_THREAD_ID)) as usize - self.free.len()
    }
}

/// Registry contents guarded by the registry lock.
#[derive(Default)]
pub(crate) struct RegistryList {
    pub(crate) threads: Vec<ThreadHandle>,
    pub(crate) unregistering: usize,
    pub(crate) shut_down: bool,
}

impl RegistryList {
    /// First live match; terminating threads are treated as gone.
    pub(crate) fn find(&self, pred: impl Fn(&ThreadHandle) -> bool) -> Option<ThreadHandle> {
        self.threads
            .iter()
            .find(|t| t.state() != ThreadState::Terminating && pred(t))
            .cloned()
    }
}

/// The set of registered threads.
///
/// Lookups step a running caller out of `Running` for their duration, which
/// makes every lookup a safepoint for that caller.
pub struct ThreadRegistry {
    ids: OrderedMutex<IdAllocator>,
    pub(crate) list: OrderedMutex<RegistryList>,
    /// Signalled when a thread finishes unregistering.
    pub(crate) changed: Condvar,
    registered: AtomicUsize,
    next_serial: AtomicU64,
    pub(crate) safepoint: Arc<SafepointState>,
    capacity: u16,
    action: FatalAction,
}

impl ThreadRegistry {
    pub(crate) fn new(config: &SuspendConfig, safepoint: Arc<SafepointState>) -> Self {
        let action = config.fatal_action;
        Self {
            ids: OrderedMutex::new(
                LockLevel::ThreadIds,
                action,
                IdAllocator::new(config.max_thread_id),
            ),
            list: OrderedMutex::new(LockLevel::Registry, action, RegistryList::default()),
            changed: Condvar::new(),
            registered: AtomicUsize::new(0),
            next_serial: AtomicU64::new(1),
            safepoint,
            capacity: config.max_thread_id,
            action,
        }
    }

    /// Register the calling OS thread.
    ///
    /// Returns once the thread is `Running`. If a suspend-all is in progress
    /// the thread waits for it to end before returning.
    pub fn register(&self, options: ThreadOptions) -> SuspendResult<ThreadHandle> {
        if let Some(existing) = current_handle() {
            fatal(
                self.action,
                FatalKind::DoubleRegistration,
                format_args!(
                    "{:?} is already registered as thread {} ({})",
                    existing.os_thread(),
                    existing.id(),
                    existing.name()
                ),
            );
        }

        let (allocated, ids_in_use) = {
            let mut ids = self.ids.lock();
            (ids.allocate(), ids.in_use())
        };
        let Some(id) = allocated else {
            fatal(
                self.action,
                FatalKind::ThreadIdsExhausted,
                format_args!("all {} thread ids are in use", self.capacity),
            );
        };
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let handle = {
            let mut list = self.list.lock();
            let counts = self.safepoint.counts.lock();
            if list.shut_down {
                drop(counts);
                drop(list);
                self.ids.lock().release(id);
                return Err(SuspendError::ShuttingDown);
            }
            let debug_suspend_count = if options.is_debugger_agent() {
                0
            } else {
                counts.debug_suspend_all_count
            };
            let handle = ThreadHandle::new(
                id,
                serial,
                options,
                debug_suspend_count,
                self.safepoint.clone(),
            );
            handle.refresh_suspend_flag(&counts);
            list.threads.push(handle.clone());
            self.registered.fetch_add(1, Ordering::Release);
            handle
        };

        tracing::debug!(
            thread_id = id,
            name = handle.name(),
            ids_in_use,
            "registered thread"
        );
        set_current(&handle);
        handle.transition_to_running();
        Ok(handle)
    }

    /// Unregister the calling thread, consuming its handle.
    ///
    /// Pending checkpoints run first. The call waits while any suspend reason
    /// still holds the thread, and the id is released only after removal.
    pub fn unregister(&self, handle: ThreadHandle) {
        if !handle.is_current() {
            fatal(
                self.action,
                FatalKind::ForeignThread,
                format_args!("thread {} unregistered from another OS thread", handle.id()),
            );
        }

        if handle.state() == ThreadState::Running {
            handle.transition_out_of_running(ThreadState::Terminating, false);
        } else {
            let counts = self.safepoint.counts.lock();
            handle.set_state_locked(&counts, ThreadState::Terminating);
        }
        self.list.lock().unregistering += 1;

        loop {
            let mut list = self.list.lock();
            let mut counts = self.safepoint.counts.lock();
            if handle.is_suspended_with(&counts) {
                drop(list);
                counts.wait(&self.safepoint.resume_cond);
                continue;
            }
            list.threads.retain(|t| t != &handle);
            self.registered.fetch_sub(1, Ordering::Release);
            break;
        }

        self.ids.lock().release(handle.id());
        self.list.lock().unregistering -= 1;
        self.changed.notify_all();
        clear_current();
        tracing::debug!(thread_id = handle.id(), name = handle.name(), "unregistered thread");
    }

    pub fn find_by_thread_id(&self, id: u16) -> Option<ThreadHandle> {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.list.lock().find(|t| t.id() == id)
    }

    pub fn find_by_peer(&self, peer: Peer) -> Option<ThreadHandle> {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.list.lock().find(|t| t.peer() == Some(peer))
    }

    pub fn find_by_os_thread(&self, os_thread: std::thread::ThreadId) -> Option<ThreadHandle> {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.list.lock().find(|t| t.os_thread() == os_thread)
    }

    /// Copy of the current thread set, terminating threads included.
    pub fn snapshot(&self) -> Vec<ThreadHandle> {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.list.lock().threads.clone()
    }

    /// Call `f` for every registered thread while holding the registry lock.
    /// `f` must not block or call back into the registry.
    pub fn for_each(&self, mut f: impl FnMut(&ThreadHandle)) {
        let _region = ControllerRegion::enter(&self.safepoint);
        let list = self.list.lock();
        for thread in &list.threads {
            f(thread);
        }
    }

    pub fn contains(&self, handle: &ThreadHandle) -> bool {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.list.lock().threads.iter().any(|t| t == handle)
    }

    /// Number of registered threads. Lock-free and possibly stale.
    pub fn len(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Threads between the start and end of `unregister`.
    pub fn unregistering_count(&self) -> usize {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.list.lock().unregistering
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_hands_out_lowest_free_id() {
        let mut ids = IdAllocator::new(8);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(3));
        ids.release(2);
        ids.release(1);
        assert_eq!(ids.in_use(), 1);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(4));
    }

    #[test]
    fn allocator_exhausts_at_capacity() {
        let mut ids = IdAllocator::new(2);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), None);
        ids.release(2);
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), None);
    }

    #[test]
    fn full_id_space_is_usable() {
        let mut ids = IdAllocator::new(u16::MAX);
        let mut last = 0;
        while let Some(id) = ids.allocate() {
            assert_eq!(id, last + 1);
            last = id;
        }
        assert_eq!(last, u16::MAX);
        assert_eq!(ids.in_use(), usize::from(u16::MAX));
    }
}
