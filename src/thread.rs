//! Per-thread handles and the thread side of the safepoint protocol.
//!
//! A [`ThreadHandle`] is created by [`ThreadList::register`] on the thread it
//! describes. While the thread is `Running` it holds the world lock shared and
//! must call [`ThreadHandle::poll`] regularly; around blocking calls it leaves
//! `Running` with [`ThreadHandle::blocking`].
//!
//! # Examples
//!
//! ```
//! use threadlist::{SuspendConfig, ThreadList, ThreadOptions, ThreadState};
//!
//! let list = ThreadList::new(SuspendConfig::default());
//! let handle = list.register(ThreadOptions::new("worker")).unwrap();
//! assert_eq!(handle.id(), threadlist::MAIN_THREAD_ID);
//! assert_eq!(handle.state(), ThreadState::Running);
//!
//! handle.poll();
//! let answer = handle.blocking(|| 6 * 7);
//! assert_eq!(answer, 42);
//!
//! list.unregister(handle);
//! assert!(list.is_empty());
//! ```
//!
//! [`ThreadList::register`]: crate::ThreadList::register

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    num::NonZeroU64,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    thread::{self, ThreadId},
};

use bitflags::bitflags;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::{
    checkpoint::Checkpoint,
    error::{FatalKind, fatal},
    safepoint::{SafepointState, SuspendCounts, SuspendReasons, is_effectively_suspended},
};

bitflags! {
    /// Requests pending on a thread, read by the poll fast path.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        const SUSPEND_REQUEST = 1;
        const CHECKPOINT_REQUEST = 1 << 1;
        const FLIP_PENDING = 1 << 2;
    }
}

/// Lifecycle state of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Inserted in the registry, not yet allowed to run managed code.
    Starting = 0,
    /// Running managed code and holding the world lock shared.
    Running = 1,
    /// Parked at a poll, inside a blocking call, or driving a suspension.
    Suspended = 2,
    /// Unregistering.
    Terminating = 3,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Starting,
            1 => ThreadState::Running,
            2 => ThreadState::Suspended,
            _ => ThreadState::Terminating,
        }
    }
}

/// Opaque token for the managed object that represents a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer(NonZeroU64);

impl Peer {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Peer)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Produces a free-form native stack and state dump for one thread.
pub trait StackDumper: Send + Sync {
    fn dump_stack(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

/// Attributes of a thread being registered.
#[derive(Clone, Default)]
pub struct ThreadOptions {
    name: String,
    peer: Option<Peer>,
    daemon: bool,
    debugger_agent: bool,
    stack_dumper: Option<Arc<dyn StackDumper>>,
}

impl ThreadOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn peer(mut self, peer: Peer) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Daemon threads do not hold up shutdown.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Debugger agents are never suspended by debugger-wide requests.
    pub fn debugger_agent(mut self, agent: bool) -> Self {
        self.debugger_agent = agent;
        self
    }

    pub fn stack_dumper(mut self, dumper: Arc<dyn StackDumper>) -> Self {
        self.stack_dumper = Some(dumper);
        self
    }

    pub(crate) fn is_debugger_agent(&self) -> bool {
        self.debugger_agent
    }
}

struct ThreadInner {
    id: u16,
    serial: u64,
    os_thread: ThreadId,
    native_tid: u64,
    name: String,
    peer: Option<Peer>,
    daemon: bool,
    debugger_agent: bool,
    state: AtomicU8,
    flags: CachePadded<AtomicU32>,
    // Both counts change only under the suspend-state lock.
    suspend_count: AtomicU32,
    debug_suspend_count: AtomicU32,
    controlling: AtomicBool,
    parked_in_poll: AtomicBool,
    checkpoints: Mutex<VecDeque<Arc<dyn Checkpoint>>>,
    flip: Mutex<Option<Arc<dyn Checkpoint>>>,
    dumper: Option<Arc<dyn StackDumper>>,
    safepoint: Arc<SafepointState>,
}

/// Shared handle to a registered thread.
#[derive(Clone)]
pub struct ThreadHandle {
    inner: Arc<ThreadInner>,
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

/// Handle registered by the calling OS thread, if any.
pub fn current_handle() -> Option<ThreadHandle> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn set_current(handle: &ThreadHandle) {
    CURRENT.with(|current| *current.borrow_mut() = Some(handle.clone()));
}

pub(crate) fn clear_current() {
    CURRENT.with(|current| current.borrow_mut().take());
}

#[cfg(target_os = "linux")]
pub(crate) fn native_thread_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn native_thread_id() -> u64 {
    // SAFETY: pthread_self is always safe to call.
    unsafe { libc::pthread_self() as usize as u64 }
}

#[cfg(not(unix))]
pub(crate) fn native_thread_id() -> u64 {
    0
}

impl ThreadHandle {
    pub(crate) fn new(
        id: u16,
        serial: u64,
        options: ThreadOptions,
        debug_suspend_count: u32,
        safepoint: Arc<SafepointState>,
    ) -> Self {
        let flags = if debug_suspend_count > 0 {
            ThreadFlags::SUSPEND_REQUEST
        } else {
            ThreadFlags::empty()
        };
        Self {
            inner: Arc::new(ThreadInner {
                id,
                serial,
                os_thread: thread::current().id(),
                native_tid: native_thread_id(),
                name: options.name,
                peer: options.peer,
                daemon: options.daemon,
                debugger_agent: options.debugger_agent,
                state: AtomicU8::new(ThreadState::Starting as u8),
                flags: CachePadded::new(AtomicU32::new(flags.bits())),
                suspend_count: AtomicU32::new(0),
                debug_suspend_count: AtomicU32::new(debug_suspend_count),
                controlling: AtomicBool::new(false),
                parked_in_poll: AtomicBool::new(false),
                checkpoints: Mutex::new(VecDeque::new()),
                flip: Mutex::new(None),
                dumper: options.stack_dumper,
                safepoint,
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Never reused, unlike the id.
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn peer(&self) -> Option<Peer> {
        self.inner.peer
    }

    pub fn is_daemon(&self) -> bool {
        self.inner.daemon
    }

    pub fn is_debugger_agent(&self) -> bool {
        self.inner.debugger_agent
    }

    pub fn os_thread(&self) -> ThreadId {
        self.inner.os_thread
    }

    pub fn native_tid(&self) -> u64 {
        self.inner.native_tid
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    pub fn suspend_count(&self) -> u32 {
        self.inner.suspend_count.load(Ordering::Acquire)
    }

    pub fn debug_suspend_count(&self) -> u32 {
        self.inner.debug_suspend_count.load(Ordering::Acquire)
    }

    pub fn is_suspend_pending(&self) -> bool {
        self.flags().contains(ThreadFlags::SUSPEND_REQUEST)
    }

    /// Racy snapshot of every reason currently holding this thread.
    pub fn suspend_reasons(&self) -> SuspendReasons {
        SuspendReasons {
            suspend_all_count: self.inner.safepoint.suspend_all_hint(),
            is_controller: self.inner.controlling.load(Ordering::Acquire),
            debug_suspend_count: self.debug_suspend_count(),
            suspend_count: self.suspend_count(),
        }
    }

    pub fn is_effectively_suspended(&self) -> bool {
        self.suspend_reasons().is_effectively_suspended()
    }

    /// True when called on the OS thread this handle describes.
    pub fn is_current(&self) -> bool {
        self.inner.os_thread == thread::current().id()
    }

    /// Safepoint poll.
    ///
    /// Runs pending flips and checkpoints, then parks while any suspend
    /// reason holds this thread. Only the owning thread may poll.
    #[inline]
    pub fn poll(&self) {
        if self.inner.flags.load(Ordering::Acquire) == 0 {
            return;
        }
        self.poll_slow();
    }

    #[cold]
    #[inline(never)]
    fn poll_slow(&self) {
        self.assert_current("poll");
        if self.state() != ThreadState::Running {
            return;
        }
        self.run_pending_work();
        while self.is_suspend_pending() {
            self.transition_out_of_running(ThreadState::Suspended, true);
            self.transition_to_running();
        }
    }

    /// Leave `Running` for a call that may block.
    ///
    /// Pair with [`exit_blocking`](Self::exit_blocking), or use
    /// [`blocking`](Self::blocking).
    pub fn enter_blocking(&self) {
        self.assert_current("enter_blocking");
        if self.state() != ThreadState::Running {
            tracing::warn!(thread_id = self.id(), state = ?self.state(), "enter_blocking outside Running");
            return;
        }
        self.transition_out_of_running(ThreadState::Suspended, false);
    }

    /// Return to `Running`, waiting out any suspension first.
    pub fn exit_blocking(&self) {
        self.assert_current("exit_blocking");
        if self.state() != ThreadState::Suspended {
            tracing::warn!(thread_id = self.id(), state = ?self.state(), "exit_blocking outside a blocking region");
            return;
        }
        self.transition_to_running();
    }

    /// Run `f` outside `Running`. Nested calls run `f` directly.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.state() != ThreadState::Running {
            return f();
        }
        self.enter_blocking();
        let result = f();
        self.exit_blocking();
        result
    }

    pub fn dump_stack(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match &self.inner.dumper {
            Some(dumper) => dumper.dump_stack(out),
            None => writeln!(out, "  (no native stack available)"),
        }
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "\"{}\" id={} serial={} tid={} state={:?} suspend_count={} debug_suspend_count={} flags={:?} daemon={}",
            self.name(),
            self.id(),
            self.serial(),
            self.native_tid(),
            self.state(),
            self.suspend_count(),
            self.debug_suspend_count(),
            self.flags(),
            self.is_daemon()
        )
    }

    pub(crate) fn belongs_to(&self, safepoint: &Arc<SafepointState>) -> bool {
        Arc::ptr_eq(&self.inner.safepoint, safepoint)
    }

    pub(crate) fn is_parked_in_poll(&self) -> bool {
        self.inner.parked_in_poll.load(Ordering::Acquire)
    }

    fn assert_current(&self, op: &str) {
        if !self.is_current() {
            fatal(
                self.inner.safepoint.fatal_action,
                FatalKind::ForeignThread,
                format_args!(
                    "{op} on thread {} called from {:?}",
                    self.id(),
                    thread::current().id()
                ),
            );
        }
    }

    /// Drop the shared world lock and publish `new_state`.
    ///
    /// Work queued while the lock was being released is run before retrying,
    /// so nothing is left behind once the thread is out of `Running`.
    pub(crate) fn transition_out_of_running(&self, new_state: ThreadState, parked: bool) {
        let safepoint = &self.inner.safepoint;
        loop {
            self.run_pending_work();
            safepoint.world.release_shared();
            let counts = safepoint.counts.lock();
            if self.has_pending_work() {
                drop(counts);
                safepoint.world.acquire_shared();
                continue;
            }
            self.inner.parked_in_poll.store(parked, Ordering::Release);
            self.inner.state.store(new_state as u8, Ordering::Release);
            safepoint.suspend_cond.notify_all();
            return;
        }
    }

    /// Wait until no suspend reason holds this thread, then become `Running`.
    pub(crate) fn transition_to_running(&self) {
        let safepoint = &self.inner.safepoint;
        {
            let mut counts = safepoint.counts.lock();
            while self.is_suspended_with(&counts) {
                counts.wait(&safepoint.resume_cond);
            }
            self.inner.parked_in_poll.store(false, Ordering::Release);
            self.inner
                .state
                .store(ThreadState::Running as u8, Ordering::Release);
            self.refresh_suspend_flag(&counts);
        }
        safepoint.world.acquire_shared();
        self.run_pending_work();
    }

    /// Move a thread that is not `Running` to `new_state`.
    pub(crate) fn set_state_locked(&self, _counts: &SuspendCounts, new_state: ThreadState) {
        self.inner.state.store(new_state as u8, Ordering::Release);
        self.inner.safepoint.suspend_cond.notify_all();
    }

    pub(crate) fn run_pending_work(&self) {
        if let Some(flip) = self.take_flip() {
            flip.run(self);
        }
        while let Some(work) = self.pop_checkpoint() {
            work.run(self);
        }
    }

    fn has_pending_work(&self) -> bool {
        self.flags()
            .intersects(ThreadFlags::CHECKPOINT_REQUEST | ThreadFlags::FLIP_PENDING)
    }

    pub(crate) fn is_suspended_with(&self, counts: &SuspendCounts) -> bool {
        is_effectively_suspended(
            counts.suspend_all_count,
            self.inner.controlling.load(Ordering::Acquire),
            self.debug_suspend_count(),
            self.suspend_count(),
        )
    }

    pub(crate) fn refresh_suspend_flag(&self, counts: &SuspendCounts) {
        let bit = ThreadFlags::SUSPEND_REQUEST.bits();
        if self.is_suspended_with(counts) {
            self.inner.flags.fetch_or(bit, Ordering::Release);
        } else {
            self.inner.flags.fetch_and(!bit, Ordering::Release);
        }
    }

    pub(crate) fn set_controlling(&self, counts: &SuspendCounts, controlling: bool) {
        self.inner.controlling.store(controlling, Ordering::Release);
        self.refresh_suspend_flag(counts);
    }

    /// Adjust the direct or debug suspend count by `delta`.
    pub(crate) fn modify_suspend_count(&self, counts: &SuspendCounts, delta: i32, for_debugger: bool) {
        let (counter, kind) = if for_debugger {
            (&self.inner.debug_suspend_count, "debug suspend")
        } else {
            (&self.inner.suspend_count, "suspend")
        };
        let current = counter.load(Ordering::Acquire);
        let Some(next) = current.checked_add_signed(delta) else {
            fatal(
                self.inner.safepoint.fatal_action,
                FatalKind::CounterUnderflow,
                format_args!(
                    "{kind} count of thread {} is {current}, cannot apply {delta}",
                    self.id()
                ),
            );
        };
        counter.store(next, Ordering::Release);
        self.refresh_suspend_flag(counts);
    }

    pub(crate) fn clear_debug_suspend_count(&self, counts: &SuspendCounts) {
        self.inner.debug_suspend_count.store(0, Ordering::Release);
        self.refresh_suspend_flag(counts);
    }

    pub(crate) fn request_checkpoint(&self, _counts: &SuspendCounts, work: Arc<dyn Checkpoint>) {
        let mut queue = self.inner.checkpoints.lock();
        queue.push_back(work);
        self.inner
            .flags
            .fetch_or(ThreadFlags::CHECKPOINT_REQUEST.bits(), Ordering::Release);
    }

    fn pop_checkpoint(&self) -> Option<Arc<dyn Checkpoint>> {
        let mut queue = self.inner.checkpoints.lock();
        let work = queue.pop_front();
        if queue.is_empty() {
            self.inner
                .flags
                .fetch_and(!ThreadFlags::CHECKPOINT_REQUEST.bits(), Ordering::Release);
        }
        work
    }

    pub(crate) fn install_flip(&self, _counts: &SuspendCounts, flip: Arc<dyn Checkpoint>) {
        *self.inner.flip.lock() = Some(flip);
        self.inner
            .flags
            .fetch_or(ThreadFlags::FLIP_PENDING.bits(), Ordering::Release);
    }

    /// Claim the pending flip. Whoever gets `Some` runs it.
    pub(crate) fn take_flip(&self) -> Option<Arc<dyn Checkpoint>> {
        let mut slot = self.inner.flip.lock();
        let flip = slot.take();
        self.inner
            .flags
            .fetch_and(!ThreadFlags::FLIP_PENDING.bits(), Ordering::Release);
        flip
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Blocking region entered on behalf of a coordination call.
///
/// A registered thread that is `Running` holds the world lock shared, which
/// ranks above the registry and suspend-state locks. Coordination calls made
/// from such a thread step out of `Running` first and step back in on drop.
pub(crate) struct ControllerRegion {
    handle: ThreadHandle,
}

impl ControllerRegion {
    pub(crate) fn enter(safepoint: &Arc<SafepointState>) -> Option<Self> {
        let handle = current_handle()?;
        if !handle.belongs_to(safepoint) || handle.state() != ThreadState::Running {
            return None;
        }
        handle.enter_blocking();
        Some(Self { handle })
    }
}

impl Drop for ControllerRegion {
    fn drop(&mut self) {
        self.handle.exit_blocking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FatalAction;
    use std::sync::atomic::AtomicUsize;

    fn detached_handle(options: ThreadOptions) -> ThreadHandle {
        let safepoint = Arc::new(SafepointState::new(FatalAction::Panic));
        ThreadHandle::new(5, 9, options, 0, safepoint)
    }

    #[test]
    fn peer_rejects_zero() {
        assert!(Peer::new(0).is_none());
        assert_eq!(Peer::new(17).unwrap().get(), 17);
    }

    #[test]
    fn new_handle_is_starting_without_requests() {
        let handle = detached_handle(ThreadOptions::new("fresh").daemon(true));
        assert_eq!(handle.id(), 5);
        assert_eq!(handle.serial(), 9);
        assert_eq!(handle.name(), "fresh");
        assert!(handle.is_daemon());
        assert!(handle.is_current());
        assert_eq!(handle.state(), ThreadState::Starting);
        assert!(handle.flags().is_empty());
        assert!(!handle.is_effectively_suspended());
    }

    #[test]
    fn inherited_debug_suspension_raises_request() {
        let safepoint = Arc::new(SafepointState::new(FatalAction::Panic));
        let handle = ThreadHandle::new(2, 1, ThreadOptions::new("late"), 3, safepoint);
        assert_eq!(handle.debug_suspend_count(), 3);
        assert!(handle.is_suspend_pending());
        assert!(handle.is_effectively_suspended());
    }

    #[test]
    fn suspend_count_drives_request_flag() {
        let handle = detached_handle(ThreadOptions::new("counted"));
        let safepoint = handle.inner.safepoint.clone();
        let counts = safepoint.counts.lock();

        handle.modify_suspend_count(&counts, 1, false);
        assert!(handle.is_suspend_pending());
        handle.modify_suspend_count(&counts, 1, true);
        handle.modify_suspend_count(&counts, -1, false);
        assert!(handle.is_suspend_pending(), "debug reason still holds");
        handle.clear_debug_suspend_count(&counts);
        assert!(!handle.is_suspend_pending());
    }

    #[test]
    fn checkpoint_flag_tracks_queue() {
        let handle = detached_handle(ThreadOptions::new("queue"));
        let safepoint = handle.inner.safepoint.clone();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let counts = safepoint.counts.lock();
            for _ in 0..2 {
                let ran = ran.clone();
                handle.request_checkpoint(
                    &counts,
                    Arc::new(move |_: &ThreadHandle| {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }
        }
        assert!(handle.flags().contains(ThreadFlags::CHECKPOINT_REQUEST));

        handle.run_pending_work();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(handle.flags().is_empty());
    }

    #[test]
    fn flip_is_claimed_once() {
        let handle = detached_handle(ThreadOptions::new("flip"));
        let safepoint = handle.inner.safepoint.clone();
        {
            let counts = safepoint.counts.lock();
            handle.install_flip(&counts, Arc::new(|_: &ThreadHandle| {}));
        }
        assert!(handle.flags().contains(ThreadFlags::FLIP_PENDING));
        assert!(handle.take_flip().is_some());
        assert!(handle.take_flip().is_none());
        assert!(!handle.flags().contains(ThreadFlags::FLIP_PENDING));
    }

    #[test]
    #[should_panic(expected = "suspend counter underflow")]
    fn underflow_is_fatal() {
        let handle = detached_handle(ThreadOptions::new("under"));
        let safepoint = handle.inner.safepoint.clone();
        let counts = safepoint.counts.lock();
        handle.modify_suspend_count(&counts, -1, false);
    }

    #[test]
    fn missing_dumper_writes_placeholder() {
        let handle = detached_handle(ThreadOptions::new("mute"));
        let mut out = String::new();
        handle.dump_stack(&mut out).unwrap();
        assert!(out.contains("no native stack"));
        assert!(handle.describe().starts_with("\"mute\" id=5 serial=9"));
    }
}
