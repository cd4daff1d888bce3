//! Ordered locks used by the thread list.
//!
//! Every lock the coordinator takes has a fixed [`LockLevel`]. A thread may
//! only acquire a lock whose level is strictly greater than every level it
//! already holds; anything else is a fatal [`FatalKind::LockOrderViolation`].
//! The check runs before blocking, so a would-be deadlock is reported instead
//! of hanging.
//!
//! The [`WorldLock`] counts as held at its level both when a running mutator
//! holds it shared and when a controller holds it exclusively.

use std::{
    cell::Cell,
    ops::{Deref, DerefMut},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{
    Condvar, Mutex, MutexGuard, RawRwLock,
    lock_api::{RawRwLock as _, RawRwLockTimed as _},
};

use crate::{
    config::FatalAction,
    error::{FatalKind, fatal},
};

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
    Registry = 0,
    SuspendState = 1,
    World = 2,
    ThreadIds = 3,
}

impl LockLevel {
    const fn bit(self) -> u8 {
        1 << self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LockLevel::Registry => "thread registry lock",
            LockLevel::SuspendState => "suspend state lock",
            LockLevel::World => "world lock",
            LockLevel::ThreadIds => "thread id allocator lock",
        }
    }

    const ALL: [LockLevel; 4] = [
        LockLevel::Registry,
        LockLevel::SuspendState,
        LockLevel::World,
        LockLevel::ThreadIds,
    ];
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

/// Record an acquisition of `level` by the current thread.
pub(crate) fn note_acquire(level: LockLevel, action: FatalAction) {
    HELD.with(|held| {
        let current = held.get();
        let conflicting = current & !(level.bit() - 1);
        if conflicting != 0 {
            let holding = LockLevel::ALL
                .iter()
                .rev()
                .find(|l| conflicting & l.bit() != 0)
                .map_or("unknown lock", |l| l.name());
            fatal(
                action,
                FatalKind::LockOrderViolation,
                format_args!(
                    "acquiring {} while holding {} on {:?}",
                    level.name(),
                    holding,
                    thread::current().id()
                ),
            );
        }
        held.set(current | level.bit());
    });
}

pub(crate) fn note_release(level: LockLevel) {
    HELD.with(|held| held.set(held.get() & !level.bit()));
}

/// Whether the current thread holds a lock at `level`.
pub fn holds(level: LockLevel) -> bool {
    HELD.with(|held| held.get() & level.bit() != 0)
}

/// A `parking_lot::Mutex` tagged with a lock level.
pub(crate) struct OrderedMutex<T> {
    level: LockLevel,
    action: FatalAction,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub(crate) fn new(level: LockLevel, action: FatalAction, value: T) -> Self {
        Self {
            level,
            action,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, T> {
        note_acquire(self.level, self.action);
        OrderedGuard {
            level: self.level,
            guard: self.inner.lock(),
        }
    }
}

pub(crate) struct OrderedGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> OrderedGuard<'_, T> {
    /// Block on `cond`, releasing the mutex while parked.
    pub(crate) fn wait(&mut self, cond: &Condvar) {
        cond.wait(&mut self.guard);
    }

    /// Like [`wait`](Self::wait) but gives up at `deadline`. Returns true on timeout.
    pub(crate) fn wait_until(&mut self, cond: &Condvar, deadline: Instant) -> bool {
        cond.wait_until(&mut self.guard, deadline).timed_out()
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        note_release(self.level);
    }
}

/// Reader/writer lock separating running mutators from a stop-the-world
/// controller.
///
/// Holds are not tied to a guard: a mutator keeps the shared side across
/// arbitrary calls while it is running, and a controller keeps the exclusive
/// side between `suspend_all` and `resume_all`.
pub(crate) struct WorldLock {
    raw: RawRwLock,
    owner: Mutex<Option<ThreadId>>,
    action: FatalAction,
}

impl WorldLock {
    pub(crate) fn new(action: FatalAction) -> Self {
        Self {
            raw: RawRwLock::INIT,
            owner: Mutex::new(None),
            action,
        }
    }

    pub(crate) fn acquire_shared(&self) {
        note_acquire(LockLevel::World, self.action);
        self.raw.lock_shared();
    }

    pub(crate) fn release_shared(&self) {
        if !holds(LockLevel::World) || self.is_held_exclusively_by_current() {
            fatal(
                self.action,
                FatalKind::UnbalancedResume,
                "releasing shared world lock that is not held",
            );
        }
        note_release(LockLevel::World);
        // SAFETY: the level bit proves this thread took the shared side and
        // the owner check rules out the exclusive side.
        unsafe { self.raw.unlock_shared() };
    }

    /// Take the exclusive side, waiting at most `timeout` when one is given.
    /// Returns false if the wait expired.
    pub(crate) fn acquire_exclusive(&self, timeout: Option<Duration>) -> bool {
        note_acquire(LockLevel::World, self.action);
        let acquired = match timeout {
            None => {
                self.raw.lock_exclusive();
                true
            }
            Some(timeout) => self.raw.try_lock_exclusive_for(timeout),
        };
        if acquired {
            *self.owner.lock() = Some(thread::current().id());
        } else {
            note_release(LockLevel::World);
        }
        acquired
    }

    pub(crate) fn release_exclusive(&self) {
        if !self.is_held_exclusively_by_current() {
            fatal(
                self.action,
                FatalKind::UnbalancedResume,
                format_args!(
                    "{:?} released the exclusive world lock without holding it",
                    thread::current().id()
                ),
            );
        }
        *self.owner.lock() = None;
        note_release(LockLevel::World);
        // SAFETY: ownership was checked above.
        unsafe { self.raw.unlock_exclusive() };
    }

    pub(crate) fn is_held_exclusively_by_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    pub(crate) fn is_locked_exclusive(&self) -> bool {
        self.raw.is_locked_exclusive()
    }
}
