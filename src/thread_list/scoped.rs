//! RAII stop-the-world

use std::{
    marker::PhantomData,
    time::{Duration, Instant},
};

use super::ThreadList;
use crate::thread::ThreadHandle;

/// Holds the world stopped until dropped, on every exit path.
///
/// Not `Send`: the exclusive world lock must be released by the thread that
/// took it.
///
/// # Examples
///
/// ```
/// use std::panic::{AssertUnwindSafe, catch_unwind};
/// use threadlist::{ScopedWorldSuspension, SuspendConfig, ThreadList};
///
/// let list = ThreadList::new(SuspendConfig::default());
/// let result = catch_unwind(AssertUnwindSafe(|| {
///     let _world = ScopedWorldSuspension::new(&list, "compaction", false);
///     panic!("collector bug");
/// }));
/// assert!(result.is_err());
/// assert_eq!(list.suspend_all_count(), 0);
/// ```
pub struct ScopedWorldSuspension<'a> {
    list: &'a ThreadList,
    cause: String,
    started: Instant,
    threads: Vec<ThreadHandle>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ScopedWorldSuspension<'a> {
    pub fn new(list: &'a ThreadList, cause: impl Into<String>, long_suspend: bool) -> Self {
        let cause = cause.into();
        let started = Instant::now();
        let threads = list.suspend_all_collect(&cause, long_suspend);
        Self {
            list,
            cause,
            started,
            threads,
            _not_send: PhantomData,
        }
    }

    pub fn cause(&self) -> &str {
        &self.cause
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Threads suspended by this scope, as of suspension time.
    pub fn threads(&self) -> &[ThreadHandle] {
        &self.threads
    }
}

impl Drop for ScopedWorldSuspension<'_> {
    fn drop(&mut self) {
        self.list.resume_all();
    }
}

impl ThreadList {
    /// Stop the world until the returned guard is dropped.
    pub fn suspend_all_scoped(
        &self,
        cause: impl Into<String>,
        long_suspend: bool,
    ) -> ScopedWorldSuspension<'_> {
        ScopedWorldSuspension::new(self, cause, long_suspend)
    }
}
