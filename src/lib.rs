//! Thread registry and safepoint coordination for managed runtimes.
//!
//! A [`ThreadList`] owns every registered mutator thread and the machinery
//! to stop them: stop-the-world suspension, single-thread and debugger
//! suspension, checkpoints run at each thread's next safepoint poll, and root
//! flips for concurrent collectors.
//!
//! ```
//! use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
//! use threadlist::{SuspendConfig, ThreadList, ThreadOptions};
//!
//! let list = ThreadList::new(SuspendConfig::default());
//! let stop = Arc::new(AtomicBool::new(false));
//!
//! let mutator = {
//!     let (list, stop) = (list.clone(), stop.clone());
//!     std::thread::spawn(move || {
//!         let me = list.register(ThreadOptions::new("mutator")).unwrap();
//!         while !stop.load(Ordering::Acquire) {
//!             me.poll();
//!         }
//!         list.unregister(me);
//!     })
//! };
//!
//! list.suspend_all("gc", false);
//! list.resume_all();
//!
//! stop.store(true, Ordering::Release);
//! mutator.join().unwrap();
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod locks;
pub mod registry;
pub mod safepoint;
pub mod thread;
pub mod thread_list;

#[cfg(test)]
pub(crate) mod test_utils;

pub use checkpoint::{Checkpoint, CheckpointBarrier};
pub use config::{FatalAction, INVALID_THREAD_ID, MAIN_THREAD_ID, MAX_THREAD_ID, SuspendConfig};
pub use error::{ConfigError, FatalKind, SuspendError, SuspendResult};
pub use registry::ThreadRegistry;
pub use safepoint::{SuspendReasons, SuspendStats, SuspendStatsSnapshot, is_effectively_suspended};
pub use thread::{
    Peer, StackDumper, ThreadFlags, ThreadHandle, ThreadOptions, ThreadState, current_handle,
};
pub use thread_list::{FlipCollector, ScopedWorldSuspension, ThreadList};
