//! Shared fixtures for unit tests.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{Sender, bounded};
use tracing_subscriber::fmt::format::FmtSpan;

use crate::{FatalAction, SuspendConfig, ThreadHandle, ThreadList, ThreadOptions};

static INIT_LOGGING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
pub(crate) fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Panicking fatal handler and timeouts short enough for tests.
pub(crate) fn test_config() -> SuspendConfig {
    SuspendConfig::default()
        .with_fatal_action(FatalAction::Panic)
        .with_suspend_timeout(Duration::from_secs(10))
        .with_thread_suspend_timeout(Duration::from_secs(10))
        .with_daemon_suspend_timeout(Duration::from_millis(500))
}

pub(crate) fn test_list() -> Arc<ThreadList> {
    init_test_logging();
    ThreadList::new(test_config())
}

/// A registered thread that polls in a loop and counts iterations.
pub(crate) struct Mutator {
    pub(crate) handle: ThreadHandle,
    pub(crate) progress: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl Mutator {
    pub(crate) fn spawn(list: &Arc<ThreadList>, options: ThreadOptions) -> Self {
        let (tx, rx) = bounded(1);
        let progress = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let join = {
            let (list, progress, stop) = (list.clone(), progress.clone(), stop.clone());
            std::thread::spawn(move || {
                let me = list.register(options).unwrap();
                tx.send(me.clone()).unwrap();
                while !stop.load(Ordering::Acquire) {
                    me.poll();
                    progress.fetch_add(1, Ordering::Release);
                    std::thread::yield_now();
                }
                list.unregister(me);
            })
        };
        let handle = rx.recv().unwrap();
        Self {
            handle,
            progress,
            stop,
            join,
        }
    }

    pub(crate) fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Spin until the loop has made at least one more iteration.
    pub(crate) fn wait_for_progress(&self) {
        let seen = self.progress();
        while self.progress() == seen {
            std::thread::yield_now();
        }
    }

    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.join.join().unwrap();
    }
}

/// A registered thread sitting in a blocking call until released.
pub(crate) struct BlockedMutator {
    pub(crate) handle: ThreadHandle,
    release: Sender<()>,
    join: JoinHandle<()>,
}

impl BlockedMutator {
    pub(crate) fn spawn(list: &Arc<ThreadList>, options: ThreadOptions) -> Self {
        let (handle_tx, handle_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let join = {
            let list = list.clone();
            std::thread::spawn(move || {
                let me = list.register(options).unwrap();
                let blocking = me.clone();
                me.blocking(move || {
                    handle_tx.send(blocking).unwrap();
                    let _ = release_rx.recv();
                });
                list.unregister(me);
            })
        };
        let handle = handle_rx.recv().unwrap();
        Self {
            handle,
            release: release_tx,
            join,
        }
    }

    pub(crate) fn release(self) {
        let _ = self.release.send(());
        self.join.join().unwrap();
    }
}
