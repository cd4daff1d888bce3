//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::bounded;
use threadlist::{FatalAction, SuspendConfig, ThreadHandle, ThreadList, ThreadOptions};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

pub fn new_list() -> Arc<ThreadList> {
    init_logging();
    ThreadList::new(
        SuspendConfig::default()
            .with_fatal_action(FatalAction::Panic)
            .with_suspend_timeout(Duration::from_secs(10))
            .with_thread_suspend_timeout(Duration::from_secs(10))
            .with_daemon_suspend_timeout(Duration::from_millis(500)),
    )
}

/// A registered thread polling in a loop until stopped.
pub struct Worker {
    pub handle: ThreadHandle,
    iterations: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl Worker {
    pub fn spawn(list: &Arc<ThreadList>, name: &str) -> Self {
        Self::spawn_with(list, ThreadOptions::new(name))
    }

    pub fn spawn_with(list: &Arc<ThreadList>, options: ThreadOptions) -> Self {
        let (tx, rx) = bounded(1);
        let iterations = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let join = {
            let (list, iterations, stop) = (list.clone(), iterations.clone(), stop.clone());
            std::thread::spawn(move || {
                let me = list.register(options).expect("register worker");
                tx.send(me.clone()).expect("hand out worker handle");
                while !stop.load(Ordering::Acquire) {
                    me.poll();
                    iterations.fetch_add(1, Ordering::Release);
                    std::thread::yield_now();
                }
                list.unregister(me);
            })
        };
        let handle = rx.recv().expect("worker registered");
        Self {
            handle,
            iterations,
            stop,
            join,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Acquire)
    }

    pub fn wait_for_progress(&self) {
        let seen = self.iterations();
        while self.iterations() == seen {
            std::thread::yield_now();
        }
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.join.join().expect("worker exited cleanly");
    }
}
