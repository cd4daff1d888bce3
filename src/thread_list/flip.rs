//! Root flips for concurrent collectors

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use super::ThreadList;
use crate::{
    checkpoint::Checkpoint,
    thread::{ControllerRegion, ThreadHandle},
};

/// Collector-side listener told how long a flip kept the world stopped.
pub trait FlipCollector {
    fn register_pause(&self, pause: Duration);
}

impl<F> FlipCollector for F
where
    F: Fn(Duration),
{
    fn register_pause(&self, pause: Duration) {
        self(pause)
    }
}

const FLIP_CAUSE: &str = "flip thread roots";

impl ThreadList {
    /// Flip every thread's roots with a brief stop-the-world.
    ///
    /// `thread_visitor` becomes each thread's pending flip and
    /// `global_callback` runs once under the exclusive world lock. Threads
    /// parked at a poll flip themselves as soon as they run again; threads
    /// suspended elsewhere stay suspended while the caller flips them. Each
    /// flip runs exactly once. Returns the number of threads flipped.
    pub fn flip_thread_roots<V, G, C>(
        &self,
        thread_visitor: V,
        global_callback: G,
        collector: &C,
    ) -> usize
    where
        V: Checkpoint + 'static,
        G: FnOnce(),
        C: FlipCollector + ?Sized,
    {
        let started = Instant::now();
        let visitor: Arc<dyn Checkpoint> = Arc::new(thread_visitor);
        let own = self.own_handle();
        let me = thread::current().id();

        let region = ControllerRegion::enter(&self.safepoint);
        let targets = self.begin_suspend_all(FLIP_CAUSE, started, region);
        self.wait_for_suspension(&targets, FLIP_CAUSE, false);

        let mut flipped = 0;
        let mut elsewhere: Vec<ThreadHandle> = Vec::new();
        {
            let list = self.registry.list.lock();
            let counts = self.safepoint.counts.lock();
            for thread in list.threads.iter().filter(|t| t.os_thread() != me) {
                thread.install_flip(&counts, visitor.clone());
                if !thread.is_parked_in_poll() {
                    thread.modify_suspend_count(&counts, 1, false);
                    elsewhere.push(thread.clone());
                }
                flipped += 1;
            }
        }

        self.acquire_world_exclusive(FLIP_CAUSE);
        self.safepoint.set_stopped(&targets);
        global_callback();
        let pause = started.elapsed();
        collector.register_pause(pause);
        self.safepoint.clear_stopped();
        self.safepoint.world.release_exclusive();

        let controller = self.end_suspend_all(me);
        self.stats.record_pause(pause);

        for thread in &elsewhere {
            if let Some(flip) = thread.take_flip() {
                flip.run(thread);
            }
        }
        if !elsewhere.is_empty() {
            let counts = self.safepoint.counts.lock();
            for thread in &elsewhere {
                thread.modify_suspend_count(&counts, -1, false);
            }
            self.safepoint.resume_cond.notify_all();
        }

        drop(controller);
        if let Some(own) = &own {
            visitor.run(own);
            flipped += 1;
        }

        tracing::debug!(
            flipped,
            run_on_behalf = elsewhere.len(),
            pause_ms = pause.as_millis() as u64,
            "flipped thread roots"
        );
        flipped
    }
}
