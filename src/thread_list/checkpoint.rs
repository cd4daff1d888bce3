//! Checkpoints: per-thread work without stopping the world

use std::{sync::Arc, thread};

use super::ThreadList;
use crate::{
    checkpoint::Checkpoint,
    thread::{ControllerRegion, ThreadHandle, ThreadState},
};

impl ThreadList {
    /// Run `work` once for every registered thread.
    ///
    /// Running threads run it at their next poll. Threads outside `Running`
    /// are held suspended while the caller runs it on their behalf. A
    /// registered caller runs it for itself. Returns the number of threads the
    /// work was scheduled or done for; pair with a
    /// [`CheckpointBarrier`](crate::CheckpointBarrier) to wait for completion.
    ///
    /// Inside the caller's own stop-the-world the work runs synchronously for
    /// every thread that stop holds.
    pub fn run_checkpoint<C>(&self, work: C) -> usize
    where
        C: Checkpoint + 'static,
    {
        self.run_checkpoint_inner(Arc::new(work), true)
    }

    /// Like [`run_checkpoint`](Self::run_checkpoint) but skips threads that
    /// are not `Running`.
    ///
    /// Meant for callers that already know suspended threads are consistent,
    /// such as a controller nested inside its own stop-the-world. There no
    /// other thread is `Running`, so only a registered caller runs the work.
    pub fn run_checkpoint_on_runnable_threads<C>(&self, work: C) -> usize
    where
        C: Checkpoint + 'static,
    {
        self.run_checkpoint_inner(Arc::new(work), false)
    }

    fn run_checkpoint_inner(&self, work: Arc<dyn Checkpoint>, include_suspended: bool) -> usize {
        let own = self.own_handle();
        if self.safepoint.world.is_held_exclusively_by_current() {
            return self.run_checkpoint_stopped(&work, own.as_ref(), include_suspended);
        }
        let region = ControllerRegion::enter(&self.safepoint);
        let me = thread::current().id();
        let mut scheduled = 0;
        let mut on_behalf: Vec<ThreadHandle> = Vec::new();

        {
            let list = self.registry.list.lock();
            let counts = self.safepoint.counts.lock();
            for thread in list.threads.iter().filter(|t| t.os_thread() != me) {
                if thread.state() == ThreadState::Running {
                    thread.request_checkpoint(&counts, work.clone());
                    scheduled += 1;
                } else if include_suspended {
                    thread.modify_suspend_count(&counts, 1, false);
                    on_behalf.push(thread.clone());
                    scheduled += 1;
                }
            }
        }

        for thread in &on_behalf {
            work.run(thread);
        }
        if !on_behalf.is_empty() {
            let counts = self.safepoint.counts.lock();
            for thread in &on_behalf {
                thread.modify_suspend_count(&counts, -1, false);
            }
            self.safepoint.resume_cond.notify_all();
        }

        drop(region);
        if let Some(own) = &own {
            work.run(own);
            scheduled += 1;
        }

        tracing::debug!(
            scheduled,
            run_on_behalf = on_behalf.len(),
            include_suspended,
            "checkpoint requested"
        );
        scheduled
    }

    /// Checkpoint requested from inside the caller's own stop-the-world.
    ///
    /// The registry cannot be locked under the exclusive world lock, and no
    /// stopped thread is `Running`, so the work runs here for each thread
    /// this stop-the-world holds. Threads registering during the stop have
    /// not run yet and are skipped.
    fn run_checkpoint_stopped(
        &self,
        work: &Arc<dyn Checkpoint>,
        own: Option<&ThreadHandle>,
        include_suspended: bool,
    ) -> usize {
        let mut done = 0;
        if include_suspended {
            for thread in self.safepoint.stopped() {
                work.run(&thread);
                done += 1;
            }
        }
        if let Some(own) = own {
            work.run(own);
            done += 1;
        }
        tracing::debug!(done, include_suspended, "checkpoint run inside stop-the-world");
        done
    }
}
