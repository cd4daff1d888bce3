//! Runtime teardown

use std::{thread, time::Instant};

use super::ThreadList;
use crate::thread::{ControllerRegion, ThreadHandle, ThreadState};

impl ThreadList {
    /// Tear down the thread list.
    ///
    /// Closes registration, waits for every other non-daemon thread to
    /// unregister and for in-flight unregistrations to finish, then suspends
    /// daemon threads for good. Daemons still running after
    /// `daemon_suspend_timeout` are logged and left alone. Returns the number
    /// of daemon threads suspended.
    pub fn shutdown(&self) -> usize {
        let _region = ControllerRegion::enter(&self.safepoint);
        let me = thread::current().id();

        {
            let mut list = self.registry.list.lock();
            list.shut_down = true;
            loop {
                let waiting_on = list
                    .threads
                    .iter()
                    .filter(|t| t.os_thread() != me && !t.is_daemon())
                    .count();
                if waiting_on == 0 && list.unregistering == 0 {
                    break;
                }
                tracing::debug!(
                    waiting_on,
                    unregistering = list.unregistering,
                    "shutdown waiting for threads to exit"
                );
                list.wait(&self.registry.changed);
            }
        }

        self.suspend_daemons_for_shutdown()
    }

    fn suspend_daemons_for_shutdown(&self) -> usize {
        let me = thread::current().id();
        let start = Instant::now();
        let daemons: Vec<ThreadHandle> = {
            let list = self.registry.list.lock();
            let counts = self.safepoint.counts.lock();
            let daemons: Vec<ThreadHandle> = list
                .threads
                .iter()
                .filter(|t| t.os_thread() != me && t.is_daemon())
                .cloned()
                .collect();
            for daemon in &daemons {
                daemon.modify_suspend_count(&counts, 1, false);
            }
            daemons
        };

        let deadline = start + self.config.daemon_suspend_timeout;
        let mut counts = self.safepoint.counts.lock();
        let mut timed_out = false;
        loop {
            let running: Vec<u16> = daemons
                .iter()
                .filter(|t| t.state() == ThreadState::Running)
                .map(|t| t.id())
                .collect();
            if running.is_empty() {
                tracing::debug!(daemons = daemons.len(), "daemon threads suspended for shutdown");
                break;
            }
            if timed_out {
                tracing::warn!(
                    ?running,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "daemon threads still running at shutdown"
                );
                break;
            }
            timed_out = counts.wait_until(&self.safepoint.suspend_cond, deadline);
        }
        daemons.len()
    }
}
