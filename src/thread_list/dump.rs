//! Diagnostic dumps

use std::fmt::{self, Write as _};

use super::ThreadList;
use crate::thread::ControllerRegion;

impl ThreadList {
    /// Write the registry and suspend state, one line per thread.
    ///
    /// Native stacks come from each thread's
    /// [`StackDumper`](crate::StackDumper) and are collected after the
    /// registry lock is released.
    ///
    /// A controller holding its own stop-the-world cannot take the registry
    /// lock, so there the dump lists only the threads that stop holds.
    pub fn dump(&self, out: &mut dyn fmt::Write, dump_native_stacks: bool) -> fmt::Result {
        if self.safepoint.world.is_held_exclusively_by_current() {
            return self.dump_stopped(out, dump_native_stacks);
        }
        let _region = ControllerRegion::enter(&self.safepoint);
        let (threads, header, controllers) = {
            let list = self.registry.list.lock();
            let counts = self.safepoint.counts.lock();
            let header = format!(
                "ThreadList: {} threads registered, suspend_all_count={}, debug_suspend_all_count={}, unregistering={}",
                list.threads.len(),
                counts.suspend_all_count,
                counts.debug_suspend_all_count,
                list.unregistering
            );
            let controllers: Vec<String> = counts
                .controllers
                .iter()
                .map(|c| {
                    format!(
                        "suspend all by {:?} for \"{}\" ({:?} ago)",
                        c.os_thread,
                        c.cause,
                        c.started.elapsed()
                    )
                })
                .collect();
            (list.threads.clone(), header, controllers)
        };

        writeln!(out, "{header}")?;
        for controller in &controllers {
            writeln!(out, "  {controller}")?;
        }
        for thread in &threads {
            writeln!(out, "{}", thread.describe())?;
            if dump_native_stacks {
                thread.dump_stack(out)?;
            }
        }
        Ok(())
    }

    fn dump_stopped(&self, out: &mut dyn fmt::Write, dump_native_stacks: bool) -> fmt::Result {
        let threads = self.safepoint.stopped();
        writeln!(
            out,
            "ThreadList (world stopped): {} threads stopped, suspend_all_count={}",
            threads.len(),
            self.safepoint.suspend_all_hint()
        )?;
        for thread in &threads {
            writeln!(out, "{}", thread.describe())?;
            if dump_native_stacks {
                thread.dump_stack(out)?;
            }
        }
        Ok(())
    }

    /// Dump plus the suspend-all pause summary.
    pub fn dump_for_sigquit(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.dump(out, self.config.dump_native_stacks)?;
        writeln!(out, "{}", self.stats.snapshot())
    }

    pub(crate) fn dump_to_string(&self) -> String {
        let mut out = String::new();
        if self.dump(&mut out, self.config.dump_native_stacks).is_err() {
            out.push_str("(dump truncated)");
        }
        out
    }
}

