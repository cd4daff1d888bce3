//! Global suspend state shared by every thread of a [`ThreadList`](crate::ThreadList).
//!
//! ## Architecture
//!
//! - **Counts**: `suspend_all_count`, `debug_suspend_all_count` and the set of
//!   active suspend-all controllers, behind the suspend-state lock
//! - **Conditions**: `suspend_cond` wakes controllers when a thread leaves
//!   `Running`; `resume_cond` wakes parked threads when a count drops
//! - **World lock**: shared by running mutators, exclusive for a stop-the-world
//! - **Stats**: pause and acknowledgement timings for diagnostics

mod state;
mod stats;

pub use state::{SuspendReasons, is_effectively_suspended};
pub use stats::{SuspendStats, SuspendStatsSnapshot};

pub(crate) use state::{Controller, SafepointState, SuspendCounts};
