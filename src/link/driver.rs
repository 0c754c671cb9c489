//! Long-running link jobs.
//!
//! Each function here runs on its own task and may sleep or block on the
//! transport. The link state is only touched through [`LinkHost`], which
//! holds the shared lock for the duration of one input, never across a
//! sleep or a blocking connect.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use super::{ConnectJob, LinkInput, Step, TargetLink};
use crate::app::ports::ClassicPort;

/// Serialized access to a [`TargetLink`].
pub trait LinkHost {
    /// Run `f` with exclusive access to the link. Implementations forward
    /// any queued [`LinkEvent`](super::LinkEvent)s after `f` returns.
    fn with_link<R>(&self, f: impl FnOnce(&mut TargetLink) -> R) -> R;

    /// Apply one input, logging and swallowing link errors.
    fn apply(&self, input: LinkInput) -> Step {
        self.with_link(|link| link.handle(input)).unwrap_or_else(|e| {
            warn!("Link: {}", e);
            Step::None
        })
    }
}

impl LinkHost for Mutex<TargetLink> {
    fn with_link<R>(&self, f: impl FnOnce(&mut TargetLink) -> R) -> R {
        let mut link = self.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut link)
    }
}

/// Scan poller: clears the dedup cache every `poll` until the scan ends.
///
/// Discovery is already running when this is spawned.
pub fn run_scan<H: LinkHost + ?Sized>(host: &H, classic: &dyn ClassicPort, generation: u32, poll: Duration) {
    loop {
        std::thread::sleep(poll);
        match host.apply(LinkInput::ScanPoll { generation }) {
            Step::ClearCache => classic.clear_discovery_cache(),
            Step::StopDiscovery => {
                classic.stop_discovery();
                return;
            }
            _ => return,
        }
    }
}

/// Connect-retry loop followed by liveness monitoring.
pub fn run_connect<H: LinkHost + ?Sized>(host: &H, classic: &dyn ClassicPort, job: ConnectJob, poll: Duration) {
    let generation = job.generation;

    loop {
        let Step::Attempt(n) = host.apply(LinkInput::BeginAttempt { generation }) else {
            return;
        };
        debug!("Link: attempt {}/{} to {}", n, job.attempts, job.address);

        // Blocking; the lock is not held here.
        let connected = classic.connect(&job.address);

        match host.apply(LinkInput::AttemptFinished { generation, connected }) {
            Step::Retry => {}
            Step::Monitor => break,
            Step::Teardown => {
                classic.disconnect();
                return;
            }
            _ => return,
        }
    }

    loop {
        std::thread::sleep(poll);
        let alive = classic.is_connected();
        if host.apply(LinkInput::LinkPoll { generation, alive }) != Step::Monitor {
            return;
        }
    }
}

/// Close the transport link after a [`Step::Teardown`].
pub fn run_teardown<H: LinkHost + ?Sized>(host: &H, classic: &dyn ClassicPort) {
    classic.disconnect();
    host.apply(LinkInput::TeardownFinished);
}
