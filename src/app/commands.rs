//! Deferred work requested by the service.
//!
//! [`BridgeService`](super::service::BridgeService) never blocks and never
//! touches a transport in a way that can wait. Anything long-running or
//! irreversible comes back as a [`Job`] for the
//! [`Runtime`](super::runtime::Runtime) to execute on a task of its own.

use crate::link::ConnectJob;
use crate::power::ShutdownKind;

/// Work to run outside the stack callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Poll discovery for scan `generation` until it ends.
    Scan { generation: u32 },
    /// Connect-retry loop, then liveness monitoring.
    Connect(ConnectJob),
    /// Close the Classic link.
    TeardownTarget,
    /// Drop a BLE peer (idle, rejected second peer, failed pairing).
    DisconnectPeer { conn_id: u16 },
    StartAdvertising,
    /// Stop both radios, then restart or sleep.
    Shutdown(ShutdownKind),
}

/// Jobs produced by a single event. Four is the most any event yields.
pub type Jobs = heapless::Vec<Job, 4>;

/// Queue `job`, logging if the batch is already full.
pub(crate) fn push(jobs: &mut Jobs, job: Job) {
    if jobs.push(job).is_err() {
        log::error!("App: job batch full, dropping {:?}", job);
    }
}
