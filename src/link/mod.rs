//! Bluetooth Classic target link.
//!
//! Explicit state machine for the scan / connect / monitor / disconnect
//! lifecycle of the bridged serial peripheral. It owns no transport; the
//! [`driver`] runs the long operations against a
//! [`ClassicPort`](crate::app::ports::ClassicPort) and reports back through
//! [`LinkInput`]s.
//!
//! ```text
//!            StartScan                 poll budget spent / CancelScan
//!   Idle ───────────────▶ Scanning ─────────────────────────────────▶ Idle
//!    │                       │ Connect
//!    │ Connect               ▼
//!    └──────────────▶ Connecting(n, max) ── attempts exhausted ──▶ Idle
//!                            │ attempt ok
//!                            ▼
//!                        Connected ── liveness lost ──▶ Idle
//!                            │ Disconnect
//!                            ▼
//!                      Disconnecting ── TeardownFinished ──▶ Idle
//! ```
//!
//! Every long operation carries the `generation` it was started under.
//! Cancelling or superseding an operation bumps the generation, so a late
//! report from the old job is recognised as stale and produces no second
//! completion event.
//!
//! Completion events ([`LinkEvent`]) queue inside the link and are drained
//! by the owner after each input.

pub mod driver;
pub mod framer;

use core::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::TargetName;

// ── Addresses and discovery records ───────────────────────────

/// Six-byte Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BtAddress(pub [u8; 6]);

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// One named device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: BtAddress,
    pub name: TargetName,
    pub rssi: i8,
}

// ── State, inputs, outputs ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning { polls_left: u16 },
    Connecting { attempt: u8, max_attempts: u8 },
    Connected,
    Disconnecting,
}

/// Everything that can happen to the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkInput {
    /// Phone asked for a scan.
    StartScan,
    /// The transport refused to start discovery; ends the scan as canceled.
    ScanStartFailed { generation: u32 },
    /// Phone cancelled the scan.
    CancelScan,
    /// The transport reported a device.
    Discovered(DiscoveredDevice),
    /// The scan job's poll timer fired.
    ScanPoll { generation: u32 },
    /// Phone asked to connect to `address`.
    Connect { address: BtAddress, attempts: u8 },
    /// The connect job is about to make its next attempt.
    BeginAttempt { generation: u32 },
    /// The blocking connect call returned.
    AttemptFinished { generation: u32, connected: bool },
    /// The monitor sampled link liveness.
    LinkPoll { generation: u32, alive: bool },
    /// Phone (or shutdown) asked to drop the link.
    Disconnect,
    /// The transport link has been torn down.
    TeardownFinished,
}

/// Outcome of an operation, delivered to the phone as a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ScanStarted,
    DeviceFound(DiscoveredDevice),
    ScanFinished { canceled: bool },
    ConnectAttempt { attempt: u8, of: u8 },
    ConnectionChanged(bool),
}

/// A connect-retry job to run on its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectJob {
    pub generation: u32,
    pub address: BtAddress,
    pub attempts: u8,
}

/// What the caller must do next with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do.
    None,
    /// Start discovery and spawn the scan poller for `generation`.
    RunScan { generation: u32 },
    /// Keep scanning; clear the transport's dedup cache.
    ClearCache,
    /// Stop discovery; the scan job is over.
    StopDiscovery,
    /// Spawn the connect-retry job.
    RunConnect(ConnectJob),
    /// Make connect attempt number `n`.
    Attempt(u8),
    /// Link is (still) up; keep monitoring.
    Monitor,
    /// Attempt failed, more remain.
    Retry,
    /// Job is over.
    Finish,
    /// Tear down the transport link.
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Scanning is disabled for the rest of this boot.
    ScanUnavailable,
    /// Another scan or connect is already in flight.
    Busy,
    /// A connect needs at least one attempt.
    NoAttempts,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanUnavailable => write!(f, "scanning unavailable after connect"),
            Self::Busy => write!(f, "link busy"),
            Self::NoAttempts => write!(f, "connect needs at least one attempt"),
        }
    }
}

const EVENT_QUEUE_LEN: usize = 16;

// ── TargetLink ────────────────────────────────────────────────

/// Bluetooth Classic bridge state.
pub struct TargetLink {
    state: LinkState,
    /// Cleared forever by the first connect; the transport cannot scan
    /// again once it has opened an SPP connection.
    can_scan: bool,
    generation: u32,
    scan_polls: u16,
    events: heapless::Deque<LinkEvent, EVENT_QUEUE_LEN>,
}

impl TargetLink {
    /// New idle link whose scans last `scan_polls` poll periods.
    pub fn new(scan_polls: u16) -> Self {
        Self {
            state: LinkState::Idle,
            can_scan: true,
            generation: 0,
            scan_polls: scan_polls.max(1),
            events: heapless::Deque::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn can_scan(&self) -> bool {
        self.can_scan
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self.state, LinkState::Scanning { .. })
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Pop the oldest pending completion event.
    pub fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Apply one input.
    pub fn handle(&mut self, input: LinkInput) -> Result<Step, LinkError> {
        match input {
            LinkInput::StartScan => self.start_scan(),
            LinkInput::ScanStartFailed { generation } => {
                if self.is_current(generation) && self.is_scanning() {
                    warn!("Link: discovery failed to start");
                    self.finish_scan(true);
                }
                Ok(Step::None)
            }
            LinkInput::CancelScan => Ok(self.cancel_scan()),
            LinkInput::Discovered(device) => {
                if self.is_scanning() && !device.name.is_empty() {
                    self.emit(LinkEvent::DeviceFound(device));
                }
                Ok(Step::None)
            }
            LinkInput::ScanPoll { generation } => Ok(self.scan_poll(generation)),
            LinkInput::Connect { address, attempts } => self.connect(address, attempts),
            LinkInput::BeginAttempt { generation } => Ok(self.begin_attempt(generation)),
            LinkInput::AttemptFinished { generation, connected } => {
                Ok(self.attempt_finished(generation, connected))
            }
            LinkInput::LinkPoll { generation, alive } => Ok(self.link_poll(generation, alive)),
            LinkInput::Disconnect => Ok(self.disconnect()),
            LinkInput::TeardownFinished => {
                if self.state == LinkState::Disconnecting {
                    self.state = LinkState::Idle;
                }
                Ok(Step::None)
            }
        }
    }

    fn start_scan(&mut self) -> Result<Step, LinkError> {
        if !self.can_scan {
            return Err(LinkError::ScanUnavailable);
        }
        if self.state != LinkState::Idle {
            return Err(LinkError::Busy);
        }
        self.bump();
        self.state = LinkState::Scanning {
            polls_left: self.scan_polls,
        };
        self.emit(LinkEvent::ScanStarted);
        info!("Link: scan started");
        Ok(Step::RunScan {
            generation: self.generation,
        })
    }

    fn cancel_scan(&mut self) -> Step {
        if !self.is_scanning() {
            return Step::None;
        }
        self.finish_scan(true);
        Step::StopDiscovery
    }

    fn finish_scan(&mut self, canceled: bool) {
        self.state = LinkState::Idle;
        self.bump();
        self.emit(LinkEvent::ScanFinished { canceled });
        info!("Link: scan finished (canceled={})", canceled);
    }

    fn scan_poll(&mut self, generation: u32) -> Step {
        let LinkState::Scanning { polls_left } = self.state else {
            return Step::Finish;
        };
        if !self.is_current(generation) {
            return Step::Finish;
        }
        let polls_left = polls_left.saturating_sub(1);
        if polls_left == 0 {
            self.finish_scan(false);
            return Step::StopDiscovery;
        }
        self.state = LinkState::Scanning { polls_left };
        Step::ClearCache
    }

    fn connect(&mut self, address: BtAddress, attempts: u8) -> Result<Step, LinkError> {
        if attempts == 0 {
            return Err(LinkError::NoAttempts);
        }
        if matches!(
            self.state,
            LinkState::Connecting { .. } | LinkState::Connected | LinkState::Disconnecting
        ) {
            return Err(LinkError::Busy);
        }
        if self.can_scan {
            info!("Link: scanning disabled from now on");
        }
        self.can_scan = false;
        if self.is_scanning() {
            self.finish_scan(true);
        }

        self.bump();
        self.state = LinkState::Connecting {
            attempt: 0,
            max_attempts: attempts,
        };
        info!("Link: connecting to {} ({} attempts)", address, attempts);
        Ok(Step::RunConnect(ConnectJob {
            generation: self.generation,
            address,
            attempts,
        }))
    }

    fn begin_attempt(&mut self, generation: u32) -> Step {
        let LinkState::Connecting {
            attempt,
            max_attempts,
        } = self.state
        else {
            return Step::Finish;
        };
        if !self.is_current(generation) || attempt >= max_attempts {
            return Step::Finish;
        }
        let attempt = attempt + 1;
        self.state = LinkState::Connecting {
            attempt,
            max_attempts,
        };
        self.emit(LinkEvent::ConnectAttempt {
            attempt,
            of: max_attempts,
        });
        Step::Attempt(attempt)
    }

    fn attempt_finished(&mut self, generation: u32, connected: bool) -> Step {
        let current = self.is_current(generation);
        let LinkState::Connecting {
            attempt,
            max_attempts,
        } = self.state
        else {
            // Superseded while the blocking call was running; a link that
            // came up anyway has no owner and must be closed.
            return if connected { Step::Teardown } else { Step::Finish };
        };
        if !current {
            return if connected { Step::Teardown } else { Step::Finish };
        }

        if connected {
            self.state = LinkState::Connected;
            self.emit(LinkEvent::ConnectionChanged(true));
            info!("Link: connected on attempt {}/{}", attempt, max_attempts);
            Step::Monitor
        } else if attempt >= max_attempts {
            self.state = LinkState::Idle;
            self.bump();
            self.emit(LinkEvent::ConnectionChanged(false));
            warn!("Link: connect failed after {} attempts", max_attempts);
            Step::Finish
        } else {
            Step::Retry
        }
    }

    fn link_poll(&mut self, generation: u32, alive: bool) -> Step {
        if self.state != LinkState::Connected || !self.is_current(generation) {
            return Step::Finish;
        }
        if alive {
            return Step::Monitor;
        }
        self.state = LinkState::Idle;
        self.bump();
        self.emit(LinkEvent::ConnectionChanged(false));
        warn!("Link: target connection lost");
        Step::Finish
    }

    fn disconnect(&mut self) -> Step {
        match self.state {
            LinkState::Connected | LinkState::Connecting { .. } => {
                self.state = LinkState::Disconnecting;
                self.bump();
                self.emit(LinkEvent::ConnectionChanged(false));
                info!("Link: disconnecting");
                Step::Teardown
            }
            LinkState::Idle | LinkState::Scanning { .. } | LinkState::Disconnecting => Step::None,
        }
    }

    fn is_current(&self, generation: u32) -> bool {
        generation == self.generation
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    fn emit(&mut self, event: LinkEvent) {
        if self.events.push_back(event).is_err() {
            warn!("Link: event queue full, dropping event");
        }
    }
}
