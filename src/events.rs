//! Stack events in, notifications out.
//!
//! Radio callbacks translate their raw parameters into a [`BridgeEvent`]
//! and hand it to the [`Runtime`](crate::app::runtime::Runtime). Anything
//! the phone should see goes the other way as a [`Notification`] through
//! the outbox, an `embassy-sync` bounded channel drained by the
//! notification pump task.
//!
//! ```text
//! ┌──────────────┐  BridgeEvent  ┌───────────────┐  Notification  ┌─────────────┐
//! │ GATT / GAP   │──────────────▶│               │───────────────▶│ Notify pump │
//! │ SPP / GAP BT │──────────────▶│ BridgeService │     Outbox     │ (async)     │
//! │ Logger       │───────────────┼───────────────┼───────────────▶│ → GattPort  │
//! └──────────────┘               └───────────────┘                └─────────────┘
//! ```
//!
//! Notifications are never sent from the stack callback itself.

use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::warn;

use crate::link::DiscoveredDevice;
use crate::logging::LineSink;
use crate::protocol::CharId;
use crate::protocol::codec::{AttrValue, value_from};
use crate::session::PeerAddress;

/// Everything the radio stacks report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent<'a> {
    PeerConnected { conn_id: u16, peer: PeerAddress },
    PeerDisconnected { conn_id: u16 },
    AuthComplete { peer: PeerAddress, success: bool, reason: u8 },
    MtuChanged { mtu: u16 },
    /// Read of a characteristic value; answered synchronously.
    Read { ch: CharId },
    Write { ch: CharId, data: &'a [u8] },
    /// Write to a characteristic's CCCD.
    SubscriptionWrite { ch: CharId, data: &'a [u8] },
    ExecWrite,
    NotifyConfirmed,
    TargetDiscovered(DiscoveredDevice),
    TargetData(&'a [u8]),
}

/// A value to push to the subscribed peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub ch: CharId,
    pub value: AttrValue,
}

impl Notification {
    pub fn new(ch: CharId, value: &[u8]) -> Self {
        Self {
            ch,
            value: value_from(value),
        }
    }
}

/// Outbox depth. Each slot holds a full attribute value.
pub const OUTBOX_DEPTH: usize = 16;

pub type Outbox = Channel<CriticalSectionRawMutex, Notification, OUTBOX_DEPTH>;

/// Queue `n` without blocking; drops it with a warning when full.
pub fn post(outbox: &Outbox, n: Notification) -> bool {
    let ch = n.ch;
    if outbox.try_send(n).is_err() {
        // Debug log lines are allowed to fall behind silently.
        if ch != CharId::DebugLog {
            warn!("Notify: outbox full, dropping {:?}", ch);
        }
        return false;
    }
    true
}

/// Routes completed log lines to the Debug Log characteristic.
pub struct DebugLogSink(pub Arc<Outbox>);

impl LineSink for DebugLogSink {
    fn forward_line(&self, line: &[u8]) {
        post(&self.0, Notification::new(CharId::DebugLog, line));
    }
}
