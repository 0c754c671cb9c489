//! BLE session and idle-timeout policy.
//!
//! At most one phone is connected at a time. The manager owns that
//! peer's identity, its pairing outcome, its notification subscriptions
//! and the activity clock the idle sweep measures against.
//!
//! | Situation                          | Sweep result               |
//! |------------------------------------|----------------------------|
//! | connected, idle ≥ connected limit  | `DisconnectPeer` (once)    |
//! | no peer, idle ≥ disconnected limit | `DeepSleep`                |
//! | otherwise, or limit is 0           | nothing                    |
//!
//! Times are monotonic seconds supplied by the caller.

use core::fmt;

use log::{info, warn};

use crate::protocol::CharId;

/// Link-layer address of the BLE peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerAddress(pub [u8; 6]);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Client Characteristic Configuration for one characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subscription {
    pub notify: bool,
    pub indicate: bool,
}

impl Subscription {
    /// Decode the two-byte little-endian CCCD value.
    pub fn from_cccd(value: u16) -> Self {
        Self {
            notify: value & 0x0001 != 0,
            indicate: value & 0x0002 != 0,
        }
    }

    pub fn to_cccd(self) -> u16 {
        u16::from(self.notify) | (u16::from(self.indicate) << 1)
    }

    pub fn is_enabled(self) -> bool {
        self.notify || self.indicate
    }
}

const MAX_SUBSCRIPTIONS: usize = 8;

/// The single connected peer.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: PeerAddress,
    pub conn_id: u16,
    pub authenticated: bool,
    pub mtu: u16,
    subscriptions: heapless::LinearMap<CharId, Subscription, MAX_SUBSCRIPTIONS>,
}

/// Default ATT MTU before the peer negotiates a larger one.
pub const DEFAULT_MTU: u16 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted,
    /// Another peer is already connected; the transport must drop this one.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    /// Pairing failed; the peer must be disconnected.
    Failed { conn_id: u16 },
    /// Event for a peer that is not the current session.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    None,
    DisconnectPeer { conn_id: u16 },
    DeepSleep,
}

/// Idle limits in seconds; 0 disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub connected_secs: u32,
    pub disconnected_secs: u32,
}

/// Owner of the BLE session and its activity clock.
pub struct SessionManager {
    session: Option<Session>,
    last_activity: u64,
    policy: IdlePolicy,
    advertising: bool,
}

impl SessionManager {
    /// Start advertising with no peer; the clock starts at `now`.
    pub fn new(policy: IdlePolicy, now: u64) -> Self {
        Self {
            session: None,
            last_activity: now,
            policy,
            advertising: true,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub fn policy(&self) -> IdlePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: IdlePolicy) {
        self.policy = policy;
    }

    pub fn mtu(&self) -> u16 {
        self.session.as_ref().map_or(DEFAULT_MTU, |s| s.mtu)
    }

    /// A peer connected at the transport.
    pub fn on_connect(&mut self, peer: PeerAddress, conn_id: u16, now: u64) -> ConnectOutcome {
        if let Some(current) = &self.session {
            warn!(
                "Session: rejecting {} while {} is connected",
                peer, current.peer
            );
            return ConnectOutcome::Rejected;
        }
        info!("Session: {} connected (conn {})", peer, conn_id);
        self.session = Some(Session {
            peer,
            conn_id,
            authenticated: false,
            mtu: DEFAULT_MTU,
            subscriptions: heapless::LinearMap::new(),
        });
        self.advertising = false;
        self.last_activity = now;
        ConnectOutcome::Accepted
    }

    /// A connection closed. Returns `true` if it was the session peer and
    /// advertising must restart.
    pub fn on_disconnect(&mut self, conn_id: u16, now: u64) -> bool {
        match &self.session {
            Some(s) if s.conn_id == conn_id => {}
            _ => return false,
        }
        if let Some(mut session) = self.session.take() {
            session.subscriptions.clear();
            info!("Session: {} disconnected", session.peer);
        }
        self.last_activity = now;
        self.advertising = true;
        true
    }

    /// Pairing finished for `peer`.
    pub fn on_auth_complete(&mut self, peer: PeerAddress, success: bool, reason: u8) -> AuthOutcome {
        let Some(session) = self.session.as_mut().filter(|s| s.peer == peer) else {
            return AuthOutcome::Ignored;
        };
        if success {
            session.authenticated = true;
            info!("Session: {} authenticated", peer);
            AuthOutcome::Authenticated
        } else {
            session.authenticated = false;
            warn!(
                "Session: authentication with {} failed, reason 0x{:02x} ({})",
                peer,
                reason,
                auth_failure_reason(reason)
            );
            AuthOutcome::Failed {
                conn_id: session.conn_id,
            }
        }
    }

    /// Record activity from the authenticated peer. Returns whether the
    /// clock moved.
    pub fn touch(&mut self, now: u64) -> bool {
        let authenticated = self.session.as_ref().is_some_and(|s| s.authenticated);
        if authenticated {
            self.last_activity = now;
        }
        authenticated
    }

    pub fn on_mtu(&mut self, mtu: u16) {
        if let Some(session) = self.session.as_mut() {
            session.mtu = mtu;
        }
    }

    /// Store the CCCD the peer wrote for `ch`.
    pub fn set_subscription(&mut self, ch: CharId, sub: Subscription) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !sub.is_enabled() {
            session.subscriptions.remove(&ch);
        } else if session.subscriptions.insert(ch, sub).is_err() {
            warn!("Session: subscription table full, ignoring {:?}", ch);
        }
    }

    pub fn subscription(&self, ch: CharId) -> Subscription {
        self.session
            .as_ref()
            .and_then(|s| s.subscriptions.get(&ch).copied())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.subscriptions.len())
    }

    /// Periodic idle check.
    pub fn sweep(&mut self, now: u64) -> SweepAction {
        let idle = now.saturating_sub(self.last_activity);
        match &self.session {
            Some(session) => {
                let limit = u64::from(self.policy.connected_secs);
                if limit == 0 || idle < limit {
                    return SweepAction::None;
                }
                info!("Session: {} idle for {}s, disconnecting", session.peer, idle);
                // Re-arm so the next sweep does not fire again before the
                // disconnect event lands.
                self.last_activity = now;
                SweepAction::DisconnectPeer {
                    conn_id: session.conn_id,
                }
            }
            None => {
                let limit = u64::from(self.policy.disconnected_secs);
                if limit == 0 || idle < limit {
                    return SweepAction::None;
                }
                info!("Session: no peer for {}s, going to sleep", idle);
                SweepAction::DeepSleep
            }
        }
    }
}

/// Human-readable SMP failure reason.
pub fn auth_failure_reason(reason: u8) -> &'static str {
    match reason {
        0x51 => "wrong passkey",
        0x55 => "pairing canceled",
        _ => "unknown",
    }
}
