//! Application service: the hexagonal core.
//!
//! [`BridgeService`] owns every engine (session, target link, inbound
//! framer, OTA) and the settings store. Stack callbacks reach it as
//! [`BridgeEvent`]s; it answers reads synchronously, validates and
//! dispatches writes, queues notifications on the outbox and hands back
//! the [`Job`]s that must run on their own task.
//!
//! ```text
//!  BridgeEvent ──▶ ┌──────────────────────────────┐ ──▶ Outbox (notifications)
//!                  │        BridgeService         │
//!      Reply ◀──── │ Session · Link · Framer · OTA│ ──▶ Jobs (deferred work)
//!                  └──────────────────────────────┘
//! ```
//!
//! The service is shared as `Arc<Mutex<BridgeService>>`; that mutex is the
//! single serialization point for all engine state.

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::config::{BridgeConfig, Timings};
use crate::error::Error;
use crate::events::{BridgeEvent, Notification, Outbox, post};
use crate::link::driver::LinkHost;
use crate::link::framer::InboundFramer;
use crate::link::{LinkEvent, LinkInput, Step, TargetLink};
use crate::logging::suspend_forwarding;
use crate::ota::OtaEngine;
use crate::power::{BatteryStatus, ShutdownKind};
use crate::protocol::CharId;
use crate::protocol::codec::{
    self, AttrValue, OTA_STATUS_FAILURE, OTA_STATUS_SUCCESS, OtaMessage, STATE_ACTIVE, STATE_IDLE,
    STATE_UNAVAILABLE,
};
use crate::session::{AuthOutcome, ConnectOutcome, IdlePolicy, SessionManager, Subscription, SweepAction};

use super::commands::{Job, Jobs, push};
use super::ports::{ClassicPort, ConfigError, ConfigPort, FirmwarePort};

/// Answer to one [`BridgeEvent`].
#[derive(Debug, Default)]
pub struct Reply {
    /// Value for a read; `None` when the characteristic is not readable.
    pub value: Option<AttrValue>,
    pub jobs: Jobs,
}

impl Reply {
    fn jobs(jobs: Jobs) -> Self {
        Self { value: None, jobs }
    }
}

// ───────────────────────────────────────────────────────────────
// BridgeService
// ───────────────────────────────────────────────────────────────

pub struct BridgeService<C: ConfigPort, F: FirmwarePort> {
    config: BridgeConfig,
    store: C,
    timings: Timings,
    session: SessionManager,
    link: TargetLink,
    framer: InboundFramer,
    /// `None` when the build carries no verification key.
    ota: Option<OtaEngine<F>>,
    battery: Option<BatteryStatus>,
    classic: Arc<dyn ClassicPort>,
    outbox: Arc<Outbox>,
}

fn idle_policy(config: &BridgeConfig) -> IdlePolicy {
    IdlePolicy {
        connected_secs: config.connected_idle_timeout_secs,
        disconnected_secs: config.disconnected_idle_timeout_secs,
    }
}

impl<C: ConfigPort, F: FirmwarePort> BridgeService<C, F> {
    /// Load settings from `store` (defaults if missing or corrupted) and
    /// start with no peer, an idle link and the activity clock at `now`.
    pub fn new(
        store: C,
        ota: Option<OtaEngine<F>>,
        classic: Arc<dyn ClassicPort>,
        outbox: Arc<Outbox>,
        timings: Timings,
        now: u64,
    ) -> Self {
        let config = match store.load() {
            Ok(config) => {
                info!("App: settings loaded for \"{}\"", config.name);
                config
            }
            Err(ConfigError::NotFound) => {
                info!("App: no stored settings, using defaults");
                BridgeConfig::default()
            }
            Err(e) => {
                warn!("App: settings unusable ({}), using defaults", e);
                BridgeConfig::default()
            }
        };
        if ota.is_none() {
            warn!("App: no OTA public key in this build, updates disabled");
        }
        Self {
            session: SessionManager::new(idle_policy(&config), now),
            link: TargetLink::new(timings.scan_polls),
            framer: InboundFramer::new(),
            config,
            store,
            timings,
            ota,
            battery: None,
            classic,
            outbox,
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn link(&self) -> &TargetLink {
        &self.link
    }

    pub fn ota(&self) -> Option<&OtaEngine<F>> {
        self.ota.as_ref()
    }

    pub fn ota_available(&self) -> bool {
        self.ota.is_some()
    }

    pub fn battery(&self) -> Option<BatteryStatus> {
        self.battery
    }

    pub fn timings(&self) -> Timings {
        self.timings
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Connection and mode to deliver a notification on `ch`, if the peer
    /// subscribed to it. Indication is used only when notify is off.
    pub fn delivery_target(&self, ch: CharId) -> Option<(u16, bool)> {
        let session = self.session.session()?;
        let sub = self.session.subscription(ch);
        sub.is_enabled()
            .then_some((session.conn_id, sub.indicate && !sub.notify))
    }

    // ── Event dispatch ────────────────────────────────────────

    /// Handle one stack event at monotonic time `now` (seconds).
    pub fn handle_event(&mut self, event: BridgeEvent<'_>, now: u64) -> Reply {
        let reply = match event {
            BridgeEvent::PeerConnected { conn_id, peer } => {
                let mut jobs = Jobs::new();
                if self.session.on_connect(peer, conn_id, now) == ConnectOutcome::Rejected {
                    push(&mut jobs, Job::DisconnectPeer { conn_id });
                }
                Reply::jobs(jobs)
            }
            BridgeEvent::PeerDisconnected { conn_id } => {
                let mut jobs = Jobs::new();
                if self.session.on_disconnect(conn_id, now) {
                    if let Some(ota) = self.ota.as_mut() {
                        ota.interrupt();
                    }
                    push(&mut jobs, Job::StartAdvertising);
                }
                Reply::jobs(jobs)
            }
            BridgeEvent::AuthComplete {
                peer,
                success,
                reason,
            } => {
                let mut jobs = Jobs::new();
                match self.session.on_auth_complete(peer, success, reason) {
                    AuthOutcome::Failed { conn_id } => {
                        push(&mut jobs, Job::DisconnectPeer { conn_id });
                    }
                    AuthOutcome::Authenticated => self.touch(now),
                    AuthOutcome::Ignored => {}
                }
                Reply::jobs(jobs)
            }
            BridgeEvent::MtuChanged { mtu } => {
                info!("GATT: MTU now {}", mtu);
                self.session.on_mtu(mtu);
                Reply::default()
            }
            BridgeEvent::Read { ch } => {
                self.touch(now);
                Reply {
                    value: self.read(ch),
                    jobs: Jobs::new(),
                }
            }
            BridgeEvent::Write { ch, data } => {
                self.touch(now);
                Reply::jobs(self.write(ch, data))
            }
            BridgeEvent::SubscriptionWrite { ch, data } => {
                self.touch(now);
                self.write_cccd(ch, data);
                Reply::default()
            }
            BridgeEvent::ExecWrite | BridgeEvent::NotifyConfirmed => {
                self.touch(now);
                Reply::default()
            }
            BridgeEvent::TargetDiscovered(device) => {
                // Devices arriving outside a scan are dropped by the link.
                if let Err(e) = self.link.handle(LinkInput::Discovered(device)) {
                    warn!("Link: discovery report rejected: {}", e);
                }
                Reply::default()
            }
            BridgeEvent::TargetData(data) => {
                self.relay_inbound(data);
                Reply::default()
            }
        };
        self.flush_link_events();
        reply
    }

    /// Periodic idle check.
    pub fn sweep(&mut self, now: u64) -> Jobs {
        let mut jobs = Jobs::new();
        match self.session.sweep(now) {
            SweepAction::None => {}
            SweepAction::DisconnectPeer { conn_id } => push(&mut jobs, Job::DisconnectPeer { conn_id }),
            SweepAction::DeepSleep => push(&mut jobs, Job::Shutdown(ShutdownKind::DeepSleep)),
        }
        jobs
    }

    /// Record a battery sample and publish the level.
    pub fn update_battery(&mut self, millivolts: u32) -> Jobs {
        let status = BatteryStatus::from_millivolts(millivolts);
        self.battery = Some(status);
        debug!("Power: battery {} mV ({}%)", status.millivolts, status.level);
        self.notify(CharId::BatteryLevel, &[status.level]);

        let mut jobs = Jobs::new();
        if status.is_critical() {
            warn!("Power: battery critical at {} mV", millivolts);
            push(&mut jobs, Job::Shutdown(ShutdownKind::DeepSleep));
        }
        jobs
    }

    // ── Reads ─────────────────────────────────────────────────

    fn read(&self, ch: CharId) -> Option<AttrValue> {
        let value = match ch {
            CharId::BatteryVoltage => codec::encode_u32(self.battery.map_or(0, |b| b.millivolts)),
            CharId::BatteryLevel => codec::value_from(&[self.battery.map_or(0, |b| b.level)]),
            CharId::BtScan => codec::value_from(&[self.scan_state()]),
            CharId::BtConnect => codec::value_from(&[self.connect_state()]),
            CharId::ConfigName => codec::encode_name(&self.config),
            CharId::ConfigTarget => codec::encode_target(self.config.target.as_ref()),
            CharId::ConnectedIdleTimeout => codec::encode_u32(self.config.connected_idle_timeout_secs),
            CharId::DisconnectedIdleTimeout => {
                codec::encode_u32(self.config.disconnected_idle_timeout_secs)
            }
            CharId::MtuInfo => codec::encode_u32(u32::from(self.session.mtu())),
            CharId::SerialData
            | CharId::ConfigPin
            | CharId::DebugLog
            | CharId::Restart
            | CharId::OtaUpdate
            | CharId::Sleep => {
                debug!("GATT: read of {:?} refused", ch);
                return None;
            }
        };
        Some(value)
    }

    fn scan_state(&self) -> u8 {
        if !self.link.can_scan() {
            STATE_UNAVAILABLE
        } else if self.link.is_scanning() {
            STATE_ACTIVE
        } else {
            STATE_IDLE
        }
    }

    fn connect_state(&self) -> u8 {
        if self.config.target.is_none() {
            STATE_UNAVAILABLE
        } else if self.link.is_connected() {
            STATE_ACTIVE
        } else {
            STATE_IDLE
        }
    }

    // ── Writes ────────────────────────────────────────────────

    /// Dispatch a characteristic write. Rejected writes are logged and
    /// leave all state unchanged.
    pub fn write(&mut self, ch: CharId, data: &[u8]) -> Jobs {
        self.try_write(ch, data).unwrap_or_else(|e| {
            warn!("GATT: write to {:?} rejected: {}", ch, e);
            Jobs::new()
        })
    }

    fn try_write(&mut self, ch: CharId, data: &[u8]) -> Result<Jobs, Error> {
        let mut jobs = Jobs::new();
        match ch {
            CharId::SerialData => {
                if data.is_empty() {
                    return Err(codec::ProtocolError::TooShort { min: 1, got: 0 }.into());
                }
                if !self.link.is_connected() {
                    return Err(Error::NotConnected);
                }
                if !self.classic.write(data) {
                    return Err(Error::Transport("serial write failed"));
                }
            }
            CharId::BtScan => {
                if codec::decode_flag(data)? {
                    self.start_scan(&mut jobs)?;
                } else if self.link.handle(LinkInput::CancelScan)? == Step::StopDiscovery {
                    self.classic.stop_discovery();
                }
            }
            CharId::BtConnect => {
                if codec::decode_flag(data)? {
                    let target = self.config.target.as_ref().ok_or(Error::NoTarget)?;
                    let was_scanning = self.link.is_scanning();
                    let step = self.link.handle(LinkInput::Connect {
                        address: target.address,
                        attempts: self.timings.connect_attempts,
                    })?;
                    if let Step::RunConnect(job) = step {
                        if was_scanning {
                            self.classic.stop_discovery();
                        }
                        push(&mut jobs, Job::Connect(job));
                    }
                } else if self.link.handle(LinkInput::Disconnect)? == Step::Teardown {
                    push(&mut jobs, Job::TeardownTarget);
                }
            }
            CharId::ConfigName => {
                let name = codec::decode_name(data)?;
                self.update_config(|c| c.name = name)?;
                info!("App: name set to \"{}\", applies after restart", self.config.name);
            }
            CharId::ConfigPin => {
                let pin = codec::decode_pin(data)?;
                self.update_config(|c| c.pin_code = pin)?;
                info!("App: PIN changed, applies after restart");
            }
            CharId::ConfigTarget => {
                let target = codec::decode_target(data)?;
                match &target {
                    Some(t) => info!("App: target set to {} \"{}\"", t.address, t.name),
                    None => info!("App: target cleared"),
                }
                self.update_config(|c| c.target = target)?;
            }
            CharId::ConnectedIdleTimeout => {
                let secs = codec::decode_u32(data)?;
                self.update_config(|c| c.connected_idle_timeout_secs = secs)?;
                self.session.set_policy(idle_policy(&self.config));
                info!("App: connected idle timeout {}s", secs);
            }
            CharId::DisconnectedIdleTimeout => {
                let secs = codec::decode_u32(data)?;
                self.update_config(|c| c.disconnected_idle_timeout_secs = secs)?;
                self.session.set_policy(idle_policy(&self.config));
                info!("App: disconnected idle timeout {}s", secs);
            }
            CharId::Restart => {
                if codec::decode_flag(data)? {
                    self.store.erase()?;
                    self.config = BridgeConfig::default();
                    warn!("App: settings erased");
                }
                push(&mut jobs, Job::Shutdown(ShutdownKind::Restart));
            }
            CharId::Sleep => push(&mut jobs, Job::Shutdown(ShutdownKind::DeepSleep)),
            CharId::OtaUpdate => return self.ota_write(data),
            CharId::BatteryVoltage | CharId::BatteryLevel | CharId::DebugLog | CharId::MtuInfo => {
                return Err(Error::NotWritable(ch));
            }
        }
        Ok(jobs)
    }

    fn start_scan(&mut self, jobs: &mut Jobs) -> Result<(), Error> {
        let Step::RunScan { generation } = self.link.handle(LinkInput::StartScan)? else {
            return Ok(());
        };
        if !self.classic.start_discovery() {
            if let Err(e) = self.link.handle(LinkInput::ScanStartFailed { generation }) {
                warn!("Link: scan rollback failed: {}", e);
            }
            return Err(Error::Transport("discovery refused"));
        }
        push(jobs, Job::Scan { generation });
        Ok(())
    }

    /// Apply `edit` to a copy of the settings and persist it; the live
    /// settings only change once the store accepted them.
    fn update_config(&mut self, edit: impl FnOnce(&mut BridgeConfig)) -> Result<(), Error> {
        let mut next = self.config.clone();
        edit(&mut next);
        self.store.save(&next)?;
        self.config = next;
        Ok(())
    }

    fn write_cccd(&mut self, ch: CharId, data: &[u8]) {
        let Ok(raw) = <[u8; 2]>::try_from(data) else {
            warn!("GATT: CCCD write for {:?} with {} bytes ignored", ch, data.len());
            return;
        };
        let sub = Subscription::from_cccd(u16::from_le_bytes(raw));
        debug!("GATT: {:?} subscription {:?}", ch, sub);
        self.session.set_subscription(ch, sub);
    }

    // ── OTA ───────────────────────────────────────────────────

    fn ota_write(&mut self, data: &[u8]) -> Result<Jobs, Error> {
        let ota = self.ota.as_mut().ok_or(Error::OtaUnavailable)?;
        let message = OtaMessage::decode(data)?;

        let finishing = matches!(message, OtaMessage::Finish { .. });
        let result = match message {
            OtaMessage::Start { format, size } => ota.start(format, size),
            OtaMessage::Chunk(bytes) => ota.chunk(bytes).map(|_| ()),
            OtaMessage::Finish { signature } => ota.finish(signature),
        };

        if let Err(e) = result {
            self.notify(CharId::OtaUpdate, &[OTA_STATUS_FAILURE]);
            return Err(e.into());
        }
        let mut jobs = Jobs::new();
        if finishing {
            self.notify(CharId::OtaUpdate, &[OTA_STATUS_SUCCESS]);
            push(&mut jobs, Job::Shutdown(ShutdownKind::Restart));
        }
        Ok(jobs)
    }

    // ── Target link ───────────────────────────────────────────

    fn relay_inbound(&mut self, data: &[u8]) {
        let outbox = &self.outbox;
        self.framer.feed(data, |frame| {
            post(outbox, Notification::new(CharId::SerialData, frame));
        });
    }

    /// Turn queued link events into notifications.
    fn flush_link_events(&mut self) {
        while let Some(event) = self.link.next_event() {
            match event {
                LinkEvent::ScanStarted => self.notify(CharId::BtScan, &[STATE_ACTIVE]),
                LinkEvent::DeviceFound(device) => {
                    debug!("Link: found {} \"{}\" ({} dBm)", device.address, device.name, device.rssi);
                    post(
                        &self.outbox,
                        Notification {
                            ch: CharId::BtScan,
                            value: codec::encode_scan_result(&device),
                        },
                    );
                }
                LinkEvent::ScanFinished { .. } => {
                    let state = self.scan_state();
                    self.notify(CharId::BtScan, &[state]);
                }
                LinkEvent::ConnectAttempt { attempt, of } => {
                    info!("Link: connect attempt {}/{}", attempt, of);
                }
                LinkEvent::ConnectionChanged(up) => {
                    if !up {
                        self.framer.reset();
                    }
                    self.notify(CharId::BtConnect, &[u8::from(up)]);
                }
            }
        }
    }

    fn notify(&self, ch: CharId, value: &[u8]) {
        post(&self.outbox, Notification::new(ch, value));
    }

    /// Activity refresh; its own log output must not count as activity.
    fn touch(&mut self, now: u64) {
        let _quiet = suspend_forwarding();
        self.session.touch(now);
    }
}

impl<C: ConfigPort, F: FirmwarePort> LinkHost for Mutex<BridgeService<C, F>> {
    fn with_link<R>(&self, f: impl FnOnce(&mut TargetLink) -> R) -> R {
        let mut service = self.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut service.link);
        service.flush_link_events();
        out
    }
}
