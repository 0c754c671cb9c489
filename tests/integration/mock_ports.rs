//! Simulated ports wired into a real runtime.
//!
//! Stack events enter through the same handler slots the radio callbacks
//! use. Jobs are recorded instead of spawned, so each test decides when
//! (and on which thread) they run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use x1bridge::adapters::ble::SimGatt;
use x1bridge::adapters::classic::SimClassic;
use x1bridge::adapters::nvs::NvsAdapter;
use x1bridge::adapters::partition::SimFirmware;
use x1bridge::adapters::system::SimSystem;
use x1bridge::app::commands::Job;
use x1bridge::app::ports::{ClockPort, ConfigError, ConfigPort};
use x1bridge::app::runtime::{EventHandler, Ports, Runtime};
use x1bridge::app::service::BridgeService;
use x1bridge::config::{BridgeConfig, Timings};
use x1bridge::events::{BridgeEvent, Outbox};
use x1bridge::ota::OtaEngine;
use x1bridge::protocol::CharId;
use x1bridge::protocol::codec::AttrValue;
use x1bridge::session::PeerAddress;

pub const PHONE: PeerAddress = PeerAddress([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01]);
pub const PHONE_CONN: u16 = 0;

// ── Settings store ────────────────────────────────────────────

/// NVS simulation shared between "boots", with write-failure injection.
#[derive(Clone)]
pub struct MockNvs {
    inner: Arc<Mutex<NvsAdapter>>,
    fail_writes: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl MockNvs {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NvsAdapter::new().unwrap())),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Option<BridgeConfig> {
        self.inner.lock().unwrap().load().ok()
    }
}

impl ConfigPort for MockNvs {
    fn load(&self) -> Result<BridgeConfig, ConfigError> {
        self.inner.lock().unwrap().load()
    }

    fn save(&mut self, config: &BridgeConfig) -> Result<(), ConfigError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConfigError::IoError);
        }
        self.inner.lock().unwrap().save(config)
    }

    fn erase(&mut self) -> Result<(), ConfigError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConfigError::IoError);
        }
        self.inner.lock().unwrap().erase()
    }
}

// ── Clock ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct ManualClock(AtomicU64);

#[allow(dead_code)]
impl ManualClock {
    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl ClockPort for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Job recorder ──────────────────────────────────────────────

pub type BridgeRuntime = Runtime<MockNvs, SimFirmware>;

/// Event handler that serves the runtime's service but queues the jobs.
struct Recorder {
    runtime: BridgeRuntime,
    clock: Arc<ManualClock>,
    jobs: Mutex<Vec<Job>>,
}

impl EventHandler for Recorder {
    fn on_event(&self, event: BridgeEvent<'_>) -> Option<AttrValue> {
        let reply = self.runtime.lock().handle_event(event, self.clock.now_secs());
        self.jobs.lock().unwrap().extend(reply.jobs);
        reply.value
    }
}

// ── Bridge rig ────────────────────────────────────────────────

pub struct Bridge {
    pub runtime: BridgeRuntime,
    pub gatt: Arc<SimGatt>,
    pub classic: Arc<SimClassic>,
    pub system: Arc<SimSystem>,
    pub clock: Arc<ManualClock>,
    pub firmware: SimFirmware,
    pub nvs: MockNvs,
    recorder: Arc<Recorder>,
}

#[allow(dead_code)]
impl Bridge {
    /// Bridge on fresh settings without an update key.
    pub fn new() -> Self {
        Self::boot(MockNvs::new(), None)
    }

    pub fn with_ota_key(public_key: &[u8]) -> Self {
        Self::boot(MockNvs::new(), Some(public_key))
    }

    /// Boot on `nvs`, which may carry settings from an earlier boot.
    pub fn boot(nvs: MockNvs, public_key: Option<&[u8]>) -> Self {
        let gatt = Arc::new(SimGatt::new());
        let classic = Arc::new(SimClassic::new());
        let system = Arc::new(SimSystem::new());
        let clock = Arc::new(ManualClock::default());
        let firmware = SimFirmware::new();

        let ota = public_key.map(|key| OtaEngine::new(firmware.clone(), key));
        let service = BridgeService::new(
            nvs.clone(),
            ota,
            classic.clone(),
            Arc::new(Outbox::new()),
            Timings::immediate(),
            clock.now_secs(),
        );
        let ports = Ports {
            classic: classic.clone(),
            gatt: gatt.clone(),
            system: system.clone(),
            clock: clock.clone(),
        };
        let runtime = Runtime::new(service, ports);
        let recorder = Arc::new(Recorder {
            runtime: runtime.clone(),
            clock: clock.clone(),
            jobs: Mutex::new(Vec::new()),
        });
        gatt.install_handler(recorder.clone());
        classic.install_handler(recorder.clone());

        Self {
            runtime,
            gatt,
            classic,
            system,
            clock,
            firmware,
            nvs,
            recorder,
        }
    }

    // ── Phone side ────────────────────────────────────────────

    /// Connect the phone, pair it, and subscribe to `subscribe`.
    pub fn pair_phone(&self, subscribe: &[CharId]) {
        self.gatt.peer(BridgeEvent::PeerConnected {
            conn_id: PHONE_CONN,
            peer: PHONE,
        });
        self.gatt.peer(BridgeEvent::AuthComplete {
            peer: PHONE,
            success: true,
            reason: 0,
        });
        for &ch in subscribe {
            self.gatt.peer(BridgeEvent::SubscriptionWrite {
                ch,
                data: &[0x01, 0x00],
            });
        }
    }

    pub fn write(&self, ch: CharId, data: &[u8]) {
        self.gatt.peer(BridgeEvent::Write { ch, data });
    }

    pub fn read(&self, ch: CharId) -> Option<Vec<u8>> {
        self.gatt.peer(BridgeEvent::Read { ch }).map(|v| v.to_vec())
    }

    /// Deliver every queued notification, as the pump task would.
    pub fn pump(&self) {
        while let Ok(n) = self.runtime.outbox().try_receive() {
            self.runtime.deliver(&n);
        }
    }

    /// Values the phone received on `ch` so far.
    pub fn notified(&self, ch: CharId) -> Vec<Vec<u8>> {
        self.pump();
        self.gatt.notified(ch)
    }

    // ── Jobs ──────────────────────────────────────────────────

    /// Take the jobs requested since the last call.
    pub fn take_jobs(&self) -> Vec<Job> {
        std::mem::take(&mut *self.recorder.jobs.lock().unwrap())
    }

    /// Run every queued job on this thread, oldest first.
    pub fn run_jobs(&self) {
        for job in self.take_jobs() {
            self.runtime.run(job);
        }
    }

    pub fn sweep(&self) -> Vec<Job> {
        self.runtime.lock().sweep(self.clock.now_secs()).to_vec()
    }
}

/// Poll `cond` until it holds or two seconds pass.
#[allow(dead_code)]
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
