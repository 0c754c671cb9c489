//! X1 Bridge firmware entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  BleAdapter      ClassicAdapter   NvsAdapter    EspFirmware    │
//! │  (GattPort)      (ClassicPort)    (ConfigPort)  (FirmwarePort) │
//! │  EspSystem       AdcBattery       MonotonicClock               │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │        BridgeService (Arc<Mutex<…>>, pure logic)       │    │
//! │  │  Session · TargetLink · Framer · OtaEngine             │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Runtime: job tasks · notify pump · idle sweep · battery       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{LevelFilter, error, info, warn};

use x1bridge::adapters::battery::battery_monitor;
use x1bridge::adapters::ble::{self, BleAdapter};
use x1bridge::adapters::classic::{self, ClassicAdapter};
use x1bridge::adapters::nvs::NvsAdapter;
use x1bridge::adapters::partition::{EspFirmware, mark_running_image_valid};
use x1bridge::adapters::system::EspSystem;
use x1bridge::adapters::time::MonotonicClock;
use x1bridge::app::ports::{BatteryPort, ClassicPort, ClockPort, SystemPort};
use x1bridge::app::runtime::{EventHandler, Ports, Runtime};
use x1bridge::app::service::BridgeService;
use x1bridge::config::Timings;
use x1bridge::events::{DebugLogSink, Outbox};
use x1bridge::logging;
use x1bridge::ota::OtaEngine;
use x1bridge::ota::verify::embedded_public_key;
use x1bridge::power::BatteryStatus;

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    let logger = logging::init(LevelFilter::Info).context("logger already set")?;
    info!("X1 Bridge v{}", env!("CARGO_PKG_VERSION"));

    mark_running_image_valid();

    // ── 2. Battery gate: a flat cell never starts the radios ──
    let mut battery = battery_monitor();
    if let Some(mv) = battery.as_mut().and_then(|b| b.read_millivolts()) {
        let status = BatteryStatus::from_millivolts(mv);
        info!("Battery: {} mV ({}%)", status.millivolts, status.level);
        if status.is_critical() {
            warn!("Battery: below cutoff at boot, going to deep sleep");
            EspSystem.deep_sleep();
            return Ok(());
        }
    }

    // ── 3. Settings and update engine ─────────────────────────
    let nvs = NvsAdapter::new().map_err(|e| anyhow!("NVS init failed: {e}"))?;
    let outbox = Arc::new(Outbox::new());
    let ota = embedded_public_key().map(|key| OtaEngine::new(EspFirmware, key));
    let ota_available = ota.is_some();

    // ── 4. Radios ─────────────────────────────────────────────
    ble::init_bluetooth().context("Bluetooth controller")?;
    let classic: Arc<dyn ClassicPort> = Arc::new(ClassicAdapter::start().context("SPP")?);
    let gatt = Arc::new(BleAdapter::new());

    let service = BridgeService::new(
        nvs,
        ota,
        Arc::clone(&classic),
        Arc::clone(&outbox),
        Timings::default(),
        MonotonicClock.now_secs(),
    );
    let config = service.config().clone();
    info!("Config: name \"{}\"", config.name);
    if let Some(target) = &config.target {
        info!("Config: target {} \"{}\"", target.address, target.name);
    }

    let ports = Ports {
        classic,
        gatt: gatt.clone(),
        system: Arc::new(EspSystem),
        clock: Arc::new(MonotonicClock),
    };
    let runtime = Runtime::new(service, ports);

    // Handlers go in before advertising starts so no peer event is lost.
    let handler: Arc<dyn EventHandler> = Arc::new(runtime.clone());
    ble::install_event_handler(Arc::clone(&handler));
    classic::install_event_handler(handler);
    gatt.start(&config, ota_available).context("GATT server")?;

    // ── 5. Background loops ───────────────────────────────────
    let background = runtime.start_background(battery).context("executor task")?;
    logger.install_sink(Arc::new(DebugLogSink(outbox)));
    info!("ready");

    if background.join().is_err() {
        error!("Runtime: executor task panicked");
    }
    Ok(())
}
