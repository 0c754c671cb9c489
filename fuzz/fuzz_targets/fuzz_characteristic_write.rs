//! Fuzz target: characteristic write dispatch
//!
//! Replays arbitrary `[selector, len, payload...]` records as GATT writes
//! against a service backed by the host simulations. No write may panic,
//! and whatever gets through must leave a configuration that would pass
//! validation on the next boot.
//!
//! cargo fuzz run fuzz_characteristic_write

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use x1bridge::adapters::classic::SimClassic;
use x1bridge::adapters::nvs::NvsAdapter;
use x1bridge::adapters::partition::SimFirmware;
use x1bridge::app::service::BridgeService;
use x1bridge::config::{Timings, validate_config};
use x1bridge::events::{BridgeEvent, Outbox};
use x1bridge::ota::OtaEngine;
use x1bridge::protocol::CharId;
use x1bridge::session::PeerAddress;

const CHARS: [CharId; 15] = [
    CharId::BatteryVoltage,
    CharId::SerialData,
    CharId::BtScan,
    CharId::BtConnect,
    CharId::ConfigName,
    CharId::ConfigPin,
    CharId::ConfigTarget,
    CharId::DebugLog,
    CharId::Restart,
    CharId::OtaUpdate,
    CharId::ConnectedIdleTimeout,
    CharId::DisconnectedIdleTimeout,
    CharId::Sleep,
    CharId::MtuInfo,
    CharId::BatteryLevel,
];

fuzz_target!(|data: &[u8]| {
    let Ok(nvs) = NvsAdapter::new() else {
        return;
    };
    // Junk key: every Finish fails verification.
    let ota = OtaEngine::new(SimFirmware::new(), &[0x04; 65]);
    let mut service = BridgeService::new(
        nvs,
        Some(ota),
        Arc::new(SimClassic::new()),
        Arc::new(Outbox::new()),
        Timings::immediate(),
        0,
    );
    let peer = PeerAddress([1; 6]);
    service.handle_event(BridgeEvent::PeerConnected { conn_id: 0, peer }, 0);
    service.handle_event(BridgeEvent::AuthComplete { peer, success: true, reason: 0 }, 0);

    let mut rest = data;
    let mut now = 0;
    while let [selector, len, tail @ ..] = rest {
        let len = usize::from(*len).min(tail.len());
        let (payload, next) = tail.split_at(len);
        let ch = CHARS[usize::from(*selector) % CHARS.len()];
        now += 1;

        if selector & 0x80 != 0 {
            service.handle_event(BridgeEvent::SubscriptionWrite { ch, data: payload }, now);
        } else {
            service.handle_event(BridgeEvent::Write { ch, data: payload }, now);
        }
        let _ = service.handle_event(BridgeEvent::Read { ch }, now);
        while service.outbox().try_receive().is_ok() {}

        assert!(validate_config(service.config()).is_ok());
        rest = next;
    }
    let _ = service.sweep(now + 1_000_000);
});
