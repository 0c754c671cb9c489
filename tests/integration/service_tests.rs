//! Phone-facing behaviour of the bridge: settings, pairing, subscriptions,
//! idle timeouts and battery handling, driven through the simulated GATT
//! server exactly as the Bluedroid callbacks would drive it.

use x1bridge::adapters::battery::SimBattery;
use x1bridge::adapters::ble::GattCall;
use x1bridge::app::commands::Job;
use x1bridge::config::BridgeConfig;
use x1bridge::events::BridgeEvent;
use x1bridge::power::ShutdownKind;
use x1bridge::protocol::CharId;
use x1bridge::session::PeerAddress;

use crate::mock_ports::{Bridge, MockNvs, PHONE, PHONE_CONN, wait_until};

// ── Settings ──────────────────────────────────────────────────

#[test]
fn settings_survive_a_reboot() {
    let nvs = MockNvs::new();
    let bridge = Bridge::boot(nvs.clone(), None);
    bridge.pair_phone(&[]);

    bridge.write(CharId::ConfigName, b"Workshop");
    bridge.write(CharId::ConfigPin, &654_321u32.to_le_bytes());
    let mut target = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    target.extend_from_slice(b"Label Printer");
    bridge.write(CharId::ConfigTarget, &target);
    bridge.write(CharId::ConnectedIdleTimeout, &120u32.to_le_bytes());
    bridge.write(CharId::DisconnectedIdleTimeout, &0u32.to_le_bytes());

    let rebooted = Bridge::boot(nvs, None);
    assert_eq!(rebooted.read(CharId::ConfigName).unwrap(), b"Workshop");
    assert_eq!(rebooted.read(CharId::ConfigTarget).unwrap(), target);
    assert_eq!(
        rebooted.read(CharId::ConnectedIdleTimeout).unwrap(),
        120u32.to_le_bytes()
    );
    assert_eq!(
        rebooted.read(CharId::DisconnectedIdleTimeout).unwrap(),
        0u32.to_le_bytes()
    );
    assert_eq!(rebooted.runtime.lock().config().pin_code, 654_321);
}

#[test]
fn pin_is_write_only() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    bridge.write(CharId::ConfigPin, &111_111u32.to_le_bytes());
    assert_eq!(bridge.read(CharId::ConfigPin), None);
}

#[test]
fn failed_store_keeps_live_settings() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    bridge.nvs.fail_writes(true);

    bridge.write(CharId::ConfigName, b"Nope");
    assert_eq!(bridge.runtime.lock().config(), &BridgeConfig::default());
    assert_eq!(bridge.nvs.stored(), None);
}

#[test]
fn out_of_range_pin_is_rejected() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    bridge.write(CharId::ConfigPin, &1_000_000u32.to_le_bytes());
    assert_eq!(
        bridge.runtime.lock().config().pin_code,
        BridgeConfig::default().pin_code
    );
}

#[test]
fn restart_with_erase_wipes_settings_and_reboots() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    bridge.write(CharId::ConfigName, b"Garage");
    assert!(bridge.nvs.stored().is_some());

    bridge.write(CharId::Restart, &[1]);
    assert_eq!(bridge.take_jobs(), [Job::Shutdown(ShutdownKind::Restart)]);
    assert_eq!(bridge.nvs.stored(), None);
    assert_eq!(bridge.read(CharId::ConfigName).unwrap(), BridgeConfig::default().name.as_bytes());

    bridge.runtime.run(Job::Shutdown(ShutdownKind::Restart));
    assert_eq!(bridge.system.restarts(), 1);
    assert!(bridge.classic.link().shut_down);
    assert!(bridge.gatt.calls().contains(&GattCall::Shutdown));
}

#[test]
fn plain_restart_keeps_settings() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    bridge.write(CharId::ConfigName, b"Garage");
    bridge.write(CharId::Restart, &[0]);
    bridge.run_jobs();

    assert_eq!(bridge.system.restarts(), 1);
    assert_eq!(bridge.nvs.stored().unwrap().name.as_str(), "Garage");
}

#[test]
fn sleep_write_powers_down() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    bridge.write(CharId::Sleep, &[1]);
    bridge.run_jobs();
    assert_eq!(bridge.system.sleeps(), 1);
    assert_eq!(bridge.system.restarts(), 0);
}

// ── Session ───────────────────────────────────────────────────

#[test]
fn second_phone_is_turned_away() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);

    bridge.gatt.peer(BridgeEvent::PeerConnected {
        conn_id: 1,
        peer: PeerAddress([0xAB; 6]),
    });
    bridge.run_jobs();

    assert_eq!(bridge.gatt.calls(), [GattCall::Disconnect(1)]);
    let rt = bridge.runtime.lock();
    let session = rt.session().session().unwrap();
    assert_eq!(session.peer, PHONE);
    assert_eq!(session.conn_id, PHONE_CONN);
}

#[test]
fn failed_pairing_drops_the_phone() {
    let bridge = Bridge::new();
    bridge.gatt.peer(BridgeEvent::PeerConnected {
        conn_id: PHONE_CONN,
        peer: PHONE,
    });
    bridge.gatt.peer(BridgeEvent::AuthComplete {
        peer: PHONE,
        success: false,
        reason: 0x61,
    });
    assert_eq!(bridge.take_jobs(), [Job::DisconnectPeer { conn_id: PHONE_CONN }]);
}

#[test]
fn disconnect_resumes_advertising_and_forgets_subscriptions() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[CharId::BatteryLevel]);
    let mut battery = SimBattery::new(3700);

    bridge.runtime.sample_battery(&mut battery);
    assert_eq!(bridge.notified(CharId::BatteryLevel), [vec![50]]);

    bridge.gatt.peer(BridgeEvent::PeerDisconnected { conn_id: PHONE_CONN });
    bridge.run_jobs();
    assert!(bridge.gatt.calls().contains(&GattCall::Advertise));

    // Same phone back, but it has not re-subscribed.
    bridge.pair_phone(&[]);
    battery.set(Some(4200));
    bridge.runtime.sample_battery(&mut battery);
    assert_eq!(bridge.notified(CharId::BatteryLevel), [vec![50]]);
    assert_eq!(bridge.read(CharId::BatteryLevel).unwrap(), [100]);
}

#[test]
fn mtu_is_reported() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    assert_eq!(bridge.read(CharId::MtuInfo).unwrap(), 23u32.to_le_bytes());
    bridge.gatt.peer(BridgeEvent::MtuChanged { mtu: 247 });
    assert_eq!(bridge.read(CharId::MtuInfo).unwrap(), 247u32.to_le_bytes());
}

#[test]
fn write_only_values_are_not_readable() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    for ch in [CharId::SerialData, CharId::Restart, CharId::OtaUpdate, CharId::Sleep] {
        assert_eq!(bridge.read(ch), None, "{ch:?}");
    }
}

// ── Idle timeouts ─────────────────────────────────────────────

#[test]
fn idle_phone_is_dropped_then_bridge_sleeps() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);

    bridge.clock.set(599);
    assert!(bridge.sweep().is_empty());
    bridge.clock.set(600);
    assert_eq!(bridge.sweep(), [Job::DisconnectPeer { conn_id: PHONE_CONN }]);
    // Re-armed: no second disconnect before the stack reports it.
    assert!(bridge.sweep().is_empty());

    bridge.gatt.peer(BridgeEvent::PeerDisconnected { conn_id: PHONE_CONN });
    bridge.clock.set(600 + 1799);
    assert!(bridge.sweep().is_empty());
    bridge.clock.set(600 + 1800);
    assert_eq!(bridge.sweep(), [Job::Shutdown(ShutdownKind::DeepSleep)]);
}

#[test]
fn activity_pushes_the_deadline_back() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);

    bridge.clock.set(500);
    bridge.read(CharId::BatteryVoltage);
    bridge.clock.set(1099);
    assert!(bridge.sweep().is_empty());
    bridge.clock.set(1100);
    assert_eq!(bridge.sweep(), [Job::DisconnectPeer { conn_id: PHONE_CONN }]);
}

#[test]
fn unpaired_traffic_does_not_count_as_activity() {
    let bridge = Bridge::new();
    bridge.gatt.peer(BridgeEvent::PeerConnected {
        conn_id: PHONE_CONN,
        peer: PHONE,
    });
    bridge.clock.set(300);
    bridge.read(CharId::MtuInfo);
    bridge.clock.set(600);
    assert_eq!(bridge.sweep(), [Job::DisconnectPeer { conn_id: PHONE_CONN }]);
}

#[test]
fn zero_timeout_never_fires() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    bridge.write(CharId::ConnectedIdleTimeout, &0u32.to_le_bytes());
    bridge.clock.set(1_000_000);
    assert!(bridge.sweep().is_empty());
}

// ── Battery ───────────────────────────────────────────────────

#[test]
fn battery_reads_follow_samples() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[]);
    assert_eq!(bridge.read(CharId::BatteryVoltage).unwrap(), 0u32.to_le_bytes());

    bridge.runtime.sample_battery(&mut SimBattery::new(3950));
    assert_eq!(bridge.read(CharId::BatteryVoltage).unwrap(), 3950u32.to_le_bytes());
    assert_eq!(bridge.read(CharId::BatteryLevel).unwrap(), [75]);
}

#[test]
fn failed_sample_changes_nothing() {
    let bridge = Bridge::new();
    let mut battery = SimBattery::new(3950);
    battery.set(None);
    bridge.runtime.sample_battery(&mut battery);
    assert!(bridge.runtime.lock().battery().is_none());
}

#[test]
fn critical_battery_puts_the_bridge_to_sleep() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[CharId::BatteryLevel]);

    bridge.runtime.sample_battery(&mut SimBattery::new(3050));
    assert!(wait_until(|| bridge.system.sleeps() == 1));
    assert!(bridge.classic.link().shut_down);
    assert_eq!(bridge.notified(CharId::BatteryLevel), [vec![0]]);
}
