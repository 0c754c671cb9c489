//! Bluetooth Classic side of the bridge: discovery, connect with retries,
//! serial relay in both directions and teardown, against the scripted SPP
//! transport.

use std::thread;

use x1bridge::app::commands::Job;
use x1bridge::link::{BtAddress, LinkState};
use x1bridge::protocol::CharId;
use x1bridge::protocol::codec::{STATE_ACTIVE, STATE_IDLE, STATE_UNAVAILABLE, decode_scan_result};

use crate::mock_ports::{Bridge, wait_until};

const PRINTER: BtAddress = BtAddress([0x00, 0x1B, 0xDC, 0x07, 0x31, 0x5E]);
const SCALE: BtAddress = BtAddress([0x00, 0x1B, 0xDC, 0x07, 0x31, 0x5F]);

fn bridge() -> Bridge {
    let bridge = Bridge::new();
    bridge.pair_phone(&[CharId::SerialData, CharId::BtScan, CharId::BtConnect]);
    bridge
}

fn set_target(bridge: &Bridge, address: BtAddress) {
    let mut payload = address.0.to_vec();
    payload.extend_from_slice(b"Printer");
    bridge.write(CharId::ConfigTarget, &payload);
}

fn connect_job(bridge: &Bridge) -> Job {
    bridge.write(CharId::BtConnect, &[1]);
    let jobs = bridge.take_jobs();
    match jobs.as_slice() {
        [job @ Job::Connect(_)] => *job,
        other => panic!("expected a connect job, got {other:?}"),
    }
}

/// Connect on a task of its own; the job keeps monitoring until the link
/// goes down.
fn connect_in_background(bridge: &Bridge) -> thread::JoinHandle<()> {
    let job = connect_job(bridge);
    let runtime = bridge.runtime.clone();
    let handle = thread::spawn(move || runtime.run(job));
    assert!(wait_until(|| bridge.runtime.lock().link().is_connected()));
    handle
}

// ── Discovery ─────────────────────────────────────────────────

#[test]
fn scan_reports_named_devices_once_per_window() {
    let bridge = bridge();
    bridge.write(CharId::BtScan, &[1]);
    assert!(matches!(bridge.take_jobs().as_slice(), [Job::Scan { .. }]));
    assert!(bridge.classic.link().discovering);
    assert_eq!(bridge.read(CharId::BtScan).unwrap(), [STATE_ACTIVE]);

    assert!(bridge.classic.inquiry_result(PRINTER, b"Printer", -48));
    assert!(!bridge.classic.inquiry_result(PRINTER, b"Printer", -48));
    assert!(!bridge.classic.inquiry_result(SCALE, b"", -70));

    let results: Vec<_> = bridge
        .notified(CharId::BtScan)
        .into_iter()
        .filter(|v| v.len() > 1)
        .map(|v| decode_scan_result(&v).unwrap())
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].address, PRINTER);
    assert_eq!(results[0].name.as_str(), "Printer");
    assert_eq!(results[0].rssi, -48);
}

#[test]
fn scan_runs_its_course_then_stops() {
    let bridge = bridge();
    bridge.write(CharId::BtScan, &[1]);
    let polls = bridge.runtime.lock().timings().scan_polls;
    bridge.run_jobs();

    let link = bridge.classic.link();
    assert!(!link.discovering);
    assert_eq!(link.cache_clears, u32::from(polls) - 1);
    assert_eq!(bridge.runtime.lock().link().state(), LinkState::Idle);
    assert_eq!(
        bridge.notified(CharId::BtScan),
        [vec![STATE_ACTIVE], vec![STATE_IDLE]]
    );
}

#[test]
fn devices_after_the_scan_are_ignored() {
    let bridge = bridge();
    bridge.write(CharId::BtScan, &[1]);
    bridge.write(CharId::BtScan, &[0]);
    assert!(!bridge.classic.link().discovering);

    bridge.classic.inquiry_result(PRINTER, b"Printer", -48);
    assert_eq!(
        bridge.notified(CharId::BtScan),
        [vec![STATE_ACTIVE], vec![STATE_IDLE]]
    );
}

#[test]
fn refused_discovery_ends_the_scan() {
    let bridge = bridge();
    bridge.classic.set_refuse_discovery(true);
    bridge.write(CharId::BtScan, &[1]);

    assert!(bridge.take_jobs().is_empty());
    assert_eq!(bridge.read(CharId::BtScan).unwrap(), [STATE_IDLE]);
    assert_eq!(
        bridge.notified(CharId::BtScan),
        [vec![STATE_ACTIVE], vec![STATE_IDLE]]
    );
}

// ── Connect ───────────────────────────────────────────────────

#[test]
fn connect_without_target_does_nothing() {
    let bridge = bridge();
    assert_eq!(bridge.read(CharId::BtConnect).unwrap(), [STATE_UNAVAILABLE]);
    bridge.write(CharId::BtConnect, &[1]);
    assert!(bridge.take_jobs().is_empty());
    assert_eq!(bridge.classic.link().connect_attempts, 0);
}

#[test]
fn unreachable_target_exhausts_retries() {
    let bridge = bridge();
    set_target(&bridge, PRINTER);
    let job = connect_job(&bridge);
    bridge.runtime.run(job);

    let attempts = bridge.runtime.lock().timings().connect_attempts;
    assert_eq!(bridge.classic.link().connect_attempts, u32::from(attempts));
    assert_eq!(bridge.runtime.lock().link().state(), LinkState::Idle);
    assert_eq!(bridge.notified(CharId::BtConnect), [vec![0]]);
    assert_eq!(bridge.read(CharId::BtConnect).unwrap(), [STATE_IDLE]);
}

#[test]
fn second_connect_while_connecting_is_refused() {
    let bridge = bridge();
    set_target(&bridge, PRINTER);
    let _job = connect_job(&bridge);
    bridge.write(CharId::BtConnect, &[1]);
    assert!(bridge.take_jobs().is_empty());
}

#[test]
fn connect_relays_serial_both_ways() {
    let bridge = bridge();
    set_target(&bridge, PRINTER);
    bridge.classic.set_reachable(PRINTER);
    let monitor = connect_in_background(&bridge);

    assert_eq!(bridge.read(CharId::BtConnect).unwrap(), [STATE_ACTIVE]);
    assert_eq!(bridge.notified(CharId::BtConnect), [vec![1]]);

    bridge.write(CharId::SerialData, b"PRINT 1\n");
    assert_eq!(bridge.classic.link().sent, b"PRINT 1\n");

    bridge.classic.receive(b"OK\r\nREA");
    bridge.classic.receive(b"DY\n");
    assert_eq!(
        bridge.notified(CharId::SerialData),
        [b"OK\r\n".to_vec(), b"READY\n".to_vec()]
    );

    bridge.classic.drop_link();
    monitor.join().unwrap();
    assert_eq!(bridge.runtime.lock().link().state(), LinkState::Idle);
    assert_eq!(bridge.notified(CharId::BtConnect), [vec![1], vec![0]]);
}

#[test]
fn lost_link_drops_partial_frame() {
    let bridge = bridge();
    set_target(&bridge, PRINTER);
    bridge.classic.set_reachable(PRINTER);
    let monitor = connect_in_background(&bridge);

    bridge.classic.receive(b"half a li");
    bridge.classic.drop_link();
    monitor.join().unwrap();

    bridge.classic.receive(b"ne\n");
    assert_eq!(bridge.notified(CharId::SerialData), [b"ne\n".to_vec()]);
}

#[test]
fn phone_disconnect_tears_the_link_down() {
    let bridge = bridge();
    set_target(&bridge, PRINTER);
    bridge.classic.set_reachable(PRINTER);
    let monitor = connect_in_background(&bridge);

    bridge.write(CharId::BtConnect, &[0]);
    assert_eq!(bridge.take_jobs(), [Job::TeardownTarget]);
    bridge.run_jobs();
    monitor.join().unwrap();

    assert_eq!(bridge.classic.link().connected, None);
    assert_eq!(bridge.runtime.lock().link().state(), LinkState::Idle);

    // Serial writes are refused once the link is gone.
    bridge.write(CharId::SerialData, b"late\n");
    assert!(bridge.classic.link().sent.is_empty());
}

#[test]
fn connect_ends_scanning_for_good() {
    let bridge = bridge();
    bridge.write(CharId::BtScan, &[1]);
    bridge.take_jobs();
    set_target(&bridge, PRINTER);
    bridge.classic.set_reachable(PRINTER);

    let monitor = connect_in_background(&bridge);
    assert!(!bridge.classic.link().discovering);
    assert_eq!(
        bridge.notified(CharId::BtScan),
        [vec![STATE_ACTIVE], vec![STATE_UNAVAILABLE]]
    );

    bridge.write(CharId::BtScan, &[1]);
    assert!(bridge.take_jobs().is_empty());
    assert_eq!(bridge.read(CharId::BtScan).unwrap(), [STATE_UNAVAILABLE]);

    bridge.classic.drop_link();
    monitor.join().unwrap();
    bridge.write(CharId::BtScan, &[1]);
    assert!(bridge.take_jobs().is_empty());
}

#[test]
fn serial_write_without_link_is_dropped() {
    let bridge = bridge();
    bridge.write(CharId::SerialData, b"AT\n");
    assert!(bridge.classic.link().sent.is_empty());
}
