//! Runtime: stack callbacks in, deferred work and notifications out.
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │  Radio callback (Bluedroid / SPP task)                         │
//!  │    EventHandler::on_event ─▶ lock ─▶ BridgeService ─▶ unlock   │
//!  │                                  │ Reply.jobs                  │
//!  │                                  ▼                             │
//!  │        one named task per Job (scan, connect, shutdown, …)     │
//!  └──────────────────────────────────────────────────────────────┘
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │  bridge-exec thread: edge_executor::LocalExecutor             │
//!  │   ┌──────────────┐  ┌────────────────┐  ┌─────────────────┐   │
//!  │   │ notify pump  │  │ idle sweep     │  │ battery sample  │   │
//!  │   │ outbox.await │  │ 30 s ⏱         │  │ 60 s ⏱          │   │
//!  │   └──────────────┘  └────────────────┘  └─────────────────┘   │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The service lock is never held across a transport call that can
//! block, a sleep, or a notification send.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::config::Timings;
use crate::events::{BridgeEvent, Notification, Outbox};
use crate::link::driver;
use crate::power;
use crate::protocol::codec::AttrValue;

use super::commands::Job;
use super::ports::{BatteryPort, ClassicPort, ClockPort, ConfigPort, FirmwarePort, GattPort, SystemPort};
use super::service::BridgeService;
use super::tasks::{self, TaskSpec};

/// Entry point the radio adapters call with every stack event.
pub trait EventHandler: Send + Sync {
    /// Handle `event`; returns the value to answer a read with.
    fn on_event(&self, event: BridgeEvent<'_>) -> Option<AttrValue>;
}

/// Transports and platform services used by jobs and the background loops.
#[derive(Clone)]
pub struct Ports {
    pub classic: Arc<dyn ClassicPort>,
    pub gatt: Arc<dyn GattPort>,
    pub system: Arc<dyn SystemPort>,
    pub clock: Arc<dyn ClockPort>,
}

pub struct Runtime<C: ConfigPort, F: FirmwarePort> {
    service: Arc<Mutex<BridgeService<C, F>>>,
    outbox: Arc<Outbox>,
    ports: Ports,
    timings: Timings,
}

impl<C: ConfigPort, F: FirmwarePort> Clone for Runtime<C, F> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            outbox: Arc::clone(&self.outbox),
            ports: self.ports.clone(),
            timings: self.timings,
        }
    }
}

impl<C, F> Runtime<C, F>
where
    C: ConfigPort + Send + 'static,
    F: FirmwarePort + Send + 'static,
    F::Update: Send,
{
    pub fn new(service: BridgeService<C, F>, ports: Ports) -> Self {
        let outbox = Arc::clone(service.outbox());
        let timings = service.timings();
        Self {
            service: Arc::new(Mutex::new(service)),
            outbox,
            ports,
            timings,
        }
    }

    /// Exclusive access to the service.
    pub fn lock(&self) -> MutexGuard<'_, BridgeService<C, F>> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Feed one event and start its jobs; returns the read answer.
    pub fn handle_event(&self, event: BridgeEvent<'_>) -> Option<AttrValue> {
        let now = self.ports.clock.now_secs();
        let reply = self.lock().handle_event(event, now);
        for job in reply.jobs {
            self.spawn(job);
        }
        reply.value
    }

    // ── Jobs ──────────────────────────────────────────────────

    /// Run `job` on the calling thread until it completes.
    pub fn run(&self, job: Job) {
        let classic = &*self.ports.classic;
        match job {
            Job::Scan { generation } => {
                driver::run_scan(&*self.service, classic, generation, self.timings.scan_poll);
            }
            Job::Connect(connect) => {
                driver::run_connect(&*self.service, classic, connect, self.timings.link_poll);
            }
            Job::TeardownTarget => driver::run_teardown(&*self.service, classic),
            Job::DisconnectPeer { conn_id } => {
                info!("Runtime: disconnecting BLE peer {}", conn_id);
                self.ports.gatt.disconnect_peer(conn_id);
            }
            Job::StartAdvertising => self.ports.gatt.start_advertising(),
            Job::Shutdown(kind) => power::run_shutdown(
                kind,
                &*self.ports.gatt,
                classic,
                &*self.ports.system,
                self.timings.shutdown_grace,
            ),
        }
    }

    /// Run `job` on a task of its own.
    pub fn spawn(&self, job: Job) {
        let spec = match job {
            Job::Scan { .. } => TaskSpec::SCAN,
            Job::Connect(_) => TaskSpec::CONNECT,
            Job::TeardownTarget => TaskSpec::TEARDOWN,
            Job::DisconnectPeer { .. } | Job::StartAdvertising => TaskSpec::PEER,
            Job::Shutdown(_) => TaskSpec::SHUTDOWN,
        };
        let runtime = self.clone();
        if let Err(e) = tasks::spawn(spec, move || runtime.run(job)) {
            error!("Runtime: could not spawn {} for {:?}: {}", spec.display_name(), job, e);
        }
    }

    // ── Periodic work ─────────────────────────────────────────

    /// Send `n` to the peer if it subscribed to that characteristic.
    pub fn deliver(&self, n: &Notification) -> bool {
        let Some((conn_id, confirm)) = self.lock().delivery_target(n.ch) else {
            return false;
        };
        let sent = self.ports.gatt.notify(conn_id, n.ch, &n.value, confirm);
        if !sent {
            debug!("Runtime: notify {:?} not sent", n.ch);
        }
        sent
    }

    /// One idle-timeout check.
    pub fn sweep_once(&self) {
        let now = self.ports.clock.now_secs();
        let jobs = self.lock().sweep(now);
        for job in jobs {
            self.spawn(job);
        }
    }

    /// Take one battery sample and publish it.
    pub fn sample_battery(&self, battery: &mut dyn BatteryPort) {
        let Some(millivolts) = battery.read_millivolts() else {
            warn!("Runtime: battery sample failed");
            return;
        };
        let jobs = self.lock().update_battery(millivolts);
        for job in jobs {
            self.spawn(job);
        }
    }

    async fn notify_pump(&self) {
        loop {
            let n = self.outbox.receive().await;
            self.deliver(&n);
        }
    }

    async fn sweep_loop(&self) {
        loop {
            async_io_mini::Timer::after(self.timings.idle_sweep).await;
            self.sweep_once();
        }
    }

    async fn battery_loop(&self, mut battery: Box<dyn BatteryPort>) {
        loop {
            self.sample_battery(battery.as_mut());
            async_io_mini::Timer::after(self.timings.battery_poll).await;
        }
    }

    /// Start the executor thread running the notification pump, the idle
    /// sweep and, if a battery is fitted, battery sampling.
    pub fn start_background(&self, battery: Option<Box<dyn BatteryPort>>) -> io::Result<JoinHandle<()>> {
        let runtime = self.clone();
        tasks::spawn(TaskSpec::EXECUTOR, move || runtime.run_background(battery))
    }

    fn run_background(self, battery: Option<Box<dyn BatteryPort>>) {
        let executor: edge_executor::LocalExecutor<'_, 4> = edge_executor::LocalExecutor::new();

        executor.spawn(self.notify_pump()).detach();
        executor.spawn(self.sweep_loop()).detach();
        match battery {
            Some(battery) => executor.spawn(self.battery_loop(battery)).detach(),
            None => info!("Runtime: no battery monitor"),
        }

        info!(
            "Runtime: background loops started (sweep {:?}, battery {:?})",
            self.timings.idle_sweep, self.timings.battery_poll
        );
        futures_lite::future::block_on(executor.run(core::future::pending::<()>()));
    }
}

impl<C, F> EventHandler for Runtime<C, F>
where
    C: ConfigPort + Send + 'static,
    F: FirmwarePort + Send + 'static,
    F::Update: Send,
{
    fn on_event(&self, event: BridgeEvent<'_>) -> Option<AttrValue> {
        self.handle_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::NvsAdapter;
    use crate::adapters::partition::SimFirmware;
    use crate::link::BtAddress;
    use crate::protocol::CharId;
    use crate::session::PeerAddress;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Gatt {
        sent: Mutex<Vec<(u16, CharId, Vec<u8>, bool)>>,
    }

    impl GattPort for Gatt {
        fn notify(&self, conn_id: u16, ch: CharId, value: &[u8], confirm: bool) -> bool {
            self.sent.lock().unwrap().push((conn_id, ch, value.to_vec(), confirm));
            true
        }
        fn disconnect_peer(&self, _: u16) {}
        fn start_advertising(&self) {}
        fn shutdown(&self) {}
    }

    struct Idle;

    impl ClassicPort for Idle {
        fn start_discovery(&self) -> bool {
            true
        }
        fn clear_discovery_cache(&self) {}
        fn stop_discovery(&self) {}
        fn connect(&self, _: &BtAddress) -> bool {
            false
        }
        fn is_connected(&self) -> bool {
            false
        }
        fn disconnect(&self) {}
        fn write(&self, _: &[u8]) -> bool {
            false
        }
        fn shutdown(&self) {}
    }

    impl SystemPort for Idle {
        fn restart(&self) {}
        fn deep_sleep(&self) {}
    }

    #[derive(Default)]
    struct Clock(AtomicU64);

    impl ClockPort for Clock {
        fn now_secs(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn runtime() -> (Runtime<NvsAdapter, SimFirmware>, Arc<Gatt>) {
        let gatt = Arc::new(Gatt::default());
        let classic: Arc<dyn ClassicPort> = Arc::new(Idle);
        let service = BridgeService::new(
            NvsAdapter::new().unwrap(),
            None,
            Arc::clone(&classic),
            Arc::new(Outbox::new()),
            Timings::immediate(),
            0,
        );
        let ports = Ports {
            classic,
            gatt: gatt.clone(),
            system: Arc::new(Idle),
            clock: Arc::new(Clock::default()),
        };
        (Runtime::new(service, ports), gatt)
    }

    #[test]
    fn unsubscribed_notifications_are_not_sent() {
        let (rt, gatt) = runtime();
        rt.handle_event(BridgeEvent::PeerConnected {
            conn_id: 1,
            peer: PeerAddress([1; 6]),
        });
        let n = Notification::new(CharId::SerialData, b"hi\n");
        assert!(!rt.deliver(&n));

        rt.handle_event(BridgeEvent::SubscriptionWrite {
            ch: CharId::SerialData,
            data: &[0x01, 0x00],
        });
        assert!(rt.deliver(&n));
        assert_eq!(
            gatt.sent.lock().unwrap().as_slice(),
            [(1, CharId::SerialData, b"hi\n".to_vec(), false)]
        );
    }

    #[test]
    fn reads_are_answered() {
        let (rt, _) = runtime();
        let value = rt.handle_event(BridgeEvent::Read { ch: CharId::MtuInfo });
        assert_eq!(value.unwrap().as_slice(), 23u32.to_le_bytes());
        assert!(rt.handle_event(BridgeEvent::Read { ch: CharId::Sleep }).is_none());
    }

    #[test]
    fn connect_job_runs_to_failure() {
        let (rt, _) = runtime();
        rt.handle_event(BridgeEvent::Write {
            ch: CharId::ConfigTarget,
            data: &[1, 2, 3, 4, 5, 6],
        });
        let job = rt.lock().write(CharId::BtConnect, &[1]);
        let [Job::Connect(connect)] = job.as_slice() else {
            panic!("no connect job: {job:?}");
        };
        rt.run(Job::Connect(*connect));
        assert!(!rt.lock().link().is_connected());
        let states: Vec<_> = core::iter::from_fn(|| rt.outbox().try_receive().ok())
            .filter(|n| n.ch == CharId::BtConnect)
            .map(|n| n.value.to_vec())
            .collect();
        assert_eq!(states, [vec![0]]);
    }
}
