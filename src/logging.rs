//! Console logger with a Debug Log characteristic tap.
//!
//! On target, console output goes through `esp_idf_svc::log::EspLogger`,
//! so per-tag levels and the IDF line format apply. Host builds print the
//! same `I (1234) target: message` shape on stdout. Every completed line
//! is also handed to an installed [`LineSink`] for streaming to the phone.
//!
//! The tap is skipped while a [`ForwardingGuard`] is alive on the
//! logging thread, and is rate-limited so a chatty subsystem cannot
//! flood the BLE link.

use core::cell::Cell;
use core::marker::PhantomData;
use core::time::Duration;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use burster::Limiter;
use log::{LevelFilter, Log, Metadata, Record};

use crate::adapters::time::monotonic_now;
use crate::link::framer::InboundFramer;

/// Log lines per second forwarded to the sink, and burst capacity.
const FORWARD_RATE: u64 = 20;
const FORWARD_BURST: u64 = 40;

/// Receiver for completed log lines.
pub trait LineSink: Send + Sync {
    fn forward_line(&self, line: &[u8]);
}

thread_local! {
    static SUSPEND_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// While alive, log output on this thread is not forwarded.
pub struct ForwardingGuard {
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ForwardingGuard {
    fn drop(&mut self) {
        SUSPEND_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Suspend forwarding on the current thread until the guard drops.
pub fn suspend_forwarding() -> ForwardingGuard {
    SUSPEND_DEPTH.with(|d| d.set(d.get() + 1));
    ForwardingGuard {
        _thread_bound: PhantomData,
    }
}

pub fn forwarding_suspended() -> bool {
    SUSPEND_DEPTH.with(|d| d.get() > 0)
}

struct Tap {
    framer: InboundFramer,
    limiter: burster::TokenBucket<fn() -> Duration>,
    dropped: u32,
}

#[cfg(target_os = "espidf")]
type Console = esp_idf_svc::log::EspLogger;

#[cfg(not(target_os = "espidf"))]
type Console = StdoutConsole;

/// Host console: IDF-shaped lines on stdout.
#[cfg(not(target_os = "espidf"))]
struct StdoutConsole;

#[cfg(not(target_os = "espidf"))]
impl StdoutConsole {
    const fn new() -> Self {
        Self
    }
}

#[cfg(not(target_os = "espidf"))]
impl Log for StdoutConsole {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        use std::io::Write as _;
        let _ = std::io::stdout().lock().write_all(render(record).as_bytes());
    }

    fn flush(&self) {
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
    }
}

pub struct BridgeLogger {
    level: LevelFilter,
    console: Console,
    sink: OnceLock<Arc<dyn LineSink>>,
    tap: Mutex<Tap>,
}

impl BridgeLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            level,
            console: Console::new(),
            sink: OnceLock::new(),
            tap: Mutex::new(Tap {
                framer: InboundFramer::new(),
                limiter: burster::TokenBucket::new_with_time_provider(
                    FORWARD_RATE,
                    FORWARD_BURST,
                    monotonic_now as fn() -> Duration,
                ),
                dropped: 0,
            }),
        }
    }

    /// Attach the line sink. Only the first call has an effect.
    pub fn install_sink(&self, sink: Arc<dyn LineSink>) {
        let _ = self.sink.set(sink);
    }

    /// Lines withheld by the rate limiter so far.
    pub fn dropped_lines(&self) -> u32 {
        self.tap.lock().unwrap_or_else(PoisonError::into_inner).dropped
    }

    fn forward(&self, record: &Record<'_>) {
        let Some(sink) = self.sink.get() else {
            return;
        };
        if forwarding_suspended() {
            return;
        }
        // Anything the sink logs must not come back here.
        let _guard = suspend_forwarding();
        let line = render(record);
        let mut tap = self.tap.lock().unwrap_or_else(PoisonError::into_inner);
        let Tap {
            framer,
            limiter,
            dropped,
        } = &mut *tap;
        framer.feed(line.as_bytes(), |frame| {
            if limiter.try_consume(1).is_ok() {
                sink.forward_line(frame);
            } else {
                *dropped = dropped.saturating_add(1);
            }
        });
    }
}

/// One console line, newline included.
fn render(record: &Record<'_>) -> String {
    format!(
        "{} ({}) {}: {}\n",
        level_letter(record.level()),
        monotonic_now().as_millis(),
        record.target(),
        record.args()
    )
}

fn level_letter(level: log::Level) -> char {
    match level {
        log::Level::Error => 'E',
        log::Level::Warn => 'W',
        log::Level::Info => 'I',
        log::Level::Debug => 'D',
        log::Level::Trace => 'V',
    }
}

impl Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.console.log(record);
        self.forward(record);
    }

    fn flush(&self) {
        self.console.flush();
    }
}

static LOGGER: OnceLock<BridgeLogger> = OnceLock::new();

/// Install the global logger at `level`.
pub fn init(level: LevelFilter) -> Result<&'static BridgeLogger, log::SetLoggerError> {
    let logger = LOGGER.get_or_init(|| BridgeLogger::new(level));
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(logger)
}
