//! Named, sized task spawning.
//!
//! ESP-IDF implements `std::thread` over pthreads on FreeRTOS tasks.
//! `esp_pthread_set_cfg()` sets the core, priority and stack size for the
//! *next* `pthread_create()` from the calling thread, so the config and
//! the spawn must stay paired.

use std::io;
use std::thread::JoinHandle;

/// Placement and size of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    /// NUL-terminated, for the FreeRTOS task name.
    pub name: &'static str,
    pub priority: u8,
    pub stack_kb: usize,
    /// Core 0 hosts the Bluetooth controller; `None` lets the scheduler pick.
    pub core: Option<u8>,
}

impl TaskSpec {
    /// Async executor: notification pump, idle sweep, battery sampling.
    pub const EXECUTOR: Self = Self::new("bridge-exec\0", 6, 8);
    pub const SCAN: Self = Self::new("bt-scan\0", 5, 4);
    /// Blocking SPP connect plus the liveness monitor.
    pub const CONNECT: Self = Self::new("bt-connect\0", 5, 6);
    pub const TEARDOWN: Self = Self::new("bt-teardown\0", 5, 4);
    pub const PEER: Self = Self::new("ble-peer\0", 5, 3);
    pub const SHUTDOWN: Self = Self::new("shutdown\0", 7, 4);

    pub const fn new(name: &'static str, priority: u8, stack_kb: usize) -> Self {
        Self {
            name,
            priority,
            stack_kb,
            core: None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        self.name.trim_end_matches('\0')
    }
}

/// Spawn `f` as the task described by `spec`.
#[cfg(target_os = "espidf")]
pub fn spawn(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> io::Result<JoinHandle<()>> {
    use esp_idf_svc::sys::*;

    // SAFETY: the config is copied by esp_pthread_set_cfg; `name` is a
    // NUL-terminated 'static string.
    let ret = unsafe {
        let mut cfg = esp_pthread_get_default_config();
        cfg.pin_to_core = spec.core.map_or(tskNO_AFFINITY as i32, i32::from);
        cfg.prio = i32::from(spec.priority);
        cfg.stack_size = spec.stack_kb * 1024;
        cfg.thread_name = spec.name.as_ptr().cast();
        esp_pthread_set_cfg(&cfg)
    };
    if ret != ESP_OK {
        return Err(io::Error::other(format!("esp_pthread_set_cfg failed: {ret}")));
    }

    log::debug!(
        "Task: spawning '{}' (pri={}, stack={}KB)",
        spec.display_name(),
        spec.priority,
        spec.stack_kb
    );
    std::thread::Builder::new()
        .name(spec.display_name().into())
        .spawn(f)
}

/// Host fallback: only the name and stack size apply.
#[cfg(not(target_os = "espidf"))]
pub fn spawn(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(spec.display_name().into())
        .stack_size(spec.stack_kb.max(64) * 1024)
        .spawn(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_nul_terminated() {
        for spec in [
            TaskSpec::EXECUTOR,
            TaskSpec::SCAN,
            TaskSpec::CONNECT,
            TaskSpec::TEARDOWN,
            TaskSpec::PEER,
            TaskSpec::SHUTDOWN,
        ] {
            assert!(spec.name.ends_with('\0'));
            assert!(!spec.display_name().contains('\0'));
        }
    }

    #[test]
    fn spawned_thread_carries_name() {
        let handle = spawn(TaskSpec::SCAN, || {
            assert_eq!(std::thread::current().name(), Some("bt-scan"));
        })
        .unwrap();
        handle.join().unwrap();
    }
}
