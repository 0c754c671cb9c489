//! OTA partition adapter.
//!
//! - **`target_os = "espidf"`**: [`EspFirmware`] drives the inactive app
//!   partition through `esp-ota`. Dropping an unfinished update aborts it.
//! - **host**: [`SimFirmware`] stages the image in memory so tests can see
//!   what would have been booted.

use log::{info, warn};

use crate::app::ports::{FirmwareError, FirmwarePort, FirmwareUpdate};

// ── ESP-IDF ───────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct EspFirmware;

#[cfg(target_os = "espidf")]
pub struct EspFirmwareUpdate(esp_ota::OtaUpdate);

// SAFETY: the update handle is only ever used behind the service mutex,
// one task at a time; esp_ota_* calls are not tied to the opening task.
#[cfg(target_os = "espidf")]
unsafe impl Send for EspFirmwareUpdate {}

#[cfg(target_os = "espidf")]
impl FirmwarePort for EspFirmware {
    type Update = EspFirmwareUpdate;

    fn begin(&mut self, image_size: u32) -> Result<EspFirmwareUpdate, FirmwareError> {
        let update = esp_ota::OtaUpdate::begin().map_err(|e| {
            warn!("Partition: esp-ota begin failed: {:?}", e);
            FirmwareError::BeginFailed
        })?;
        info!("Partition: next OTA slot open for {} bytes", image_size);
        Ok(EspFirmwareUpdate(update))
    }
}

#[cfg(target_os = "espidf")]
impl FirmwareUpdate for EspFirmwareUpdate {
    fn write(&mut self, data: &[u8]) -> Result<(), FirmwareError> {
        self.0.write(data).map_err(|e| {
            warn!("Partition: esp-ota write failed: {:?}", e);
            FirmwareError::WriteFailed
        })
    }

    fn commit(self) -> Result<(), FirmwareError> {
        let mut completed = self.0.finalize().map_err(|e| {
            warn!("Partition: esp-ota finalize failed: {:?}", e);
            FirmwareError::FinalizeFailed
        })?;
        completed.set_as_boot_partition().map_err(|e| {
            warn!("Partition: set_as_boot_partition failed: {:?}", e);
            FirmwareError::BootSetFailed
        })?;
        info!("Partition: new image set as boot partition");
        Ok(())
    }
}

/// Mark the running image valid so the bootloader does not roll back.
#[cfg(target_os = "espidf")]
pub fn mark_running_image_valid() {
    match esp_ota::mark_app_valid() {
        Ok(()) => info!("Partition: running image marked valid"),
        Err(e) => warn!("Partition: mark_app_valid failed: {:?}", e),
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn mark_running_image_valid() {
    info!("Partition: rollback check skipped (simulation)");
}

// ── Simulation ────────────────────────────────────────────────

/// What the simulated flash saw.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimFlash {
    /// Bytes of the update currently being written.
    pub staged: Vec<u8>,
    /// Image that would boot next, once committed.
    pub boot: Option<Vec<u8>>,
    /// Updates dropped without commit.
    pub aborted: u32,
    /// Make the next `begin` fail.
    pub refuse_begin: bool,
}

/// In-memory [`FirmwarePort`]. Clones share the same flash.
#[derive(Debug, Default, Clone)]
pub struct SimFirmware {
    flash: std::sync::Arc<std::sync::Mutex<SimFlash>>,
}

impl SimFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the simulated flash.
    pub fn flash(&self) -> SimFlash {
        self.lock().clone()
    }

    pub fn set_refuse_begin(&self, refuse: bool) {
        self.lock().refuse_begin = refuse;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimFlash> {
        self.flash.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct SimUpdate {
    firmware: SimFirmware,
    committed: bool,
}

impl FirmwarePort for SimFirmware {
    type Update = SimUpdate;

    fn begin(&mut self, image_size: u32) -> Result<SimUpdate, FirmwareError> {
        let mut flash = self.lock();
        if flash.refuse_begin {
            return Err(FirmwareError::NoPartition);
        }
        flash.staged = Vec::with_capacity(image_size as usize);
        drop(flash);
        Ok(SimUpdate {
            firmware: self.clone(),
            committed: false,
        })
    }
}

impl FirmwareUpdate for SimUpdate {
    fn write(&mut self, data: &[u8]) -> Result<(), FirmwareError> {
        self.firmware.lock().staged.extend_from_slice(data);
        Ok(())
    }

    fn commit(mut self) -> Result<(), FirmwareError> {
        let mut flash = self.firmware.lock();
        let image = core::mem::take(&mut flash.staged);
        flash.boot = Some(image);
        drop(flash);
        self.committed = true;
        Ok(())
    }
}

impl Drop for SimUpdate {
    fn drop(&mut self) {
        if !self.committed {
            let mut flash = self.firmware.lock();
            flash.staged.clear();
            flash.aborted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_sets_boot_image() {
        let mut fw = SimFirmware::new();
        let mut update = fw.begin(4).unwrap();
        update.write(&[1, 2]).unwrap();
        update.write(&[3, 4]).unwrap();
        update.commit().unwrap();
        let flash = fw.flash();
        assert_eq!(flash.boot, Some(vec![1, 2, 3, 4]));
        assert_eq!(flash.aborted, 0);
    }

    #[test]
    fn drop_aborts() {
        let mut fw = SimFirmware::new();
        let mut update = fw.begin(4).unwrap();
        update.write(&[1]).unwrap();
        drop(update);
        let flash = fw.flash();
        assert_eq!(flash.boot, None);
        assert_eq!(flash.aborted, 1);
        assert!(flash.staged.is_empty());
    }

    #[test]
    fn refused_begin() {
        let mut fw = SimFirmware::new();
        fw.set_refuse_begin(true);
        assert_eq!(fw.begin(1).err(), Some(FirmwareError::NoPartition));
    }
}
