//! Battery voltage through the ADC.
//!
//! The channel is fixed at build time by `BATTERY_ADC_CHANNEL` (ADC1,
//! 0..=7). Without it the board has no battery monitor and
//! [`battery_monitor`] returns `None`.
//!
//! Readings are calibrated to millivolts at the pin, then scaled by the
//! divider to the cell voltage.

use std::sync::{Arc, Mutex, PoisonError};

use log::warn;

use crate::app::ports::BatteryPort;
use crate::power::DIVIDER_RATIO;

/// Highest ADC1 channel on the ESP32.
const MAX_CHANNEL: u32 = 7;

/// Channel from the build-time setting; `None` when unset or out of range.
pub fn parse_channel(raw: Option<&str>) -> Option<u32> {
    let channel = raw?.trim().parse::<u32>().ok()?;
    if channel > MAX_CHANNEL {
        warn!("Battery: ADC channel {} out of range", channel);
        return None;
    }
    Some(channel)
}

/// Cell voltage for a calibrated pin reading.
pub fn cell_millivolts(pin_millivolts: u32) -> u32 {
    pin_millivolts * DIVIDER_RATIO
}

/// The board's battery monitor, if it has one.
pub fn battery_monitor() -> Option<Box<dyn BatteryPort>> {
    let Some(channel) = parse_channel(option_env!("BATTERY_ADC_CHANNEL")) else {
        log::info!("Battery: monitor unavailable");
        return None;
    };

    #[cfg(target_os = "espidf")]
    {
        match AdcBattery::new(channel) {
            Ok(adc) => Some(Box::new(adc)),
            Err(ret) => {
                warn!("Battery: ADC init failed ({})", ret);
                None
            }
        }
    }

    #[cfg(not(target_os = "espidf"))]
    {
        log::info!("Battery(sim): channel {} has no ADC on host", channel);
        None
    }
}

// ── ESP-IDF ───────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct AdcBattery {
    unit: esp_idf_svc::sys::adc_oneshot_unit_handle_t,
    cali: esp_idf_svc::sys::adc_cali_handle_t,
    channel: esp_idf_svc::sys::adc_channel_t,
}

// SAFETY: the handles are owned by this value and only used through
// `&mut self`, from one task at a time.
#[cfg(target_os = "espidf")]
unsafe impl Send for AdcBattery {}

#[cfg(target_os = "espidf")]
impl AdcBattery {
    pub fn new(channel: u32) -> Result<Self, esp_idf_svc::sys::esp_err_t> {
        use esp_idf_svc::sys::*;

        let atten = adc_atten_t_ADC_ATTEN_DB_12;
        let bitwidth = adc_bitwidth_t_ADC_BITWIDTH_12;

        let mut unit: adc_oneshot_unit_handle_t = core::ptr::null_mut();
        let init_cfg = adc_oneshot_unit_init_cfg_t {
            unit_id: adc_unit_t_ADC_UNIT_1,
            ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
            ..Default::default()
        };
        // SAFETY: out-pointer is a local.
        let ret = unsafe { adc_oneshot_new_unit(&init_cfg, &mut unit) };
        if ret != ESP_OK {
            return Err(ret);
        }

        let chan_cfg = adc_oneshot_chan_cfg_t { atten, bitwidth };
        // SAFETY: `unit` was just created.
        let ret = unsafe { adc_oneshot_config_channel(unit, channel as adc_channel_t, &chan_cfg) };
        if ret != ESP_OK {
            return Err(ret);
        }

        let mut cali: adc_cali_handle_t = core::ptr::null_mut();
        let cali_cfg = adc_cali_line_fitting_config_t {
            unit_id: adc_unit_t_ADC_UNIT_1,
            atten,
            bitwidth,
            ..Default::default()
        };
        // SAFETY: out-pointer is a local.
        let ret = unsafe { adc_cali_create_scheme_line_fitting(&cali_cfg, &mut cali) };
        if ret != ESP_OK {
            return Err(ret);
        }

        log::info!("Battery: ADC1 channel {} calibrated", channel);
        Ok(Self {
            unit,
            cali,
            channel: channel as adc_channel_t,
        })
    }
}

#[cfg(target_os = "espidf")]
impl BatteryPort for AdcBattery {
    fn read_millivolts(&mut self) -> Option<u32> {
        use esp_idf_svc::sys::*;

        let mut raw: i32 = 0;
        let mut pin_mv: i32 = 0;
        // SAFETY: handles were created in `new`; out-pointers are locals.
        unsafe {
            if adc_oneshot_read(self.unit, self.channel, &mut raw) != ESP_OK {
                return None;
            }
            if adc_cali_raw_to_voltage(self.cali, raw, &mut pin_mv) != ESP_OK {
                return None;
            }
        }
        Some(cell_millivolts(pin_mv.max(0) as u32))
    }
}

// ── Simulation ────────────────────────────────────────────────

/// Battery whose voltage tests set directly. Clones share the reading.
#[derive(Debug, Default, Clone)]
pub struct SimBattery(Arc<Mutex<Option<u32>>>);

impl SimBattery {
    pub fn new(millivolts: u32) -> Self {
        Self(Arc::new(Mutex::new(Some(millivolts))))
    }

    /// Next readings return `millivolts`; `None` makes them fail.
    pub fn set(&self, millivolts: Option<u32>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = millivolts;
    }
}

impl BatteryPort for SimBattery {
    fn read_millivolts(&mut self) -> Option<u32> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
