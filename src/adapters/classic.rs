//! Bluetooth Classic adapter: inquiry and the SPP link to the target.
//!
//! - **`target_os = "espidf"`**: [`ClassicAdapter`] over the Bluedroid GAP
//!   BT and SPP (callback mode) APIs. Inquiry results and inbound SPP
//!   data are forwarded as [`BridgeEvent`]s from the stack callbacks;
//!   `connect` blocks on a condvar until the SPP open completes.
//! - **host**: [`SimClassic`], a scripted transport for tests.
//!
//! Both report a device once per cache window and only when it has a name.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;

use crate::adapters::HandlerSlot;
use crate::app::ports::ClassicPort;
use crate::app::runtime::EventHandler;
use crate::config::TargetName;
use crate::events::BridgeEvent;
use crate::link::{BtAddress, DiscoveredDevice};

#[cfg(target_os = "espidf")]
pub use esp::{ClassicAdapter, install_event_handler};

const EIR_SHORT_NAME: u8 = 0x08;
const EIR_COMPLETE_NAME: u8 = 0x09;

/// Device name carried in extended inquiry response data. The complete
/// name wins over the shortened one.
pub fn eir_name(eir: &[u8]) -> Option<&[u8]> {
    let mut short = None;
    let mut rest = eir;
    while let [len, tail @ ..] = rest {
        let len = usize::from(*len);
        if len == 0 || len > tail.len() {
            break;
        }
        let (field, next) = tail.split_at(len);
        match field[0] {
            EIR_COMPLETE_NAME => return Some(&field[1..]),
            EIR_SHORT_NAME => short = Some(&field[1..]),
            _ => {}
        }
        rest = next;
    }
    short
}

/// Turn an inquiry result into a report. Nameless devices are skipped;
/// names are cut at the first NUL, invalid UTF-8 or the storage limit.
pub fn device_from_inquiry(address: BtAddress, name: &[u8], rssi: i8) -> Option<DiscoveredDevice> {
    let raw = name.split(|&b| b == 0).next().unwrap_or_default();
    let text = match core::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => core::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or_default(),
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let mut stored = TargetName::new();
    for c in text.chars() {
        if stored.push(c).is_err() {
            break;
        }
    }
    Some(DiscoveredDevice {
        address,
        name: stored,
        rssi,
    })
}

/// Addresses already reported since the last cache clear.
#[derive(Debug, Default)]
pub struct SeenDevices(heapless::Vec<BtAddress, 32>);

impl SeenDevices {
    pub const fn new() -> Self {
        Self(heapless::Vec::new())
    }

    /// `true` the first time `address` is seen. Once the list is full
    /// every further device is reported.
    pub fn first_sighting(&mut self, address: BtAddress) -> bool {
        if self.0.contains(&address) {
            return false;
        }
        let _ = self.0.push(address);
        true
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── ESP-IDF ───────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp {
    use std::ffi::c_void;
    use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use esp_idf_svc::sys::*;
    use log::{debug, error, info, warn};

    use super::{SeenDevices, device_from_inquiry, eir_name, lock};
    use crate::adapters::HandlerSlot;
    use crate::app::ports::ClassicPort;
    use crate::app::runtime::EventHandler;
    use crate::error::Error;
    use crate::events::BridgeEvent;
    use crate::link::BtAddress;

    /// Inquiry length in 1.28 s units; the scan job stops it earlier.
    const INQUIRY_LEN: u8 = 0x30;
    /// SDP lookup plus RFCOMM open.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    /// Legacy pairing fallback for targets without SSP.
    const LEGACY_PIN: [u8; 4] = *b"1234";

    static EVENTS: HandlerSlot = HandlerSlot::new();
    static SEEN: Mutex<SeenDevices> = Mutex::new(SeenDevices::new());
    static SPP: SppLink = SppLink::new();

    pub fn install_event_handler(handler: Arc<dyn EventHandler>) {
        EVENTS.install(handler);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Pending {
        Idle,
        Discovering,
        Opening,
        Done(bool),
    }

    struct SppSlot {
        handle: Option<u32>,
        pending: Pending,
        target: [u8; 6],
    }

    struct SppLink {
        slot: Mutex<SppSlot>,
        changed: Condvar,
    }

    impl SppLink {
        const fn new() -> Self {
            Self {
                slot: Mutex::new(SppSlot {
                    handle: None,
                    pending: Pending::Idle,
                    target: [0; 6],
                }),
                changed: Condvar::new(),
            }
        }

        fn lock(&self) -> MutexGuard<'_, SppSlot> {
            self.slot.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Resolve the connect in flight, if any.
        fn settle(&self, slot: &mut SppSlot, connected: bool) {
            if matches!(slot.pending, Pending::Discovering | Pending::Opening) {
                slot.pending = Pending::Done(connected);
                self.changed.notify_all();
            }
        }
    }

    fn check(ret: esp_err_t, what: &'static str) -> Result<(), Error> {
        if ret != ESP_OK {
            error!("Classic: {} failed ({})", what, ret);
            return Err(Error::Transport(what));
        }
        Ok(())
    }

    /// SPP initiator. The controller and Bluedroid must already be enabled.
    pub struct ClassicAdapter;

    impl ClassicAdapter {
        pub fn start() -> Result<Self, Error> {
            // SAFETY: called once from the main task after bluedroid_enable;
            // the callbacks are 'static functions.
            unsafe {
                check(esp_bt_gap_register_callback(Some(gap_event_handler)), "gap register")?;
                check(esp_spp_register_callback(Some(spp_event_handler)), "spp register")?;
                let cfg = esp_spp_cfg_t {
                    mode: esp_spp_mode_t_ESP_SPP_MODE_CB,
                    enable_l2cap_ertm: true,
                    tx_buffer_size: 0,
                };
                check(esp_spp_enhanced_init(&cfg), "spp init")?;

                let iocap: esp_bt_io_cap_t = ESP_BT_IO_CAP_NONE as esp_bt_io_cap_t;
                check(
                    esp_bt_gap_set_security_param(
                        esp_bt_sp_param_t_ESP_BT_SP_IOCAP_MODE,
                        &iocap as *const _ as *mut c_void,
                        core::mem::size_of_val(&iocap) as u8,
                    ),
                    "ssp iocap",
                )?;

                // Initiator only: never page- or inquiry-scannable.
                check(
                    esp_bt_gap_set_scan_mode(
                        esp_bt_connection_mode_t_ESP_BT_NON_CONNECTABLE,
                        esp_bt_discovery_mode_t_ESP_BT_NON_DISCOVERABLE,
                    ),
                    "scan mode",
                )?;
            }
            info!("Classic: SPP initiator ready");
            Ok(Self)
        }
    }

    impl ClassicPort for ClassicAdapter {
        fn start_discovery(&self) -> bool {
            lock(&SEEN).clear();
            // SAFETY: plain stack call.
            let ret = unsafe {
                esp_bt_gap_start_discovery(esp_bt_inq_mode_t_ESP_BT_INQ_MODE_GENERAL_INQUIRY, INQUIRY_LEN, 0)
            };
            if ret != ESP_OK {
                warn!("Classic: start_discovery refused ({})", ret);
            }
            ret == ESP_OK
        }

        fn clear_discovery_cache(&self) {
            lock(&SEEN).clear();
        }

        fn stop_discovery(&self) {
            // SAFETY: plain stack call; fails harmlessly when idle.
            unsafe { esp_bt_gap_cancel_discovery() };
        }

        fn connect(&self, address: &BtAddress) -> bool {
            {
                let mut slot = SPP.lock();
                if slot.handle.is_some() {
                    return true;
                }
                slot.pending = Pending::Discovering;
                slot.target = address.0;
            }

            let mut bda = address.0;
            // SAFETY: `bda` outlives the call; the stack copies it.
            let ret = unsafe { esp_spp_start_discovery(bda.as_mut_ptr()) };
            if ret != ESP_OK {
                warn!("Classic: SDP lookup for {} refused ({})", address, ret);
                SPP.lock().pending = Pending::Idle;
                return false;
            }

            let slot = SPP.lock();
            let (mut slot, wait) = SPP
                .changed
                .wait_timeout_while(slot, CONNECT_TIMEOUT, |s| !matches!(s.pending, Pending::Done(_)))
                .unwrap_or_else(PoisonError::into_inner);
            if wait.timed_out() {
                warn!("Classic: connect to {} timed out", address);
            }
            let connected = slot.pending == Pending::Done(true) && slot.handle.is_some();
            slot.pending = Pending::Idle;
            connected
        }

        fn is_connected(&self) -> bool {
            SPP.lock().handle.is_some()
        }

        fn disconnect(&self) {
            let Some(handle) = SPP.lock().handle.take() else {
                return;
            };
            // SAFETY: handle came from ESP_SPP_OPEN_EVT.
            let ret = unsafe { esp_spp_disconnect(handle) };
            if ret != ESP_OK {
                warn!("Classic: disconnect failed ({})", ret);
            }
        }

        fn write(&self, data: &[u8]) -> bool {
            let Some(handle) = SPP.lock().handle else {
                return false;
            };
            let Ok(len) = i32::try_from(data.len()) else {
                return false;
            };
            // SAFETY: the stack copies `data` before returning.
            unsafe { esp_spp_write(handle, len, data.as_ptr().cast_mut()) == ESP_OK }
        }

        fn shutdown(&self) {
            self.stop_discovery();
            self.disconnect();
            // SAFETY: no further SPP calls follow.
            unsafe { esp_spp_deinit() };
            info!("Classic: SPP stopped");
        }
    }

    // ── Stack callbacks ───────────────────────────────────────

    /// # Safety
    /// Called by Bluedroid with a `param` valid for `event`.
    unsafe extern "C" fn gap_event_handler(event: esp_bt_gap_cb_event_t, param: *mut esp_bt_gap_cb_param_t) {
        match event {
            esp_bt_gap_cb_event_t_ESP_BT_GAP_DISC_RES_EVT => {
                let res = unsafe { &(*param).disc_res };
                if res.prop.is_null() {
                    return;
                }
                let props = unsafe { core::slice::from_raw_parts(res.prop, res.num_prop.max(0) as usize) };

                let mut bdname: Option<&[u8]> = None;
                let mut eir: Option<&[u8]> = None;
                let mut rssi = 0i8;
                for prop in props {
                    if prop.val.is_null() {
                        continue;
                    }
                    let val = unsafe { core::slice::from_raw_parts(prop.val.cast::<u8>(), prop.len.max(0) as usize) };
                    match prop.type_ {
                        esp_bt_gap_dev_prop_type_t_ESP_BT_GAP_DEV_PROP_BDNAME => bdname = Some(val),
                        esp_bt_gap_dev_prop_type_t_ESP_BT_GAP_DEV_PROP_RSSI => {
                            rssi = val.first().map_or(0, |&b| b as i8);
                        }
                        esp_bt_gap_dev_prop_type_t_ESP_BT_GAP_DEV_PROP_EIR => eir = eir_name(val),
                        _ => {}
                    }
                }

                let address = BtAddress(res.bda);
                let name = bdname.or(eir).unwrap_or_default();
                let Some(device) = device_from_inquiry(address, name, rssi) else {
                    return;
                };
                if lock(&SEEN).first_sighting(address) {
                    EVENTS.dispatch(BridgeEvent::TargetDiscovered(device));
                }
            }
            esp_bt_gap_cb_event_t_ESP_BT_GAP_DISC_STATE_CHANGED_EVT => {
                let state = unsafe { (*param).disc_st_chg.state };
                debug!("Classic: discovery state {}", state);
            }
            esp_bt_gap_cb_event_t_ESP_BT_GAP_CFM_REQ_EVT => {
                let req = unsafe { &mut (*param).cfm_req };
                unsafe { esp_bt_gap_ssp_confirm_reply(req.bda.as_mut_ptr(), true) };
            }
            esp_bt_gap_cb_event_t_ESP_BT_GAP_PIN_REQ_EVT => {
                let req = unsafe { &mut (*param).pin_req };
                let mut pin: esp_bt_pin_code_t = [0; 16];
                pin[..LEGACY_PIN.len()].copy_from_slice(&LEGACY_PIN);
                unsafe { esp_bt_gap_pin_reply(req.bda.as_mut_ptr(), true, LEGACY_PIN.len() as u8, pin.as_mut_ptr()) };
            }
            esp_bt_gap_cb_event_t_ESP_BT_GAP_AUTH_CMPL_EVT => {
                let auth = unsafe { &(*param).auth_cmpl };
                if auth.stat == esp_bt_status_t_ESP_BT_STATUS_SUCCESS {
                    info!("Classic: paired with {}", BtAddress(auth.bda));
                } else {
                    warn!("Classic: pairing with {} failed ({})", BtAddress(auth.bda), auth.stat);
                }
            }
            _ => {}
        }
    }

    /// # Safety
    /// Called by Bluedroid with a `param` valid for `event`.
    unsafe extern "C" fn spp_event_handler(event: esp_spp_cb_event_t, param: *mut esp_spp_cb_param_t) {
        match event {
            esp_spp_cb_event_t_ESP_SPP_DISCOVERY_COMP_EVT => {
                let comp = unsafe { &(*param).disc_comp };
                let mut slot = SPP.lock();
                if slot.pending != Pending::Discovering {
                    return;
                }
                if comp.status != esp_spp_status_t_ESP_SPP_SUCCESS || comp.scn_num == 0 {
                    warn!("Classic: no SPP channel on {}", BtAddress(slot.target));
                    SPP.settle(&mut slot, false);
                    return;
                }
                slot.pending = Pending::Opening;
                let ret = unsafe {
                    esp_spp_connect(
                        ESP_SPP_SEC_AUTHENTICATE as esp_spp_sec_t,
                        esp_spp_role_t_ESP_SPP_ROLE_MASTER,
                        comp.scn[0],
                        slot.target.as_mut_ptr(),
                    )
                };
                if ret != ESP_OK {
                    SPP.settle(&mut slot, false);
                }
            }
            esp_spp_cb_event_t_ESP_SPP_CL_INIT_EVT => {
                let init = unsafe { &(*param).cl_init };
                if init.status != esp_spp_status_t_ESP_SPP_SUCCESS {
                    let mut slot = SPP.lock();
                    SPP.settle(&mut slot, false);
                }
            }
            esp_spp_cb_event_t_ESP_SPP_OPEN_EVT => {
                let open = unsafe { &(*param).open };
                let mut slot = SPP.lock();
                if open.status != esp_spp_status_t_ESP_SPP_SUCCESS {
                    SPP.settle(&mut slot, false);
                    return;
                }
                if slot.pending != Pending::Opening {
                    // The connect gave up waiting; close the late link.
                    drop(slot);
                    unsafe { esp_spp_disconnect(open.handle) };
                    return;
                }
                slot.handle = Some(open.handle);
                SPP.settle(&mut slot, true);
                info!("Classic: SPP open to {}", BtAddress(open.rem_bda));
            }
            esp_spp_cb_event_t_ESP_SPP_CLOSE_EVT => {
                let mut slot = SPP.lock();
                slot.handle = None;
                SPP.settle(&mut slot, false);
                info!("Classic: SPP closed");
            }
            esp_spp_cb_event_t_ESP_SPP_DATA_IND_EVT => {
                let ind = unsafe { &(*param).data_ind };
                if ind.data.is_null() || ind.len == 0 {
                    return;
                }
                let data = unsafe { core::slice::from_raw_parts(ind.data, usize::from(ind.len)) };
                EVENTS.dispatch(BridgeEvent::TargetData(data));
            }
            esp_spp_cb_event_t_ESP_SPP_CONG_EVT => {
                let cong = unsafe { (*param).cong.cong };
                debug!("Classic: SPP congested={}", cong);
            }
            _ => {}
        }
    }
}

// ── Simulation ────────────────────────────────────────────────

/// What the simulated transport saw.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimLink {
    pub discovering: bool,
    pub refuse_discovery: bool,
    pub cache_clears: u32,
    /// Addresses that accept a connect.
    pub reachable: Vec<BtAddress>,
    pub connect_attempts: u32,
    pub connected: Option<BtAddress>,
    /// Everything written to the open link.
    pub sent: Vec<u8>,
    pub shut_down: bool,
}

/// Scripted [`ClassicPort`]. Inquiry results and inbound data are fed
/// through the installed handler, as the stack callbacks would.
#[derive(Default)]
pub struct SimClassic {
    link: Mutex<SimLink>,
    seen: Mutex<SeenDevices>,
    events: HandlerSlot,
}

impl SimClassic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_handler(&self, handler: Arc<dyn EventHandler>) {
        self.events.install(handler);
    }

    /// Snapshot of the transport state.
    pub fn link(&self) -> SimLink {
        lock(&self.link).clone()
    }

    pub fn set_reachable(&self, address: BtAddress) {
        lock(&self.link).reachable.push(address);
    }

    pub fn set_refuse_discovery(&self, refuse: bool) {
        lock(&self.link).refuse_discovery = refuse;
    }

    /// The target closes the link.
    pub fn drop_link(&self) {
        lock(&self.link).connected = None;
    }

    /// An inquiry result arrives. Returns whether it was reported.
    pub fn inquiry_result(&self, address: BtAddress, name: &[u8], rssi: i8) -> bool {
        let Some(device) = device_from_inquiry(address, name, rssi) else {
            return false;
        };
        if !lock(&self.seen).first_sighting(address) {
            return false;
        }
        self.events.dispatch(BridgeEvent::TargetDiscovered(device));
        true
    }

    /// Bytes arrive from the target.
    pub fn receive(&self, data: &[u8]) {
        self.events.dispatch(BridgeEvent::TargetData(data));
    }
}

impl ClassicPort for SimClassic {
    fn start_discovery(&self) -> bool {
        let mut link = lock(&self.link);
        if link.refuse_discovery {
            return false;
        }
        link.discovering = true;
        drop(link);
        lock(&self.seen).clear();
        true
    }

    fn clear_discovery_cache(&self) {
        lock(&self.link).cache_clears += 1;
        lock(&self.seen).clear();
    }

    fn stop_discovery(&self) {
        lock(&self.link).discovering = false;
    }

    fn connect(&self, address: &BtAddress) -> bool {
        let mut link = lock(&self.link);
        link.connect_attempts += 1;
        if link.reachable.contains(address) {
            link.connected = Some(*address);
            return true;
        }
        false
    }

    fn is_connected(&self) -> bool {
        lock(&self.link).connected.is_some()
    }

    fn disconnect(&self) {
        lock(&self.link).connected = None;
    }

    fn write(&self, data: &[u8]) -> bool {
        let mut link = lock(&self.link);
        if link.connected.is_none() {
            return false;
        }
        link.sent.extend_from_slice(data);
        true
    }

    fn shutdown(&self) {
        let mut link = lock(&self.link);
        link.discovering = false;
        link.connected = None;
        link.shut_down = true;
        info!("Classic(sim): stopped");
    }
}
