//! BLE GATT server adapter.
//!
//! Implements [`GattPort`] over Bluedroid. The attribute table is not
//! hand-written here: [`Registrar`] walks the characteristic table in
//! [`crate::protocol`] and issues one `create_service` / `add_char` /
//! `add_char_descr` per step, recording the handle each completion event
//! returns into a [`HandleMap`]. Stack callbacks then translate handles
//! back to [`CharId`]s and hand [`BridgeEvent`]s to the runtime.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: Bluedroid GATTS + GAP (LE Secure
//!   Connections, static passkey, MITM, bonding).
//! - **all other targets**: [`SimGatt`] records every call for tests.
//!
//! ## Pairing
//!
//! IO capability is display-only, so the peer must type the configured
//! six-digit PIN. Bridge characteristics require an encrypted MITM link;
//! only the Battery service is open.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;

use crate::adapters::HandlerSlot;
use crate::app::ports::GattPort;
use crate::app::runtime::EventHandler;
use crate::events::BridgeEvent;
use crate::protocol::codec::AttrValue;
use crate::protocol::{self, CCCD_UUID, CharDef, CharId, PRESENTATION_FORMAT_UUID, ServiceId};

#[cfg(target_os = "espidf")]
pub use esp::{BleAdapter, init_bluetooth, install_event_handler};

// ───────────────────────────────────────────────────────────────
// Registration plan
// ───────────────────────────────────────────────────────────────

/// One attribute registration, in the order the stack must see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrStep {
    Service(ServiceId),
    Value(&'static CharDef),
    Descriptor { ch: CharId, uuid: u16 },
}

/// What a registered handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Value,
    Cccd,
    Description,
    Format,
}

impl AttrKind {
    fn of_descriptor(uuid: u16) -> Self {
        match uuid {
            CCCD_UUID => Self::Cccd,
            PRESENTATION_FORMAT_UUID => Self::Format,
            _ => Self::Description,
        }
    }
}

/// Both services, each followed by its characteristics and descriptors.
pub fn registration_plan(ota_available: bool) -> Vec<AttrStep> {
    let mut plan = Vec::new();
    for service in [ServiceId::Bridge, ServiceId::Battery] {
        plan.push(AttrStep::Service(service));
        for def in protocol::characteristics(service, ota_available) {
            plan.push(AttrStep::Value(def));
            for uuid in def.descriptors() {
                plan.push(AttrStep::Descriptor { ch: def.id, uuid });
            }
        }
    }
    plan
}

/// Handles reserved when creating `service`.
pub fn reserved_handles(service: ServiceId) -> u16 {
    match service {
        ServiceId::Bridge => protocol::BRIDGE_SERVICE_HANDLES,
        ServiceId::Battery => protocol::BATTERY_SERVICE_HANDLES,
    }
}

/// Handle ↔ characteristic lookup, filled during registration.
#[derive(Debug, Default, Clone)]
pub struct HandleMap {
    entries: Vec<(u16, CharId, AttrKind)>,
}

impl HandleMap {
    pub fn lookup(&self, handle: u16) -> Option<(CharId, AttrKind)> {
        self.entries
            .iter()
            .find(|(h, _, _)| *h == handle)
            .map(|&(_, ch, kind)| (ch, kind))
    }

    pub fn value_handle(&self, ch: CharId) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, c, kind)| *c == ch && *kind == AttrKind::Value)
            .map(|&(h, _, _)| h)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drives the registration plan one completion event at a time.
#[derive(Debug)]
pub struct Registrar {
    plan: Vec<AttrStep>,
    cursor: usize,
    service_handle: u16,
    handles: HandleMap,
    aborted: bool,
}

impl Registrar {
    pub fn new(ota_available: bool) -> Self {
        Self {
            plan: registration_plan(ota_available),
            cursor: 0,
            service_handle: 0,
            handles: HandleMap::default(),
            aborted: false,
        }
    }

    /// The step to issue, `None` when done or aborted.
    pub fn next_step(&self) -> Option<AttrStep> {
        if self.aborted {
            return None;
        }
        self.plan.get(self.cursor).copied()
    }

    /// The stack assigned `handle` to the current step.
    pub fn record(&mut self, handle: u16) {
        let Some(step) = self.next_step() else {
            return;
        };
        match step {
            AttrStep::Service(_) => self.service_handle = handle,
            AttrStep::Value(def) => self.handles.entries.push((handle, def.id, AttrKind::Value)),
            AttrStep::Descriptor { ch, uuid } => {
                self.handles.entries.push((handle, ch, AttrKind::of_descriptor(uuid)));
            }
        }
        self.cursor += 1;
    }

    /// The stack rejected the current step; nothing further is issued.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Handle of the service currently being populated.
    pub fn service_handle(&self) -> u16 {
        self.service_handle
    }

    pub fn is_complete(&self) -> bool {
        !self.aborted && self.cursor == self.plan.len()
    }

    pub fn handles(&self) -> &HandleMap {
        &self.handles
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp {
    use std::ffi::c_void;
    use std::sync::{Arc, Mutex};

    use esp_idf_svc::sys::*;
    use log::{debug, error, info, warn};

    use super::{AttrKind, AttrStep, Registrar, lock, reserved_handles};
    use crate::adapters::HandlerSlot;
    use crate::app::ports::GattPort;
    use crate::app::runtime::EventHandler;
    use crate::config::BridgeConfig;
    use crate::error::Error;
    use crate::events::BridgeEvent;
    use crate::protocol::{self, Access, CCCD_UUID, CharId, PRESENTATION_FORMAT_UUID, ServiceId, Uuid};
    use crate::session::PeerAddress;

    const APP_ID: u16 = 0;
    /// Advertising and scan-response data both configured.
    const ADV_CONFIGURED: u8 = 0b11;

    static EVENTS: HandlerSlot = HandlerSlot::new();
    static GATT: Mutex<Option<GattState>> = Mutex::new(None);

    pub fn install_event_handler(handler: Arc<dyn EventHandler>) {
        EVENTS.install(handler);
    }

    struct GattState {
        gatts_if: esp_gatt_if_t,
        registrar: Registrar,
        name: crate::config::DeviceName,
        pin_code: u32,
        adv_ready: u8,
        /// Queued prepare-write: value handle and bytes so far.
        prepare: Option<(u16, Vec<u8>)>,
    }

    fn check(ret: esp_err_t, what: &'static str) -> Result<(), Error> {
        if ret != ESP_OK {
            error!("GATT: {} failed ({})", what, ret);
            return Err(Error::Transport(what));
        }
        Ok(())
    }

    fn esp_uuid(uuid: Uuid) -> esp_bt_uuid_t {
        // SAFETY: all-zero is a valid esp_bt_uuid_t.
        let mut t: esp_bt_uuid_t = unsafe { core::mem::zeroed() };
        match uuid {
            Uuid::Sig16(u) => {
                t.len = 2;
                t.uuid.uuid16 = u;
            }
            Uuid::Bridge128(u) => {
                t.len = 16;
                t.uuid.uuid128 = u.to_le_bytes();
            }
        }
        t
    }

    fn adv_params() -> esp_ble_adv_params_t {
        esp_ble_adv_params_t {
            adv_int_min: 0x20,
            adv_int_max: 0x40,
            adv_type: esp_ble_adv_type_t_ADV_TYPE_IND,
            own_addr_type: esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
            channel_map: esp_ble_adv_channel_t_ADV_CHNL_ALL,
            adv_filter_policy: esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
            // SAFETY: remaining fields (peer address) are plain data.
            ..unsafe { core::mem::zeroed() }
        }
    }

    fn value_perm(access: Access, readable: bool, writable: bool) -> esp_gatt_perm_t {
        let (read, write) = match access {
            Access::Open => (ESP_GATT_PERM_READ, ESP_GATT_PERM_WRITE),
            Access::EncryptedMitm => (ESP_GATT_PERM_READ_ENC_MITM, ESP_GATT_PERM_WRITE_ENC_MITM),
        };
        let mut perm = 0;
        if readable {
            perm |= read;
        }
        if writable {
            perm |= write;
        }
        perm as esp_gatt_perm_t
    }

    /// Bring up the controller in dual mode and enable Bluedroid.
    pub fn init_bluetooth() -> Result<(), Error> {
        // SAFETY: called once from the main task before any other BT call.
        unsafe {
            let mut bt_cfg = esp_bt_controller_config_t::default();
            check(esp_bt_controller_init(&mut bt_cfg), "bt_controller_init")?;
            check(esp_bt_controller_enable(esp_bt_mode_t_ESP_BT_MODE_BTDM), "bt_controller_enable")?;
            check(esp_bluedroid_init(), "bluedroid_init")?;
            check(esp_bluedroid_enable(), "bluedroid_enable")?;
        }
        info!("GATT: controller and Bluedroid up (dual mode)");
        Ok(())
    }

    /// The Bluedroid GATT server.
    #[derive(Debug, Default)]
    pub struct BleAdapter;

    impl BleAdapter {
        pub fn new() -> Self {
            Self
        }

        /// Register the application. Services and advertising follow from
        /// the registration callback.
        pub fn start(&self, config: &BridgeConfig, ota_available: bool) -> Result<(), Error> {
            for service in [ServiceId::Bridge, ServiceId::Battery] {
                if let Err(e) = protocol::check_handle_budget(service, reserved_handles(service), ota_available) {
                    error!("GATT: {}", e);
                }
            }

            *lock(&GATT) = Some(GattState {
                gatts_if: ESP_GATT_IF_NONE as esp_gatt_if_t,
                registrar: Registrar::new(ota_available),
                name: config.name.clone(),
                pin_code: config.pin_code,
                adv_ready: 0,
                prepare: None,
            });

            // SAFETY: handlers are 'static functions; bluedroid is enabled.
            unsafe {
                check(esp_ble_gap_register_callback(Some(gap_event_handler)), "gap register")?;
                check(esp_ble_gatts_register_callback(Some(gatts_event_handler)), "gatts register")?;
                check(esp_ble_gatts_app_register(APP_ID), "app register")?;
            }
            info!("GATT: application registered (OTA {})", if ota_available { "on" } else { "off" });
            Ok(())
        }
    }

    impl GattPort for BleAdapter {
        fn notify(&self, conn_id: u16, ch: CharId, value: &[u8], confirm: bool) -> bool {
            let (gatts_if, handle) = {
                let guard = lock(&GATT);
                let Some(state) = guard.as_ref() else {
                    return false;
                };
                let Some(handle) = state.registrar.handles().value_handle(ch) else {
                    return false;
                };
                (state.gatts_if, handle)
            };
            let Ok(len) = u16::try_from(value.len()) else {
                return false;
            };
            // SAFETY: the stack copies `value` before returning.
            let ret = unsafe { esp_ble_gatts_send_indicate(gatts_if, conn_id, handle, len, value.as_ptr().cast_mut(), confirm) };
            ret == ESP_OK
        }

        fn disconnect_peer(&self, conn_id: u16) {
            let gatts_if = lock(&GATT).as_ref().map(|s| s.gatts_if);
            if let Some(gatts_if) = gatts_if {
                // SAFETY: plain stack call.
                unsafe { esp_ble_gatts_close(gatts_if, conn_id) };
            }
        }

        fn start_advertising(&self) {
            let mut params = adv_params();
            // SAFETY: params are copied by the stack.
            let ret = unsafe { esp_ble_gap_start_advertising(&mut params) };
            if ret != ESP_OK {
                warn!("GATT: start advertising failed ({})", ret);
            }
        }

        fn shutdown(&self) {
            // SAFETY: no BT call follows; the device restarts or sleeps next.
            unsafe {
                esp_ble_gap_stop_advertising();
                esp_bluedroid_disable();
                esp_bluedroid_deinit();
                esp_bt_controller_disable();
                esp_bt_controller_deinit();
            }
            info!("GATT: stack shut down");
        }
    }

    // ── Registration ──────────────────────────────────────────

    fn set_security(pin_code: u32) {
        let auth_req = ESP_LE_AUTH_REQ_SC_MITM_BOND as esp_ble_auth_req_t;
        let iocap = ESP_IO_CAP_OUT as esp_ble_io_cap_t;
        let key_size: u8 = 16;
        let keys: u8 = (ESP_BLE_ENC_KEY_MASK | ESP_BLE_ID_KEY_MASK) as u8;
        let only_specified: u8 = ESP_BLE_ONLY_ACCEPT_SPECIFIED_AUTH_ENABLE as u8;
        let passkey: u32 = pin_code;

        fn set<T>(param: esp_ble_sm_param_t, value: &T) {
            // SAFETY: the stack copies `size_of::<T>()` bytes from `value`.
            unsafe {
                esp_ble_gap_set_security_param(param, value as *const T as *mut c_void, core::mem::size_of::<T>() as u8);
            }
        }

        set(esp_ble_sm_param_t_ESP_BLE_SM_SET_STATIC_PASSKEY, &passkey);
        set(esp_ble_sm_param_t_ESP_BLE_SM_AUTHEN_REQ_MODE, &auth_req);
        set(esp_ble_sm_param_t_ESP_BLE_SM_IOCAP_MODE, &iocap);
        set(esp_ble_sm_param_t_ESP_BLE_SM_MAX_KEY_SIZE, &key_size);
        set(esp_ble_sm_param_t_ESP_BLE_SM_ONLY_ACCEPT_SPECIFIED_SEC_AUTH, &only_specified);
        set(esp_ble_sm_param_t_ESP_BLE_SM_SET_INIT_KEY, &keys);
        set(esp_ble_sm_param_t_ESP_BLE_SM_SET_RSP_KEY, &keys);
    }

    fn configure_advertising(name: &str) {
        let mut cname = [0u8; crate::config::MAX_NAME_LEN + 1];
        cname[..name.len()].copy_from_slice(name.as_bytes());
        let mut uuid = protocol::BRIDGE_SERVICE_UUID.to_le_bytes();

        // SAFETY: name is NUL-terminated; the adv data is deep-copied.
        unsafe {
            esp_ble_gap_set_device_name(cname.as_ptr().cast());

            let mut adv = esp_ble_adv_data_t {
                set_scan_rsp: false,
                include_name: false,
                include_txpower: false,
                min_interval: 0x0006,
                max_interval: 0x0010,
                service_uuid_len: uuid.len() as u16,
                p_service_uuid: uuid.as_mut_ptr(),
                flag: ESP_BLE_ADV_FLAG_GEN_DISC as u8,
                ..core::mem::zeroed()
            };
            esp_ble_gap_config_adv_data(&mut adv);

            let mut rsp = esp_ble_adv_data_t {
                set_scan_rsp: true,
                include_name: true,
                ..core::mem::zeroed()
            };
            esp_ble_gap_config_adv_data(&mut rsp);
        }
    }

    /// Issue the registrar's current step.
    fn issue(state: &GattState) {
        let Some(step) = state.registrar.next_step() else {
            if state.registrar.is_complete() {
                info!("GATT: {} attributes registered", state.registrar.handles().len());
            }
            return;
        };
        let gatts_if = state.gatts_if;
        let service_handle = state.registrar.service_handle();

        // SAFETY: all pointers are to locals the stack copies before returning.
        let ret = unsafe {
            match step {
                AttrStep::Service(service) => {
                    let uuid = match service {
                        ServiceId::Bridge => Uuid::Bridge128(protocol::BRIDGE_SERVICE_UUID),
                        ServiceId::Battery => Uuid::Sig16(protocol::BATTERY_SERVICE_UUID),
                    };
                    let mut id = esp_gatt_srvc_id_t {
                        id: esp_gatt_id_t {
                            uuid: esp_uuid(uuid),
                            inst_id: 0,
                        },
                        is_primary: true,
                    };
                    esp_ble_gatts_create_service(gatts_if, &mut id, reserved_handles(service))
                }
                AttrStep::Value(def) => {
                    let mut uuid = esp_uuid(def.uuid);
                    let mut control = esp_attr_control_t {
                        auto_rsp: ESP_GATT_RSP_BY_APP as u8,
                    };
                    esp_ble_gatts_add_char(
                        service_handle,
                        &mut uuid,
                        value_perm(def.access, def.readable(), def.writable()),
                        def.properties as esp_gatt_char_prop_t,
                        core::ptr::null_mut(),
                        &mut control,
                    )
                }
                AttrStep::Descriptor { ch, uuid } => {
                    let def = protocol::char_def(ch);
                    let format = def.format.map(|f| f.encode()).unwrap_or_default();
                    let cccd = [0u8; 2];
                    let (value, perm): (&[u8], _) = match uuid {
                        CCCD_UUID => (&cccd, value_perm(def.access, true, true)),
                        PRESENTATION_FORMAT_UUID => (&format, value_perm(def.access, true, false)),
                        _ => (def.description.as_bytes(), value_perm(def.access, true, false)),
                    };
                    let mut descr_uuid = esp_uuid(Uuid::Sig16(uuid));
                    let mut attr = esp_attr_value_t {
                        attr_max_len: value.len() as u16,
                        attr_len: value.len() as u16,
                        attr_value: value.as_ptr().cast_mut(),
                    };
                    let mut control = esp_attr_control_t {
                        auto_rsp: ESP_GATT_AUTO_RSP as u8,
                    };
                    esp_ble_gatts_add_char_descr(service_handle, &mut descr_uuid, perm, &mut attr, &mut control)
                }
            }
        };
        if ret != ESP_OK {
            error!("GATT: could not issue {:?} ({})", step, ret);
        }
    }

    /// Completion of the current step.
    fn registered(status: esp_gatt_status_t, handle: u16) {
        let mut guard = lock(&GATT);
        let Some(state) = guard.as_mut() else {
            return;
        };
        if status != esp_gatt_status_t_ESP_GATT_OK {
            error!(
                "GATT: registering {:?} failed (status {}); attribute table exhausted?",
                state.registrar.next_step(),
                status
            );
            state.registrar.abort();
            return;
        }
        if let Some(AttrStep::Service(service)) = state.registrar.next_step() {
            // SAFETY: handle came from ESP_GATTS_CREATE_EVT.
            unsafe { esp_ble_gatts_start_service(handle) };
            debug!("GATT: {:?} service at handle {}", service, handle);
        }
        state.registrar.record(handle);
        issue(state);
    }

    // ── Request handling ──────────────────────────────────────

    fn lookup(handle: u16) -> Option<(esp_gatt_if_t, CharId, AttrKind)> {
        let guard = lock(&GATT);
        let state = guard.as_ref()?;
        let (ch, kind) = state.registrar.handles().lookup(handle)?;
        Some((state.gatts_if, ch, kind))
    }

    fn respond(gatts_if: esp_gatt_if_t, conn_id: u16, trans_id: u32, status: esp_gatt_status_t, rsp: Option<&mut esp_gatt_rsp_t>) {
        let rsp = rsp.map_or(core::ptr::null_mut(), |r| r as *mut _);
        // SAFETY: `rsp` is null or points to a live response.
        unsafe { esp_ble_gatts_send_response(gatts_if, conn_id, trans_id, status, rsp) };
    }

    fn on_read(gatts_if: esp_gatt_if_t, p: &esp_ble_gatts_cb_param_t_gatts_read_evt_param) {
        if !p.need_rsp {
            return;
        }
        let value = match lookup(p.handle) {
            Some((_, ch, AttrKind::Value)) => EVENTS.dispatch(BridgeEvent::Read { ch }),
            _ => None,
        };
        let Some(value) = value else {
            respond(gatts_if, p.conn_id, p.trans_id, esp_gatt_status_t_ESP_GATT_READ_NOT_PERMIT, None);
            return;
        };

        let offset = usize::from(p.offset).min(value.len());
        let tail = &value[offset..];
        // SAFETY: all-zero is a valid esp_gatt_rsp_t.
        let mut rsp: esp_gatt_rsp_t = unsafe { core::mem::zeroed() };
        // SAFETY: attr_value is the active union member for read responses.
        unsafe {
            let attr = &mut rsp.attr_value;
            let len = tail.len().min(attr.value.len());
            attr.value[..len].copy_from_slice(&tail[..len]);
            attr.len = len as u16;
            attr.handle = p.handle;
            attr.offset = p.offset;
        }
        respond(gatts_if, p.conn_id, p.trans_id, esp_gatt_status_t_ESP_GATT_OK, Some(&mut rsp));
    }

    fn on_write(gatts_if: esp_gatt_if_t, p: &esp_ble_gatts_cb_param_t_gatts_write_evt_param) {
        let data: &[u8] = if p.value.is_null() {
            &[]
        } else {
            // SAFETY: the stack guarantees `len` bytes at `value`.
            unsafe { core::slice::from_raw_parts(p.value, usize::from(p.len)) }
        };

        if p.is_prep {
            let mut guard = lock(&GATT);
            if let Some(state) = guard.as_mut() {
                let (handle, buf) = state.prepare.get_or_insert_with(|| (p.handle, Vec::new()));
                if *handle == p.handle && usize::from(p.offset) == buf.len() {
                    buf.extend_from_slice(data);
                } else {
                    warn!("GATT: out-of-order prepare write dropped");
                }
            }
            drop(guard);
            if p.need_rsp {
                // SAFETY: all-zero is a valid esp_gatt_rsp_t.
                let mut rsp: esp_gatt_rsp_t = unsafe { core::mem::zeroed() };
                // SAFETY: attr_value is the active member; prepare responses echo the data.
                unsafe {
                    let attr = &mut rsp.attr_value;
                    let len = data.len().min(attr.value.len());
                    attr.value[..len].copy_from_slice(&data[..len]);
                    attr.len = len as u16;
                    attr.handle = p.handle;
                    attr.offset = p.offset;
                }
                respond(gatts_if, p.conn_id, p.trans_id, esp_gatt_status_t_ESP_GATT_OK, Some(&mut rsp));
            }
            return;
        }

        if p.need_rsp {
            respond(gatts_if, p.conn_id, p.trans_id, esp_gatt_status_t_ESP_GATT_OK, None);
        }
        match lookup(p.handle) {
            Some((_, ch, AttrKind::Value)) => {
                EVENTS.dispatch(BridgeEvent::Write { ch, data });
            }
            Some((_, ch, AttrKind::Cccd)) => {
                EVENTS.dispatch(BridgeEvent::SubscriptionWrite { ch, data });
            }
            _ => debug!("GATT: write to unmapped handle {}", p.handle),
        }
    }

    fn on_exec_write(gatts_if: esp_gatt_if_t, p: &esp_ble_gatts_cb_param_t_gatts_exec_write_evt_param) {
        let prepared = lock(&GATT).as_mut().and_then(|s| s.prepare.take());
        respond(gatts_if, p.conn_id, p.trans_id, esp_gatt_status_t_ESP_GATT_OK, None);

        if p.exec_write_flag == ESP_GATT_PREP_WRITE_EXEC as u8 {
            if let Some((handle, data)) = prepared {
                if let Some((_, ch, AttrKind::Value)) = lookup(handle) {
                    EVENTS.dispatch(BridgeEvent::Write { ch, data: &data });
                }
            }
        }
        EVENTS.dispatch(BridgeEvent::ExecWrite);
    }

    // ── Stack callbacks ───────────────────────────────────────

    /// # Safety
    /// Called by Bluedroid with a `param` valid for `event`.
    unsafe extern "C" fn gap_event_handler(event: esp_gap_ble_cb_event_t, param: *mut esp_ble_gap_cb_param_t) {
        match event {
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT
            | esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_RSP_DATA_SET_COMPLETE_EVT => {
                let bit = if event == esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT { 0b01 } else { 0b10 };
                let ready = lock(&GATT).as_mut().is_some_and(|s| {
                    s.adv_ready |= bit;
                    s.adv_ready == ADV_CONFIGURED
                });
                if ready {
                    let mut params = adv_params();
                    unsafe { esp_ble_gap_start_advertising(&mut params) };
                }
            }
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
                let status = unsafe { (*param).adv_start_cmpl.status };
                if status == esp_bt_status_t_ESP_BT_STATUS_SUCCESS {
                    info!("GATT: advertising");
                } else {
                    warn!("GATT: advertising failed to start ({})", status);
                }
            }
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_SEC_REQ_EVT => {
                unsafe { esp_ble_gap_security_rsp((*param).ble_security.ble_req.bd_addr.as_mut_ptr(), true) };
            }
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_PASSKEY_NOTIF_EVT => {
                info!("GATT: pairing, enter the configured PIN on the phone");
            }
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_AUTH_CMPL_EVT => {
                let auth = unsafe { &(*param).ble_security.auth_cmpl };
                EVENTS.dispatch(BridgeEvent::AuthComplete {
                    peer: PeerAddress(auth.bd_addr),
                    success: auth.success,
                    reason: auth.fail_reason as u8,
                });
            }
            _ => {}
        }
    }

    /// # Safety
    /// Called by Bluedroid with a `param` valid for `event`.
    unsafe extern "C" fn gatts_event_handler(event: esp_gatts_cb_event_t, gatts_if: esp_gatt_if_t, param: *mut esp_ble_gatts_cb_param_t) {
        match event {
            esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
                let reg = unsafe { &(*param).reg };
                if reg.status != esp_gatt_status_t_ESP_GATT_OK {
                    error!("GATT: app registration failed ({})", reg.status);
                    return;
                }
                let mut guard = lock(&GATT);
                let Some(state) = guard.as_mut() else {
                    return;
                };
                state.gatts_if = gatts_if;
                set_security(state.pin_code);
                configure_advertising(&state.name);
                issue(state);
            }
            esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
                let p = unsafe { &(*param).create };
                registered(p.status, p.service_handle);
            }
            esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
                let p = unsafe { &(*param).add_char };
                registered(p.status, p.attr_handle);
            }
            esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_DESCR_EVT => {
                let p = unsafe { &(*param).add_char_descr };
                registered(p.status, p.attr_handle);
            }
            esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
                let p = unsafe { &mut (*param).connect };
                unsafe { esp_ble_set_encryption(p.remote_bda.as_mut_ptr(), esp_ble_sec_act_t_ESP_BLE_SEC_ENCRYPT_MITM) };
                EVENTS.dispatch(BridgeEvent::PeerConnected {
                    conn_id: p.conn_id,
                    peer: PeerAddress(p.remote_bda),
                });
            }
            esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
                let p = unsafe { &(*param).disconnect };
                if let Some(state) = lock(&GATT).as_mut() {
                    state.prepare = None;
                }
                debug!("GATT: peer {} gone (reason {:#x})", p.conn_id, p.reason);
                EVENTS.dispatch(BridgeEvent::PeerDisconnected { conn_id: p.conn_id });
            }
            esp_gatts_cb_event_t_ESP_GATTS_MTU_EVT => {
                let p = unsafe { &(*param).mtu };
                EVENTS.dispatch(BridgeEvent::MtuChanged { mtu: p.mtu });
            }
            esp_gatts_cb_event_t_ESP_GATTS_READ_EVT => on_read(gatts_if, unsafe { &(*param).read }),
            esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => on_write(gatts_if, unsafe { &(*param).write }),
            esp_gatts_cb_event_t_ESP_GATTS_EXEC_WRITE_EVT => on_exec_write(gatts_if, unsafe { &(*param).exec_write }),
            esp_gatts_cb_event_t_ESP_GATTS_CONF_EVT => {
                let p = unsafe { &(*param).conf };
                if p.status != esp_gatt_status_t_ESP_GATT_OK {
                    debug!("GATT: indication not confirmed ({})", p.status);
                }
                EVENTS.dispatch(BridgeEvent::NotifyConfirmed);
            }
            _ => {}
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation
// ───────────────────────────────────────────────────────────────

/// A call the domain made on the simulated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCall {
    Notify {
        conn_id: u16,
        ch: CharId,
        value: Vec<u8>,
        confirm: bool,
    },
    Disconnect(u16),
    Advertise,
    Shutdown,
}

/// Recording [`GattPort`]. Peer actions are fed through the installed
/// handler via [`peer`](SimGatt::peer).
#[derive(Default)]
pub struct SimGatt {
    calls: Mutex<Vec<GattCall>>,
    events: HandlerSlot,
}

impl SimGatt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_handler(&self, handler: Arc<dyn EventHandler>) {
        self.events.install(handler);
    }

    /// Deliver a peer action as the stack callback would.
    pub fn peer(&self, event: BridgeEvent<'_>) -> Option<AttrValue> {
        self.events.dispatch(event)
    }

    pub fn calls(&self) -> Vec<GattCall> {
        lock(&self.calls).clone()
    }

    /// Values notified on `ch`, oldest first.
    pub fn notified(&self, ch: CharId) -> Vec<Vec<u8>> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                GattCall::Notify { ch: c, value, .. } if *c == ch => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

impl GattPort for SimGatt {
    fn notify(&self, conn_id: u16, ch: CharId, value: &[u8], confirm: bool) -> bool {
        if !protocol::char_def(ch).notifies() {
            return false;
        }
        lock(&self.calls).push(GattCall::Notify {
            conn_id,
            ch,
            value: value.to_vec(),
            confirm,
        });
        true
    }

    fn disconnect_peer(&self, conn_id: u16) {
        lock(&self.calls).push(GattCall::Disconnect(conn_id));
    }

    fn start_advertising(&self) {
        lock(&self.calls).push(GattCall::Advertise);
    }

    fn shutdown(&self) {
        lock(&self.calls).push(GattCall::Shutdown);
        info!("GATT(sim): stopped");
    }
}
