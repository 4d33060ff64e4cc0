use core::ffi::c_void;
use std::{
    collections::BTreeMap,
    ffi::CString,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use esp_idf_svc::{
    bt::{BtClassic, BtDriver},
    sys::{self, esp, EspError},
};
use log::{debug, info, warn};

use dimmer_common::{BtTransport, DiscoveredDevice, MacAddress, TransportEventSink};

/// Inquiry length unit used by the controller, in milliseconds.
const INQUIRY_UNIT_MS: u64 = 1_280;
const MAX_INQUIRY_UNITS: u64 = 0x30;
const INQUIRY_CANCEL_GRACE_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum SppError {
    #[error("no SPP channel open")]
    NotConnected,
    #[error("radio name contains a NUL byte")]
    InvalidName,
    #[error("frame of {0} bytes exceeds SPP write size")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Esp(#[from] EspError),
}

/// Bluedroid reports everything through plain C callbacks, so the state they
/// touch lives in one process-wide slot. Only one [`SppTransport`] may exist.
struct RadioSlot {
    sink: Option<TransportEventSink>,
    target: Option<MacAddress>,
    handle: Option<u32>,
    inquiry_active: bool,
    discovered: BTreeMap<MacAddress, String>,
}

impl RadioSlot {
    const fn new() -> Self {
        Self {
            sink: None,
            target: None,
            handle: None,
            inquiry_active: false,
            discovered: BTreeMap::new(),
        }
    }
}

static RADIO: Mutex<RadioSlot> = Mutex::new(RadioSlot::new());
static INQUIRY_DONE: Condvar = Condvar::new();

fn radio() -> MutexGuard<'static, RadioSlot> {
    RADIO.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SppTransport {
    _driver: BtDriver<'static, BtClassic>,
}

impl SppTransport {
    /// Registers the SPP and GAP callbacks on an enabled classic-BT stack and
    /// advertises `name` as the local device name.
    pub fn new(
        driver: BtDriver<'static, BtClassic>,
        sink: TransportEventSink,
        name: &str,
    ) -> Result<Self, SppError> {
        radio().sink = Some(sink);

        let device_name = CString::new(name).map_err(|_| SppError::InvalidName)?;
        unsafe {
            esp!(sys::esp_bt_gap_register_callback(Some(gap_callback)))?;
            esp!(sys::esp_spp_register_callback(Some(spp_callback)))?;

            let spp_config = sys::esp_spp_cfg_t {
                mode: sys::esp_spp_mode_t_ESP_SPP_MODE_CB,
                enable_l2cap_ertm: true,
                ..Default::default()
            };
            esp!(sys::esp_spp_enhanced_init(&spp_config))?;
            esp!(sys::esp_bt_dev_set_device_name(device_name.as_ptr()))?;
        }

        info!("SPP initiator ready as `{name}`");
        Ok(Self { _driver: driver })
    }
}

impl BtTransport for SppTransport {
    type Error = SppError;

    fn connect(&mut self, mac: MacAddress) -> Result<(), SppError> {
        radio().target = Some(mac);
        let mut bda = mac.octets();
        // Channel lookup first; the connect itself is issued once the SDP
        // query reports a server channel.
        esp!(unsafe { sys::esp_spp_start_discovery(bda.as_mut_ptr()) })?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SppError> {
        let handle = {
            let mut slot = radio();
            slot.target = None;
            slot.handle
        };
        match handle {
            Some(handle) => esp!(unsafe { sys::esp_spp_disconnect(handle) })?,
            None => debug!("SPP disconnect with no open channel"),
        }
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), SppError> {
        let handle = radio().handle.ok_or(SppError::NotConnected)?;
        let len = i32::try_from(frame.len()).map_err(|_| SppError::FrameTooLarge(frame.len()))?;
        let mut buffer = frame.to_vec();
        esp!(unsafe { sys::esp_spp_write(handle, len, buffer.as_mut_ptr()) })?;
        Ok(())
    }

    fn discover(&mut self, timeout_ms: u64) -> Result<Vec<DiscoveredDevice>, SppError> {
        {
            let mut slot = radio();
            slot.discovered.clear();
            slot.inquiry_active = true;
        }

        let units = (timeout_ms / INQUIRY_UNIT_MS).clamp(1, MAX_INQUIRY_UNITS) as u8;
        if let Err(err) = esp!(unsafe {
            sys::esp_bt_gap_start_discovery(
                sys::esp_bt_inq_mode_t_ESP_BT_INQ_MODE_GENERAL_INQUIRY,
                units,
                0,
            )
        }) {
            radio().inquiry_active = false;
            return Err(err.into());
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut slot = radio();
        while slot.inquiry_active {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            slot = INQUIRY_DONE
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        if slot.inquiry_active {
            drop(slot);
            if let Err(err) = esp!(unsafe { sys::esp_bt_gap_cancel_discovery() }) {
                warn!("failed to cancel inquiry: {err}");
            }
            let grace = Duration::from_millis(INQUIRY_CANCEL_GRACE_MS);
            slot = INQUIRY_DONE
                .wait_timeout_while(radio(), grace, |slot| slot.inquiry_active)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            slot.inquiry_active = false;
        }

        Ok(slot
            .discovered
            .iter()
            .map(|(address, name)| DiscoveredDevice {
                name: name.clone(),
                address: *address,
            })
            .collect())
    }
}

unsafe extern "C" fn spp_callback(
    event: sys::esp_spp_cb_event_t,
    param: *mut sys::esp_spp_cb_param_t,
) {
    if param.is_null() {
        return;
    }
    let param = &*param;

    match event {
        sys::esp_spp_cb_event_t_ESP_SPP_INIT_EVT => {
            info!("SPP stack initialised (status {})", param.init.status);
        }
        sys::esp_spp_cb_event_t_ESP_SPP_DISCOVERY_COMP_EVT => {
            let disc = &param.disc_comp;
            let target = radio().target;
            let Some(mac) = target else {
                return;
            };

            if disc.status != sys::esp_spp_status_t_ESP_SPP_SUCCESS || disc.scn_num == 0 {
                warn!("no SPP channel found on {mac} (status {})", disc.status);
                notify_disconnected();
                return;
            }

            let mut bda = mac.octets();
            let rc = sys::esp_spp_connect(
                sys::ESP_SPP_SEC_NONE as sys::esp_spp_sec_t,
                sys::esp_spp_role_t_ESP_SPP_ROLE_MASTER,
                disc.scn[0],
                bda.as_mut_ptr(),
            );
            if let Err(err) = esp!(rc) {
                warn!("SPP connect to {mac} failed to start: {err}");
                notify_disconnected();
            }
        }
        sys::esp_spp_cb_event_t_ESP_SPP_OPEN_EVT => {
            let open = &param.open;
            let mac = MacAddress::new(open.rem_bda);
            if open.status != sys::esp_spp_status_t_ESP_SPP_SUCCESS {
                warn!("SPP open to {mac} failed (status {})", open.status);
                notify_disconnected();
                return;
            }

            let sink = {
                let mut slot = radio();
                slot.handle = Some(open.handle);
                slot.sink.clone()
            };
            if let Some(sink) = sink {
                sink.connected(mac);
            }
        }
        sys::esp_spp_cb_event_t_ESP_SPP_CLOSE_EVT => {
            debug!("SPP channel closed (status {})", param.close.status);
            radio().handle = None;
            notify_disconnected();
        }
        sys::esp_spp_cb_event_t_ESP_SPP_DATA_IND_EVT => {
            // Replies from the fixture are not interpreted.
            debug!("discarding {} byte(s) from fixture", param.data_ind.len);
        }
        sys::esp_spp_cb_event_t_ESP_SPP_CONG_EVT => {
            debug!("SPP congestion: {}", param.cong.cong);
        }
        _ => {}
    }
}

unsafe extern "C" fn gap_callback(
    event: sys::esp_bt_gap_cb_event_t,
    param: *mut sys::esp_bt_gap_cb_param_t,
) {
    if param.is_null() {
        return;
    }
    let param = &mut *param;

    match event {
        sys::esp_bt_gap_cb_event_t_ESP_BT_GAP_DISC_RES_EVT => {
            let result = &param.disc_res;
            let mac = MacAddress::new(result.bda);
            let name = device_name(result.prop, result.num_prop).unwrap_or_default();

            let mut slot = radio();
            let entry = slot.discovered.entry(mac).or_default();
            if entry.is_empty() {
                *entry = name;
            }
        }
        sys::esp_bt_gap_cb_event_t_ESP_BT_GAP_DISC_STATE_CHANGED_EVT => {
            if param.disc_st_chg.state
                == sys::esp_bt_gap_discovery_state_t_ESP_BT_GAP_DISCOVERY_STOPPED
            {
                radio().inquiry_active = false;
                INQUIRY_DONE.notify_all();
            }
        }
        sys::esp_bt_gap_cb_event_t_ESP_BT_GAP_CFM_REQ_EVT => {
            let mut bda = param.cfm_req.bda;
            if let Err(err) = esp!(sys::esp_bt_gap_ssp_confirm_reply(bda.as_mut_ptr(), true)) {
                warn!("SSP confirm failed: {err}");
            }
        }
        sys::esp_bt_gap_cb_event_t_ESP_BT_GAP_AUTH_CMPL_EVT => {
            let auth = &param.auth_cmpl;
            info!(
                "pairing with {} finished (status {})",
                MacAddress::new(auth.bda),
                auth.stat
            );
        }
        _ => {}
    }
}

fn notify_disconnected() {
    let sink = radio().sink.clone();
    if let Some(sink) = sink {
        sink.disconnected();
    }
}

/// Pulls a friendly name out of an inquiry result, preferring the BDNAME
/// property and falling back to the name carried in EIR data.
unsafe fn device_name(props: *mut sys::esp_bt_gap_dev_prop_t, count: i32) -> Option<String> {
    if props.is_null() || count <= 0 {
        return None;
    }
    let props = core::slice::from_raw_parts(props, count as usize);

    let mut eir_name = None;
    for prop in props {
        if prop.val.is_null() || prop.len <= 0 {
            continue;
        }
        match prop.type_ {
            sys::esp_bt_gap_dev_prop_type_t_ESP_BT_GAP_DEV_PROP_BDNAME => {
                return Some(lossy(prop.val, prop.len as usize));
            }
            sys::esp_bt_gap_dev_prop_type_t_ESP_BT_GAP_DEV_PROP_EIR => {
                eir_name = eir_name.or_else(|| eir_local_name(prop.val as *mut u8));
            }
            _ => {}
        }
    }
    eir_name
}

unsafe fn eir_local_name(eir: *mut u8) -> Option<String> {
    for kind in [
        sys::ESP_BT_EIR_TYPE_CMPL_LOCAL_NAME,
        sys::ESP_BT_EIR_TYPE_SHORT_LOCAL_NAME,
    ] {
        let mut len = 0_u8;
        let data = sys::esp_bt_gap_resolve_eir_data(eir, kind as sys::esp_bt_eir_type_t, &mut len);
        if !data.is_null() && len > 0 {
            return Some(lossy(data as *const c_void, usize::from(len)));
        }
    }
    None
}

unsafe fn lossy(ptr: *const c_void, len: usize) -> String {
    let bytes = core::slice::from_raw_parts(ptr as *const u8, len);
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}
