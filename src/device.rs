//! Per-device core: command scheduling, handle lifecycle, brightness,
//! identity queries, suspend/resume.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chroma_transport::commands::{self, CommandDef};
use chroma_transport::hid::{DeviceInfo, FeatureEndpoint, HidAdapter};
use chroma_transport::report::{run_report, Pacing, RazerReport, Status};
use chroma_transport::types::{LedType, Quirk};
use chroma_transport::TransportError;

use crate::anim::AnimationManager;
use crate::frame::Frame;
use crate::fx::FxManager;
use crate::hardware::{Capability, DeviceType, HardwareEntry};
use crate::headset::HeadsetControl;
use crate::input::InputManager;
use crate::led::{self, LedCache};
use crate::prefs::{DevicePreferences, PreferenceManager, Preferences};
use crate::system::SystemControl;
use crate::util::{brightness_ramp, Signal, RAMP_STEP};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Operation not supported on this device: {0}")]
    Unsupported(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Factory producing a fresh endpoint whenever the device (re)opens its
/// handle. The default opens the enumerated HID path; tests inject mocks.
pub type EndpointFactory =
    Box<dyn Fn() -> Result<Box<dyn FeatureEndpoint>, TransportError> + Send + Sync>;

struct DeviceIo {
    endpoint: Option<Box<dyn FeatureEndpoint>>,
    factory: EndpointFactory,
    pacing: Pacing,
}

impl DeviceIo {
    fn ensure_open(&mut self) -> Result<(), TransportError> {
        if self.endpoint.is_none() {
            self.endpoint = Some((self.factory)()?);
        }
        Ok(())
    }
}

#[derive(Default)]
struct DeviceState {
    serial: Option<String>,
    firmware: Option<String>,
    suspended: bool,
    offline: bool,
    recycle_handle: bool,
}

/// One managed peripheral.
///
/// All command traffic is serialized by the internal async mutex; two
/// callers can never interleave halves of a split-row frame or a
/// request/response pair. Construction performs no I/O.
pub struct ChromaDevice {
    hardware: HardwareEntry,
    devinfo: DeviceInfo,
    index: u32,
    sys_path: String,

    io: AsyncMutex<DeviceIo>,
    state: Mutex<DeviceState>,
    open_refs: AtomicU32,

    prefs_manager: Arc<PreferenceManager>,
    prefs: OnceLock<Arc<DevicePreferences>>,

    /// Fired with (brightness, suspended) on every brightness step.
    pub power_state_changed: Signal<(f64, bool)>,
    /// Fired with the saved record when preferences should be re-applied.
    pub restore_prefs: Signal<Preferences>,
    /// Fired when any LED value changes.
    pub led_changed: Signal<LedType>,

    led_cache: LedCache,
    fx: OnceLock<Arc<FxManager>>,
    frame: Option<Frame>,
    anim: OnceLock<Option<Arc<AnimationManager>>>,
    input: Option<Arc<InputManager>>,
    headset: Option<HeadsetControl>,
    system: Option<Arc<SystemControl>>,

    brightness_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChromaDevice {
    /// Build a device with a custom endpoint factory (used by tests and by
    /// [`ChromaDevice::open_hid`]).
    pub fn build(
        hardware: HardwareEntry,
        devinfo: DeviceInfo,
        index: u32,
        sys_path: String,
        input_paths: Vec<PathBuf>,
        prefs_manager: Arc<PreferenceManager>,
        factory: EndpointFactory,
    ) -> Arc<Self> {
        let device = Arc::new_cyclic(|weak: &Weak<ChromaDevice>| {
            let has_matrix_area = hardware.width() > 0 && hardware.height() > 0;

            let frame = has_matrix_area.then(|| {
                Frame::new(weak.clone(), hardware.width(), hardware.height())
            });

            let input = (!input_paths.is_empty())
                .then(|| Arc::new(InputManager::new(weak.clone(), input_paths)));

            let headset = (hardware.device_type == DeviceType::Headset)
                .then(|| HeadsetControl::new(weak.clone(), &hardware));

            let system = (hardware.device_type == DeviceType::Laptop
                && hardware.has_capability(Capability::EcFanControl))
            .then(|| Arc::new(SystemControl::new(weak.clone(), &hardware)));

            ChromaDevice {
                led_cache: LedCache::new(&hardware),
                hardware,
                devinfo,
                index,
                sys_path,
                io: AsyncMutex::new(DeviceIo {
                    endpoint: None,
                    factory,
                    pacing: Pacing::new(),
                }),
                state: Mutex::new(DeviceState::default()),
                open_refs: AtomicU32::new(0),
                prefs_manager,
                prefs: OnceLock::new(),
                power_state_changed: Signal::new(),
                restore_prefs: Signal::new(),
                led_changed: Signal::new(),
                fx: OnceLock::new(),
                frame,
                anim: OnceLock::new(),
                input,
                headset,
                system,
                brightness_task: Mutex::new(None),
            }
        });

        device
            .fx
            .set(Arc::new(FxManager::new(Arc::downgrade(&device))))
            .ok();

        let anim = device.frame.is_some().then(|| {
            AnimationManager::new(Arc::downgrade(&device))
        });
        device.anim.set(anim).ok();

        Self::wire_restore_handlers(&device);
        device
    }

    /// Standard constructor: opens the enumerated HID path on demand.
    pub fn open_hid(
        hardware: HardwareEntry,
        devinfo: DeviceInfo,
        index: u32,
        sys_path: String,
        input_paths: Vec<PathBuf>,
        prefs_manager: Arc<PreferenceManager>,
    ) -> Arc<Self> {
        let info = devinfo.clone();
        Self::build(
            hardware,
            devinfo,
            index,
            sys_path,
            input_paths,
            prefs_manager,
            Box::new(move || {
                Ok(Box::new(HidAdapter::open(&info, false)?) as Box<dyn FeatureEndpoint>)
            }),
        )
    }

    fn wire_restore_handlers(device: &Arc<Self>) {
        // LED states, last FX, animation layers, and power mode re-apply
        // themselves when the restore signal fires.
        let weak = Arc::downgrade(device);
        device.restore_prefs.connect(move |prefs: &Preferences| {
            let Some(device) = weak.upgrade() else {
                return;
            };
            let prefs = prefs.clone();
            tokio::spawn(async move {
                // a restore must not rewrite the store it reads from
                let _pause = device.preferences().await.observers_paused();

                led::restore_prefs(&device, &prefs).await;

                if let Some(anim) = device.animation_manager() {
                    anim.restore_prefs(&prefs).await;
                }

                // saved layers take priority over a saved firmware effect
                if prefs.layers.is_empty() {
                    device.fx_manager().restore_prefs(&prefs).await;
                }

                if let Some(system) = device.system_control() {
                    system.restore_prefs(&prefs).await;
                }
            });
        });
    }

    // ── identity ───────────────────────────────────────────────────

    pub fn hardware(&self) -> &HardwareEntry {
        &self.hardware
    }

    pub fn name(&self) -> &str {
        &self.hardware.name
    }

    pub fn manufacturer(&self) -> &str {
        &self.hardware.manufacturer
    }

    pub fn device_type(&self) -> DeviceType {
        self.hardware.device_type
    }

    pub fn vendor_id(&self) -> u16 {
        self.devinfo.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.devinfo.product_id
    }

    pub fn device_index(&self) -> u32 {
        self.index
    }

    pub fn sys_path(&self) -> &str {
        &self.sys_path
    }

    /// Unique key identifying this device to the device manager.
    pub fn key(&self) -> String {
        format!(
            "{:04x}:{:04x}.{:02}",
            self.vendor_id(),
            self.product_id(),
            self.index
        )
    }

    pub fn width(&self) -> usize {
        self.hardware.width()
    }

    pub fn height(&self) -> usize {
        self.hardware.height()
    }

    pub fn has_matrix(&self) -> bool {
        self.hardware.has_matrix()
    }

    pub fn has_quirk(&self, quirk: Quirk) -> bool {
        self.hardware.has_quirk(quirk)
    }

    pub fn is_wireless(&self) -> bool {
        self.hardware.is_wireless()
    }

    pub fn is_offline(&self) -> bool {
        self.state.lock().offline
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    // ── subsystems ─────────────────────────────────────────────────

    pub fn fx_manager(&self) -> Arc<FxManager> {
        Arc::clone(self.fx.get().expect("fx manager wired at construction"))
    }

    pub fn frame_control(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn animation_manager(&self) -> Option<Arc<AnimationManager>> {
        self.anim.get().and_then(|a| a.clone())
    }

    pub fn input_manager(&self) -> Option<Arc<InputManager>> {
        self.input.clone()
    }

    pub fn system_control(&self) -> Option<Arc<SystemControl>> {
        self.system.clone()
    }

    pub(crate) fn headset_control(&self) -> Option<&HeadsetControl> {
        self.headset.as_ref()
    }

    pub(crate) fn led_cache(&self) -> &LedCache {
        &self.led_cache
    }

    pub fn supported_leds(&self) -> &[LedType] {
        &self.hardware.supported_leds
    }

    pub fn is_animating(&self) -> bool {
        self.animation_manager()
            .map(|a| a.running())
            .unwrap_or(false)
    }

    // ── handle lifecycle ───────────────────────────────────────────

    /// Scoped acquisition: nested callers share one open handle, and the
    /// handle closes once every guard is gone and no animation runs.
    pub fn device_open(self: &Arc<Self>) -> DeviceOpenGuard {
        self.open_refs.fetch_add(1, Ordering::SeqCst);
        DeviceOpenGuard {
            device: Arc::clone(self),
        }
    }

    fn maybe_close(&self, io: &mut DeviceIo) {
        if self.open_refs.load(Ordering::SeqCst) == 0 && !self.is_animating() {
            io.endpoint = None;
        }
    }

    /// Close the HID handle. Without `force`, the handle stays open while
    /// guards are held or an animation is running.
    pub fn close(&self, force: bool) {
        if !force && (self.open_refs.load(Ordering::SeqCst) > 0 || self.is_animating()) {
            return;
        }
        if let Ok(mut io) = self.io.try_lock() {
            io.endpoint = None;
        }
    }

    /// Shut down all services and close the handle.
    pub async fn shutdown(&self) {
        if let Some(anim) = self.animation_manager() {
            anim.shutdown().await;
        }
        if let Some(input) = &self.input {
            input.shutdown().await;
        }
        self.io.lock().await.endpoint = None;
        info!("Device {} shut down", self.key());
    }

    // ── command paths ──────────────────────────────────────────────

    /// Create a report for this device, using the protocol's transaction
    /// id unless one is given.
    pub fn get_report(
        &self,
        command_class: u8,
        command_id: u8,
        data_size: Option<u8>,
        transaction_id: Option<u8>,
    ) -> RazerReport {
        RazerReport::new(
            command_class,
            command_id,
            data_size,
            transaction_id.unwrap_or_else(|| self.hardware.transaction_id()),
        )
    }

    pub async fn run_command(&self, cmd: &CommandDef, args: &[u8]) -> Result<bool, DeviceError> {
        self.run_command_with(cmd, args, None, None, 0).await
    }

    pub async fn run_command_with(
        &self,
        cmd: &CommandDef,
        args: &[u8],
        transaction_id: Option<u8>,
        delay: Option<Duration>,
        remaining_packets: u16,
    ) -> Result<bool, DeviceError> {
        let mut report =
            self.get_report(cmd.command_class, cmd.command_id, cmd.data_size, transaction_id);
        report.args().put_slice(args);
        report.set_remaining_packets(remaining_packets);
        self.run_report(&mut report, delay).await
    }

    /// Run a command and return its payload, or None when the hardware
    /// declined (unsupported, failed, offline).
    pub async fn run_with_result(
        &self,
        cmd: &CommandDef,
        args: &[u8],
    ) -> Result<Option<Vec<u8>>, DeviceError> {
        let mut report = self.get_report(cmd.command_class, cmd.command_id, cmd.data_size, None);
        report.args().put_slice(args);

        if self.run_report(&mut report, None).await? {
            Ok(Some(report.result().to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Run a previously initialized report on the device.
    pub async fn run_report(
        &self,
        report: &mut RazerReport,
        delay: Option<Duration>,
    ) -> Result<bool, DeviceError> {
        let delay = delay.unwrap_or(self.hardware.protocol_config().inter_command_delay);

        let mut io = self.io.lock().await;
        if let Err(err) = io.ensure_open() {
            warn!("Could not open {}: {err}", self.key());
            return Err(err.into());
        }

        let wireless = self.is_wireless();
        let state = &self.state;
        let mut cb = move |status: Status, _data: Option<&[u8]>| {
            let mut s = state.lock();
            match status {
                Status::Timeout => {
                    s.offline = true;
                }
                Status::Ok if s.offline => {
                    s.offline = false;
                    s.recycle_handle = true;
                }
                _ => {}
            }
        };

        let DeviceIo {
            endpoint, pacing, ..
        } = &mut *io;
        let ep = endpoint.as_deref_mut().expect("ensured open above");

        let cb_opt: Option<chroma_transport::report::TimeoutCallback<'_>> =
            if wireless { Some(&mut cb) } else { None };
        let result = run_report(ep, report, pacing, delay, cb_opt).await;

        match result {
            Ok(ok) => {
                if self.state.lock().recycle_handle {
                    self.state.lock().recycle_handle = false;
                    io.endpoint = None;
                } else {
                    self.maybe_close(&mut io);
                }
                Ok(ok)
            }
            Err(err) => {
                // drop the handle; next call re-opens
                io.endpoint = None;
                Err(err.into())
            }
        }
    }

    /// Write one raw report outside the 90-byte framing (headset path).
    pub(crate) async fn raw_command(
        &self,
        data: &[u8],
        report_id: u8,
        delay: Duration,
    ) -> Result<(), DeviceError> {
        let mut io = self.io.lock().await;
        io.ensure_open()?;

        io.pacing.pace(delay).await;
        let DeviceIo { endpoint, .. } = &mut *io;
        match endpoint
            .as_deref_mut()
            .expect("ensured open above")
            .write(data, Some(report_id))
        {
            Ok(_) => Ok(()),
            Err(err) => {
                io.endpoint = None;
                Err(err.into())
            }
        }
    }

    /// Raw write followed by a bounded read (headset path).
    pub(crate) async fn raw_request(
        &self,
        data: &[u8],
        report_id: u8,
        delay: Duration,
        read_len: usize,
        timeout_ms: i32,
    ) -> Result<Vec<u8>, DeviceError> {
        let mut io = self.io.lock().await;
        io.ensure_open()?;

        let result = async {
            io.pacing.pace(delay).await;
            let DeviceIo {
                endpoint, pacing, ..
            } = &mut *io;
            let ep = endpoint.as_deref_mut().expect("ensured open above");
            ep.write(data, Some(report_id))?;
            pacing.pace(delay).await;
            ep.read(read_len, timeout_ms)
        }
        .await;

        match result {
            Ok(resp) => Ok(resp),
            Err(err) => {
                io.endpoint = None;
                Err(err.into())
            }
        }
    }

    // ── identity queries ───────────────────────────────────────────

    /// The hardware serial number, fetched once and cached.
    ///
    /// Laptops report their model name instead; an undecodable reply falls
    /// back to the stable device key.
    pub async fn serial_number(&self) -> String {
        if let Some(serial) = self.state.lock().serial.clone() {
            return serial;
        }

        let candidate = if self.device_type() == DeviceType::Laptop {
            Some(self.name().to_string())
        } else if let Some(headset) = &self.headset {
            headset.serial_number().await
        } else {
            match self.run_with_result(&commands::GET_SERIAL, &[]).await {
                Ok(Some(raw)) => decode_serial(&raw),
                _ => None,
            }
        };

        let serial = candidate
            .map(|s| {
                s.chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_')
                    .collect::<String>()
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.key());

        self.state.lock().serial = Some(serial.clone());
        serial
    }

    /// Firmware version as `v<major>.<minor>`, or "(unknown)".
    pub async fn firmware_version(&self) -> String {
        if let Some(version) = self.state.lock().firmware.clone() {
            return version;
        }

        let raw = if let Some(headset) = &self.headset {
            headset.firmware_version().await
        } else {
            self.run_with_result(&commands::GET_FIRMWARE, &[])
                .await
                .ok()
                .flatten()
        };

        let version = match raw {
            Some(bytes) if bytes.len() >= 2 => format!("v{}.{}", bytes[0], bytes[1]),
            _ => "(unknown)".to_string(),
        };

        self.state.lock().firmware = Some(version.clone());
        version
    }

    /// Saved preferences for this device, keyed by serial.
    pub async fn preferences(&self) -> Arc<DevicePreferences> {
        if let Some(prefs) = self.prefs.get() {
            return Arc::clone(prefs);
        }
        let serial = self.serial_number().await;
        let prefs = self.prefs_manager.get(&serial);
        let _ = self.prefs.set(Arc::clone(&prefs));
        prefs
    }

    // ── device mode (keyboards / keypads) ──────────────────────────

    pub async fn get_device_mode(&self) -> Result<Option<(u8, u8)>, DeviceError> {
        if !matches!(
            self.device_type(),
            DeviceType::Keyboard | DeviceType::Keypad
        ) {
            return Ok(None);
        }
        let result = self.run_with_result(&commands::GET_DEVICE_MODE, &[]).await?;
        Ok(result.and_then(|v| (v.len() >= 2).then(|| (v[0], v[1]))))
    }

    pub async fn set_device_mode(&self, mode: u8, param: u8) -> Result<bool, DeviceError> {
        if !matches!(
            self.device_type(),
            DeviceType::Keyboard | DeviceType::Keypad
        ) {
            return Ok(false);
        }
        self.run_command(&commands::SET_DEVICE_MODE, &[mode, param])
            .await
    }

    // ── brightness / power ─────────────────────────────────────────

    fn brightness_led(&self) -> LedType {
        if self.has_quirk(Quirk::ScrollWheelBrightness) {
            LedType::ScrollWheel
        } else if self.has_quirk(Quirk::LogoLedBrightness) {
            LedType::Logo
        } else {
            LedType::Backlight
        }
    }

    pub(crate) async fn set_brightness_raw(
        self: &Arc<Self>,
        level: f64,
    ) -> Result<bool, DeviceError> {
        if let Some(headset) = self.headset.as_ref() {
            return headset.set_brightness(level).await;
        }

        let led_type = self.brightness_led();
        match self.led(led_type) {
            Some(led) => led.set_brightness(level).await.map(|_| true),
            None => Ok(false),
        }
    }

    pub async fn get_brightness(self: &Arc<Self>) -> f64 {
        if self.is_suspended() {
            if let Some(prefs) = self.prefs.get() {
                return prefs.get().brightness.unwrap_or(0.0);
            }
            return 0.0;
        }

        if let Some(headset) = self.headset.as_ref() {
            return headset.get_brightness().await;
        }

        match self.led(self.brightness_led()) {
            Some(led) => led.brightness().await,
            None => 0.0,
        }
    }

    /// Ramp brightness to the target, emitting smoothed intermediate
    /// values at the animation tick rate and firing `power_state_changed`
    /// on every step.
    pub async fn set_brightness(self: &Arc<Self>, level: f64) {
        let level = level.clamp(0.0, 100.0);

        let suspended = self.is_suspended();
        self.preferences()
            .await
            .update(|p| p.brightness = Some(level));
        if suspended {
            return;
        }

        let current = self.get_brightness().await;
        self.animate_brightness(current, level);
    }

    fn animate_brightness(self: &Arc<Self>, from: f64, to: f64) {
        let device = Arc::clone(self);
        let mut task_slot = self.brightness_task.lock();
        if let Some(task) = task_slot.take() {
            task.abort();
        }

        *task_slot = Some(tokio::spawn(async move {
            let _guard = device.device_open();
            for step in brightness_ramp(from, to) {
                if device.set_brightness_raw(step).await.is_err() {
                    break;
                }
                let suspended = device.is_suspended() && step == 0.0;
                device.power_state_changed.fire(&(step, suspended));
                tokio::time::sleep(RAMP_STEP).await;
            }
        }));
    }

    /// Save brightness and ramp (or jump) to zero.
    pub async fn suspend(self: &Arc<Self>, fast: bool) {
        if self.is_suspended() {
            return;
        }

        let brightness = self.get_brightness().await;
        self.preferences()
            .await
            .update(|p| p.brightness = Some(brightness));
        self.state.lock().suspended = true;

        if fast {
            let _ = self.set_brightness_raw(0.0).await;
            self.power_state_changed.fire(&(0.0, true));
        } else {
            self.animate_brightness(brightness, 0.0);
        }
        debug!("Device {} suspended", self.key());
    }

    /// Restore the saved brightness level.
    pub async fn resume(self: &Arc<Self>) {
        if !self.is_suspended() {
            return;
        }
        self.state.lock().suspended = false;

        let saved = self
            .preferences()
            .await
            .get()
            .brightness
            .unwrap_or(80.0);
        let current = self.get_brightness().await;
        self.animate_brightness(current, saved);
        debug!("Device {} resumed", self.key());
    }

    /// Clear effects and custom frame state back to defaults.
    pub async fn reset(self: &Arc<Self>) -> Result<(), DeviceError> {
        if let Some(frame) = self.frame_control() {
            frame.reset().await?;
        }
        self.fx_manager().disable().await;
        Ok(())
    }

    /// Pre-seed the cached serial number, bypassing the hardware query.
    #[doc(hidden)]
    pub fn prime_serial(&self, serial: &str) {
        self.state.lock().serial = Some(serial.to_string());
    }

    /// Load preferences and fan the record out to every subsystem.
    pub async fn fire_restore_prefs(self: &Arc<Self>) {
        let prefs = self.preferences().await;
        let record = prefs.get();
        let _pause = prefs.observers_paused();

        if let Some(brightness) = record.brightness {
            let current = self.get_brightness().await;
            self.animate_brightness(current, brightness);
        }

        self.restore_prefs.fire(&record);
    }
}

fn decode_serial(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let s = std::str::from_utf8(&raw[..end]).ok()?;
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl std::fmt::Debug for ChromaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromaDevice")
            .field("name", &self.name())
            .field("type", &self.device_type().name())
            .field("product_id", &format_args!("0x{:04x}", self.product_id()))
            .field("index", &self.index)
            .field("quirks", &self.hardware.quirks)
            .finish()
    }
}

/// Scoped open reference; see [`ChromaDevice::device_open`].
pub struct DeviceOpenGuard {
    device: Arc<ChromaDevice>,
}

impl Drop for DeviceOpenGuard {
    fn drop(&mut self) {
        if self.device.open_refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.device.close(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test(start_paused = true)]
    async fn test_firmware_version_formatting() {
        let (device, endpoint) = testing::keyboard_device();
        endpoint.lock().queue_ok(0x00, 0x81, 0xFF, &[0x01, 0x05]);

        assert_eq!(device.firmware_version().await, "v1.5");
        // cached: no further traffic
        let sent = endpoint.lock().sent.len();
        assert_eq!(device.firmware_version().await, "v1.5");
        assert_eq!(endpoint.lock().sent.len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_version_unknown_on_failure() {
        let (device, endpoint) = testing::keyboard_device();
        let mut fail = vec![0u8; 90];
        fail[0] = 0x05; // UNSUPPORTED
        fail[88] = chroma_transport::crc(&fail);
        endpoint.lock().queue_response(fail);

        assert_eq!(device.firmware_version().await, "(unknown)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_number_stripped() {
        let (device, endpoint) = testing::keyboard_device();
        endpoint
            .lock()
            .queue_ok(0x00, 0x82, 0xFF, b"PM1623H02-\x00\x00\x00");

        assert_eq!(device.serial_number().await, "PM1623H02");
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_falls_back_to_key() {
        let (device, endpoint) = testing::keyboard_device();
        endpoint.lock().queue_ok(0x00, 0x82, 0xFF, &[0xFF, 0xFE, 0xFD]);

        assert_eq!(device.serial_number().await, device.key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_format() {
        let (device, _) = testing::keyboard_device();
        assert_eq!(device.key(), "1532:0203.00");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_mode_rejected_on_laptop() {
        let (device, _) = testing::laptop_device();
        assert!(device.get_device_mode().await.unwrap().is_none());
        assert!(!device.set_device_mode(0x03, 0).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_share_one_transaction_id() {
        let (device, endpoint) = testing::extended_keyboard_device();
        device
            .run_command(&commands::SET_LED_STATE, &[0x01, 0x05, 0x01])
            .await
            .unwrap();

        let sent = endpoint.lock().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], 0x3F);
    }
}
