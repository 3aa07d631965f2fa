//! Individual LED control with a lazy-read cache and write coalescing.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use chroma_transport::commands;
use chroma_transport::types::{LedType, Quirk, VARSTORE};

use crate::color::Rgba;
use crate::device::{ChromaDevice, DeviceError};
use crate::hardware::HardwareEntry;
use crate::prefs::Preferences;
use crate::traits::{TraitValue, TraitValues};
use crate::util::{scale_brightness, unscale_brightness};

/// Firmware LED effect modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedMode {
    #[default]
    Static,
    Blink,
    Pulse,
    Spectrum,
}

impl LedMode {
    pub fn value(self) -> u8 {
        match self {
            LedMode::Static => 0x00,
            LedMode::Blink => 0x01,
            LedMode::Pulse => 0x02,
            LedMode::Spectrum => 0x04,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(LedMode::Static),
            0x01 => Some(LedMode::Blink),
            0x02 => Some(LedMode::Pulse),
            0x04 => Some(LedMode::Spectrum),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LedMode::Static => "static",
            LedMode::Blink => "blink",
            LedMode::Pulse => "pulse",
            LedMode::Spectrum => "spectrum",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Some(LedMode::Static),
            "blink" => Some(LedMode::Blink),
            "pulse" => Some(LedMode::Pulse),
            "spectrum" => Some(LedMode::Spectrum),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct LedValues {
    state: bool,
    color: Rgba,
    brightness: f64,
    mode: LedMode,
    dirty: bool,
}

impl Default for LedValues {
    fn default() -> Self {
        Self {
            state: false,
            color: Rgba::from_rgb8(0, 255, 0),
            brightness: 80.0,
            mode: LedMode::Static,
            // force a hardware read on first access
            dirty: true,
        }
    }
}

/// Cached per-LED values, lazily instantiated per zone.
pub struct LedCache {
    values: Mutex<BTreeMap<LedType, LedValues>>,
    supported: Vec<LedType>,
}

impl LedCache {
    pub fn new(hardware: &HardwareEntry) -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            supported: hardware.supported_leds.clone(),
        }
    }

    fn entry(&self, led_type: LedType) -> LedValues {
        self.values.lock().entry(led_type).or_default().clone()
    }

    fn update(&self, led_type: LedType, mutate: impl FnOnce(&mut LedValues)) {
        mutate(self.values.lock().entry(led_type).or_default());
    }
}

impl ChromaDevice {
    /// Fetch the controller for one LED zone, or None when the device does
    /// not expose it.
    pub fn led(self: &Arc<Self>, led_type: LedType) -> Option<Led> {
        if !self.led_cache().supported.contains(&led_type) {
            return None;
        }
        Some(Led {
            device: Arc::clone(self),
            led_type,
        })
    }
}

/// Controller for a single LED zone.
///
/// Reads come from the cache, transparently refreshing from hardware when
/// the cache is dirty. Writes coalesce into the matching SET command and
/// dirty the cache.
pub struct Led {
    device: Arc<ChromaDevice>,
    led_type: LedType,
}

impl Led {
    pub fn led_type(&self) -> LedType {
        self.led_type
    }

    fn brightness_commands(&self) -> (&'static commands::CommandDef, &'static commands::CommandDef) {
        if self.device.has_quirk(Quirk::ExtendedFxCmds) {
            (
                &commands::SET_BRIGHTNESS_EXTENDED,
                &commands::GET_BRIGHTNESS_EXTENDED,
            )
        } else {
            (&commands::SET_LED_BRIGHTNESS, &commands::GET_LED_BRIGHTNESS)
        }
    }

    async fn get_raw(
        &self,
        cmd: &commands::CommandDef,
    ) -> Result<Option<Vec<u8>>, DeviceError> {
        self.device
            .run_with_result(cmd, &[VARSTORE, self.led_type.hardware_id()])
            .await
    }

    async fn set_raw(&self, cmd: &commands::CommandDef, args: &[u8]) -> Result<bool, DeviceError> {
        let mut full = vec![VARSTORE, self.led_type.hardware_id()];
        full.extend_from_slice(args);
        self.device.run_command(cmd, &full).await
    }

    /// Batched refresh of state, color, mode, and brightness.
    async fn refresh(&self) -> Result<(), DeviceError> {
        let _guard = self.device.device_open();
        let (_, get_brightness) = self.brightness_commands();

        let state = self.get_raw(&commands::GET_LED_STATE).await?;
        let color = self.get_raw(&commands::GET_LED_COLOR).await?;
        let mode = self.get_raw(&commands::GET_LED_MODE).await?;
        let brightness = self.get_raw(get_brightness).await?;

        self.device.led_cache().update(self.led_type, |values| {
            if let Some(v) = state.as_ref().filter(|v| v.len() >= 3) {
                values.state = v[2] != 0;
            }
            if let Some(v) = color.as_ref().filter(|v| v.len() >= 5) {
                values.color = Rgba::from_rgb8(v[2], v[3], v[4]);
            }
            if let Some(v) = mode.as_ref().filter(|v| v.len() >= 3) {
                if let Some(m) = LedMode::from_u8(v[2]) {
                    values.mode = m;
                }
            }
            if let Some(v) = brightness.as_ref().filter(|v| v.len() >= 3) {
                values.brightness = unscale_brightness(v[2]);
            }
            values.dirty = false;
        });

        Ok(())
    }

    async fn cached(&self) -> LedValues {
        let entry = self.device.led_cache().entry(self.led_type);
        if entry.dirty {
            if let Err(err) = self.refresh().await {
                debug!("LED refresh failed for {:?}: {err}", self.led_type);
            }
            return self.device.led_cache().entry(self.led_type);
        }
        entry
    }

    pub async fn state(&self) -> bool {
        self.cached().await.state
    }

    pub async fn color(&self) -> Rgba {
        self.cached().await.color
    }

    pub async fn brightness(&self) -> f64 {
        self.cached().await.brightness
    }

    pub async fn mode(&self) -> LedMode {
        self.cached().await.mode
    }

    pub async fn set_state(&self, state: bool) -> Result<(), DeviceError> {
        self.write_state(state, false).await
    }

    async fn write_state(&self, state: bool, restoring: bool) -> Result<(), DeviceError> {
        self.set_raw(&commands::SET_LED_STATE, &[state as u8]).await?;
        self.device.led_cache().update(self.led_type, |v| {
            v.state = state;
            v.dirty = true;
        });
        self.changed(restoring).await;
        Ok(())
    }

    pub async fn set_color(&self, color: Rgba) -> Result<(), DeviceError> {
        self.write_color(color, false).await
    }

    async fn write_color(&self, color: Rgba, restoring: bool) -> Result<(), DeviceError> {
        let (r, g, b) = color.to_rgb8();
        self.set_raw(&commands::SET_LED_COLOR, &[r, g, b]).await?;
        self.device.led_cache().update(self.led_type, |v| {
            v.color = color;
            v.dirty = true;
        });
        self.changed(restoring).await;
        Ok(())
    }

    pub async fn set_mode(&self, mode: LedMode) -> Result<(), DeviceError> {
        self.write_mode(mode, false).await
    }

    async fn write_mode(&self, mode: LedMode, restoring: bool) -> Result<(), DeviceError> {
        self.set_raw(&commands::SET_LED_MODE, &[mode.value()]).await?;
        self.device.led_cache().update(self.led_type, |v| {
            v.mode = mode;
            v.dirty = true;
        });
        self.changed(restoring).await;
        Ok(())
    }

    pub async fn set_brightness(&self, level: f64) -> Result<(), DeviceError> {
        self.write_brightness(level, false).await
    }

    /// Brightness write; crossing the zero boundary additionally issues a
    /// state command, ordered immediately after the brightness command.
    async fn write_brightness(&self, level: f64, restoring: bool) -> Result<(), DeviceError> {
        let level = level.clamp(0.0, 100.0);
        let old = self.device.led_cache().entry(self.led_type).brightness;

        let _guard = self.device.device_open();
        let (set_brightness, _) = self.brightness_commands();
        self.set_raw(set_brightness, &[scale_brightness(level)])
            .await?;

        if old == 0.0 && level > 0.0 {
            self.set_raw(&commands::SET_LED_STATE, &[0x01]).await?;
        } else if old > 0.0 && level == 0.0 {
            self.set_raw(&commands::SET_LED_STATE, &[0x00]).await?;
        }

        self.device.led_cache().update(self.led_type, |v| {
            v.brightness = level;
            v.state = level > 0.0;
            v.dirty = true;
        });
        self.changed(restoring).await;
        Ok(())
    }

    async fn changed(&self, restoring: bool) {
        self.device.led_changed.fire(&self.led_type);

        // backlight brightness is handled by the device's own brightness
        // path and never lands in the per-LED preference map
        if restoring || self.led_type == LedType::Backlight {
            return;
        }

        let values = self.get_values().await;
        let key = self.led_type.name().to_string();
        self.device
            .preferences()
            .await
            .update(|p| {
                p.leds.insert(key, values);
            });
    }

    /// Config-tagged values: brightness always, color for RGB zones, mode
    /// for zones with firmware modes.
    pub async fn get_values(&self) -> TraitValues {
        let cached = self.cached().await;
        let mut values = TraitValues::new();
        values.insert("brightness".into(), TraitValue::Float(cached.brightness));
        if self.led_type.is_rgb() {
            values.insert("color".into(), TraitValue::from_color(cached.color));
        }
        if self.led_type.has_modes() {
            values.insert("mode".into(), TraitValue::Str(cached.mode.name().into()));
        }
        values
    }

    /// Restore values without observer side-effects.
    pub async fn set_values(&self, values: &TraitValues) -> Result<(), DeviceError> {
        if let Some(color) = values.get("color").and_then(TraitValue::as_color) {
            self.write_color(color, true).await?;
        }
        if let Some(mode) = values
            .get("mode")
            .and_then(TraitValue::as_str)
            .and_then(LedMode::parse)
        {
            self.write_mode(mode, true).await?;
        }
        if let Some(brightness) = values.get("brightness").and_then(TraitValue::as_f64) {
            self.write_brightness(brightness, true).await?;
        }
        Ok(())
    }
}

/// Re-apply saved LED values on preference restore; the backlight is
/// covered by the device brightness path.
pub async fn restore_prefs(device: &Arc<ChromaDevice>, prefs: &Preferences) {
    for led_type in device.supported_leds().to_vec() {
        if led_type == LedType::Backlight {
            continue;
        }
        let Some(saved) = prefs.leds.get(led_type.name()) else {
            continue;
        };
        if let Some(led) = device.led(led_type) {
            if let Err(err) = led.set_values(saved).await {
                debug!("LED restore failed for {led_type:?}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    /// (class, id, first args) of every SET-class command in send order.
    fn sent_sets(sent: &[Vec<u8>]) -> Vec<(u8, u8, Vec<u8>)> {
        sent.iter()
            .filter(|buf| buf[7] < 0x80)
            .map(|buf| (buf[6], buf[7], buf[8..16].to_vec()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_brightness_crossing_zero_emits_state() {
        let (device, endpoint) = testing::keyboard_device();
        device.prime_serial("TESTSER");
        // start from a clean cache at zero
        device.led_cache().update(LedType::Game, |v| {
            v.brightness = 0.0;
            v.state = false;
            v.dirty = false;
        });

        {
            // replies for the two sets, then the four refresh reads
            let mut ep = endpoint.lock();
            ep.queue_ok(0x03, 0x03, 0xFF, &[0x01, 0x08, 0x7F]);
            ep.queue_ok(0x03, 0x00, 0xFF, &[0x01, 0x08, 0x01]);
            ep.queue_ok(0x03, 0x80, 0xFF, &[0x01, 0x08, 0x01]);
            ep.queue_ok(0x03, 0x81, 0xFF, &[0x01, 0x08, 0x00, 0xFF, 0x00]);
            ep.queue_ok(0x03, 0x82, 0xFF, &[0x01, 0x08, 0x00]);
            ep.queue_ok(0x03, 0x83, 0xFF, &[0x01, 0x08, 0x7F]);
        }

        let led = device.led(LedType::Game).unwrap();
        led.set_brightness(50.0).await.unwrap();

        let sets = sent_sets(&endpoint.lock().sent);
        assert_eq!(sets.len(), 2);
        // SET_LED_BRIGHTNESS with scaled byte
        assert_eq!((sets[0].0, sets[0].1), (0x03, 0x03));
        let byte = sets[0].2[2];
        assert!((0x7F..=0x80).contains(&byte), "scaled byte {byte:#x}");
        // SET_LED_STATE(1) immediately after
        assert_eq!((sets[1].0, sets[1].1), (0x03, 0x00));
        assert_eq!(sets[1].2[2], 0x01);
        assert!(led.brightness().await > 0.0);

        endpoint.lock().sent.clear();

        led.set_brightness(0.0).await.unwrap();
        let sets = sent_sets(&endpoint.lock().sent);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].2[2], 0x00);
        assert_eq!((sets[1].0, sets[1].1), (0x03, 0x00));
        assert_eq!(sets[1].2[2], 0x00);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_state_command_without_crossing() {
        let (device, endpoint) = testing::keyboard_device();
        device.prime_serial("TESTSER");
        device.led_cache().update(LedType::Game, |v| {
            v.brightness = 40.0;
            v.state = true;
            v.dirty = false;
        });

        let led = device.led(LedType::Game).unwrap();
        led.set_brightness(80.0).await.unwrap();

        let sets = sent_sets(&endpoint.lock().sent);
        assert_eq!(sets.len(), 1);
        assert_eq!((sets[0].0, sets[0].1), (0x03, 0x03));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_brightness_command_class() {
        let (device, endpoint) = testing::extended_keyboard_device();
        device.led_cache().update(LedType::Backlight, |v| {
            v.brightness = 10.0;
            v.dirty = false;
        });

        let led = device.led(LedType::Backlight).unwrap();
        led.set_brightness(60.0).await.unwrap();

        let sets = sent_sets(&endpoint.lock().sent);
        assert_eq!((sets[0].0, sets[0].1), (0x0F, 0x04));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_led_is_none() {
        let (device, _) = testing::keyboard_device();
        assert!(device.led(LedType::ScrollWheel).is_none());
        assert!(device.led(LedType::Backlight).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_refresh_on_read() {
        let (device, endpoint) = testing::keyboard_device();
        {
            let mut ep = endpoint.lock();
            ep.queue_ok(0x03, 0x80, 0xFF, &[0x01, 0x05, 0x01]);
            ep.queue_ok(0x03, 0x81, 0xFF, &[0x01, 0x05, 0x00, 0xFF, 0x00]);
            ep.queue_ok(0x03, 0x82, 0xFF, &[0x01, 0x05, 0x00]);
            ep.queue_ok(0x03, 0x83, 0xFF, &[0x01, 0x05, 0xFF]);
        }

        let led = device.led(LedType::Backlight).unwrap();
        assert!(led.state().await);
        assert_eq!(led.color().await.to_rgb8(), (0, 255, 0));
        assert_eq!(led.mode().await, LedMode::Static);
        assert!((led.brightness().await - 100.0).abs() < 0.5);

        // four GETs total: the batch refreshed everything at once
        assert_eq!(endpoint.lock().sent.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_values_respects_led_kind() {
        let (device, _) = testing::keyboard_device();
        device.led_cache().update(LedType::Game, |v| v.dirty = false);
        device
            .led_cache()
            .update(LedType::Backlight, |v| v.dirty = false);

        // game LED is on/off only
        let game = device.led(LedType::Game).unwrap().get_values().await;
        assert!(game.contains_key("brightness"));
        assert!(!game.contains_key("color"));
        assert!(!game.contains_key("mode"));

        let backlight = device.led(LedType::Backlight).unwrap().get_values().await;
        assert!(backlight.contains_key("color"));
        assert!(backlight.contains_key("mode"));
    }
}
