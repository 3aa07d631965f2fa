//! Headset protocol variant.
//!
//! These devices speak a 33/37-byte memory read/write protocol instead of
//! the 90-byte report: a destination byte, a length, and a big-endian
//! address. Two revisions exist (Rainie and Kylie) with different RAM
//! addresses. The transport differences stay behind the same
//! command/result vocabulary the rest of the device code uses.

use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::color::Rgba;
use crate::device::{ChromaDevice, DeviceError};
use crate::hardware::HardwareEntry;
use crate::traits::{TraitValue, TraitValues};
use crate::util::{scale_brightness, unscale_brightness};

const REPORT_ID_OUT: u8 = 4;
const REPORT_ID_IN: u8 = 5;
const REPORT_LENGTH_OUT: usize = 37;
const REPORT_LENGTH_IN: usize = 33;

/// These devices need a longer gap than the 90-byte family.
const DELAY: Duration = Duration::from_millis(25);
const READ_TIMEOUT_MS: i32 = 500;

// Destination for requests
const READ_RAM: u8 = 0x00;
const READ_EEPROM: u8 = 0x20;
const WRITE_RAM: u8 = 0x40;

// EEPROM
const ADDR_FIRMWARE_VERSION: u16 = 0x0030;
const ADDR_SERIAL_NUMBER: u16 = 0x7F00;

// RAM, Kylie (revision 2)
const ADDR_KYLIE_LED_MODE: u16 = 0x172D;
const ADDR_KYLIE_BREATHING1: u16 = 0x1741;
const ADDR_KYLIE_BREATHING2: u16 = 0x1745;
const ADDR_KYLIE_BREATHING3: u16 = 0x174D;

// RAM, Rainie (revision 1)
const ADDR_RAINIE_LED_MODE: u16 = 0x1008;
const ADDR_RAINIE_BREATHING1: u16 = 0x15DE;

/// One memory-mapped command: destination, payload length, address.
#[derive(Debug, Clone, Copy)]
pub struct HeadsetCommand {
    pub destination: u8,
    pub length: u8,
    pub address: u16,
}

impl HeadsetCommand {
    const fn new(destination: u8, length: u8, address: u16) -> Self {
        Self {
            destination,
            length,
            address,
        }
    }
}

const GET_SERIAL: HeadsetCommand = HeadsetCommand::new(READ_EEPROM, 0x16, ADDR_SERIAL_NUMBER);
const GET_FIRMWARE: HeadsetCommand = HeadsetCommand::new(READ_EEPROM, 0x02, ADDR_FIRMWARE_VERSION);

/// The effect mode is a single bit field in RAM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectBits {
    pub on: bool,
    pub breathe_single: bool,
    pub spectrum: bool,
    pub sync: bool,
    pub breathe_double: bool,
    pub breathe_triple: bool,
}

impl EffectBits {
    pub fn from_u8(value: u8) -> Self {
        Self {
            on: value & 0x01 != 0,
            breathe_single: value & 0x02 != 0,
            spectrum: value & 0x04 != 0,
            sync: value & 0x08 != 0,
            breathe_double: value & 0x10 != 0,
            breathe_triple: value & 0x20 != 0,
        }
    }

    pub fn value(self) -> u8 {
        (self.on as u8)
            | (self.breathe_single as u8) << 1
            | (self.spectrum as u8) << 2
            | (self.sync as u8) << 3
            | (self.breathe_double as u8) << 4
            | (self.breathe_triple as u8) << 5
    }

    /// Number of color slots currently in use.
    pub fn color_count(self) -> usize {
        if self.breathe_triple {
            3
        } else if self.breathe_double {
            2
        } else if self.breathe_single || self.on {
            1
        } else {
            0
        }
    }
}

/// Headset command surface over the raw write/read path.
pub struct HeadsetControl {
    device: Weak<ChromaDevice>,
    get_led: HeadsetCommand,
    set_led: HeadsetCommand,
    get_rgb: Vec<HeadsetCommand>,
    set_rgb: Vec<HeadsetCommand>,
    mode_cache: Mutex<Option<EffectBits>>,
}

impl HeadsetControl {
    pub fn new(device: Weak<ChromaDevice>, hardware: &HardwareEntry) -> Self {
        let revision = hardware.revision.unwrap_or(2);
        if !(1..=2).contains(&revision) {
            warn!("Unknown headset revision {revision}, assuming 2");
        }

        if revision == 1 {
            Self {
                device,
                get_led: HeadsetCommand::new(READ_RAM, 0x01, ADDR_RAINIE_LED_MODE),
                set_led: HeadsetCommand::new(WRITE_RAM, 0x01, ADDR_RAINIE_LED_MODE),
                get_rgb: vec![HeadsetCommand::new(READ_RAM, 0x04, ADDR_RAINIE_BREATHING1)],
                set_rgb: vec![HeadsetCommand::new(WRITE_RAM, 0x04, ADDR_RAINIE_BREATHING1)],
                mode_cache: Mutex::new(None),
            }
        } else {
            Self {
                device,
                get_led: HeadsetCommand::new(READ_RAM, 0x01, ADDR_KYLIE_LED_MODE),
                set_led: HeadsetCommand::new(WRITE_RAM, 0x01, ADDR_KYLIE_LED_MODE),
                get_rgb: vec![
                    HeadsetCommand::new(READ_RAM, 0x04, ADDR_KYLIE_BREATHING1),
                    HeadsetCommand::new(READ_RAM, 0x08, ADDR_KYLIE_BREATHING2),
                    HeadsetCommand::new(READ_RAM, 0x0C, ADDR_KYLIE_BREATHING3),
                ],
                set_rgb: vec![
                    HeadsetCommand::new(WRITE_RAM, 0x04, ADDR_KYLIE_BREATHING1),
                    HeadsetCommand::new(WRITE_RAM, 0x08, ADDR_KYLIE_BREATHING2),
                    HeadsetCommand::new(WRITE_RAM, 0x0C, ADDR_KYLIE_BREATHING3),
                ],
                mode_cache: Mutex::new(None),
            }
        }
    }

    fn pack_request(command: HeadsetCommand, args: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REPORT_LENGTH_OUT);
        buf.push(command.destination);
        buf.push(command.length);
        buf.extend_from_slice(&command.address.to_be_bytes());
        buf.extend_from_slice(args);
        buf.resize(REPORT_LENGTH_OUT, 0);
        buf
    }

    async fn run_command(&self, command: HeadsetCommand, args: &[u8]) -> Result<bool, DeviceError> {
        let Some(device) = self.device.upgrade() else {
            return Ok(false);
        };
        let data = Self::pack_request(command, args);
        device.raw_command(&data, REPORT_ID_OUT, DELAY).await?;
        Ok(true)
    }

    async fn run_with_result(&self, command: HeadsetCommand) -> Option<Vec<u8>> {
        let device = self.device.upgrade()?;
        let data = Self::pack_request(command, &[]);
        let resp = device
            .raw_request(&data, REPORT_ID_OUT, DELAY, REPORT_LENGTH_IN, READ_TIMEOUT_MS)
            .await
            .ok()?;

        if resp.is_empty() {
            return None;
        }
        if resp[0] != REPORT_ID_IN {
            debug!(
                "Inbound report should have id {REPORT_ID_IN:02x} (was {:02x})",
                resp[0]
            );
            return None;
        }

        let end = (1 + command.length as usize).min(resp.len());
        Some(resp[1..end].to_vec())
    }

    pub async fn serial_number(&self) -> Option<String> {
        let raw = self.run_with_result(GET_SERIAL).await?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let serial = std::str::from_utf8(&raw[..end]).ok()?.trim().to_string();
        (!serial.is_empty()).then_some(serial)
    }

    pub async fn firmware_version(&self) -> Option<Vec<u8>> {
        self.run_with_result(GET_FIRMWARE).await
    }

    pub async fn get_led_mode(&self) -> EffectBits {
        if let Some(bits) = *self.mode_cache.lock() {
            return bits;
        }
        let bits = self
            .run_with_result(self.get_led)
            .await
            .and_then(|v| v.first().copied())
            .map(EffectBits::from_u8)
            .unwrap_or_default();
        *self.mode_cache.lock() = Some(bits);
        bits
    }

    pub async fn set_led_mode(&self, bits: EffectBits) -> Result<bool, DeviceError> {
        let ok = self.run_command(self.set_led, &[bits.value()]).await?;
        if ok {
            *self.mode_cache.lock() = Some(bits);
        }
        Ok(ok)
    }

    /// Colors currently programmed into the active slot group.
    pub async fn get_rgb(&self) -> Option<Vec<Rgba>> {
        let bits = self.get_led_mode().await;
        let count = bits.color_count();
        if count == 0 {
            return None;
        }

        let raw = self.run_with_result(self.get_rgb[count - 1]).await?;
        Some(
            raw.chunks_exact(4)
                .map(|quad| Rgba::from_rgb8(quad[0], quad[1], quad[2]).with_alpha(quad[3] as f32 / 255.0))
                .collect(),
        )
    }

    /// Program up to three colors; brightness rides in each slot's alpha
    /// byte.
    pub async fn set_rgb(
        &self,
        colors: &[Rgba],
        brightness: Option<f64>,
    ) -> Result<bool, DeviceError> {
        if colors.is_empty() {
            warn!("RGB group out of range");
            return Ok(false);
        }
        let colors = &colors[..colors.len().min(self.set_rgb.len())];

        let brightness = match brightness {
            Some(level) => level,
            None => {
                let current = self.get_brightness().await;
                if current == 0.0 {
                    80.0
                } else {
                    current
                }
            }
        };
        let level = scale_brightness(brightness);

        let mut args = Vec::with_capacity(colors.len() * 4);
        for color in colors {
            let (r, g, b) = color.to_rgb8();
            args.extend_from_slice(&[r, g, b, level]);
        }

        self.run_command(self.set_rgb[colors.len() - 1], &args).await
    }

    pub async fn get_brightness(&self) -> f64 {
        let bits = self.get_led_mode().await;
        let count = bits.color_count();
        if count == 0 {
            return if bits.on { 100.0 } else { 0.0 };
        }

        match self.run_with_result(self.get_rgb[count - 1]).await {
            Some(raw) if raw.len() >= 4 => unscale_brightness(raw[3]),
            _ => 0.0,
        }
    }

    /// Rewrite the alpha byte of every active color slot.
    pub async fn set_brightness(&self, brightness: f64) -> Result<bool, DeviceError> {
        let bits = self.get_led_mode().await;
        let count = bits.color_count();
        if count == 0 {
            return Ok(false);
        }

        let Some(raw) = self.run_with_result(self.get_rgb[count - 1]).await else {
            return Ok(false);
        };

        let level = scale_brightness(brightness);
        let mut data = raw;
        for slot in 0..count {
            let idx = slot * 4 + 3;
            if idx < data.len() {
                data[idx] = level;
            }
        }

        self.run_command(self.set_rgb[count - 1], &data).await
    }

    /// Firmware effect dispatch for the headset family.
    pub async fn apply_fx(&self, name: &str, args: &TraitValues) -> Result<bool, DeviceError> {
        match name {
            "disable" => {
                let bits = EffectBits {
                    spectrum: true,
                    ..Default::default()
                };
                self.set_led_mode(bits).await
            }
            "spectrum" => {
                let bits = EffectBits {
                    on: true,
                    spectrum: true,
                    ..Default::default()
                };
                self.set_led_mode(bits).await
            }
            "static" => {
                let color = args
                    .get("color")
                    .and_then(TraitValue::as_color)
                    .unwrap_or_else(|| Rgba::from_rgb8(0, 255, 0));
                let bits = EffectBits {
                    on: true,
                    ..Default::default()
                };
                if self.set_rgb(&[color], None).await? {
                    return self.set_led_mode(bits).await;
                }
                Ok(false)
            }
            "breathe" => {
                let colors = args
                    .get("colors")
                    .and_then(TraitValue::as_color_list)
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| {
                        vec![
                            Rgba::from_rgb8(255, 0, 0),
                            Rgba::from_rgb8(0, 255, 0),
                            Rgba::from_rgb8(0, 0, 255),
                        ]
                    });
                let colors = &colors[..colors.len().min(self.set_rgb.len())];

                let mut bits = EffectBits {
                    on: true,
                    sync: true,
                    ..Default::default()
                };
                match colors.len() {
                    3 => bits.breathe_triple = true,
                    2 => bits.breathe_double = true,
                    _ => bits.breathe_single = true,
                }

                if self.set_rgb(colors, None).await? {
                    return self.set_led_mode(bits).await;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn queue_read(
        endpoint: &chroma_transport::hid::testing::SharedMockEndpoint,
        payload: &[u8],
    ) {
        let mut buf = vec![REPORT_ID_IN];
        buf.extend_from_slice(payload);
        buf.resize(REPORT_LENGTH_IN, 0);
        endpoint.lock().read_responses.push_back(buf);
    }

    #[test]
    fn test_effect_bits_roundtrip() {
        for value in 0u8..0x40 {
            assert_eq!(EffectBits::from_u8(value).value(), value);
        }
    }

    #[test]
    fn test_color_count() {
        assert_eq!(EffectBits::from_u8(0x00).color_count(), 0);
        assert_eq!(EffectBits::from_u8(0x01).color_count(), 1);
        assert_eq!(EffectBits::from_u8(0x02).color_count(), 1);
        assert_eq!(EffectBits::from_u8(0x10).color_count(), 2);
        assert_eq!(EffectBits::from_u8(0x20).color_count(), 3);
    }

    #[test]
    fn test_pack_request_layout() {
        let data = HeadsetControl::pack_request(GET_SERIAL, &[]);
        assert_eq!(data.len(), REPORT_LENGTH_OUT);
        assert_eq!(data[0], READ_EEPROM);
        assert_eq!(data[1], 0x16);
        // big-endian address
        assert_eq!(&data[2..4], &[0x7F, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kylie_vs_rainie_addresses() {
        let (kylie, _) = testing::headset_device(2);
        let control = kylie.headset_control().unwrap();
        assert_eq!(control.get_led.address, ADDR_KYLIE_LED_MODE);
        assert_eq!(control.get_rgb.len(), 3);

        let (rainie, _) = testing::headset_device(1);
        let control = rainie.headset_control().unwrap();
        assert_eq!(control.get_led.address, ADDR_RAINIE_LED_MODE);
        assert_eq!(control.get_rgb.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_effect_writes_rgb_then_mode() {
        let (device, endpoint) = testing::headset_device(2);
        let control = device.headset_control().unwrap();

        // led mode query answers "single color on"
        queue_read(&endpoint, &[0x01]);
        // rgb slot read for brightness
        queue_read(&endpoint, &[0x00, 0xFF, 0x00, 0xCC]);

        let mut args = TraitValues::new();
        args.insert("color".into(), TraitValue::Str("#0000ff".into()));
        assert!(control.apply_fx("static", &args).await.unwrap());

        let written = endpoint.lock().written.clone();
        // last two writes: RGB slot then LED mode
        let rgb_write = &written[written.len() - 2];
        assert_eq!(rgb_write[0], REPORT_ID_OUT);
        assert_eq!(rgb_write[1], WRITE_RAM);
        assert_eq!(&rgb_write[3..5], &ADDR_KYLIE_BREATHING1.to_be_bytes());
        assert_eq!(&rgb_write[5..8], &[0x00, 0x00, 0xFF]);

        let mode_write = written.last().unwrap();
        assert_eq!(&mode_write[3..5], &ADDR_KYLIE_LED_MODE.to_be_bytes());
        assert_eq!(mode_write[5], 0x01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_brightness_applies_to_alpha_bytes() {
        let (device, endpoint) = testing::headset_device(2);
        let control = device.headset_control().unwrap();

        // mode: breathe_double (two colors)
        queue_read(&endpoint, &[0x11]);
        // two RGBA slots
        queue_read(&endpoint, &[255, 0, 0, 0x80, 0, 0, 255, 0x80]);

        assert!(control.set_brightness(100.0).await.unwrap());

        let written = endpoint.lock().written.clone();
        let rgb_write = written.last().unwrap();
        // both alpha bytes rewritten to full
        assert_eq!(rgb_write[5 + 3], 0xFF);
        assert_eq!(rgb_write[5 + 7], 0xFF);
    }
}
