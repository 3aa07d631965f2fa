//! Wireless, polling-rate, and mouse-specific command surfaces.
//!
//! These sit directly on the device as capability-gated methods; the
//! hardware database decides which devices expose them.

use std::sync::Arc;

use tracing::debug;

use chroma_transport::commands;
use chroma_transport::types::Quirk;

use crate::color::Rgba;
use crate::device::{ChromaDevice, DeviceError};
use crate::hardware::Capability;
use crate::util::{clamp, scale_brightness, unscale_brightness};

/// Standard USB polling rates: Hz to command byte.
const POLLING_RATES: &[(u32, u8)] = &[(125, 0x08), (500, 0x02), (1000, 0x01)];

/// HyperPolling dongle rates; a disjoint code table.
const HYPERPOLLING_RATES: &[(u32, u8)] = &[
    (125, 0x40),
    (500, 0x10),
    (1000, 0x08),
    (2000, 0x04),
    (4000, 0x02),
    (8000, 0x01),
];

impl ChromaDevice {
    pub fn supports_hyperpolling(&self) -> bool {
        self.hardware().has_capability(Capability::Hyperpolling)
            || self.has_quirk(Quirk::Hyperpolling)
    }

    // ── battery ────────────────────────────────────────────────────

    /// Battery percentage, or -1.0 when unavailable.
    pub async fn battery_level(&self) -> f64 {
        if !self.is_wireless() {
            return -1.0;
        }

        match self
            .run_with_result(&commands::GET_BATTERY_LEVEL, &[])
            .await
        {
            Ok(Some(result)) if result.len() >= 2 => result[1] as f64 / 255.0 * 100.0,
            _ => -1.0,
        }
    }

    pub async fn is_charging(&self) -> bool {
        if !self.is_wireless() {
            return false;
        }

        match self
            .run_with_result(&commands::GET_CHARGING_STATUS, &[])
            .await
        {
            Ok(Some(result)) if result.len() >= 2 => result[1] == 0x01,
            _ => false,
        }
    }

    // ── idle timeout ───────────────────────────────────────────────

    /// Seconds of inactivity before the device sleeps; 0 if unsupported.
    pub async fn idle_timeout(&self) -> u32 {
        if !self.is_wireless() {
            return 0;
        }

        match self.run_with_result(&commands::GET_IDLE_TIME, &[]).await {
            Ok(Some(result)) if result.len() >= 2 => {
                ((result[0] as u32) << 8) | result[1] as u32
            }
            _ => 0,
        }
    }

    /// Set the idle timeout, clamped to 60-900 seconds.
    pub async fn set_idle_timeout(&self, seconds: u32) -> Result<bool, DeviceError> {
        if !self.is_wireless() {
            return Ok(false);
        }

        let seconds = clamp(seconds, 60, 900) as u16;
        self.run_command(&commands::SET_IDLE_TIME, &seconds.to_be_bytes())
            .await
    }

    // ── low battery threshold ──────────────────────────────────────

    pub async fn low_battery_threshold(&self) -> u8 {
        if !self.is_wireless() {
            return 0;
        }

        match self
            .run_with_result(&commands::GET_LOW_BATTERY_THRESHOLD, &[])
            .await
        {
            Ok(Some(result)) if !result.is_empty() => result[0],
            _ => 0,
        }
    }

    /// Set the low-battery warning threshold, clamped to 5-50 percent.
    pub async fn set_low_battery_threshold(&self, percent: u8) -> Result<bool, DeviceError> {
        if !self.is_wireless() {
            return Ok(false);
        }
        let percent = clamp(percent, 5, 50);
        self.run_command(&commands::SET_LOW_BATTERY_THRESHOLD, &[percent])
            .await
    }

    // ── dock ───────────────────────────────────────────────────────

    pub async fn dock_brightness(&self) -> f64 {
        match self
            .run_with_result(&commands::GET_DOCK_BRIGHTNESS, &[])
            .await
        {
            Ok(Some(result)) if !result.is_empty() => unscale_brightness(result[0]),
            _ => 0.0,
        }
    }

    pub async fn set_dock_brightness(&self, brightness: f64) -> Result<bool, DeviceError> {
        self.run_command(
            &commands::SET_DOCK_BRIGHTNESS,
            &[scale_brightness(brightness)],
        )
        .await
    }

    /// Show a charging animation on the dock. A black (or no) color
    /// disables the effect; anything else enables it and paints the
    /// battery LED.
    pub async fn set_dock_charge_color(
        self: &Arc<Self>,
        color: Option<Rgba>,
    ) -> Result<bool, DeviceError> {
        let enable = matches!(color, Some(c) if c.to_rgb8() != (0, 0, 0));

        self.run_command(&commands::SET_DOCK_CHARGE_EFFECT, &[enable as u8])
            .await?;

        if enable {
            if let (Some(color), Some(led)) =
                (color, self.led(chroma_transport::types::LedType::Battery))
            {
                led.set_color(color).await?;
            }
        }
        Ok(true)
    }

    // ── polling rate ───────────────────────────────────────────────

    pub fn available_polling_rates(&self) -> Vec<u32> {
        let table = if self.supports_hyperpolling() {
            HYPERPOLLING_RATES
        } else {
            POLLING_RATES
        };
        table.iter().map(|(hz, _)| *hz).collect()
    }

    /// Current polling rate in Hz, or 0 when the query failed.
    pub async fn polling_rate(&self) -> u32 {
        let result = match self
            .run_with_result(&commands::GET_POLLING_RATE, &[])
            .await
        {
            Ok(Some(result)) if !result.is_empty() => result[0],
            _ => return 0,
        };

        if self.supports_hyperpolling() {
            if let Some((hz, _)) = HYPERPOLLING_RATES.iter().find(|(_, code)| *code == result) {
                return *hz;
            }
        }
        POLLING_RATES
            .iter()
            .find(|(_, code)| *code == result)
            .map(|(hz, _)| *hz)
            .unwrap_or(0)
    }

    /// Set the polling rate; unsupported rates are a typed error.
    pub async fn set_polling_rate(&self, hz: u32) -> Result<bool, DeviceError> {
        let code = if self.supports_hyperpolling() {
            HYPERPOLLING_RATES
                .iter()
                .find(|(rate, _)| *rate == hz)
                .map(|(_, code)| *code)
        } else {
            POLLING_RATES
                .iter()
                .find(|(rate, _)| *rate == hz)
                .map(|(_, code)| *code)
        };

        let Some(code) = code else {
            return Err(DeviceError::InvalidArgument(format!(
                "Invalid polling rate {hz}; valid rates: {:?}",
                self.available_polling_rates()
            )));
        };

        debug!("Setting polling rate to {hz}Hz (code {code:#04x})");
        self.run_command(&commands::SET_POLLING_RATE, &[code]).await
    }

    // ── DPI ────────────────────────────────────────────────────────

    /// Current (x, y) DPI, or (-1, -1) when unavailable.
    pub async fn dpi_xy(&self) -> (i32, i32) {
        match self.run_with_result(&commands::GET_DPI_XY, &[]).await {
            Ok(Some(result)) if result.len() >= 5 => (
                i32::from(u16::from_be_bytes([result[1], result[2]])),
                i32::from(u16::from_be_bytes([result[3], result[4]])),
            ),
            _ => (-1, -1),
        }
    }

    pub async fn set_dpi_xy(&self, x: u16, y: u16) -> Result<bool, DeviceError> {
        let mut args = vec![0x01];
        args.extend_from_slice(&x.to_be_bytes());
        args.extend_from_slice(&y.to_be_bytes());
        self.run_command(&commands::SET_DPI_XY, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test(start_paused = true)]
    async fn test_battery_level_scaled() {
        let (device, endpoint) = testing::wireless_mouse_device();
        endpoint.lock().queue_ok(0x07, 0x80, 0x3F, &[0x00, 0xFF]);
        assert!((device.battery_level().await - 100.0).abs() < 0.01);

        endpoint.lock().queue_ok(0x07, 0x80, 0x3F, &[0x00, 0x80]);
        let level = device.battery_level().await;
        assert!((level - 50.2).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_on_wired_device() {
        let (device, endpoint) = testing::keyboard_device();
        assert_eq!(device.battery_level().await, -1.0);
        assert!(!device.is_charging().await);
        assert!(endpoint.lock().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_charging_status() {
        let (device, endpoint) = testing::wireless_mouse_device();
        endpoint.lock().queue_ok(0x07, 0x84, 0x3F, &[0x00, 0x01]);
        assert!(device.is_charging().await);

        endpoint.lock().queue_ok(0x07, 0x84, 0x3F, &[0x00, 0x00]);
        assert!(!device.is_charging().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_clamped_and_big_endian() {
        let (device, endpoint) = testing::wireless_mouse_device();

        device.set_idle_timeout(10_000).await.unwrap();
        let sent = endpoint.lock().sent.clone();
        let idle = sent
            .iter()
            .find(|b| b[6] == 0x07 && b[7] == 0x03)
            .unwrap();
        // clamped to 900 = 0x0384, big-endian
        assert_eq!(&idle[8..10], &[0x03, 0x84]);

        endpoint.lock().sent.clear();
        device.set_idle_timeout(10).await.unwrap();
        let sent = endpoint.lock().sent.clone();
        let idle = sent
            .iter()
            .find(|b| b[6] == 0x07 && b[7] == 0x03)
            .unwrap();
        assert_eq!(&idle[8..10], &[0x00, 0x3C]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_rate_tables_disjoint() {
        let (standard, _) = testing::wireless_mouse_device();
        assert_eq!(standard.available_polling_rates(), vec![125, 500, 1000]);

        let (hyper, _) = testing::hyperpolling_mouse_device();
        assert_eq!(
            hyper.available_polling_rates(),
            vec![125, 500, 1000, 2000, 4000, 8000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_polling_rate_codes() {
        let (standard, endpoint) = testing::wireless_mouse_device();
        standard.set_polling_rate(500).await.unwrap();
        let byte = endpoint.lock().sent.last().unwrap()[8];
        assert_eq!(byte, 0x02);

        let (hyper, endpoint) = testing::hyperpolling_mouse_device();
        hyper.set_polling_rate(8000).await.unwrap();
        let byte = endpoint.lock().sent.last().unwrap()[8];
        assert_eq!(byte, 0x01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_rate_is_typed_error() {
        let (standard, endpoint) = testing::wireless_mouse_device();
        let err = standard.set_polling_rate(8000).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
        assert!(endpoint.lock().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dpi_roundtrip() {
        let (device, endpoint) = testing::wireless_mouse_device();
        endpoint
            .lock()
            .queue_ok(0x04, 0x85, 0x3F, &[0x01, 0x1F, 0x40, 0x1F, 0x40]);
        assert_eq!(device.dpi_xy().await, (8000, 8000));

        device.set_dpi_xy(1600, 800).await.unwrap();
        let sent = endpoint.lock().sent.clone();
        let dpi = sent.iter().find(|b| b[6] == 0x04 && b[7] == 0x05).unwrap();
        assert_eq!(&dpi[8..13], &[0x01, 0x06, 0x40, 0x03, 0x20]);
    }
}
