//! Shared protocol vocabulary: quirks, LED types, varstore constants.

use serde::{Deserialize, Serialize};

/// Selects persistent device state for LED and effect commands.
/// `NOSTORE` targets the transient (no-save) slot.
pub const VARSTORE: u8 = 0x01;
pub const NOSTORE: u8 = 0x00;

/// Per-model behavioral deviations.
///
/// Consumed by the protocol selector (transaction codes, extended FX)
/// and by brightness/frame routing in the device layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quirk {
    /// Always use transaction code 0x3F
    #[serde(rename = "TRANSACTION_CODE_3F")]
    TransactionCode3f,
    /// Use transaction code 0x1F (modern devices)
    #[serde(rename = "TRANSACTION_CODE_1F")]
    TransactionCode1f,
    /// Use transaction code 0x9F (wireless keyboards)
    #[serde(rename = "TRANSACTION_CODE_9F")]
    TransactionCode9f,
    /// Use transaction code 0x08 (device-specific)
    #[serde(rename = "TRANSACTION_CODE_08")]
    TransactionCode08,
    /// Use "extended" effect commands (class 0x0F)
    ExtendedFxCmds,
    /// Control device brightness with the scroll wheel LED
    ScrollWheelBrightness,
    /// Control device brightness with the logo LED
    LogoLedBrightness,
    /// Device has charge and dock controls
    Wireless,
    /// Device supports polling rates above 1000Hz
    Hyperpolling,
    /// Needs transaction code 0x80 for custom frame data
    #[serde(rename = "CUSTOM_FRAME_80")]
    CustomFrame80,
    /// Device has individual "profile" LEDs
    ProfileLeds,
    /// Device only supports spectrum effect on the backlight LED
    BacklightLedFxOnly,
}

/// Addressable LED zones.
///
/// Not all types are available on all devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedType {
    ScrollWheel,
    Battery,
    Logo,
    Backlight,
    Macro,
    Game,
    ProfileRed,
    ProfileGreen,
    ProfileBlue,
}

impl LedType {
    /// Wire identifier used in LED command arguments.
    pub fn hardware_id(self) -> u8 {
        match self {
            LedType::ScrollWheel => 0x01,
            LedType::Battery => 0x03,
            LedType::Logo => 0x04,
            LedType::Backlight => 0x05,
            LedType::Macro => 0x07,
            LedType::Game => 0x08,
            LedType::ProfileRed => 0x0E,
            LedType::ProfileGreen => 0x0C,
            LedType::ProfileBlue => 0x0D,
        }
    }

    /// True if this zone accepts RGB color commands.
    pub fn is_rgb(self) -> bool {
        matches!(
            self,
            LedType::ScrollWheel | LedType::Battery | LedType::Logo | LedType::Backlight
        )
    }

    /// True if this zone has selectable firmware modes (static/blink/...).
    pub fn has_modes(self) -> bool {
        self.is_rgb()
    }

    pub fn name(self) -> &'static str {
        match self {
            LedType::ScrollWheel => "scroll_wheel",
            LedType::Battery => "battery",
            LedType::Logo => "logo",
            LedType::Backlight => "backlight",
            LedType::Macro => "macro",
            LedType::Game => "game",
            LedType::ProfileRed => "profile_red",
            LedType::ProfileGreen => "profile_green",
            LedType::ProfileBlue => "profile_blue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_led_hardware_ids() {
        assert_eq!(LedType::ScrollWheel.hardware_id(), 0x01);
        assert_eq!(LedType::Backlight.hardware_id(), 0x05);
        assert_eq!(LedType::ProfileGreen.hardware_id(), 0x0C);
    }

    #[test]
    fn test_quirk_from_json() {
        let q: Quirk = serde_json::from_str("\"TRANSACTION_CODE_3F\"").unwrap();
        assert_eq!(q, Quirk::TransactionCode3f);
        let q: Quirk = serde_json::from_str("\"EXTENDED_FX_CMDS\"").unwrap();
        assert_eq!(q, Quirk::ExtendedFxCmds);
    }
}
