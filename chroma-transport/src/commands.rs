//! Static catalog of hardware commands.
//!
//! Commands are grouped by class:
//! - 0x00: device info & control
//! - 0x02: key remapping
//! - 0x03: standard LED/effects/frame
//! - 0x04: DPI / mouse settings
//! - 0x05: profile management
//! - 0x07: power & battery
//! - 0x0B: calibration
//! - 0x0D: laptop EC fan/power
//! - 0x0F: extended matrix effects

use crate::protocol::ProtocolVersion;

/// Definition of one hardware command.
///
/// `data_size` is the fixed argument size, or None when variable. An empty
/// protocol list means the command is universal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDef {
    pub command_class: u8,
    pub command_id: u8,
    pub data_size: Option<u8>,
    pub name: &'static str,
    pub protocols: &'static [ProtocolVersion],
}

impl CommandDef {
    const fn new(command_class: u8, command_id: u8, data_size: Option<u8>, name: &'static str) -> Self {
        Self {
            command_class,
            command_id,
            data_size,
            name,
            protocols: &[],
        }
    }

    const fn gated(
        command_class: u8,
        command_id: u8,
        data_size: Option<u8>,
        name: &'static str,
        protocols: &'static [ProtocolVersion],
    ) -> Self {
        Self {
            command_class,
            command_id,
            data_size,
            name,
            protocols,
        }
    }

    /// True if the command exists under the given protocol.
    pub fn supports(&self, protocol: ProtocolVersion) -> bool {
        self.protocols.is_empty() || self.protocols.contains(&protocol)
    }
}

const EXTENDED_FAMILY: &[ProtocolVersion] = &[
    ProtocolVersion::Extended,
    ProtocolVersion::Modern,
    ProtocolVersion::WirelessKb,
];
const MODERN_ONLY: &[ProtocolVersion] = &[ProtocolVersion::Modern];

// Class 0x00 - device info & control
pub const GET_FIRMWARE: CommandDef = CommandDef::new(0x00, 0x81, Some(0x02), "GET_FIRMWARE");
pub const GET_SERIAL: CommandDef = CommandDef::new(0x00, 0x82, Some(0x16), "GET_SERIAL");
pub const SET_DEVICE_MODE: CommandDef = CommandDef::new(0x00, 0x04, Some(0x02), "SET_DEVICE_MODE");
pub const GET_DEVICE_MODE: CommandDef = CommandDef::new(0x00, 0x84, Some(0x02), "GET_DEVICE_MODE");
pub const SET_POLLING_RATE: CommandDef = CommandDef::new(0x00, 0x05, Some(0x01), "SET_POLLING_RATE");
pub const GET_POLLING_RATE: CommandDef = CommandDef::new(0x00, 0x85, Some(0x01), "GET_POLLING_RATE");
pub const SET_POLLING_RATE_V2: CommandDef =
    CommandDef::gated(0x00, 0x40, None, "SET_POLLING_RATE_V2", MODERN_ONLY);
pub const GET_POLLING_RATE_V2: CommandDef =
    CommandDef::gated(0x00, 0xC0, None, "GET_POLLING_RATE_V2", MODERN_ONLY);

// Class 0x02 - key remapping
pub const SET_KEY_REMAP: CommandDef = CommandDef::new(0x02, 0x0D, None, "SET_KEY_REMAP");
pub const SET_KEY_REMAP_ANALOG: CommandDef =
    CommandDef::gated(0x02, 0x12, None, "SET_KEY_REMAP_ANALOG", MODERN_ONLY);

// Class 0x03 - standard LED/effects
pub const SET_LED_STATE: CommandDef = CommandDef::new(0x03, 0x00, Some(0x03), "SET_LED_STATE");
pub const GET_LED_STATE: CommandDef = CommandDef::new(0x03, 0x80, Some(0x03), "GET_LED_STATE");
pub const SET_LED_COLOR: CommandDef = CommandDef::new(0x03, 0x01, Some(0x05), "SET_LED_COLOR");
pub const GET_LED_COLOR: CommandDef = CommandDef::new(0x03, 0x81, Some(0x05), "GET_LED_COLOR");
pub const SET_LED_MODE: CommandDef = CommandDef::new(0x03, 0x02, Some(0x03), "SET_LED_MODE");
pub const GET_LED_MODE: CommandDef = CommandDef::new(0x03, 0x82, Some(0x03), "GET_LED_MODE");
pub const SET_LED_BRIGHTNESS: CommandDef =
    CommandDef::new(0x03, 0x03, Some(0x03), "SET_LED_BRIGHTNESS");
pub const GET_LED_BRIGHTNESS: CommandDef =
    CommandDef::new(0x03, 0x83, Some(0x03), "GET_LED_BRIGHTNESS");
pub const SET_EFFECT: CommandDef =
    CommandDef::gated(0x03, 0x0A, None, "SET_EFFECT", &[ProtocolVersion::Legacy]);
pub const SET_FRAME_DATA_MATRIX: CommandDef =
    CommandDef::new(0x03, 0x0B, None, "SET_FRAME_DATA_MATRIX");
pub const SET_FRAME_DATA_SINGLE: CommandDef =
    CommandDef::new(0x03, 0x0C, None, "SET_FRAME_DATA_SINGLE");
pub const SET_DOCK_CHARGE_EFFECT: CommandDef =
    CommandDef::gated(0x03, 0x10, Some(0x01), "SET_DOCK_CHARGE_EFFECT", EXTENDED_FAMILY);

// Class 0x04 - DPI
pub const SET_DPI_XY: CommandDef = CommandDef::new(0x04, 0x05, Some(0x07), "SET_DPI_XY");
pub const GET_DPI_XY: CommandDef = CommandDef::new(0x04, 0x85, Some(0x07), "GET_DPI_XY");
pub const SET_DPI_STAGES: CommandDef = CommandDef::new(0x04, 0x06, None, "SET_DPI_STAGES");
pub const GET_DPI_STAGES: CommandDef = CommandDef::new(0x04, 0x86, None, "GET_DPI_STAGES");

// Class 0x05 - profiles
pub const SET_PROFILE: CommandDef = CommandDef::new(0x05, 0x02, None, "SET_PROFILE");
pub const GET_PROFILE: CommandDef = CommandDef::new(0x05, 0x03, None, "GET_PROFILE");
pub const WRITE_PROFILE_DATA: CommandDef =
    CommandDef::new(0x05, 0x08, None, "WRITE_PROFILE_DATA");

// Class 0x07 - power & battery
pub const SET_LOW_BATTERY_THRESHOLD: CommandDef =
    CommandDef::gated(0x07, 0x01, Some(0x01), "SET_LOW_BATTERY_THRESHOLD", EXTENDED_FAMILY);
pub const GET_LOW_BATTERY_THRESHOLD: CommandDef =
    CommandDef::gated(0x07, 0x81, Some(0x01), "GET_LOW_BATTERY_THRESHOLD", EXTENDED_FAMILY);
pub const SET_DOCK_BRIGHTNESS: CommandDef =
    CommandDef::gated(0x07, 0x02, Some(0x01), "SET_DOCK_BRIGHTNESS", EXTENDED_FAMILY);
pub const GET_DOCK_BRIGHTNESS: CommandDef =
    CommandDef::gated(0x07, 0x82, Some(0x01), "GET_DOCK_BRIGHTNESS", EXTENDED_FAMILY);
pub const SET_IDLE_TIME: CommandDef =
    CommandDef::gated(0x07, 0x03, Some(0x02), "SET_IDLE_TIME", EXTENDED_FAMILY);
pub const GET_IDLE_TIME: CommandDef =
    CommandDef::gated(0x07, 0x83, Some(0x02), "GET_IDLE_TIME", EXTENDED_FAMILY);
pub const GET_BATTERY_LEVEL: CommandDef =
    CommandDef::gated(0x07, 0x80, Some(0x02), "GET_BATTERY_LEVEL", EXTENDED_FAMILY);
pub const GET_CHARGING_STATUS: CommandDef =
    CommandDef::gated(0x07, 0x84, Some(0x02), "GET_CHARGING_STATUS", EXTENDED_FAMILY);

// Class 0x0B - calibration
pub const SET_CALIBRATION: CommandDef = CommandDef::new(0x0B, 0x03, None, "SET_CALIBRATION");
pub const GET_CALIBRATION: CommandDef = CommandDef::new(0x0B, 0x85, None, "GET_CALIBRATION");
pub const SET_LIFTOFF: CommandDef = CommandDef::new(0x0B, 0x05, None, "SET_LIFTOFF");

// Class 0x0D - laptop EC control
pub const SET_FAN_MODE: CommandDef = CommandDef::new(0x0D, 0x02, Some(0x04), "SET_FAN_MODE");
pub const GET_FAN_MODE: CommandDef = CommandDef::new(0x0D, 0x82, Some(0x04), "GET_FAN_MODE");
pub const GET_FAN_SPEED: CommandDef = CommandDef::new(0x0D, 0x81, Some(0x03), "GET_FAN_SPEED");
pub const SET_BOOST: CommandDef = CommandDef::new(0x0D, 0x0D, None, "SET_BOOST");
pub const GET_BOOST: CommandDef = CommandDef::new(0x0D, 0x8D, None, "GET_BOOST");

// Class 0x0F - extended matrix effects
pub const SET_EFFECT_EXTENDED: CommandDef =
    CommandDef::gated(0x0F, 0x02, None, "SET_EFFECT_EXTENDED", EXTENDED_FAMILY);
pub const GET_EFFECT_EXTENDED: CommandDef =
    CommandDef::gated(0x0F, 0x80, None, "GET_EFFECT_EXTENDED", EXTENDED_FAMILY);
pub const SET_FRAME_EXTENDED: CommandDef =
    CommandDef::gated(0x0F, 0x03, None, "SET_FRAME_EXTENDED", EXTENDED_FAMILY);
pub const SET_BRIGHTNESS_EXTENDED: CommandDef =
    CommandDef::gated(0x0F, 0x04, Some(0x03), "SET_BRIGHTNESS_EXTENDED", EXTENDED_FAMILY);
pub const GET_BRIGHTNESS_EXTENDED: CommandDef =
    CommandDef::gated(0x0F, 0x84, Some(0x03), "GET_BRIGHTNESS_EXTENDED", EXTENDED_FAMILY);

/// Every registered command, for diagnostics and lookup.
pub const ALL: &[&CommandDef] = &[
    &GET_FIRMWARE,
    &GET_SERIAL,
    &SET_DEVICE_MODE,
    &GET_DEVICE_MODE,
    &SET_POLLING_RATE,
    &GET_POLLING_RATE,
    &SET_POLLING_RATE_V2,
    &GET_POLLING_RATE_V2,
    &SET_KEY_REMAP,
    &SET_KEY_REMAP_ANALOG,
    &SET_LED_STATE,
    &GET_LED_STATE,
    &SET_LED_COLOR,
    &GET_LED_COLOR,
    &SET_LED_MODE,
    &GET_LED_MODE,
    &SET_LED_BRIGHTNESS,
    &GET_LED_BRIGHTNESS,
    &SET_EFFECT,
    &SET_FRAME_DATA_MATRIX,
    &SET_FRAME_DATA_SINGLE,
    &SET_DOCK_CHARGE_EFFECT,
    &SET_DPI_XY,
    &GET_DPI_XY,
    &SET_DPI_STAGES,
    &GET_DPI_STAGES,
    &SET_PROFILE,
    &GET_PROFILE,
    &WRITE_PROFILE_DATA,
    &SET_LOW_BATTERY_THRESHOLD,
    &GET_LOW_BATTERY_THRESHOLD,
    &SET_DOCK_BRIGHTNESS,
    &GET_DOCK_BRIGHTNESS,
    &SET_IDLE_TIME,
    &GET_IDLE_TIME,
    &GET_BATTERY_LEVEL,
    &GET_CHARGING_STATUS,
    &SET_CALIBRATION,
    &GET_CALIBRATION,
    &SET_LIFTOFF,
    &SET_FAN_MODE,
    &GET_FAN_MODE,
    &GET_FAN_SPEED,
    &SET_BOOST,
    &GET_BOOST,
    &SET_EFFECT_EXTENDED,
    &GET_EFFECT_EXTENDED,
    &SET_FRAME_EXTENDED,
    &SET_BRIGHTNESS_EXTENDED,
    &GET_BRIGHTNESS_EXTENDED,
];

/// Look up a command by class and id.
pub fn lookup_by_class_id(command_class: u8, command_id: u8) -> Option<&'static CommandDef> {
    ALL.iter()
        .find(|c| c.command_class == command_class && c.command_id == command_id)
        .copied()
}

/// All commands available under a protocol version.
pub fn commands_for(protocol: ProtocolVersion) -> Vec<&'static CommandDef> {
    ALL.iter()
        .filter(|c| c.supports(protocol))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let cmd = lookup_by_class_id(0x00, 0x81).unwrap();
        assert_eq!(cmd.name, "GET_FIRMWARE");
        assert_eq!(cmd.data_size, Some(0x02));
        assert!(lookup_by_class_id(0x0E, 0x01).is_none());
    }

    #[test]
    fn test_universal_commands_support_everything() {
        for protocol in [
            ProtocolVersion::Legacy,
            ProtocolVersion::Extended,
            ProtocolVersion::Modern,
            ProtocolVersion::WirelessKb,
        ] {
            assert!(GET_FIRMWARE.supports(protocol));
            assert!(SET_LED_BRIGHTNESS.supports(protocol));
        }
    }

    #[test]
    fn test_gated_commands() {
        assert!(SET_EFFECT_EXTENDED.supports(ProtocolVersion::Extended));
        assert!(SET_EFFECT_EXTENDED.supports(ProtocolVersion::Modern));
        assert!(SET_EFFECT_EXTENDED.supports(ProtocolVersion::WirelessKb));
        assert!(!SET_EFFECT_EXTENDED.supports(ProtocolVersion::Legacy));

        assert!(SET_EFFECT.supports(ProtocolVersion::Legacy));
        assert!(!SET_EFFECT.supports(ProtocolVersion::Modern));
    }

    #[test]
    fn test_commands_for_legacy_excludes_extended_family() {
        let legacy = commands_for(ProtocolVersion::Legacy);
        assert!(legacy.iter().any(|c| c.name == "SET_EFFECT"));
        assert!(!legacy.iter().any(|c| c.name == "SET_EFFECT_EXTENDED"));
        assert!(!legacy.iter().any(|c| c.name == "GET_BATTERY_LEVEL"));
    }

    #[test]
    fn test_no_duplicate_class_id_pairs() {
        for (i, a) in ALL.iter().enumerate() {
            for b in &ALL[i + 1..] {
                assert!(
                    !(a.command_class == b.command_class && a.command_id == b.command_id),
                    "{} and {} share ({:#04x}, {:#04x})",
                    a.name,
                    b.name,
                    a.command_class,
                    a.command_id
                );
            }
        }
    }
}
