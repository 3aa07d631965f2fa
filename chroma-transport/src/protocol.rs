//! Protocol version selection.
//!
//! Transaction ids and command families vary across hardware generations;
//! the quirk tags on each model map onto one of a small set of protocol
//! configurations.

use std::time::Duration;

use crate::report::CMD_DELAY;
use crate::types::Quirk;

/// Protocol families, keyed by transaction id and command structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// 0xFF, standard commands (class 0x03)
    Legacy,
    /// 0x3F, extended FX commands (class 0x0F)
    Extended,
    /// 0x1F, latest devices
    Modern,
    /// 0x9F, wireless keyboards
    WirelessKb,
    /// Device-specific 0x08
    Special,
    /// Rainie memory read/write protocol
    HeadsetV1,
    /// Kylie memory read/write protocol
    HeadsetV2,
}

impl ProtocolVersion {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::Legacy => "legacy",
            ProtocolVersion::Extended => "extended",
            ProtocolVersion::Modern => "modern",
            ProtocolVersion::WirelessKb => "wireless_kb",
            ProtocolVersion::Special => "special",
            ProtocolVersion::HeadsetV1 => "headset_v1",
            ProtocolVersion::HeadsetV2 => "headset_v2",
        }
    }
}

/// Wire parameters derived from the protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub version: ProtocolVersion,
    pub transaction_id: u8,
    pub uses_extended_fx: bool,
    pub inter_command_delay: Duration,
}

pub const LEGACY: ProtocolConfig = ProtocolConfig {
    version: ProtocolVersion::Legacy,
    transaction_id: 0xFF,
    uses_extended_fx: false,
    inter_command_delay: CMD_DELAY,
};

pub const EXTENDED: ProtocolConfig = ProtocolConfig {
    version: ProtocolVersion::Extended,
    transaction_id: 0x3F,
    uses_extended_fx: true,
    inter_command_delay: CMD_DELAY,
};

pub const MODERN: ProtocolConfig = ProtocolConfig {
    version: ProtocolVersion::Modern,
    transaction_id: 0x1F,
    uses_extended_fx: true,
    inter_command_delay: CMD_DELAY,
};

pub const WIRELESS_KB: ProtocolConfig = ProtocolConfig {
    version: ProtocolVersion::WirelessKb,
    transaction_id: 0x9F,
    uses_extended_fx: true,
    inter_command_delay: CMD_DELAY,
};

pub const SPECIAL_08: ProtocolConfig = ProtocolConfig {
    version: ProtocolVersion::Special,
    transaction_id: 0x08,
    uses_extended_fx: true,
    inter_command_delay: CMD_DELAY,
};

/// Map quirks to a protocol configuration.
///
/// Precedence on conflicting tags: 9F > 08 > 1F > 3F > default.
pub fn protocol_config_from(quirks: &[Quirk]) -> ProtocolConfig {
    if quirks.contains(&Quirk::TransactionCode9f) {
        WIRELESS_KB
    } else if quirks.contains(&Quirk::TransactionCode08) {
        SPECIAL_08
    } else if quirks.contains(&Quirk::TransactionCode1f) {
        MODERN
    } else if quirks.contains(&Quirk::TransactionCode3f) {
        EXTENDED
    } else {
        LEGACY
    }
}

/// Transaction id for a quirk set.
pub fn transaction_id(quirks: &[Quirk]) -> u8 {
    protocol_config_from(quirks).transaction_id
}

/// True if the device speaks the extended FX family (class 0x0F).
///
/// The plain EXTENDED_FX_CMDS quirk enables this even without a
/// transaction-code override.
pub fn uses_extended_fx(quirks: &[Quirk]) -> bool {
    protocol_config_from(quirks).uses_extended_fx || quirks.contains(&Quirk::ExtendedFxCmds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_legacy() {
        let config = protocol_config_from(&[]);
        assert_eq!(config.version, ProtocolVersion::Legacy);
        assert_eq!(config.transaction_id, 0xFF);
        assert!(!config.uses_extended_fx);
    }

    #[test]
    fn test_single_quirk_selection() {
        assert_eq!(transaction_id(&[Quirk::TransactionCode3f]), 0x3F);
        assert_eq!(transaction_id(&[Quirk::TransactionCode1f]), 0x1F);
        assert_eq!(transaction_id(&[Quirk::TransactionCode9f]), 0x9F);
        assert_eq!(transaction_id(&[Quirk::TransactionCode08]), 0x08);
    }

    #[test]
    fn test_precedence_over_all_combinations() {
        let codes = [
            (Quirk::TransactionCode9f, 0x9Fu8, 0u8),
            (Quirk::TransactionCode08, 0x08, 1),
            (Quirk::TransactionCode1f, 0x1F, 2),
            (Quirk::TransactionCode3f, 0x3F, 3),
        ];

        // every non-empty subset must resolve to its highest-priority member
        for mask in 1u8..16 {
            let subset: Vec<Quirk> = codes
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, (q, _, _))| *q)
                .collect();

            let expected = codes
                .iter()
                .filter(|(q, _, _)| subset.contains(q))
                .min_by_key(|(_, _, prio)| *prio)
                .map(|(_, tid, _)| *tid)
                .unwrap();

            assert_eq!(transaction_id(&subset), expected, "subset {subset:?}");
        }
    }

    #[test]
    fn test_extended_fx_quirk_without_transaction_override() {
        assert!(uses_extended_fx(&[Quirk::ExtendedFxCmds]));
        assert!(!uses_extended_fx(&[]));
        assert!(uses_extended_fx(&[Quirk::TransactionCode3f]));
    }
}
