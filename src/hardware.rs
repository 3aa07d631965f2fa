//! Static hardware database.
//!
//! Per-model configuration is bundled as JSON, keyed by device type. Entries
//! are hierarchical: a type-level parent carries shared defaults and each
//! child model inherits any field it leaves unset. Lookup resolves the chain
//! into a flat immutable snapshot, which is what device code sees.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use chroma_transport::protocol::{self, ProtocolConfig};
use chroma_transport::types::{LedType, Quirk};

pub const RAZER_VENDOR_ID: u16 = 0x1532;

const BUNDLED_DB: &str = include_str!("data/hardware.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum DeviceType {
    Keyboard,
    Keypad,
    Laptop,
    Mouse,
    Mousepad,
    Headset,
}

impl DeviceType {
    pub const ALL: &'static [DeviceType] = &[
        DeviceType::Keyboard,
        DeviceType::Keypad,
        DeviceType::Laptop,
        DeviceType::Mouse,
        DeviceType::Mousepad,
        DeviceType::Headset,
    ];

    /// USB interface number carrying the control endpoint for this type.
    pub fn control_interface(self) -> i32 {
        match self {
            DeviceType::Keyboard | DeviceType::Keypad | DeviceType::Laptop => 2,
            DeviceType::Mouse | DeviceType::Mousepad => 1,
            DeviceType::Headset => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Keyboard => "Keyboard",
            DeviceType::Keypad => "Keypad",
            DeviceType::Laptop => "Laptop",
            DeviceType::Mouse => "Mouse",
            DeviceType::Mousepad => "Mousepad",
            DeviceType::Headset => "Headset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keyboard" => Some(DeviceType::Keyboard),
            "keypad" => Some(DeviceType::Keypad),
            "laptop" => Some(DeviceType::Laptop),
            "mouse" => Some(DeviceType::Mouse),
            "mousepad" => Some(DeviceType::Mousepad),
            "headset" => Some(DeviceType::Headset),
            _ => None,
        }
    }
}

/// Feature capabilities for newer model descriptions; these supplement the
/// quirk tags rather than replacing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Wireless,
    Hyperpolling,
    EcFanControl,
    EcFanSpeed,
    EcBoost,
    ProfileLeds,
}

/// Fan RPM limits for a laptop model.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FanLimits {
    #[serde(default = "default_min_manual_rpm")]
    pub min_manual_rpm: u32,
    #[serde(default = "default_max_rpm")]
    pub max_rpm: u32,
    #[serde(default)]
    pub dual_fan: bool,
}

fn default_min_manual_rpm() -> u32 {
    3500
}

fn default_max_rpm() -> u32 {
    5000
}

impl Default for FanLimits {
    fn default() -> Self {
        Self {
            min_manual_rpm: default_min_manual_rpm(),
            max_rpm: default_max_rpm(),
            dual_fan: false,
        }
    }
}

/// Key coordinate fixups applied before frame data is shipped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyFixups {
    #[serde(default)]
    pub insert: Vec<(u8, u8)>,
    #[serde(default)]
    pub delete: Vec<(u8, u8)>,
    #[serde(default)]
    pub copy: Vec<((u8, u8), (u8, u8))>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawEntry {
    name: Option<String>,
    manufacturer: Option<String>,
    product_id: Option<String>,
    vendor_id: Option<String>,
    dimensions: Option<(u8, u8)>,
    supported_fx: Option<Vec<String>>,
    supported_leds: Option<Vec<LedType>>,
    quirks: Option<Vec<Quirk>>,
    capabilities: Option<Vec<Capability>>,
    key_mapping: Option<BTreeMap<String, Vec<(u8, u8)>>>,
    key_fixups: Option<KeyFixups>,
    row_offsets: Option<Vec<u8>>,
    macro_keys: Option<Vec<String>>,
    revision: Option<u8>,
    fan_limits: Option<FanLimits>,
    #[serde(default)]
    devices: Vec<RawEntry>,
}

/// Resolved per-model configuration snapshot.
#[derive(Debug, Clone)]
pub struct HardwareEntry {
    pub name: String,
    pub manufacturer: String,
    pub device_type: DeviceType,
    pub vendor_id: u16,
    pub product_id: u16,
    /// (rows, cols) of the lighting matrix, if any
    pub dimensions: Option<(u8, u8)>,
    pub supported_fx: Vec<String>,
    pub supported_leds: Vec<LedType>,
    pub quirks: Vec<Quirk>,
    pub capabilities: Vec<Capability>,
    pub key_mapping: BTreeMap<String, Vec<(u8, u8)>>,
    pub key_fixups: Option<KeyFixups>,
    pub row_offsets: Option<Vec<u8>>,
    pub macro_keys: Vec<String>,
    pub revision: Option<u8>,
    pub fan_limits: Option<FanLimits>,
}

impl HardwareEntry {
    /// True if the device has an addressable key matrix.
    pub fn has_matrix(&self) -> bool {
        matches!(self.dimensions, Some((rows, cols)) if rows > 1 && cols > 1)
    }

    /// Matrix width in columns (0 without a matrix row).
    pub fn width(&self) -> usize {
        self.dimensions.map(|(_, cols)| cols as usize).unwrap_or(0)
    }

    /// Matrix height in rows.
    pub fn height(&self) -> usize {
        self.dimensions.map(|(rows, _)| rows as usize).unwrap_or(0)
    }

    pub fn has_quirk(&self, quirk: Quirk) -> bool {
        self.quirks.contains(&quirk)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports_fx(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.supported_fx.iter().any(|fx| fx == &lower)
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        protocol::protocol_config_from(&self.quirks)
    }

    pub fn transaction_id(&self) -> u8 {
        protocol::transaction_id(&self.quirks)
    }

    pub fn uses_extended_fx(&self) -> bool {
        protocol::uses_extended_fx(&self.quirks)
    }

    pub fn is_wireless(&self) -> bool {
        self.has_capability(Capability::Wireless) || self.has_quirk(Quirk::Wireless)
    }
}

/// Loaded hardware database with every model flattened.
pub struct HardwareDatabase {
    entries: Vec<HardwareEntry>,
}

fn parse_hex_u16(value: &str) -> Result<u16, String> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16).map_err(|e| format!("bad hex id {value:?}: {e}"))
}

impl HardwareDatabase {
    /// Parse the bundled database. A corrupt database is a startup-fatal
    /// condition for the daemon.
    pub fn load_bundled() -> Result<Self, String> {
        Self::from_json(BUNDLED_DB)
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let raw: BTreeMap<String, RawEntry> =
            serde_json::from_str(json).map_err(|e| format!("hardware database: {e}"))?;

        let mut entries = Vec::new();
        for (type_name, parent) in &raw {
            let device_type = DeviceType::parse(type_name)
                .ok_or_else(|| format!("unknown hardware type {type_name:?}"))?;

            for child in &parent.devices {
                entries.push(Self::resolve(device_type, parent, child)?);
            }
        }

        debug!("Loaded {} hardware entries", entries.len());
        Ok(Self { entries })
    }

    fn resolve(
        device_type: DeviceType,
        parent: &RawEntry,
        child: &RawEntry,
    ) -> Result<HardwareEntry, String> {
        let name = child
            .name
            .clone()
            .or_else(|| parent.name.clone())
            .ok_or("entry without a name")?;

        let product_id = child
            .product_id
            .as_deref()
            .or(parent.product_id.as_deref())
            .ok_or_else(|| format!("{name}: missing product_id"))?;

        let vendor_id = child
            .vendor_id
            .as_deref()
            .or(parent.vendor_id.as_deref())
            .map(parse_hex_u16)
            .transpose()?
            .unwrap_or(RAZER_VENDOR_ID);

        Ok(HardwareEntry {
            manufacturer: child
                .manufacturer
                .clone()
                .or_else(|| parent.manufacturer.clone())
                .unwrap_or_else(|| "Razer".into()),
            device_type,
            vendor_id,
            product_id: parse_hex_u16(product_id)?,
            dimensions: child.dimensions.or(parent.dimensions),
            supported_fx: child
                .supported_fx
                .clone()
                .or_else(|| parent.supported_fx.clone())
                .unwrap_or_default()
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            supported_leds: child
                .supported_leds
                .clone()
                .or_else(|| parent.supported_leds.clone())
                .unwrap_or_default(),
            quirks: child
                .quirks
                .clone()
                .or_else(|| parent.quirks.clone())
                .unwrap_or_default(),
            capabilities: child
                .capabilities
                .clone()
                .or_else(|| parent.capabilities.clone())
                .unwrap_or_default(),
            key_mapping: child
                .key_mapping
                .clone()
                .or_else(|| parent.key_mapping.clone())
                .unwrap_or_default(),
            key_fixups: child.key_fixups.clone().or_else(|| parent.key_fixups.clone()),
            row_offsets: child.row_offsets.clone().or_else(|| parent.row_offsets.clone()),
            macro_keys: child
                .macro_keys
                .clone()
                .or_else(|| parent.macro_keys.clone())
                .unwrap_or_default(),
            revision: child.revision.or(parent.revision),
            fan_limits: child.fan_limits.or(parent.fan_limits),
            name,
        })
    }

    /// Look up a model. Without a type hint, all types are searched.
    pub fn get_device(
        &self,
        product_id: u16,
        device_type: Option<DeviceType>,
    ) -> Option<&HardwareEntry> {
        self.entries.iter().find(|e| {
            e.product_id == product_id
                && device_type.map(|t| t == e.device_type).unwrap_or(true)
        })
    }

    pub fn entries(&self) -> &[HardwareEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_database_loads() {
        let db = HardwareDatabase::load_bundled().unwrap();
        assert!(!db.is_empty());
    }

    #[test]
    fn test_lookup_by_type() {
        let db = HardwareDatabase::load_bundled().unwrap();
        let kb = db.get_device(0x0203, Some(DeviceType::Keyboard)).unwrap();
        assert_eq!(kb.name, "BlackWidow Chroma");
        assert_eq!(kb.vendor_id, RAZER_VENDOR_ID);
        assert!(kb.has_matrix());
        assert_eq!(kb.dimensions, Some((6, 22)));

        assert!(db.get_device(0x0203, Some(DeviceType::Mouse)).is_none());
        assert!(db.get_device(0x0203, None).is_some());
    }

    #[test]
    fn test_unknown_product_id() {
        let db = HardwareDatabase::load_bundled().unwrap();
        assert!(db.get_device(0xBEEF, None).is_none());
    }

    #[test]
    fn test_inheritance_from_type_parent() {
        let json = r#"{
            "keyboard": {
                "manufacturer": "Razer",
                "supported_fx": ["Static", "SPECTRUM"],
                "supported_leds": ["BACKLIGHT"],
                "devices": [
                    {"name": "Alpha", "product_id": "0x0100"},
                    {"name": "Beta", "product_id": "0x0101", "supported_fx": ["wave"]}
                ]
            }
        }"#;
        let db = HardwareDatabase::from_json(json).unwrap();

        let alpha = db.get_device(0x0100, None).unwrap();
        assert_eq!(alpha.manufacturer, "Razer");
        assert!(alpha.supports_fx("static"));
        assert!(alpha.supports_fx("SPECTRUM"));
        assert_eq!(alpha.supported_leds, vec![LedType::Backlight]);

        let beta = db.get_device(0x0101, None).unwrap();
        assert!(beta.supports_fx("wave"));
        assert!(!beta.supports_fx("static"));
    }

    #[test]
    fn test_matrix_invariant() {
        let json = r#"{
            "mousepad": {
                "devices": [
                    {"name": "Strip", "product_id": "0x0C00", "dimensions": [1, 15]}
                ]
            }
        }"#;
        let db = HardwareDatabase::from_json(json).unwrap();
        let strip = db.get_device(0x0C00, None).unwrap();
        // one row is not a matrix
        assert!(!strip.has_matrix());
        assert_eq!(strip.width(), 15);
        assert_eq!(strip.height(), 1);
    }

    #[test]
    fn test_protocol_from_quirks() {
        let db = HardwareDatabase::load_bundled().unwrap();
        let legacy = db.get_device(0x0203, None).unwrap();
        assert_eq!(legacy.transaction_id(), 0xFF);

        let wireless = db.get_device(0x025A, None).unwrap();
        assert_eq!(wireless.transaction_id(), 0x9F);
        assert!(wireless.uses_extended_fx());
    }

    #[test]
    fn test_interface_requirements() {
        assert_eq!(DeviceType::Keyboard.control_interface(), 2);
        assert_eq!(DeviceType::Mouse.control_interface(), 1);
        assert_eq!(DeviceType::Headset.control_interface(), 3);
    }
}
