//! Mock-backed device fixtures shared by unit and integration tests.

#![allow(dead_code)]

use std::ffi::CString;
use std::sync::Arc;

use chroma_transport::hid::testing::SharedMockEndpoint;
use chroma_transport::hid::{DeviceInfo, FeatureEndpoint};

use crate::device::ChromaDevice;
use crate::hardware::{DeviceType, HardwareDatabase, HardwareEntry};
use crate::prefs::PreferenceManager;

pub fn fake_devinfo(vendor_id: u16, product_id: u16, interface: i32) -> DeviceInfo {
    DeviceInfo {
        path: CString::new(format!("/mock/{vendor_id:04x}:{product_id:04x}")).unwrap(),
        vendor_id,
        product_id,
        release_number: 0x0100,
        serial_number: None,
        manufacturer: Some("Razer".into()),
        product: None,
        usage_page: 0x0001,
        usage: 0x0006,
        interface_number: interface,
    }
}

pub fn entry_for(product_id: u16, device_type: DeviceType) -> HardwareEntry {
    HardwareDatabase::load_bundled()
        .expect("bundled database")
        .get_device(product_id, Some(device_type))
        .expect("device in bundled database")
        .clone()
}

/// Device wired to a scripted mock endpoint.
pub fn device_with_entry(entry: HardwareEntry) -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    let endpoint = SharedMockEndpoint::new();
    let handle = endpoint.clone();
    let interface = entry.device_type.control_interface();
    let devinfo = fake_devinfo(entry.vendor_id, entry.product_id, interface);
    let sys_path = format!("/sys/mock/{:04x}", entry.product_id);

    let device = ChromaDevice::build(
        entry,
        devinfo,
        0,
        sys_path,
        Vec::new(),
        Arc::new(PreferenceManager::ephemeral()),
        Box::new(move || Ok(Box::new(handle.clone()) as Box<dyn FeatureEndpoint>)),
    );
    (device, endpoint)
}

pub fn device_for(
    product_id: u16,
    device_type: DeviceType,
) -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_with_entry(entry_for(product_id, device_type))
}

/// BlackWidow Chroma: legacy protocol, 6x22 matrix.
pub fn keyboard_device() -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_for(0x0203, DeviceType::Keyboard)
}

/// Huntsman Elite: 0x3F transaction code, extended FX commands.
pub fn extended_keyboard_device() -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_for(0x0226, DeviceType::Keyboard)
}

/// Blade 15 Advanced 2020: EC fan control, dual fan.
pub fn laptop_device() -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_for(0x0253, DeviceType::Laptop)
}

/// Blade Pro 2017: 25-wide matrix (split rows) with key fixups.
pub fn wide_laptop_device() -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_for(0x0225, DeviceType::Laptop)
}

/// Firefly: single-row 1x15 strip.
pub fn firefly_device() -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_for(0x0C00, DeviceType::Mousepad)
}

/// Mamba Wireless: wireless quirk plus scroll-wheel brightness.
pub fn wireless_mouse_device() -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_for(0x0045, DeviceType::Mouse)
}

/// Viper 8KHz: hyperpolling capability.
pub fn hyperpolling_mouse_device() -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    device_for(0x0091, DeviceType::Mouse)
}

/// Kraken headset, revision selectable (1 = Rainie, 2 = Kylie).
pub fn headset_device(revision: u8) -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    let product_id = match revision {
        1 => 0x0501,
        _ => 0x0510,
    };
    device_for(product_id, DeviceType::Headset)
}

/// A synthetic matrix device with explicit dimensions, for geometry tests.
pub fn matrix_device(rows: u8, cols: u8) -> (Arc<ChromaDevice>, SharedMockEndpoint) {
    let mut entry = entry_for(0x0203, DeviceType::Keyboard);
    entry.dimensions = Some((rows, cols));
    entry.key_fixups = None;
    entry.row_offsets = None;
    device_with_entry(entry)
}
