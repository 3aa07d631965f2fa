//! Thin wrapper over the platform HID endpoint.
//!
//! Everything above this layer works in terms of [`FeatureEndpoint`], so the
//! report codec and the device layer never touch `hidapi` directly and tests
//! can substitute [`testing::MockEndpoint`].

use std::ffi::CString;

use hidapi::HidApi;
use tracing::debug;

use crate::error::TransportError;

/// Enumerated HID endpoint description.
///
/// Interface-number filtering is the caller's job; enumeration returns every
/// endpoint exposed by matching devices.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: CString,
    pub vendor_id: u16,
    pub product_id: u16,
    pub release_number: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub usage_page: u16,
    pub usage: u16,
    pub interface_number: i32,
}

/// Enumerate HID endpoints for a vendor, sorted by path.
pub fn enumerate(vendor_id: u16) -> Result<Vec<DeviceInfo>, TransportError> {
    let api = HidApi::new()?;
    let mut infos: Vec<DeviceInfo> = api
        .device_list()
        .filter(|d| d.vendor_id() == vendor_id)
        .map(|d| DeviceInfo {
            path: d.path().to_owned(),
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            release_number: d.release_number(),
            serial_number: d.serial_number().map(str::to_string),
            manufacturer: d.manufacturer_string().map(str::to_string),
            product: d.product_string().map(str::to_string),
            usage_page: d.usage_page(),
            usage: d.usage(),
            interface_number: d.interface_number(),
        })
        .collect();

    infos.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(infos)
}

/// Seam between the report codec and the hardware.
///
/// Feature-report calls complete in microseconds, so implementations may
/// issue them inline from async context.
pub trait FeatureEndpoint: Send {
    fn send_feature_report(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read a feature report. The returned buffer never includes a leading
    /// report-id byte, regardless of whether the platform prepends one.
    fn get_feature_report(&mut self, report_id: u8, size: usize)
        -> Result<Vec<u8>, TransportError>;

    fn write(&mut self, data: &[u8], report_id: Option<u8>) -> Result<usize, TransportError>;

    fn read(&mut self, size: usize, timeout_ms: i32) -> Result<Vec<u8>, TransportError>;
}

/// Uniform handle over one open HID endpoint.
pub struct HidAdapter {
    device: hidapi::HidDevice,
    blocking: bool,
}

impl HidAdapter {
    pub fn open(info: &DeviceInfo, blocking: bool) -> Result<Self, TransportError> {
        let api = HidApi::new()?;
        let device = api.open_path(&info.path)?;
        device.set_blocking_mode(blocking)?;
        debug!(
            "Opened HID endpoint {:04x}:{:04x} iface {}",
            info.vendor_id, info.product_id, info.interface_number
        );
        Ok(Self { device, blocking })
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError> {
        self.device.set_blocking_mode(!nonblocking)?;
        self.blocking = !nonblocking;
        Ok(())
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }
}

impl FeatureEndpoint for HidAdapter {
    fn send_feature_report(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.device.send_feature_report(data)?;
        Ok(())
    }

    fn get_feature_report(
        &mut self,
        report_id: u8,
        size: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; size + 1];
        buf[0] = report_id;
        let n = self.device.get_feature_report(&mut buf)?;

        // Some backends hand back the report id as the first byte.
        if n == size + 1 && buf[0] == report_id {
            buf.remove(0);
            buf.truncate(size);
        } else {
            buf.truncate(n.min(size));
        }
        Ok(buf)
    }

    fn write(&mut self, data: &[u8], report_id: Option<u8>) -> Result<usize, TransportError> {
        match report_id {
            Some(id) => {
                let mut buf = Vec::with_capacity(data.len() + 1);
                buf.push(id);
                buf.extend_from_slice(data);
                Ok(self.device.write(&buf)?)
            }
            None => Ok(self.device.write(data)?),
        }
    }

    fn read(&mut self, size: usize, timeout_ms: i32) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; size];
        let n = if timeout_ms > 0 {
            self.device.read_timeout(&mut buf, timeout_ms)?
        } else {
            self.device.read(&mut buf)?
        };
        buf.truncate(n);
        Ok(buf)
    }
}

/// Scripted endpoint for exercising the codec and device layers in tests.
#[doc(hidden)]
pub mod testing {
    use std::collections::VecDeque;

    use super::FeatureEndpoint;
    use crate::error::TransportError;

    /// Records outbound reports and replays queued responses.
    ///
    /// With no queued response, a feature-report read synthesizes an OK
    /// reply echoing the last request, which is what well-behaved hardware
    /// does for SET-class commands.
    #[derive(Default)]
    pub struct MockEndpoint {
        pub sent: Vec<Vec<u8>>,
        pub written: Vec<Vec<u8>>,
        pub responses: VecDeque<Vec<u8>>,
        pub read_responses: VecDeque<Vec<u8>>,
        pub fail_sends: bool,
    }

    impl MockEndpoint {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_response(&mut self, data: Vec<u8>) {
            self.responses.push_back(data);
        }

        /// Queue a well-formed 90-byte OK response with the given payload.
        pub fn queue_ok(&mut self, class: u8, id: u8, tid: u8, payload: &[u8]) {
            let mut buf = vec![0u8; 90];
            buf[0] = 0x02;
            buf[1] = tid;
            buf[5] = payload.len() as u8;
            buf[6] = class;
            buf[7] = id;
            buf[8..8 + payload.len()].copy_from_slice(payload);
            self.responses.push_back(buf);
        }
    }

    /// Cloneable handle to a shared mock, so tests keep inspection access
    /// after handing the endpoint to a device.
    #[derive(Clone, Default)]
    pub struct SharedMockEndpoint(pub std::sync::Arc<parking_lot::Mutex<MockEndpoint>>);

    impl SharedMockEndpoint {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn lock(&self) -> parking_lot::MutexGuard<'_, MockEndpoint> {
            self.0.lock()
        }
    }

    impl FeatureEndpoint for SharedMockEndpoint {
        fn send_feature_report(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.0.lock().send_feature_report(data)
        }

        fn get_feature_report(
            &mut self,
            report_id: u8,
            size: usize,
        ) -> Result<Vec<u8>, TransportError> {
            self.0.lock().get_feature_report(report_id, size)
        }

        fn write(&mut self, data: &[u8], report_id: Option<u8>) -> Result<usize, TransportError> {
            self.0.lock().write(data, report_id)
        }

        fn read(&mut self, size: usize, timeout_ms: i32) -> Result<Vec<u8>, TransportError> {
            self.0.lock().read(size, timeout_ms)
        }
    }

    impl FeatureEndpoint for MockEndpoint {
        fn send_feature_report(&mut self, data: &[u8]) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Hid("mock send failure".into()));
            }
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn get_feature_report(
            &mut self,
            _report_id: u8,
            size: usize,
        ) -> Result<Vec<u8>, TransportError> {
            if let Some(resp) = self.responses.pop_front() {
                return Ok(resp);
            }
            let mut buf = self
                .sent
                .last()
                .cloned()
                .unwrap_or_else(|| vec![0u8; size]);
            buf.resize(size, 0);
            buf[0] = 0x02;
            Ok(buf)
        }

        fn write(&mut self, data: &[u8], report_id: Option<u8>) -> Result<usize, TransportError> {
            let mut buf = Vec::new();
            if let Some(id) = report_id {
                buf.push(id);
            }
            buf.extend_from_slice(data);
            let n = buf.len();
            self.written.push(buf);
            Ok(n)
        }

        fn read(&mut self, size: usize, _timeout_ms: i32) -> Result<Vec<u8>, TransportError> {
            Ok(self
                .read_responses
                .pop_front()
                .unwrap_or_else(|| vec![0u8; size]))
        }
    }
}
