//! Device discovery, construction, and hot-plug lifecycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_udev::{EventType, MonitorBuilder};
use tracing::{debug, info, warn};

use chroma_transport::hid::{self, DeviceInfo, FeatureEndpoint, HidAdapter};
use chroma_transport::TransportError;

use crate::device::ChromaDevice;
use crate::hardware::{DeviceType, HardwareDatabase, HardwareEntry, RAZER_VENDOR_ID};
use crate::prefs::PreferenceManager;
use crate::util::Signal;

/// Delay before add/remove callbacks fire, giving udev time to settle
/// permissions on fresh device nodes.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

type Enumerator = Box<dyn Fn() -> Result<Vec<DeviceInfo>, TransportError> + Send + Sync>;
type Factory = Box<dyn Fn(&DeviceInfo) -> Result<Box<dyn FeatureEndpoint>, TransportError> + Send + Sync>;

/// Enumerates and owns every managed device.
///
/// Exactly one device object is built per physical USB device; endpoints
/// are matched on the control interface number for the hardware type.
pub struct DeviceManager {
    db: HardwareDatabase,
    prefs: Arc<PreferenceManager>,
    devices: AsyncMutex<BTreeMap<String, Arc<ChromaDevice>>>,
    enumerator: Enumerator,
    endpoint_factory: Factory,
    use_udev: bool,
    monitoring: AtomicBool,
    monitor_tasks: Mutex<Vec<JoinHandle<()>>>,
    pub device_added: Signal<Arc<ChromaDevice>>,
    pub device_removed: Signal<String>,
}

/// The udev monitor socket holds a raw FFI pointer and so isn't `Send` by
/// default. It is only ever constructed in one task and then moved wholesale
/// into the blocking poller task that owns it for the rest of its life.
struct SendSocket(tokio_udev::MonitorSocket);
unsafe impl Send for SendSocket {}

impl DeviceManager {
    /// Build a manager over the real HID and udev stacks. A corrupt
    /// hardware database aborts startup.
    pub fn new() -> Result<Arc<Self>, String> {
        let db = HardwareDatabase::load_bundled()?;
        Ok(Arc::new(Self {
            db,
            prefs: Arc::new(PreferenceManager::new()),
            devices: AsyncMutex::new(BTreeMap::new()),
            enumerator: Box::new(|| hid::enumerate(RAZER_VENDOR_ID)),
            endpoint_factory: Box::new(|info| {
                Ok(Box::new(HidAdapter::open(info, false)?) as Box<dyn FeatureEndpoint>)
            }),
            use_udev: true,
            monitoring: AtomicBool::new(false),
            monitor_tasks: Mutex::new(Vec::new()),
            device_added: Signal::new(),
            device_removed: Signal::new(),
        }))
    }

    /// Manager with injected enumeration and endpoints, no udev.
    #[doc(hidden)]
    pub fn with_backend(enumerator: Enumerator, endpoint_factory: Factory) -> Arc<Self> {
        Arc::new(Self {
            db: HardwareDatabase::load_bundled().expect("bundled database"),
            prefs: Arc::new(PreferenceManager::ephemeral()),
            devices: AsyncMutex::new(BTreeMap::new()),
            enumerator,
            endpoint_factory,
            use_udev: false,
            monitoring: AtomicBool::new(false),
            monitor_tasks: Mutex::new(Vec::new()),
            device_added: Signal::new(),
            device_removed: Signal::new(),
        })
    }

    pub fn database(&self) -> &HardwareDatabase {
        &self.db
    }

    pub async fn devices(&self) -> Vec<Arc<ChromaDevice>> {
        self.devices.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<ChromaDevice>> {
        self.devices.lock().await.get(key).cloned()
    }

    /// Smallest non-negative index not currently in use.
    async fn next_index(&self) -> u32 {
        let devices = self.devices.lock().await;
        let used: Vec<u32> = devices.values().map(|d| d.device_index()).collect();
        (0..).find(|i| !used.contains(i)).unwrap()
    }

    /// Scan for supported devices and build any that are new.
    ///
    /// Idempotent: a second pass over an unchanged bus finds nothing to
    /// add and fires no callbacks. Unknown product ids are skipped
    /// silently.
    pub async fn discover(self: &Arc<Self>) -> usize {
        let mut infos = match (self.enumerator)() {
            Ok(infos) => infos,
            Err(err) => {
                warn!("HID enumeration failed: {err}");
                return 0;
            }
        };
        infos.sort_by(|a, b| a.path.cmp(&b.path));

        let mut added = 0;

        for info in infos {
            let Some(hardware) = self.db.get_device(info.product_id, None) else {
                continue;
            };

            if info.interface_number != hardware.device_type.control_interface() {
                continue;
            }

            let (sys_path, input_paths) = self.locate_parent(&info, hardware);

            let already_known = {
                let devices = self.devices.lock().await;
                devices.values().any(|d| d.sys_path() == sys_path)
            };
            if already_known {
                continue;
            }

            let index = self.next_index().await;
            let device = self.create_device(hardware.clone(), info, index, sys_path, input_paths);

            info!(
                "Discovered {} ({}) as {}",
                device.name(),
                device.device_type().name(),
                device.key()
            );

            self.devices
                .lock()
                .await
                .insert(device.key(), Arc::clone(&device));
            added += 1;

            if self.monitoring.load(Ordering::SeqCst) {
                self.fire_added(device);
            }
        }

        added
    }

    /// Per-type construction. The type decides which subsystems the
    /// device grows (headset transport, laptop EC control, matrix
    /// pipeline, keypad macro input); the hardware entry carries the data.
    fn create_device(
        self: &Arc<Self>,
        hardware: HardwareEntry,
        info: DeviceInfo,
        index: u32,
        sys_path: String,
        input_paths: Vec<PathBuf>,
    ) -> Arc<ChromaDevice> {
        let input_paths = match hardware.device_type {
            // headsets have no input endpoints worth watching
            DeviceType::Headset => Vec::new(),
            _ => input_paths,
        };

        let factory_info = info.clone();
        let manager = Arc::downgrade(self);
        ChromaDevice::build(
            hardware,
            info,
            index,
            sys_path,
            input_paths,
            Arc::clone(&self.prefs),
            Box::new(move || {
                let manager = manager
                    .upgrade()
                    .ok_or_else(|| TransportError::DeviceNotFound("manager is gone".into()))?;
                (manager.endpoint_factory)(&factory_info)
            }),
        )
    }

    fn fire_added(self: &Arc<Self>, device: Arc<ChromaDevice>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DELAY).await;
            device.fire_restore_prefs().await;
            manager.device_added.fire(&device);
        });
    }

    /// Resolve the USB parent sys path and its input event nodes.
    fn locate_parent(&self, info: &DeviceInfo, hardware: &HardwareEntry) -> (String, Vec<PathBuf>) {
        if self.use_udev {
            if let Some(found) = usb_parent(info) {
                return found;
            }
        }
        // stable synthetic path when the device tree is unavailable
        (
            format!(
                "usb/{:04x}:{:04x}/{}",
                info.vendor_id,
                info.product_id,
                hardware.device_type.name()
            ),
            Vec::new(),
        )
    }

    /// Start watching for hot-plug events.
    pub async fn monitor_start(self: &Arc<Self>) -> Result<(), String> {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // announce the initial set
        for device in self.devices().await {
            self.fire_added(device);
        }

        if !self.use_udev {
            return Ok(());
        }

        let socket = MonitorBuilder::new()
            .and_then(|b| b.match_subsystem_devtype("usb", "usb_device"))
            .and_then(|b| b.listen())
            .map_err(|e| format!("udev monitor: {e}"))?;
        // SAFETY: ownership of the handle moves wholesale into the
        // blocking task below and is never touched from another thread.
        let socket = SendSocket(socket);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(EventType, String)>();

        // blocking poller: a timed poll keeps the monitoring flag honored
        let weak = Arc::downgrade(self);
        let poller = tokio::task::spawn_blocking(move || {
            use std::os::unix::io::AsRawFd;
            // force capture of the whole `SendSocket` wrapper rather than
            // letting 2021-edition disjoint closure capture reach directly
            // into the non-`Send` field
            let socket: SendSocket = socket;
            let socket = socket.0;
            let fd = socket.as_raw_fd();

            loop {
                let still_running = weak
                    .upgrade()
                    .map(|m| m.monitoring.load(Ordering::SeqCst))
                    .unwrap_or(false);
                if !still_running {
                    break;
                }

                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                let ready = unsafe { libc::poll(&mut pfd, 1, 1000) };
                if ready <= 0 {
                    continue;
                }

                if let Some(event) = socket.iter().next() {
                    let sys_path = event.syspath().to_string_lossy().to_string();
                    if event_tx.send((event.event_type(), sys_path)).is_err() {
                        break;
                    }
                }
            }
        });

        let weak = Arc::downgrade(self);
        let dispatcher = tokio::spawn(async move {
            while let Some((event_type, sys_path)) = event_rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.handle_udev_event(event_type, sys_path).await;
            }
        });

        let mut tasks = self.monitor_tasks.lock();
        tasks.push(poller);
        tasks.push(dispatcher);

        debug!("Udev monitor started");
        Ok(())
    }

    async fn handle_udev_event(self: &Arc<Self>, event_type: EventType, sys_path: String) {
        debug!("Device event [{event_type:?}]: {sys_path}");

        match event_type {
            EventType::Remove => {
                let removed = {
                    let mut devices = self.devices.lock().await;
                    let key = devices
                        .iter()
                        .find(|(_, d)| d.sys_path() == sys_path)
                        .map(|(k, _)| k.clone());
                    key.and_then(|k| devices.remove(&k).map(|d| (k, d)))
                };

                if let Some((key, device)) = removed {
                    info!("Device removed: {key}");
                    device.shutdown().await;

                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(SETTLE_DELAY).await;
                        manager.device_removed.fire(&key);
                    });
                }
            }
            _ => {
                let known = {
                    let devices = self.devices.lock().await;
                    devices.values().any(|d| d.sys_path() == sys_path)
                };
                if !known {
                    self.discover().await;
                }
            }
        }
    }

    pub async fn monitor_stop(&self) {
        if !self.monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.monitor_tasks.lock().drain(..) {
            task.abort();
        }
        debug!("Udev monitor stopped");
    }

    /// Shut down every device and clear the registry.
    pub async fn close_devices(&self) {
        self.monitor_stop().await;

        let devices: Vec<_> = {
            let mut map = self.devices.lock().await;
            let values = map.values().cloned().collect();
            map.clear();
            values
        };
        for device in devices {
            device.shutdown().await;
        }
    }
}

/// Find the USB parent for an endpoint by scanning the sysfs device
/// tree, and collect the parent's input event nodes.
fn usb_parent(info: &DeviceInfo) -> Option<(String, Vec<PathBuf>)> {
    let vendor = format!("{:04x}", info.vendor_id);
    let product = format!("{:04x}", info.product_id);

    for entry in std::fs::read_dir("/sys/bus/usb/devices").ok()?.flatten() {
        let path = entry.path();
        let matches = |file: &str, expect: &str| {
            std::fs::read_to_string(path.join(file))
                .map(|v| v.trim().eq_ignore_ascii_case(expect))
                .unwrap_or(false)
        };
        if matches("idVendor", &vendor) && matches("idProduct", &product) {
            let inputs = collect_input_nodes(&path);
            return Some((path.to_string_lossy().to_string(), inputs));
        }
    }
    None
}

/// Walk a USB device's sysfs subtree for input eventN entries and map
/// them to their /dev/input nodes.
fn collect_input_nodes(parent: &Path) -> Vec<PathBuf> {
    let mut nodes = Vec::new();
    walk_for_events(parent, 0, &mut nodes);
    nodes.sort();
    nodes
}

fn walk_for_events(dir: &Path, depth: u32, nodes: &mut Vec<PathBuf>) {
    if depth > 5 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("event") {
            nodes.push(PathBuf::from("/dev/input").join(name.as_ref()));
        } else if !name.starts_with('.') {
            walk_for_events(&entry.path(), depth + 1, nodes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use chroma_transport::hid::testing::SharedMockEndpoint;

    fn mock_manager(present: Vec<(u16, i32)>) -> Arc<DeviceManager> {
        let endpoint = SharedMockEndpoint::new();
        DeviceManager::with_backend(
            Box::new(move || {
                Ok(present
                    .iter()
                    .map(|(pid, iface)| testing::fake_devinfo(RAZER_VENDOR_ID, *pid, *iface))
                    .collect())
            }),
            Box::new(move |_| Ok(Box::new(endpoint.clone()) as Box<dyn FeatureEndpoint>)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_builds_known_devices() {
        let manager = mock_manager(vec![(0x0203, 2), (0x0045, 1)]);
        assert_eq!(manager.discover().await, 2);

        let devices = manager.devices().await;
        assert_eq!(devices.len(), 2);
        let names: Vec<_> = devices.iter().map(|d| d.name().to_string()).collect();
        assert!(names.contains(&"BlackWidow Chroma".to_string()));
        assert!(names.contains(&"Mamba Wireless".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_filter() {
        // keyboard endpoint on the wrong interface is ignored
        let manager = mock_manager(vec![(0x0203, 0), (0x0203, 1)]);
        assert_eq!(manager.discover().await, 0);

        let manager = mock_manager(vec![(0x0203, 2)]);
        assert_eq!(manager.discover().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_product_ignored() {
        let manager = mock_manager(vec![(0xBEEF, 2)]);
        assert_eq!(manager.discover().await, 0);
        assert!(manager.devices().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_is_idempotent() {
        let manager = mock_manager(vec![(0x0203, 2)]);
        assert_eq!(manager.discover().await, 1);
        let keys: Vec<String> = manager
            .devices()
            .await
            .iter()
            .map(|d| d.key())
            .collect();

        assert_eq!(manager.discover().await, 0);
        let keys_after: Vec<String> = manager
            .devices()
            .await
            .iter()
            .map(|d| d.key())
            .collect();
        assert_eq!(keys, keys_after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_indexes_are_smallest_free() {
        let manager = mock_manager(vec![(0x0203, 2), (0x0226, 2)]);
        manager.discover().await;

        let mut indexes: Vec<u32> = manager
            .devices()
            .await
            .iter()
            .map(|d| d.device_index())
            .collect();
        indexes.sort();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_devices_clears_registry() {
        let manager = mock_manager(vec![(0x0203, 2)]);
        manager.discover().await;
        manager.close_devices().await;
        assert!(manager.devices().await.is_empty());
    }
}
