//! Expiring per-device queue of key input events.
//!
//! Input-aware renderers attach a queue, then await `get_events` for the
//! current unexpired batch. Expiration is a lazy prune on enqueue, and a
//! repeat press replaces the previous entry for the same keycode.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::device::ChromaDevice;
use crate::input::{self, InputManager, KeyEvent, KEY_STATE_DOWN, KEY_STATE_HOLD, KEY_STATE_UP};
use crate::util::clamp;

pub const KEY_UP: u8 = 1;
pub const KEY_DOWN: u8 = 2;
pub const KEY_HOLD: u8 = 4;

/// One queued key event with its expiration window.
#[derive(Debug, Clone)]
pub struct KeyInputEvent {
    pub timestamp: f64,
    pub expire_time: f64,
    pub keycode: String,
    pub scancode: u16,
    pub keystate: u8,
    /// Matrix coordinates resolved from the hardware key map at enqueue.
    pub coords: Option<Vec<(u8, u8)>>,
}

impl KeyInputEvent {
    /// Seconds until this event expires.
    pub fn time_remaining(&self) -> f64 {
        (self.expire_time - input::now()).max(0.0)
    }

    /// Remaining fraction of the expiration window, clamped to [0, 1].
    pub fn percent_complete(&self) -> f64 {
        let duration = self.expire_time - self.timestamp;
        if duration <= 0.0 {
            return 0.0;
        }
        clamp(self.time_remaining() / duration, 0.0, 1.0)
    }
}

struct QueueShared {
    events: Mutex<Vec<KeyInputEvent>>,
    wake_tx: mpsc::UnboundedSender<KeyInputEvent>,
    expire_time: Mutex<f64>,
    keystates: Mutex<u8>,
    mapping: std::collections::BTreeMap<String, Vec<(u8, u8)>>,
}

impl QueueShared {
    fn prune(&self) {
        let now = input::now();
        self.events.lock().retain(|e| e.expire_time >= now);
    }

    fn accept(&self, event: &KeyEvent) -> bool {
        let mask = *self.keystates.lock();
        match event.keystate {
            KEY_STATE_UP => mask & KEY_UP != 0,
            KEY_STATE_DOWN => mask & KEY_DOWN != 0,
            KEY_STATE_HOLD => mask & KEY_HOLD != 0,
            _ => false,
        }
    }

    fn enqueue(&self, event: &KeyEvent) {
        self.prune();

        if !self.accept(event) {
            return;
        }

        let expire_time = *self.expire_time.lock();
        let queued = KeyInputEvent {
            timestamp: event.timestamp,
            expire_time: event.timestamp + expire_time,
            keycode: event.keycode.clone(),
            scancode: event.scancode,
            keystate: event.keystate,
            coords: self.mapping.get(&event.keycode).cloned(),
        };

        trace!("Input event: {queued:?}");

        if expire_time > 0.0 {
            let mut events = self.events.lock();
            // a repeat for the same key replaces the previous entry
            events.retain(|e| e.keycode != queued.keycode);
            events.push(queued.clone());
        }

        let _ = self.wake_tx.send(queued);
    }
}

/// Asynchronous input event queue.
///
/// After `attach()`, await `get_events()` for new input. With a nonzero
/// expiration, each wake returns every unexpired event; with zero, one
/// event per wake.
pub struct InputQueue {
    manager: Arc<InputManager>,
    shared: Arc<QueueShared>,
    wake_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<KeyInputEvent>>,
    callback_id: Mutex<Option<u64>>,
}

impl InputQueue {
    /// Build a queue bound to a device's input manager. Returns None when
    /// the device produces no input events.
    pub fn new(device: &Arc<ChromaDevice>, expire_time: f64) -> Option<Self> {
        let manager = device.input_manager()?;
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();

        Some(Self {
            manager,
            shared: Arc::new(QueueShared {
                events: Mutex::new(Vec::new()),
                wake_tx,
                expire_time: Mutex::new(expire_time),
                keystates: Mutex::new(KEY_DOWN),
                mapping: device.hardware().key_mapping.clone(),
            }),
            wake_rx: tokio::sync::Mutex::new(wake_rx),
            callback_id: Mutex::new(None),
        })
    }

    pub fn expire_time(&self) -> f64 {
        *self.shared.expire_time.lock()
    }

    pub fn set_expire_time(&self, seconds: f64) {
        *self.shared.expire_time.lock() = seconds;
    }

    pub fn keystates(&self) -> u8 {
        *self.shared.keystates.lock()
    }

    pub fn set_keystates(&self, mask: u8) {
        *self.shared.keystates.lock() = mask;
    }

    /// Start listening for input events.
    pub fn attach(&self) -> bool {
        let mut slot = self.callback_id.lock();
        if slot.is_some() {
            return true;
        }

        let shared = Arc::clone(&self.shared);
        let id = self
            .manager
            .add_callback(move |event| shared.enqueue(event));
        *slot = Some(id);
        debug!("InputQueue attached");
        true
    }

    /// Stop listening for input events.
    pub fn detach(&self) {
        if let Some(id) = self.callback_id.lock().take() {
            self.manager.remove_callback(id);
            debug!("InputQueue detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.callback_id.lock().is_some()
    }

    /// Yield until input is available, then return the active batch.
    pub async fn get_events(&self) -> Option<Vec<KeyInputEvent>> {
        if !self.is_attached() {
            error!("InputQueue is not attached");
            return None;
        }

        let mut rx = self.wake_rx.lock().await;

        if self.expire_time() <= 0.0 {
            return rx.recv().await.map(|event| vec![event]);
        }

        self.shared.prune();
        loop {
            {
                let events = self.shared.events.lock();
                if !events.is_empty() {
                    return Some(events.clone());
                }
            }
            rx.recv().await?;
            self.shared.prune();
        }
    }

    /// Current batch without waiting.
    pub fn get_events_nowait(&self) -> Vec<KeyInputEvent> {
        self.shared.prune();
        self.shared.events.lock().clone()
    }
}

impl Drop for InputQueue {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::path::PathBuf;

    fn device_with_input() -> Arc<ChromaDevice> {
        let entry = testing::entry_for(0x0203, crate::hardware::DeviceType::Keyboard);
        let endpoint = chroma_transport::hid::testing::SharedMockEndpoint::new();
        let handle = endpoint.clone();
        crate::device::ChromaDevice::build(
            entry.clone(),
            testing::fake_devinfo(entry.vendor_id, entry.product_id, 2),
            0,
            "/sys/mock/input".into(),
            vec![PathBuf::from("/dev/null")],
            Arc::new(crate::prefs::PreferenceManager::ephemeral()),
            Box::new(move || {
                Ok(Box::new(handle.clone()) as Box<dyn chroma_transport::FeatureEndpoint>)
            }),
        )
    }

    fn key_down(keycode: &str, scancode: u16, at: f64) -> KeyEvent {
        KeyEvent {
            timestamp: at,
            keycode: keycode.into(),
            scancode,
            keystate: KEY_STATE_DOWN,
        }
    }

    #[tokio::test]
    async fn test_coords_resolved_from_key_mapping() {
        let device = device_with_input();
        let queue = InputQueue::new(&device, 1.0).unwrap();
        queue.attach();

        device
            .input_manager()
            .unwrap()
            .dispatch(&key_down("KEY_W", 17, input::now()));

        let events = queue.get_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].coords.as_deref(), Some(&[(2, 3)][..]));
        queue.detach();
    }

    #[tokio::test]
    async fn test_expired_events_pruned() {
        let device = device_with_input();
        let queue = InputQueue::new(&device, 0.5).unwrap();
        queue.attach();
        let manager = device.input_manager().unwrap();

        // long expired
        manager.dispatch(&key_down("KEY_A", 30, input::now() - 10.0));
        // fresh
        manager.dispatch(&key_down("KEY_S", 31, input::now()));

        let events = queue.get_events().await.unwrap();
        let now = input::now();
        assert!(events.iter().all(|e| e.expire_time >= now));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].keycode, "KEY_S");
        queue.detach();
    }

    #[tokio::test]
    async fn test_repeat_key_replaces_entry() {
        let device = device_with_input();
        let queue = InputQueue::new(&device, 5.0).unwrap();
        queue.attach();
        let manager = device.input_manager().unwrap();

        manager.dispatch(&key_down("KEY_W", 17, input::now() - 0.1));
        manager.dispatch(&key_down("KEY_W", 17, input::now()));

        let events = queue.get_events().await.unwrap();
        assert_eq!(events.len(), 1);
        queue.detach();
    }

    #[tokio::test]
    async fn test_keystate_mask_filters() {
        let device = device_with_input();
        let queue = InputQueue::new(&device, 1.0).unwrap();
        queue.attach();
        let manager = device.input_manager().unwrap();

        // default mask is KEY_DOWN only
        manager.dispatch(&KeyEvent {
            timestamp: input::now(),
            keycode: "KEY_W".into(),
            scancode: 17,
            keystate: KEY_STATE_UP,
        });
        assert!(queue.get_events_nowait().is_empty());

        queue.set_keystates(KEY_UP | KEY_DOWN);
        manager.dispatch(&KeyEvent {
            timestamp: input::now(),
            keycode: "KEY_W".into(),
            scancode: 17,
            keystate: KEY_STATE_UP,
        });
        assert_eq!(queue.get_events_nowait().len(), 1);
        queue.detach();
    }

    #[tokio::test]
    async fn test_zero_expiry_returns_single_events() {
        let device = device_with_input();
        let queue = InputQueue::new(&device, 0.0).unwrap();
        queue.attach();
        let manager = device.input_manager().unwrap();

        manager.dispatch(&key_down("KEY_A", 30, input::now()));
        manager.dispatch(&key_down("KEY_S", 31, input::now()));

        let first = queue.get_events().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].keycode, "KEY_A");
        let second = queue.get_events().await.unwrap();
        assert_eq!(second[0].keycode, "KEY_S");
        queue.detach();
    }

    #[test]
    fn test_percent_complete_clamped() {
        let now = input::now();
        let event = KeyInputEvent {
            timestamp: now,
            expire_time: now + 2.0,
            keycode: "KEY_W".into(),
            scancode: 17,
            keystate: KEY_STATE_DOWN,
            coords: None,
        };
        let pct = event.percent_complete();
        assert!((0.0..=1.0).contains(&pct));
        assert!(pct > 0.9);

        let expired = KeyInputEvent {
            expire_time: now - 1.0,
            ..event
        };
        assert_eq!(expired.percent_complete(), 0.0);
    }
}
