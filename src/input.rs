//! Key event capture from the device's input nodes.
//!
//! A blocking reader per evdev node parses raw `input_event` structs and
//! fans key events out to registered callbacks on the runtime. Readers
//! only run while at least one callback is attached.

use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::device::ChromaDevice;

pub const KEY_STATE_UP: u8 = 0;
pub const KEY_STATE_DOWN: u8 = 1;
pub const KEY_STATE_HOLD: u8 = 2;

const EV_KEY: u16 = 0x01;
const EVIOCGRAB: libc::c_ulong = 0x4004_4590;

/// One decoded key transition.
#[derive(Debug, Clone)]
pub struct KeyEvent {
    /// Seconds since the epoch, from the kernel event timestamp.
    pub timestamp: f64,
    pub keycode: String,
    pub scancode: u16,
    /// 0 = up, 1 = down, 2 = hold
    pub keystate: u8,
}

type Callback = Arc<dyn Fn(&KeyEvent) + Send + Sync>;

/// Fans out key events from the device's input nodes.
pub struct InputManager {
    device: Weak<ChromaDevice>,
    paths: Vec<PathBuf>,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    readers: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    grabbed: AtomicBool,
}

impl InputManager {
    pub fn new(device: Weak<ChromaDevice>, paths: Vec<PathBuf>) -> Self {
        Self {
            device,
            paths,
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            readers: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            grabbed: AtomicBool::new(false),
        }
    }

    pub fn input_devices(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Register a callback; readers start with the first one.
    pub fn add_callback(
        self: &Arc<Self>,
        callback: impl Fn(&KeyEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let start = {
            let mut callbacks = self.callbacks.lock();
            callbacks.push((id, Arc::new(callback)));
            callbacks.len() == 1
        };
        if start {
            self.start_readers();
        }
        id
    }

    /// Remove a callback; readers stop with the last one.
    pub fn remove_callback(&self, id: u64) {
        let stop = {
            let mut callbacks = self.callbacks.lock();
            callbacks.retain(|(cid, _)| *cid != id);
            callbacks.is_empty()
        };
        if stop {
            self.stop_readers();
        }
    }

    /// Dispatch one event to every callback. Public so protocol tests can
    /// inject events without an evdev node.
    pub fn dispatch(&self, event: &KeyEvent) {
        let snapshot: Vec<Callback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    /// Grab (or release) exclusive access to the input nodes, keeping key
    /// events away from the rest of the desktop while a macro device owns
    /// them.
    pub fn grab(&self, grab: bool) {
        if self.grabbed.swap(grab, Ordering::SeqCst) == grab {
            return;
        }
        for path in &self.paths {
            if let Ok(file) = File::open(path) {
                let arg: libc::c_int = grab as libc::c_int;
                let rc = unsafe { libc::ioctl(file.as_raw_fd(), EVIOCGRAB, arg) };
                if rc != 0 {
                    warn!("EVIOCGRAB({grab}) failed on {}", path.display());
                }
            }
        }
    }

    fn start_readers(self: &Arc<Self>) {
        self.stop.store(false, Ordering::SeqCst);
        let mut readers = self.readers.lock();

        for path in self.paths.clone() {
            let manager = Arc::downgrade(self);
            let stop = Arc::clone(&self.stop);
            readers.push(tokio::task::spawn_blocking(move || {
                read_loop(&path, stop, manager);
            }));
        }
        debug!("Input readers started ({})", self.paths.len());
    }

    fn stop_readers(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.readers.lock().clear();
        debug!("Input readers stopped");
    }

    pub async fn shutdown(&self) {
        self.callbacks.lock().clear();
        self.stop_readers();
        if let Some(device) = self.device.upgrade() {
            debug!("Input manager for {} shut down", device.key());
        }
    }
}

/// Blocking poll/read loop over one evdev node.
fn read_loop(path: &Path, stop: Arc<AtomicBool>, manager: Weak<InputManager>) {
    let file = match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => file,
        Err(err) => {
            warn!("Could not open input node {}: {err}", path.display());
            return;
        }
    };
    let fd = file.as_raw_fd();

    const EVENT_SIZE: usize = std::mem::size_of::<libc::input_event>();
    let mut buf = [0u8; EVENT_SIZE * 16];

    while !stop.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 200) };
        if ready <= 0 {
            continue;
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n == 0 {
            // EOF: the node went away
            break;
        }
        if n < 0 {
            continue;
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };

        for chunk in buf[..n as usize].chunks_exact(EVENT_SIZE) {
            let event: libc::input_event =
                unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const _) };
            if event.type_ != EV_KEY {
                continue;
            }

            let timestamp = event.time.tv_sec as f64 + event.time.tv_usec as f64 / 1e6;
            let timestamp = if timestamp > 0.0 { timestamp } else { now() };

            manager.dispatch(&KeyEvent {
                timestamp,
                keycode: keycode_name(event.code),
                scancode: event.code,
                keystate: event.value as u8,
            });
        }
    }
}

pub(crate) fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Evdev key code to its KEY_* name.
fn keycode_name(code: u16) -> String {
    let name = match code {
        1 => "KEY_ESC",
        2 => "KEY_1",
        3 => "KEY_2",
        4 => "KEY_3",
        5 => "KEY_4",
        6 => "KEY_5",
        7 => "KEY_6",
        8 => "KEY_7",
        9 => "KEY_8",
        10 => "KEY_9",
        11 => "KEY_0",
        12 => "KEY_MINUS",
        13 => "KEY_EQUAL",
        14 => "KEY_BACKSPACE",
        15 => "KEY_TAB",
        16 => "KEY_Q",
        17 => "KEY_W",
        18 => "KEY_E",
        19 => "KEY_R",
        20 => "KEY_T",
        21 => "KEY_Y",
        22 => "KEY_U",
        23 => "KEY_I",
        24 => "KEY_O",
        25 => "KEY_P",
        26 => "KEY_LEFTBRACE",
        27 => "KEY_RIGHTBRACE",
        28 => "KEY_ENTER",
        29 => "KEY_LEFTCTRL",
        30 => "KEY_A",
        31 => "KEY_S",
        32 => "KEY_D",
        33 => "KEY_F",
        34 => "KEY_G",
        35 => "KEY_H",
        36 => "KEY_J",
        37 => "KEY_K",
        38 => "KEY_L",
        39 => "KEY_SEMICOLON",
        40 => "KEY_APOSTROPHE",
        41 => "KEY_GRAVE",
        42 => "KEY_LEFTSHIFT",
        43 => "KEY_BACKSLASH",
        44 => "KEY_Z",
        45 => "KEY_X",
        46 => "KEY_C",
        47 => "KEY_V",
        48 => "KEY_B",
        49 => "KEY_N",
        50 => "KEY_M",
        51 => "KEY_COMMA",
        52 => "KEY_DOT",
        53 => "KEY_SLASH",
        54 => "KEY_RIGHTSHIFT",
        56 => "KEY_LEFTALT",
        57 => "KEY_SPACE",
        58 => "KEY_CAPSLOCK",
        59 => "KEY_F1",
        60 => "KEY_F2",
        61 => "KEY_F3",
        62 => "KEY_F4",
        63 => "KEY_F5",
        64 => "KEY_F6",
        65 => "KEY_F7",
        66 => "KEY_F8",
        67 => "KEY_F9",
        68 => "KEY_F10",
        87 => "KEY_F11",
        88 => "KEY_F12",
        103 => "KEY_UP",
        105 => "KEY_LEFT",
        106 => "KEY_RIGHT",
        108 => "KEY_DOWN",
        _ => return format!("KEY_{code}"),
    };
    name.to_string()
}
