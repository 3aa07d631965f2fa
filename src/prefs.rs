//! Per-device persisted preferences.
//!
//! One TOML record per device serial under the user config directory.
//! Every field mutation fires an observer that snapshots the record and
//! writes it back; bulk restores take the pause guard so a restore does
//! not rewrite the store it is reading from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::traits::TraitValues;
use crate::util::Signal;

/// One saved animation layer: renderer key plus its config traits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerPrefs {
    pub renderer: String,
    #[serde(default)]
    pub traits: TraitValues,
}

/// Saved per-device state.
///
/// Scalar fields stay ahead of the tables so the record serializes as
/// valid TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_args: Option<TraitValues>,
    #[serde(default)]
    pub leds: BTreeMap<String, TraitValues>,
    #[serde(default)]
    pub layers: Vec<LayerPrefs>,
}

/// Handle to one device's preference record.
pub struct DevicePreferences {
    serial: String,
    path: Option<PathBuf>,
    data: Mutex<Preferences>,
    pause_depth: AtomicUsize,
    /// Fired with a snapshot after every unpaused mutation.
    pub changed: Signal<Preferences>,
}

impl DevicePreferences {
    fn new(serial: &str, path: Option<PathBuf>) -> Arc<Self> {
        let data = path
            .as_deref()
            .and_then(Self::read_record)
            .unwrap_or_default();

        let prefs = Arc::new(Self {
            serial: serial.to_string(),
            path,
            data: Mutex::new(data),
            pause_depth: AtomicUsize::new(0),
            changed: Signal::new(),
        });

        // write-through observer
        let weak = Arc::downgrade(&prefs);
        prefs.changed.connect(move |snapshot: &Preferences| {
            if let Some(prefs) = weak.upgrade() {
                prefs.persist(snapshot);
            }
        });

        prefs
    }

    fn read_record(path: &Path) -> Option<Preferences> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(prefs) => Some(prefs),
            Err(err) => {
                warn!("Ignoring unreadable preferences {}: {err}", path.display());
                None
            }
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Snapshot of the current record.
    pub fn get(&self) -> Preferences {
        self.data.lock().clone()
    }

    /// Mutate the record and notify observers (unless paused).
    pub fn update(&self, mutate: impl FnOnce(&mut Preferences)) {
        let snapshot = {
            let mut data = self.data.lock();
            mutate(&mut data);
            data.clone()
        };

        if self.pause_depth.load(Ordering::SeqCst) == 0 {
            self.changed.fire(&snapshot);
        }
    }

    /// Suppress observer notification for the guard's lifetime; the record
    /// is persisted once when the guard drops.
    pub fn observers_paused(self: &Arc<Self>) -> PauseGuard {
        self.pause_depth.fetch_add(1, Ordering::SeqCst);
        PauseGuard {
            prefs: Arc::clone(self),
        }
    }

    fn persist(&self, snapshot: &Preferences) {
        let Some(path) = &self.path else {
            return;
        };

        let serialized = match toml::to_string_pretty(snapshot) {
            Ok(s) => s,
            Err(err) => {
                warn!("Could not serialize preferences for {}: {err}", self.serial);
                return;
            }
        };

        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("Could not create {}: {err}", parent.display());
                return;
            }
        }

        if let Err(err) = std::fs::write(path, serialized) {
            warn!("Could not write {}: {err}", path.display());
        } else {
            debug!("Preferences saved for {}", self.serial);
        }
    }
}

/// Re-enables notifications and flushes the record on drop.
pub struct PauseGuard {
    prefs: Arc<DevicePreferences>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if self.prefs.pause_depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            let snapshot = self.prefs.get();
            self.prefs.persist(&snapshot);
        }
    }
}

/// Factory for per-serial preference records.
pub struct PreferenceManager {
    dir: Option<PathBuf>,
    cache: Mutex<BTreeMap<String, Arc<DevicePreferences>>>,
}

impl PreferenceManager {
    pub fn new() -> Self {
        Self {
            dir: Some(config_dir()),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// In-memory manager without a backing store, for tests.
    pub fn ephemeral() -> Self {
        Self {
            dir: None,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Manager rooted at an explicit directory.
    pub fn with_dir(dir: PathBuf) -> Self {
        Self {
            dir: Some(dir),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, serial: &str) -> Arc<DevicePreferences> {
        let mut cache = self.cache.lock();
        if let Some(prefs) = cache.get(serial) {
            return Arc::clone(prefs);
        }

        let path = self.dir.as_ref().map(|d| d.join(format!("{serial}.toml")));
        let prefs = DevicePreferences::new(serial, path);
        cache.insert(serial.to_string(), Arc::clone(&prefs));
        prefs
    }
}

impl Default for PreferenceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn config_dir() -> PathBuf {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config).join("chroma")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config/chroma")
    } else {
        PathBuf::from("/tmp/chroma")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TraitValue;

    #[test]
    fn test_update_fires_observer() {
        let manager = PreferenceManager::ephemeral();
        let prefs = manager.get("PM1234");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        prefs.changed.connect(move |p: &Preferences| {
            sink.lock().push(p.brightness);
        });

        prefs.update(|p| p.brightness = Some(80.0));
        prefs.update(|p| p.brightness = Some(40.0));
        assert_eq!(&*seen.lock(), &[Some(80.0), Some(40.0)]);
    }

    #[test]
    fn test_pause_guard_suppresses() {
        let manager = PreferenceManager::ephemeral();
        let prefs = manager.get("PM1234");

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        prefs.changed.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        {
            let _guard = prefs.observers_paused();
            prefs.update(|p| p.fx = Some("static".into()));
            prefs.update(|p| p.brightness = Some(10.0));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(prefs.get().fx.as_deref(), Some("static"));

        prefs.update(|p| p.brightness = Some(20.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_serial_shares_record() {
        let manager = PreferenceManager::ephemeral();
        let a = manager.get("X");
        let b = manager.get("X");
        a.update(|p| p.brightness = Some(55.0));
        assert_eq!(b.get().brightness, Some(55.0));
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = std::env::temp_dir().join(format!("chroma-prefs-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        {
            let manager = PreferenceManager::with_dir(dir.clone());
            let prefs = manager.get("SER01");
            prefs.update(|p| {
                p.fx = Some("breathe".into());
                p.fx_args = Some(
                    [("colors".to_string(), TraitValue::List(vec![
                        TraitValue::Str("#ff0000".into()),
                    ]))]
                    .into_iter()
                    .collect(),
                );
                p.layers.push(LayerPrefs {
                    renderer: "fxlib.rainbow".into(),
                    traits: [("speed".to_string(), TraitValue::Float(1.5))]
                        .into_iter()
                        .collect(),
                });
            });
        }

        let manager = PreferenceManager::with_dir(dir.clone());
        let prefs = manager.get("SER01");
        let record = prefs.get();
        assert_eq!(record.fx.as_deref(), Some("breathe"));
        assert_eq!(record.layers.len(), 1);
        assert_eq!(record.layers[0].renderer, "fxlib.rainbow");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
