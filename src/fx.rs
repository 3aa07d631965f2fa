//! Firmware lighting effects.
//!
//! Effect ids differ between the standard (class 0x03) and extended
//! (class 0x0F) command families; the manager picks the family from the
//! device quirks and maps names across.

use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use chroma_transport::commands;
use chroma_transport::types::{LedType, Quirk, VARSTORE};

use crate::color::{hue_gradient, Rgba};
use crate::device::{ChromaDevice, DeviceError};
use crate::prefs::Preferences;
use crate::traits::{TraitDef, TraitKind, TraitValue, TraitValues};

/// Standard effect ids (class 0x03, command 0x0A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fx {
    Disable,
    Wave,
    Reactive,
    Breathe,
    Spectrum,
    CustomFrame,
    Static,
    Sweep,
    Morph,
    Fire,
    RippleSolid,
    Ripple,
    Starlight,
}

impl Fx {
    pub fn value(self) -> u8 {
        match self {
            Fx::Disable => 0x00,
            Fx::Wave => 0x01,
            Fx::Reactive => 0x02,
            Fx::Breathe => 0x03,
            Fx::Spectrum => 0x04,
            Fx::CustomFrame => 0x05,
            Fx::Static => 0x06,
            Fx::Sweep => 0x0C,
            Fx::Morph => 0x11,
            Fx::Fire => 0x12,
            Fx::RippleSolid => 0x13,
            Fx::Ripple => 0x14,
            Fx::Starlight => 0x19,
        }
    }
}

/// Extended effect ids (class 0x0F, command 0x02).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedFx {
    Disable,
    Static,
    Breathe,
    Spectrum,
    Wave,
    Reactive,
    Starlight,
    CustomFrame,
}

impl ExtendedFx {
    pub fn value(self) -> u8 {
        match self {
            ExtendedFx::Disable => 0x00,
            ExtendedFx::Static => 0x01,
            ExtendedFx::Breathe => 0x02,
            ExtendedFx::Spectrum => 0x03,
            ExtendedFx::Wave => 0x04,
            ExtendedFx::Reactive => 0x05,
            ExtendedFx::Starlight => 0x07,
            ExtendedFx::CustomFrame => 0x08,
        }
    }

    /// Standard-to-extended mapping; effects without a counterpart do not
    /// exist on extended hardware.
    pub fn from_fx(fx: Fx) -> Option<Self> {
        match fx {
            Fx::Disable => Some(ExtendedFx::Disable),
            Fx::Static => Some(ExtendedFx::Static),
            Fx::Breathe => Some(ExtendedFx::Breathe),
            Fx::Spectrum => Some(ExtendedFx::Spectrum),
            Fx::Wave => Some(ExtendedFx::Wave),
            Fx::Reactive => Some(ExtendedFx::Reactive),
            Fx::Starlight => Some(ExtendedFx::Starlight),
            Fx::CustomFrame => Some(ExtendedFx::CustomFrame),
            _ => None,
        }
    }
}

/// Definition of one user-facing effect.
pub struct FxDef {
    pub name: &'static str,
    pub description: &'static str,
    pub hidden: bool,
    pub traits: &'static [TraitDef],
}

const COLOR: TraitDef = TraitDef::new("color", TraitKind::Color);
const BASE_COLOR: TraitDef = TraitDef::new("base_color", TraitKind::Color);
const COLORS: TraitDef = TraitDef::new("colors", TraitKind::ColorList);
const DIRECTION: TraitDef = TraitDef::choice("direction", &["right", "left"]);

/// Catalog of every effect this driver can drive. Per-device availability
/// is the intersection with the hardware's supported set.
pub static FX_CATALOG: &[FxDef] = &[
    FxDef {
        name: "disable",
        description: "Disable all effects",
        hidden: false,
        traits: &[],
    },
    FxDef {
        name: "static",
        description: "Static color",
        hidden: false,
        traits: &[COLOR],
    },
    FxDef {
        name: "wave",
        description: "Waves of color",
        hidden: false,
        traits: &[DIRECTION, TraitDef::new("trackpad_effect", TraitKind::Bool)],
    },
    FxDef {
        name: "spectrum",
        description: "Cycle thru all colors of the spectrum",
        hidden: false,
        traits: &[],
    },
    FxDef {
        name: "reactive",
        description: "Keys light up when pressed",
        hidden: false,
        traits: &[COLOR, TraitDef::ranged("speed", TraitKind::Int, 1.0, 4.0)],
    },
    FxDef {
        name: "breathe",
        description: "Colors pulse in and out",
        hidden: false,
        traits: &[COLORS],
    },
    FxDef {
        name: "starlight",
        description: "Keys sparkle with color",
        hidden: false,
        traits: &[COLORS, TraitDef::ranged("speed", TraitKind::Int, 1.0, 4.0)],
    },
    FxDef {
        name: "sweep",
        description: "Colors sweep across the device",
        hidden: false,
        traits: &[
            COLOR,
            BASE_COLOR,
            DIRECTION,
            TraitDef::ranged("speed", TraitKind::Int, 1.0, 30.0),
        ],
    },
    FxDef {
        name: "morph",
        description: "Morphing colors when keys are pressed",
        hidden: false,
        traits: &[
            COLOR,
            BASE_COLOR,
            TraitDef::ranged("speed", TraitKind::Int, 1.0, 4.0),
        ],
    },
    FxDef {
        name: "fire",
        description: "Keys on fire",
        hidden: false,
        traits: &[COLOR, TraitDef::ranged("speed", TraitKind::Int, 16.0, 128.0)],
    },
    FxDef {
        name: "ripple",
        description: "Ripple effect when keys are pressed",
        hidden: false,
        traits: &[COLOR, TraitDef::ranged("speed", TraitKind::Int, 1.0, 8.0)],
    },
    FxDef {
        name: "ripple_solid",
        description: "Ripple effect on a solid background",
        hidden: false,
        traits: &[COLOR, TraitDef::ranged("speed", TraitKind::Int, 1.0, 8.0)],
    },
    FxDef {
        name: "rainbow",
        description: "Rainbow of hues",
        hidden: false,
        traits: &[
            TraitDef::ranged("stagger", TraitKind::Int, 0.0, 100.0),
            TraitDef::ranged("length", TraitKind::Int, 20.0, 360.0),
        ],
    },
    FxDef {
        name: "custom_frame",
        description: "Display custom frame",
        hidden: true,
        traits: &[],
    },
];

pub fn fx_def(name: &str) -> Option<&'static FxDef> {
    FX_CATALOG.iter().find(|def| def.name == name)
}

struct FxState {
    current: Option<(String, TraitValues)>,
}

/// Applies firmware effects and persists the last one.
pub struct FxManager {
    device: Weak<ChromaDevice>,
    state: Mutex<FxState>,
    apply_lock: AsyncMutex<()>,
}

impl FxManager {
    pub fn new(device: Weak<ChromaDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(FxState { current: None }),
            apply_lock: AsyncMutex::new(()),
        }
    }

    /// Effects available on this device.
    pub fn available_fx(&self) -> Vec<&'static FxDef> {
        let Some(device) = self.device.upgrade() else {
            return Vec::new();
        };
        FX_CATALOG
            .iter()
            .filter(|def| device.hardware().supports_fx(def.name))
            .collect()
    }

    pub fn has_fx(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.available_fx().iter().any(|def| def.name == name)
    }

    /// Name and arguments of the active effect.
    pub fn current_fx(&self) -> Option<(String, TraitValues)> {
        self.state.lock().current.clone()
    }

    /// Activate a named effect.
    ///
    /// Stops a running animation first (except for the internal
    /// custom-frame follow-up) and persists the effect to preferences
    /// unless the name is exempt.
    pub async fn activate(&self, name: &str, args: TraitValues) -> bool {
        let Some(device) = self.device.upgrade() else {
            return false;
        };

        let name = name.to_ascii_lowercase();
        let Some(def) = fx_def(&name) else {
            warn!("Unknown effect requested: {name}");
            return false;
        };
        if !device.hardware().supports_fx(&name) {
            warn!("Effect {name} not supported by {}", device.name());
            return false;
        }

        // reject bad arguments at the boundary, device state unchanged
        for (key, value) in &args {
            let Some(trait_def) = def.traits.iter().find(|t| t.name == key.as_str()) else {
                error!("Effect {name} has no trait {key}");
                return false;
            };
            if let Err(err) = trait_def.validate(value) {
                error!("Effect {name}: {err}");
                return false;
            }
        }

        let _lock = self.apply_lock.lock().await;

        if name != "custom_frame" && name != "disable" && device.is_animating() {
            if let Some(anim) = device.animation_manager() {
                anim.stop().await;
            }
        }

        let applied = match self.apply(&device, &name, &args).await {
            Ok(ok) => ok,
            Err(err) => {
                error!("Effect {name} failed: {err}");
                false
            }
        };

        if applied {
            self.state.lock().current = Some((name.clone(), args.clone()));

            if name != "custom_frame" && name != "disable" {
                info!("Activated effect {name} on {}", device.name());
                device.preferences().await.update(|p| {
                    p.fx = Some(name.clone());
                    p.fx_args = (!args.is_empty()).then(|| args.clone());
                });
            }
        }

        applied
    }

    pub async fn disable(&self) -> bool {
        if self.has_fx("disable") {
            return self.activate("disable", TraitValues::new()).await;
        }
        false
    }

    /// Re-apply the saved effect; called on preference restore when no
    /// animation layers are saved.
    pub async fn restore_prefs(&self, prefs: &Preferences) {
        if let Some(fx) = &prefs.fx {
            let args = prefs.fx_args.clone().unwrap_or_default();
            self.activate(fx, args).await;
        }
    }

    async fn apply(
        &self,
        device: &std::sync::Arc<ChromaDevice>,
        name: &str,
        args: &TraitValues,
    ) -> Result<bool, DeviceError> {
        // headsets speak a different framing behind the same vocabulary
        if let Some(headset) = device.headset_control() {
            return headset.apply_fx(name, args).await;
        }

        let color = |key: &str, fallback: &str| {
            args.get(key)
                .and_then(TraitValue::as_color)
                .unwrap_or_else(|| Rgba::parse(fallback).unwrap())
        };
        let int = |key: &str, fallback: i64| args.get(key).and_then(TraitValue::as_i64).unwrap_or(fallback);
        let colors = args
            .get("colors")
            .and_then(TraitValue::as_color_list)
            .unwrap_or_default();
        let rgb = |c: Rgba| {
            let (r, g, b) = c.to_rgb8();
            [r, g, b]
        };

        match name {
            "disable" => self.set_effect(device, Fx::Disable, &[]).await,
            "static" => {
                self.set_effect(device, Fx::Static, &rgb(color("color", "green")))
                    .await
            }
            "spectrum" => self.set_effect(device, Fx::Spectrum, &[]).await,
            "wave" => {
                let trackpad = args
                    .get("trackpad_effect")
                    .and_then(TraitValue::as_bool)
                    .unwrap_or(false);
                let left = args
                    .get("direction")
                    .and_then(TraitValue::as_str)
                    .map(|d| d.eq_ignore_ascii_case("left"))
                    .unwrap_or(false);
                let direction = match (left, trackpad) {
                    (true, false) => 0x02,
                    (false, false) => 0x01,
                    (true, true) => 0x03,
                    (false, true) => 0x04,
                };
                self.set_effect(device, Fx::Wave, &[direction]).await
            }
            "reactive" => {
                let mut wire = vec![int("speed", 1) as u8];
                wire.extend(rgb(color("color", "skyblue")));
                self.set_effect(device, Fx::Reactive, &wire).await
            }
            "breathe" => {
                let mut wire = vec![colors.len().min(2) as u8];
                for c in colors.iter().take(2) {
                    wire.extend(rgb(*c));
                }
                self.set_effect(device, Fx::Breathe, &wire).await
            }
            "starlight" => {
                let mut wire = vec![colors.len().min(2) as u8, int("speed", 1) as u8];
                for c in colors.iter().take(2) {
                    wire.extend(rgb(*c));
                }
                self.set_effect(device, Fx::Starlight, &wire).await
            }
            "sweep" => {
                let left = args
                    .get("direction")
                    .and_then(TraitValue::as_str)
                    .map(|d| d.eq_ignore_ascii_case("left"))
                    .unwrap_or(false);
                let mut wire = vec![if left { 0x02 } else { 0x01 }, int("speed", 15) as u8];
                wire.extend(rgb(color("base_color", "black")));
                wire.extend(rgb(color("color", "green")));
                self.set_effect(device, Fx::Sweep, &wire).await
            }
            "morph" => {
                let mut wire = vec![0x04, int("speed", 2) as u8];
                wire.extend(rgb(color("color", "magenta")));
                wire.extend(rgb(color("base_color", "darkblue")));
                self.set_effect(device, Fx::Morph, &wire).await
            }
            "fire" => {
                let mut wire = vec![0x01, int("speed", 0x40) as u8];
                wire.extend(rgb(color("color", "red")));
                self.set_effect(device, Fx::Fire, &wire).await
            }
            "ripple" => {
                let mut wire = vec![0x01, (int("speed", 3) * 10) as u8];
                wire.extend(rgb(color("color", "green")));
                self.set_effect(device, Fx::Ripple, &wire).await
            }
            "ripple_solid" => {
                let mut wire = vec![0x01, (int("speed", 3) * 10) as u8];
                wire.extend(rgb(color("color", "green")));
                self.set_effect(device, Fx::RippleSolid, &wire).await
            }
            "custom_frame" => self.set_effect(device, Fx::CustomFrame, &[VARSTORE]).await,
            "rainbow" => self.apply_rainbow(device, args).await,
            other => {
                debug!("Effect {other} has no implementation");
                Ok(false)
            }
        }
    }

    /// Software rainbow: paints a hue gradient through the frame path.
    async fn apply_rainbow(
        &self,
        device: &std::sync::Arc<ChromaDevice>,
        args: &TraitValues,
    ) -> Result<bool, DeviceError> {
        let Some(frame) = device.frame_control() else {
            return Ok(false);
        };

        let stagger = args
            .get("stagger")
            .and_then(TraitValue::as_i64)
            .unwrap_or(4) as usize;
        let length = args
            .get("length")
            .and_then(TraitValue::as_i64)
            .unwrap_or(75) as f32;

        let mut layer = frame.create_layer();
        let gradient = hue_gradient(length, layer.width() + layer.height() * stagger);
        for row in 0..layer.height() {
            for col in 0..layer.width() {
                layer.put(row, col, gradient[row * stagger + col]);
            }
        }

        // activate the uploaded frame directly; going back through
        // `activate` would re-enter the apply lock
        frame.commit(&[&layer], None, false).await?;
        self.set_effect(device, Fx::CustomFrame, &[VARSTORE]).await
    }

    async fn set_effect(
        &self,
        device: &std::sync::Arc<ChromaDevice>,
        fx: Fx,
        args: &[u8],
    ) -> Result<bool, DeviceError> {
        if device.has_quirk(Quirk::ExtendedFxCmds) {
            let Some(extended) = ExtendedFx::from_fx(fx) else {
                return Ok(false);
            };
            let mut wire = vec![
                VARSTORE,
                LedType::Backlight.hardware_id(),
                extended.value(),
            ];
            wire.extend_from_slice(args);
            device
                .run_command_with(&commands::SET_EFFECT_EXTENDED, &wire, Some(0x3F), None, 0)
                .await
        } else {
            let mut wire = vec![fx.value()];
            wire.extend_from_slice(args);
            device.run_command(&commands::SET_EFFECT, &wire).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn sent_effect_commands(sent: &[Vec<u8>]) -> Vec<(u8, u8, Vec<u8>)> {
        sent.iter()
            .filter(|buf| (buf[6] == 0x03 && buf[7] == 0x0A) || (buf[6] == 0x0F && buf[7] == 0x02))
            .map(|buf| (buf[6], buf[7], buf[8..20].to_vec()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_effect_standard() {
        let (device, endpoint) = testing::keyboard_device();
        device.prime_serial("FXTEST");

        let mut args = TraitValues::new();
        args.insert("color".into(), TraitValue::Str("#ff0000".into()));
        assert!(device.fx_manager().activate("static", args).await);

        let cmds = sent_effect_commands(&endpoint.lock().sent);
        assert_eq!(cmds.len(), 1);
        assert_eq!((cmds[0].0, cmds[0].1), (0x03, 0x0A));
        assert_eq!(&cmds[0].2[..4], &[0x06, 0xFF, 0x00, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_effect_extended() {
        let (device, endpoint) = testing::extended_keyboard_device();
        device.prime_serial("FXTEST");

        assert!(
            device
                .fx_manager()
                .activate("static", TraitValues::new())
                .await
        );

        let cmds = sent_effect_commands(&endpoint.lock().sent);
        assert_eq!((cmds[0].0, cmds[0].1), (0x0F, 0x02));
        // varstore, backlight, STATIC=0x01, green
        assert_eq!(&cmds[0].2[..6], &[0x01, 0x05, 0x01, 0x00, 0xFF, 0x00]);
        // extended effects pin transaction id 0x3F
        let raw = &endpoint.lock().sent[0];
        assert_eq!(raw[1], 0x3F);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_effect_rejected() {
        let (device, endpoint) = testing::firefly_device();
        device.prime_serial("FXTEST");

        // firefly does not list reactive
        assert!(
            !device
                .fx_manager()
                .activate("reactive", TraitValues::new())
                .await
        );
        assert!(sent_effect_commands(&endpoint.lock().sent).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_trait_rejected_without_io() {
        let (device, endpoint) = testing::keyboard_device();
        device.prime_serial("FXTEST");

        let mut args = TraitValues::new();
        args.insert("speed".into(), TraitValue::Int(99));
        assert!(!device.fx_manager().activate("reactive", args).await);
        assert!(endpoint.lock().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_rules() {
        let (device, _) = testing::keyboard_device();
        device.prime_serial("FXTEST");
        let prefs = device.preferences().await;

        device
            .fx_manager()
            .activate("spectrum", TraitValues::new())
            .await;
        assert_eq!(prefs.get().fx.as_deref(), Some("spectrum"));

        // exempt names leave the saved effect untouched
        device
            .fx_manager()
            .activate("custom_frame", TraitValues::new())
            .await;
        device.fx_manager().disable().await;
        assert_eq!(prefs.get().fx.as_deref(), Some("spectrum"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breathe_color_count_mode() {
        let (device, endpoint) = testing::keyboard_device();
        device.prime_serial("FXTEST");

        let mut args = TraitValues::new();
        args.insert(
            "colors".into(),
            TraitValue::List(vec![
                TraitValue::Str("red".into()),
                TraitValue::Str("blue".into()),
            ]),
        );
        device.fx_manager().activate("breathe", args).await;

        let cmds = sent_effect_commands(&endpoint.lock().sent);
        // BREATHE=0x03, mode=DUAL(2), then two colors
        assert_eq!(cmds[0].2[0], 0x03);
        assert_eq!(cmds[0].2[1], 0x02);
        assert_eq!(&cmds[0].2[2..5], &[0xFF, 0x00, 0x00]);
        assert_eq!(&cmds[0].2[5..8], &[0x00, 0x00, 0xFF]);
    }

    #[test]
    fn test_catalog_names_unique() {
        for (i, a) in FX_CATALOG.iter().enumerate() {
            for b in &FX_CATALOG[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }
}
