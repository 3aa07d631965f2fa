//! Animation producer contract and registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::color::{BlendMode, Rgba};
use crate::device::ChromaDevice;
use crate::frame::Frame;
use crate::layer::Layer;
use crate::traits::{TraitDef, TraitError, TraitKind, TraitValue, TraitValues};

/// Hard ceiling of the animation loop; renderers may run slower.
pub const MAX_FPS: f64 = 30.0;
pub const DEFAULT_FPS: f64 = 15.0;
/// Buffers per layer holder (double buffering).
pub const NUM_BUFFERS: usize = 2;

/// Immutable description of a renderer implementation.
#[derive(Debug, Clone)]
pub struct RendererMeta {
    pub display_name: &'static str,
    pub description: &'static str,
    pub author: &'static str,
    pub version: &'static str,
}

/// Standard properties shared by every renderer.
///
/// Width and height are fixed from the owning device when the renderer is
/// created; runtime reassignment is not offered.
#[derive(Debug, Clone)]
pub struct RendererProps {
    fps: f64,
    pub blend_mode: BlendMode,
    pub opacity: f64,
    pub background_color: Option<Rgba>,
    width: usize,
    height: usize,
}

impl RendererProps {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            fps: DEFAULT_FPS,
            blend_mode: BlendMode::Normal,
            opacity: 1.0,
            background_color: None,
            width,
            height,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub const DEFS: &'static [TraitDef] = &[
        TraitDef::ranged("fps", TraitKind::Float, 0.0, MAX_FPS),
        TraitDef::choice(
            "blend_mode",
            &[
                "normal", "screen", "multiply", "lighten", "darken", "overlay", "dodge", "burn",
            ],
        ),
        TraitDef::ranged("opacity", TraitKind::Float, 0.0, 1.0),
        TraitDef::new("background_color", TraitKind::Color),
    ];

    pub fn get_traits(&self) -> TraitValues {
        let mut values = TraitValues::new();
        values.insert("fps".into(), TraitValue::Float(self.fps));
        values.insert(
            "blend_mode".into(),
            TraitValue::Str(self.blend_mode.name().into()),
        );
        values.insert("opacity".into(), TraitValue::Float(self.opacity));
        if let Some(bg) = self.background_color {
            values.insert("background_color".into(), TraitValue::from_color(bg));
        }
        values
    }

    /// Apply a standard property; returns false when the name is not one.
    pub fn set_trait(&mut self, name: &str, value: &TraitValue) -> Result<bool, TraitError> {
        let def = match Self::DEFS.iter().find(|d| d.name == name) {
            Some(def) => def,
            None => return Ok(false),
        };
        def.validate(value)?;

        match name {
            "fps" => self.fps = value.as_f64().unwrap(),
            "blend_mode" => self.blend_mode = value.as_blend_mode().unwrap(),
            "opacity" => self.opacity = value.as_f64().unwrap(),
            "background_color" => self.background_color = value.as_color(),
            _ => unreachable!(),
        }
        Ok(true)
    }
}

/// An animation producer filling one layer per tick.
#[async_trait]
pub trait Renderer: Send {
    fn meta(&self) -> &RendererMeta;

    fn props(&self) -> &RendererProps;

    fn props_mut(&mut self) -> &mut RendererProps;

    /// Renderer-specific configurable traits (standard props excluded).
    fn trait_defs(&self) -> &'static [TraitDef];

    /// Snapshot of all configurable values, standard props included.
    fn get_traits(&self) -> TraitValues;

    /// Apply one trait value, standard props included.
    fn set_trait(&mut self, name: &str, value: &TraitValue) -> Result<(), TraitError>;

    /// Called once after traits are set; allocate model-sized state here.
    /// Returning false refuses the layer.
    fn init(&mut self, frame: &Frame) -> bool;

    /// Fill the provided layer for this tick. Returning false skips the
    /// tick (no new buffer is queued) and the previous frame stays up.
    async fn draw(&mut self, layer: &mut Layer, timestamp: Instant) -> bool;

    /// Teardown counterpart of `init`.
    fn finish(&mut self, frame: &Frame);
}

/// Apply a bag of traits, reporting the first failure.
pub fn apply_traits(
    renderer: &mut dyn Renderer,
    values: &TraitValues,
) -> Result<(), TraitError> {
    for (name, value) in values {
        renderer.set_trait(name, value)?;
    }
    Ok(())
}

/// Factory entry for a discoverable renderer.
#[derive(Clone)]
pub struct RendererInfo {
    /// Stable dotted key, e.g. `fxlib.rainbow`.
    pub key: &'static str,
    pub meta: RendererMeta,
    pub traits: &'static [TraitDef],
    pub factory: fn(&Arc<ChromaDevice>) -> Box<dyn Renderer>,
}

/// Process-wide renderer registry.
///
/// Built-ins register on first access; embedders may add their own
/// factories before starting the device manager.
pub struct RendererRegistry {
    infos: Mutex<BTreeMap<&'static str, RendererInfo>>,
}

impl RendererRegistry {
    fn new() -> Self {
        let registry = Self {
            infos: Mutex::new(BTreeMap::new()),
        };
        crate::fxlib::register_builtins(&registry);
        registry
    }

    pub fn register(&self, info: RendererInfo) {
        self.infos.lock().insert(info.key, info);
    }

    pub fn get(&self, key: &str) -> Option<RendererInfo> {
        self.infos.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.infos.lock().keys().copied().collect()
    }

    pub fn infos(&self) -> Vec<RendererInfo> {
        self.infos.lock().values().cloned().collect()
    }
}

static REGISTRY: std::sync::OnceLock<RendererRegistry> = std::sync::OnceLock::new();

pub fn registry() -> &'static RendererRegistry {
    REGISTRY.get_or_init(RendererRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_props_roundtrip() {
        let mut props = RendererProps::new(22, 6);
        assert!(props
            .set_trait("fps", &TraitValue::Float(20.0))
            .unwrap());
        assert!(props
            .set_trait("blend_mode", &TraitValue::Str("screen".into()))
            .unwrap());
        assert!(!props
            .set_trait("no_such_prop", &TraitValue::Bool(true))
            .unwrap());

        let values = props.get_traits();
        assert_eq!(values.get("fps"), Some(&TraitValue::Float(20.0)));
        assert_eq!(
            values.get("blend_mode"),
            Some(&TraitValue::Str("screen".into()))
        );
    }

    #[test]
    fn test_fps_out_of_range_rejected() {
        let mut props = RendererProps::new(22, 6);
        assert!(props.set_trait("fps", &TraitValue::Float(60.0)).is_err());
        assert_eq!(props.fps(), DEFAULT_FPS);
    }

    #[test]
    fn test_builtin_registry() {
        let reg = registry();
        assert!(reg.get("fxlib.rainbow").is_some());
        assert!(reg.get("no.such.renderer").is_none());
        assert!(!reg.keys().is_empty());
    }
}
