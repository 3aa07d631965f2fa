//! Built-in reference renderers.
//!
//! The numerical effect library proper lives out of tree; the renderers
//! here exercise the producer contract and give the daemon something to
//! show out of the box.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::color::{hue_gradient, Rgba};
use crate::device::ChromaDevice;
use crate::frame::Frame;
use crate::layer::Layer;
use crate::renderer::{
    Renderer, RendererInfo, RendererMeta, RendererProps, RendererRegistry,
};
use crate::traits::{TraitDef, TraitError, TraitKind, TraitValue, TraitValues};

pub fn register_builtins(registry: &RendererRegistry) {
    registry.register(RendererInfo {
        key: "fxlib.rainbow",
        meta: RAINBOW_META.clone(),
        traits: Rainbow::TRAIT_DEFS,
        factory: Rainbow::create,
    });
    registry.register(RendererInfo {
        key: "fxlib.solid",
        meta: SOLID_META.clone(),
        traits: Solid::TRAIT_DEFS,
        factory: Solid::create,
    });
}

static RAINBOW_META: RendererMeta = RendererMeta {
    display_name: "Rainbow",
    description: "Rainbow of hues scrolling across the device",
    author: "Chroma Developers",
    version: "1.0",
};

static SOLID_META: RendererMeta = RendererMeta {
    display_name: "Solid",
    description: "Single solid color",
    author: "Chroma Developers",
    version: "1.0",
};

/// Scrolling rainbow of hues.
pub struct Rainbow {
    props: RendererProps,
    speed: f64,
    stagger: i64,
    gradient: Vec<Rgba>,
    start: Option<Instant>,
}

impl Rainbow {
    const TRAIT_DEFS: &'static [TraitDef] = &[
        TraitDef::ranged("speed", TraitKind::Float, 0.1, 10.0),
        TraitDef::ranged("stagger", TraitKind::Int, 0.0, 100.0),
    ];

    fn create(device: &Arc<ChromaDevice>) -> Box<dyn Renderer> {
        Box::new(Self {
            props: RendererProps::new(device.width(), device.height()),
            speed: 1.0,
            stagger: 4,
            gradient: Vec::new(),
            start: None,
        })
    }
}

#[async_trait]
impl Renderer for Rainbow {
    fn meta(&self) -> &RendererMeta {
        &RAINBOW_META
    }

    fn props(&self) -> &RendererProps {
        &self.props
    }

    fn props_mut(&mut self) -> &mut RendererProps {
        &mut self.props
    }

    fn trait_defs(&self) -> &'static [TraitDef] {
        Self::TRAIT_DEFS
    }

    fn get_traits(&self) -> TraitValues {
        let mut values = self.props.get_traits();
        values.insert("speed".into(), TraitValue::Float(self.speed));
        values.insert("stagger".into(), TraitValue::Int(self.stagger));
        values
    }

    fn set_trait(&mut self, name: &str, value: &TraitValue) -> Result<(), TraitError> {
        if self.props.set_trait(name, value)? {
            return Ok(());
        }
        match name {
            "speed" => {
                Self::TRAIT_DEFS[0].validate(value)?;
                self.speed = value.as_f64().unwrap();
            }
            "stagger" => {
                Self::TRAIT_DEFS[1].validate(value)?;
                self.stagger = value.as_i64().unwrap();
            }
            _ => return Err(TraitError::Unknown(name.into())),
        }
        Ok(())
    }

    fn init(&mut self, frame: &Frame) -> bool {
        let span = frame.width() + frame.height() * self.stagger as usize;
        if span == 0 {
            return false;
        }
        self.gradient = hue_gradient(360.0, span.max(1) * 2);
        true
    }

    async fn draw(&mut self, layer: &mut Layer, timestamp: Instant) -> bool {
        let start = *self.start.get_or_insert(timestamp);
        let elapsed = timestamp.duration_since(start).as_secs_f64();
        let shift = (elapsed * self.speed * 10.0) as usize;

        let len = self.gradient.len();
        for row in 0..layer.height() {
            for col in 0..layer.width() {
                let idx = (row * self.stagger as usize + col + shift) % len;
                layer.put(row, col, self.gradient[idx]);
            }
        }
        true
    }

    fn finish(&mut self, _frame: &Frame) {
        self.gradient.clear();
        self.start = None;
    }
}

/// Fills the whole matrix with one color; mostly useful as a base layer
/// under blended renderers.
pub struct Solid {
    props: RendererProps,
    color: Rgba,
    drawn: bool,
}

impl Solid {
    const TRAIT_DEFS: &'static [TraitDef] = &[TraitDef::new("color", TraitKind::Color)];

    fn create(device: &Arc<ChromaDevice>) -> Box<dyn Renderer> {
        Box::new(Self {
            props: RendererProps::new(device.width(), device.height()),
            color: Rgba::from_rgb8(0, 255, 0),
            drawn: false,
        })
    }
}

#[async_trait]
impl Renderer for Solid {
    fn meta(&self) -> &RendererMeta {
        &SOLID_META
    }

    fn props(&self) -> &RendererProps {
        &self.props
    }

    fn props_mut(&mut self) -> &mut RendererProps {
        &mut self.props
    }

    fn trait_defs(&self) -> &'static [TraitDef] {
        Self::TRAIT_DEFS
    }

    fn get_traits(&self) -> TraitValues {
        let mut values = self.props.get_traits();
        values.insert("color".into(), TraitValue::from_color(self.color));
        values
    }

    fn set_trait(&mut self, name: &str, value: &TraitValue) -> Result<(), TraitError> {
        if self.props.set_trait(name, value)? {
            return Ok(());
        }
        match name {
            "color" => {
                Self::TRAIT_DEFS[0].validate(value)?;
                self.color = value.as_color().unwrap();
                self.drawn = false;
            }
            _ => return Err(TraitError::Unknown(name.into())),
        }
        Ok(())
    }

    fn init(&mut self, _frame: &Frame) -> bool {
        self.drawn = false;
        true
    }

    async fn draw(&mut self, layer: &mut Layer, _timestamp: Instant) -> bool {
        // static output: draw once, then skip ticks until the color changes
        if self.drawn {
            return false;
        }
        layer.fill(self.color);
        self.drawn = true;
        true
    }

    fn finish(&mut self, _frame: &Frame) {}
}
