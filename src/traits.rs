//! Typed trait bags.
//!
//! Renderers and firmware effects expose a small set of tunable values.
//! Each owner publishes a descriptor table; values travel as [`TraitValue`]
//! so the IPC boundary and the preferences store never see concrete types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::color::{BlendMode, Rgba};

/// A single configuration value.
///
/// Colors travel as strings ("#rrggbb" or a color name) so stored
/// preferences stay human-editable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<TraitValue>),
}

impl TraitValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TraitValue::Float(v) => Some(*v),
            TraitValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TraitValue::Int(v) => Some(*v),
            TraitValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TraitValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TraitValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<Rgba> {
        Rgba::parse(self.as_str()?)
    }

    pub fn as_color_list(&self) -> Option<Vec<Rgba>> {
        match self {
            TraitValue::List(items) => items.iter().map(TraitValue::as_color).collect(),
            _ => None,
        }
    }

    pub fn as_blend_mode(&self) -> Option<BlendMode> {
        BlendMode::parse(self.as_str()?)
    }

    pub fn from_color(color: Rgba) -> TraitValue {
        let (r, g, b) = color.to_rgb8();
        TraitValue::Str(format!("#{r:02x}{g:02x}{b:02x}"))
    }

    pub fn from_color_list(colors: &[Rgba]) -> TraitValue {
        TraitValue::List(colors.iter().map(|c| TraitValue::from_color(*c)).collect())
    }
}

/// Declared kind of a trait, used for validation at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraitKind {
    Bool,
    Int,
    Float,
    Color,
    ColorList,
    Choice,
}

/// One entry in a descriptor table.
///
/// `configurable` marks traits that are exposed for saving/restoring;
/// internal values (like a hidden frame id) stay out of preferences.
#[derive(Debug, Clone)]
pub struct TraitDef {
    pub name: &'static str,
    pub kind: TraitKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub choices: &'static [&'static str],
    pub configurable: bool,
}

impl TraitDef {
    pub const fn new(name: &'static str, kind: TraitKind) -> Self {
        Self {
            name,
            kind,
            min: None,
            max: None,
            choices: &[],
            configurable: true,
        }
    }

    pub const fn ranged(name: &'static str, kind: TraitKind, min: f64, max: f64) -> Self {
        Self {
            name,
            kind,
            min: Some(min),
            max: Some(max),
            choices: &[],
            configurable: true,
        }
    }

    pub const fn choice(name: &'static str, choices: &'static [&'static str]) -> Self {
        Self {
            name,
            kind: TraitKind::Choice,
            min: None,
            max: None,
            choices,
            configurable: true,
        }
    }

    pub const fn internal(mut self) -> Self {
        self.configurable = false;
        self
    }

    /// Validate a candidate value against this definition.
    pub fn validate(&self, value: &TraitValue) -> Result<(), TraitError> {
        let ok = match self.kind {
            TraitKind::Bool => value.as_bool().is_some(),
            TraitKind::Int => {
                value.as_i64().map_or(false, |v| self.in_range(v as f64))
            }
            TraitKind::Float => {
                value.as_f64().map_or(false, |v| self.in_range(v))
            }
            TraitKind::Color => value.as_color().is_some(),
            TraitKind::ColorList => value.as_color_list().is_some(),
            TraitKind::Choice => value
                .as_str()
                .map_or(false, |s| {
                    self.choices.iter().any(|c| c.eq_ignore_ascii_case(s))
                }),
        };

        if ok {
            Ok(())
        } else {
            Err(TraitError::InvalidValue {
                name: self.name,
                value: format!("{value:?}"),
            })
        }
    }

    fn in_range(&self, v: f64) -> bool {
        self.min.map_or(true, |m| v >= m) && self.max.map_or(true, |m| v <= m)
    }
}

#[derive(Debug, Error)]
pub enum TraitError {
    #[error("Unknown trait: {0}")]
    Unknown(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Trait {0} is write-once")]
    WriteOnce(&'static str),
}

/// Name-indexed bag of trait values.
pub type TraitValues = BTreeMap<String, TraitValue>;
