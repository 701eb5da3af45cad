//! Per-key configuration.
//!
//! The property inspector sends an opaque JSON blob per key. It is parsed
//! field by field into [`KeySettings`]; a bad field is replaced by its
//! default and reported as a [`SettingsIssue`], never rejected outright.

use crate::core::render::GraphStyle;
use crate::core::store::capacity_for;
use crate::sensors::SensorId;
use embedded_graphics::pixelcolor::Rgb888;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const DEFAULT_SENSOR: &str = "cpu.load";
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(1000);
pub const MIN_SAMPLING_INTERVAL: Duration = Duration::from_millis(50);
pub const MAX_WINDOW: Duration = Duration::from_secs(3600);

pub const DEFAULT_COLOR: Rgb888 = Rgb888::new(0, 255, 0);
pub const DEFAULT_WARNING_COLOR: Rgb888 = Rgb888::new(255, 0, 0);
pub const DEFAULT_BACKGROUND: Rgb888 = Rgb888::new(0, 0, 0);

/// Line or filled area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderStyle {
    #[default]
    Line,
    Area,
}

/// Vertical axis scaling.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ValueRange {
    /// Recomputed from the window's min/max on every render
    #[default]
    Auto,
    Fixed { min: f64, max: f64 },
}

/// A settings field that could not be used as given.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsIssue {
    #[error("settings payload is not an object, using defaults")]
    NotAnObject,
    #[error("`{field}` has unusable value {value}, using default")]
    Invalid { field: &'static str, value: String },
    #[error("`{field}` clamped to {value}")]
    Clamped { field: &'static str, value: String },
    #[error("fixed range needs finite fixedMin < fixedMax, using auto range")]
    FixedRange,
}

/// Validated configuration of one key.
///
/// Always replaced as a whole; nothing mutates individual fields of a
/// configuration that a controller is already using.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySettings {
    pub sensor_id: SensorId,
    pub window: Duration,
    pub sampling_interval: Duration,
    pub style: RenderStyle,
    pub color: Rgb888,
    pub background: Rgb888,
    pub gridlines: bool,
    pub show_value: bool,
    pub title: Option<String>,
    pub value_range: ValueRange,
    /// Overrides the unit the sensor reports
    pub unit_label: Option<String>,
    pub threshold: Option<f64>,
    pub warning_color: Rgb888,
}

impl Default for KeySettings {
    fn default() -> Self {
        let sensor_id = SensorId::new(DEFAULT_SENSOR);
        Self {
            threshold: default_threshold(&sensor_id),
            sensor_id,
            window: DEFAULT_WINDOW,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            style: RenderStyle::Line,
            color: DEFAULT_COLOR,
            background: DEFAULT_BACKGROUND,
            gridlines: false,
            show_value: true,
            title: None,
            value_range: ValueRange::Auto,
            unit_label: None,
            warning_color: DEFAULT_WARNING_COLOR,
        }
    }
}

/// Warning threshold used when a key does not set one. Only sensors with a
/// natural alarm level have one.
pub fn default_threshold(sensor: &SensorId) -> Option<f64> {
    match sensor.as_str() {
        "cpu.load" | "gpu.load" | "memory.usage" | "cpu.temperature" => Some(80.0),
        "gpu.temperature" => Some(85.0),
        "board.temperature" => Some(60.0),
        "nvme.temperature" => Some(70.0),
        _ => None,
    }
}

/// Parse `#rrggbb` or `rrggbb`.
pub fn parse_hex_color(hex: &str) -> Option<Rgb888> {
    let hex = hex.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some(Rgb888::new(r, g, b))
}

/// Accepts JSON numbers and numeric strings, which some inspectors send.
fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    }
}

struct Fields<'a> {
    raw: &'a Map<String, Value>,
    issues: Vec<SettingsIssue>,
}

impl<'a> Fields<'a> {
    /// Present and non-null.
    fn get(&self, field: &str) -> Option<&'a Value> {
        self.raw.get(field).filter(|v| !v.is_null())
    }

    fn invalid(&mut self, field: &'static str, value: &Value) {
        self.issues.push(SettingsIssue::Invalid {
            field,
            value: value.to_string(),
        });
    }

    fn parse<T>(&mut self, field: &'static str, f: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        let value = self.get(field)?;
        let parsed = f(value);
        if parsed.is_none() {
            self.invalid(field, value);
        }
        parsed
    }

    fn string(&mut self, field: &'static str) -> Option<String> {
        self.parse(field, |v| v.as_str().map(|s| s.trim().to_string()))
    }

    fn positive(&mut self, field: &'static str) -> Option<f64> {
        self.parse(field, |v| as_number(v).filter(|n| *n > 0.0))
    }

    fn number(&mut self, field: &'static str) -> Option<f64> {
        self.parse(field, as_number)
    }

    fn flag(&mut self, field: &'static str) -> Option<bool> {
        self.parse(field, as_bool)
    }

    fn color(&mut self, field: &'static str) -> Option<Rgb888> {
        self.parse(field, |v| v.as_str().and_then(parse_hex_color))
    }
}

impl KeySettings {
    /// Build settings from a property-inspector payload.
    pub fn from_raw(raw: &Value) -> (Self, Vec<SettingsIssue>) {
        let mut settings = Self::default();
        let Some(map) = raw.as_object() else {
            let issues = if raw.is_null() {
                Vec::new()
            } else {
                vec![SettingsIssue::NotAnObject]
            };
            return (settings, issues);
        };
        let mut fields = Fields {
            raw: map,
            issues: Vec::new(),
        };

        let sensor = fields.parse("sensorId", |v| {
            v.as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SensorId::new)
        });
        if let Some(id) = sensor {
            settings.sensor_id = id;
        }

        if let Some(secs) = fields.positive("windowSeconds") {
            let window = Duration::from_secs_f64(secs.min(MAX_WINDOW.as_secs_f64()));
            if secs > MAX_WINDOW.as_secs_f64() {
                fields.issues.push(SettingsIssue::Clamped {
                    field: "windowSeconds",
                    value: MAX_WINDOW.as_secs().to_string(),
                });
            }
            settings.window = window;
        }

        if let Some(ms) = fields.positive("samplingIntervalMs") {
            let interval = Duration::from_secs_f64(ms.min(MAX_WINDOW.as_millis() as f64) / 1000.0);
            if interval < MIN_SAMPLING_INTERVAL {
                fields.issues.push(SettingsIssue::Clamped {
                    field: "samplingIntervalMs",
                    value: MIN_SAMPLING_INTERVAL.as_millis().to_string(),
                });
                settings.sampling_interval = MIN_SAMPLING_INTERVAL;
            } else {
                settings.sampling_interval = interval;
            }
        }

        if let Some(style) = fields.parse("style", |v| serde_json::from_value(v.clone()).ok()) {
            settings.style = style;
        }
        if let Some(color) = fields.color("color") {
            settings.color = color;
        }
        if let Some(color) = fields.color("backgroundColor") {
            settings.background = color;
        }
        if let Some(color) = fields.color("warningColor") {
            settings.warning_color = color;
        }
        if let Some(on) = fields.flag("gridlines") {
            settings.gridlines = on;
        }
        if let Some(on) = fields.flag("showValue") {
            settings.show_value = on;
        }
        settings.title = fields.string("title").filter(|s| !s.is_empty());
        settings.unit_label = fields.string("unitLabel").filter(|s| !s.is_empty());
        settings.threshold = fields
            .number("threshold")
            .or_else(|| default_threshold(&settings.sensor_id));

        let mode = fields.parse("valueRangeMode", |v| match v.as_str() {
            Some("auto") => Some(false),
            Some("fixed") => Some(true),
            _ => None,
        });
        if mode == Some(true) {
            let min = fields.number("fixedMin");
            let max = fields.number("fixedMax");
            match (min, max) {
                (Some(min), Some(max)) if min < max => {
                    settings.value_range = ValueRange::Fixed { min, max };
                }
                _ => fields.issues.push(SettingsIssue::FixedRange),
            }
        }

        (settings, fields.issues)
    }

    /// Sample store capacity for this window and interval.
    pub fn capacity(&self, slack: usize) -> usize {
        capacity_for(self.window, self.sampling_interval, slack)
    }

    /// Renderer style for these settings. `sensor_unit` is used when no
    /// unit label is configured.
    pub fn graph_style(&self, sensor_unit: &str) -> GraphStyle {
        GraphStyle {
            kind: self.style,
            color: self.color,
            background: self.background,
            gridlines: self.gridlines,
            show_value: self.show_value,
            title: self.title.clone(),
            unit: self.unit_label.clone().unwrap_or_else(|| sensor_unit.to_string()),
            value_range: self.value_range,
            window: self.window,
            threshold: self.threshold,
            warning_color: self.warning_color,
        }
    }
}
