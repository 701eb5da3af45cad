//! Graph renderer.
//!
//! Turns a window of samples into a key image. Rendering is a pure function
//! of `(samples, style, dimensions)`: no clock, no randomness, no state, so
//! equal inputs give byte-identical pixels and the controller can skip
//! pushing frames that did not change.
//!
//! Layout, top to bottom:
//!
//! ```text
//! ┌──────────────────────┐
//! │        title         │  optional, 9pt
//! │       42.5 °C        │  optional, 12pt
//! │ ┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄ │  gridlines at 25/50/75%
//! │      ╱╲    ╱──       │
//! │ ──╱╲╱  ╲  ╱          │  gaps where samples are invalid
//! └──────────────────────┘
//!  oldest ──────▶ newest
//! ```

use crate::core::canvas::Canvas;
use crate::core::frame::{Dimensions, RasterImage};
use crate::core::settings::{RenderStyle, ValueRange};
use crate::core::store::Sample;
use embedded_graphics::mono_font::{MonoFont, MonoTextStyle};
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Line, PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};
use profont::{PROFONT_12_POINT, PROFONT_9_POINT};
use statrs::statistics::Statistics;
use std::time::Duration;

pub const MIN_DIMENSION: u32 = 16;
pub const MAX_DIMENSION: u32 = 1024;
pub const MIN_PLOT_HEIGHT: u32 = 8;

/// Smallest vertical span used for auto-scaling.
pub const MIN_SPAN: f64 = 1e-6;

/// Span relative to the magnitude of a flat series, so the widened range
/// still differs from the value at large magnitudes.
const RELATIVE_SPAN: f64 = 1e-9;

/// Value label shown while the window has no plottable data.
pub const NO_DATA_LABEL: &str = "--";

const FILL_ALPHA: f32 = 0.6;
const GRID_ALPHA: f32 = 0.25;
const LINE_WIDTH: u32 = 2;
const LABEL_GAP: u32 = 2;
const TITLE_FONT: &MonoFont = &PROFONT_9_POINT;
const VALUE_FONT: &MonoFont = &PROFONT_12_POINT;

/// Everything that affects how samples are drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphStyle {
    pub kind: RenderStyle,
    pub color: Rgb888,
    pub background: Rgb888,
    pub gridlines: bool,
    pub show_value: bool,
    pub title: Option<String>,
    /// Suffix for the value label
    pub unit: String,
    pub value_range: ValueRange,
    /// Time span mapped onto the horizontal axis
    pub window: Duration,
    pub threshold: Option<f64>,
    pub warning_color: Rgb888,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("unsupported image size {0} (each side must be 16..=1024)")]
    Dimensions(Dimensions),
    #[error("labels leave only {plot_height}px for the plot (need 8)")]
    Layout { plot_height: u32 },
}

/// Rendered image plus what the renderer derived from the samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub image: RasterImage,
    /// Effective vertical range, `None` for a background-only frame
    pub range: Option<(f64, f64)>,
    /// Newest valid value
    pub latest: Option<f64>,
    /// True if the threshold was exceeded and the warning colour used
    pub warning: bool,
}

/// Pixel geometry of the plot area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotLayout {
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
    title_y: Option<i32>,
    value_y: Option<i32>,
}

fn check_dimensions(dims: Dimensions) -> Result<(), RenderError> {
    let ok = |v: u32| (MIN_DIMENSION..=MAX_DIMENSION).contains(&v);
    if ok(dims.width) && ok(dims.height) {
        Ok(())
    } else {
        Err(RenderError::Dimensions(dims))
    }
}

impl PlotLayout {
    pub fn new(dims: Dimensions, style: &GraphStyle) -> Result<Self, RenderError> {
        check_dimensions(dims)?;
        let pad = (dims.width.min(dims.height) / 18).max(1);

        let mut band = 0;
        let mut title_y = None;
        let mut value_y = None;
        if style.title.is_some() {
            title_y = Some((pad + band) as i32);
            band += TITLE_FONT.character_size.height + LABEL_GAP;
        }
        if style.show_value {
            value_y = Some((pad + band) as i32);
            band += VALUE_FONT.character_size.height + LABEL_GAP;
        }

        let top = pad + band;
        let bottom = dims.height - 1 - pad;
        let plot_height = (bottom + 1).saturating_sub(top);
        if plot_height < MIN_PLOT_HEIGHT {
            return Err(RenderError::Layout { plot_height });
        }

        Ok(Self {
            left: pad as i32,
            right: (dims.width - 1 - pad) as i32,
            top: top as i32,
            bottom: bottom as i32,
            title_y,
            value_y,
        })
    }

    /// Column for a sample `age` behind the newest one; `None` if it falls
    /// left of the window.
    pub fn x_for(&self, age: chrono::Duration, window: Duration) -> Option<i32> {
        let window_ms = window.as_secs_f64() * 1000.0;
        let age_ms = age.num_microseconds().map(|us| us as f64 / 1000.0)?;
        if window_ms <= 0.0 {
            return Some(self.right);
        }
        let frac = age_ms / window_ms;
        if !(0.0..=1.0 + 1e-9).contains(&frac) {
            return None;
        }
        let span = f64::from(self.right - self.left);
        Some(self.right - (frac.min(1.0) * span).round() as i32)
    }

    /// Row for `value` on a `lo..hi` scale, clamped to the plot. A collapsed
    /// scale maps everything to the middle row.
    pub fn y_for(&self, value: f64, lo: f64, hi: f64) -> i32 {
        let frac = ((value - lo) / (hi - lo)).clamp(0.0, 1.0);
        let frac = if frac.is_nan() { 0.5 } else { frac };
        let span = f64::from(self.bottom - self.top);
        self.bottom - (frac * span).round() as i32
    }
}

/// Effective range: the configured one, or the window's min/max widened to
/// at least [`MIN_SPAN`] (or a magnitude-relative span) around its centre.
/// The result always has `lo < hi`.
fn value_range(values: &[f64], range: ValueRange) -> (f64, f64) {
    if let ValueRange::Fixed { min, max } = range {
        if min.is_finite() && max.is_finite() && min < max {
            return (min, max);
        }
    }
    let lo = Statistics::min(values.iter());
    let hi = Statistics::max(values.iter());
    if hi - lo >= MIN_SPAN {
        return (lo, hi);
    }
    let mid = lo + (hi - lo) / 2.0;
    let mut span = MIN_SPAN.max(mid.abs() * RELATIVE_SPAN);
    loop {
        let (lo, hi) = (mid - span / 2.0, mid + span / 2.0);
        if lo < hi || !span.is_finite() {
            return (lo, hi);
        }
        span *= 2.0;
    }
}

fn mix(fg: Rgb888, bg: Rgb888, alpha: f32) -> Rgb888 {
    let ch = |f: u8, b: u8| (f32::from(f) * alpha + f32::from(b) * (1.0 - alpha)).round() as u8;
    Rgb888::new(ch(fg.r(), bg.r()), ch(fg.g(), bg.g()), ch(fg.b(), bg.b()))
}

/// Near-white on dark backgrounds, black on light ones.
fn label_color_for_bg(bg: Rgb888) -> Rgb888 {
    let luma = 0.299 * f32::from(bg.r()) + 0.587 * f32::from(bg.g()) + 0.114 * f32::from(bg.b());
    if luma > 140.0 {
        Rgb888::BLACK
    } else {
        Rgb888::new(230, 230, 230)
    }
}

/// Value label with precision adapted to magnitude.
pub fn format_value(value: f64, unit: &str) -> String {
    let number = if value.abs() >= 100.0 {
        format!("{value:.0}")
    } else if value.abs() >= 10.0 {
        format!("{value:.1}")
    } else {
        format!("{value:.2}")
    };
    match unit.chars().next() {
        Some(c) if c.is_alphanumeric() => format!("{number} {unit}"),
        _ => format!("{number}{unit}"),
    }
}

/// Connected runs of plottable points. An invalid sample ends a run.
fn runs(samples: &[Sample], layout: &PlotLayout, style: &GraphStyle, lo: f64, hi: f64) -> Vec<Vec<Point>> {
    let Some(newest) = samples.last().map(|s| s.timestamp) else {
        return Vec::new();
    };
    let mut runs = Vec::new();
    let mut current: Vec<Point> = Vec::new();
    for sample in samples {
        if !(sample.valid && sample.value.is_finite()) {
            if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(x) = layout.x_for(newest - sample.timestamp, style.window) {
            current.push(Point::new(x, layout.y_for(sample.value, lo, hi)));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn draw_gridlines(canvas: &mut Canvas, layout: &PlotLayout, color: Rgb888) {
    let height = layout.bottom - layout.top;
    for quarter in 1..4 {
        let y = layout.top + height * quarter / 4;
        Line::new(Point::new(layout.left, y), Point::new(layout.right, y))
            .into_styled(PrimitiveStyle::with_stroke(color, 1))
            .draw(canvas)
            .ok();
    }
}

/// Vertical gradient under a run, strongest at the line.
fn draw_fill(canvas: &mut Canvas, layout: &PlotLayout, run: &[Point], color: Rgb888) {
    for (i, pair) in run.windows(2).enumerate() {
        let (p0, p1) = (pair[0], pair[1]);
        let last = i + 2 == run.len();
        let end = if last { p1.x } else { p1.x - 1 };
        for x in p0.x..=end {
            let y_line = if p1.x == p0.x {
                p0.y.min(p1.y)
            } else {
                let t = f64::from(x - p0.x) / f64::from(p1.x - p0.x);
                (f64::from(p0.y) + t * f64::from(p1.y - p0.y)).round() as i32
            };
            let depth = (layout.bottom - y_line + 1).max(1) as f32;
            for y in (y_line + 1)..=layout.bottom {
                let alpha = FILL_ALPHA * (1.0 - (y - y_line) as f32 / depth);
                canvas.blend_pixel(x, y, color, alpha);
            }
        }
    }
}

fn draw_line(canvas: &mut Canvas, run: &[Point], color: Rgb888) {
    if let [only] = run {
        Rectangle::new(*only - Point::new(0, 1), Size::new(LINE_WIDTH, LINE_WIDTH))
            .into_styled(PrimitiveStyle::with_fill(color))
            .draw(canvas)
            .ok();
        return;
    }
    for pair in run.windows(2) {
        Line::new(pair[0], pair[1])
            .into_styled(PrimitiveStyle::with_stroke(color, LINE_WIDTH))
            .draw(canvas)
            .ok();
    }
}

fn draw_labels(canvas: &mut Canvas, layout: &PlotLayout, style: &GraphStyle, latest: Option<f64>, accent: Rgb888) {
    let center = canvas.width() as i32 / 2;
    let text_style = TextStyleBuilder::new()
        .alignment(Alignment::Center)
        .baseline(Baseline::Top)
        .build();

    if let (Some(y), Some(title)) = (layout.title_y, style.title.as_deref()) {
        let font = MonoTextStyle::new(TITLE_FONT, label_color_for_bg(style.background));
        Text::with_text_style(title, Point::new(center, y), font, text_style)
            .draw(canvas)
            .ok();
    }
    if let Some(y) = layout.value_y {
        let label = match latest {
            Some(value) => format_value(value, &style.unit),
            None => NO_DATA_LABEL.to_string(),
        };
        let font = MonoTextStyle::new(VALUE_FONT, accent);
        Text::with_text_style(&label, Point::new(center, y), font, text_style)
            .draw(canvas)
            .ok();
    }
}

/// Frame for a window without plottable data: no plot, only the title and
/// a placeholder value label when those are enabled.
fn no_data(style: &GraphStyle, dims: Dimensions) -> Graph {
    let mut canvas = Canvas::new(dims.width, dims.height, style.background);
    // A label band too tall for the key still leaves a plain background.
    if let Ok(layout) = PlotLayout::new(dims, style) {
        let dimmed = mix(label_color_for_bg(style.background), style.background, 0.6);
        draw_labels(&mut canvas, &layout, style, None, dimmed);
    }
    Graph {
        image: canvas.into_raster(),
        range: None,
        latest: None,
        warning: false,
    }
}

/// Render `samples` (oldest first) into an image of `dims`.
pub fn render(samples: &[Sample], style: &GraphStyle, dims: Dimensions) -> Result<RasterImage, RenderError> {
    render_graph(samples, style, dims).map(|graph| graph.image)
}

/// Like [`render`], also returning the range and latest value used.
pub fn render_graph(samples: &[Sample], style: &GraphStyle, dims: Dimensions) -> Result<Graph, RenderError> {
    check_dimensions(dims)?;

    let values: Vec<f64> = samples
        .iter()
        .filter(|s| s.valid && s.value.is_finite())
        .map(|s| s.value)
        .collect();
    if values.len() < 2 {
        return Ok(no_data(style, dims));
    }

    let layout = PlotLayout::new(dims, style)?;
    let (lo, hi) = value_range(&values, style.value_range);
    let latest = values[values.len() - 1];
    let warning = style.threshold.is_some_and(|t| latest > t);
    let accent = if warning { style.warning_color } else { style.color };

    let mut canvas = Canvas::new(dims.width, dims.height, style.background);
    if style.gridlines {
        draw_gridlines(&mut canvas, &layout, mix(style.color, style.background, GRID_ALPHA));
    }
    let runs = runs(samples, &layout, style, lo, hi);
    if style.kind == RenderStyle::Area {
        for run in &runs {
            draw_fill(&mut canvas, &layout, run, accent);
        }
    }
    for run in &runs {
        draw_line(&mut canvas, run, accent);
    }
    draw_labels(&mut canvas, &layout, style, Some(latest), accent);

    Ok(Graph {
        image: canvas.into_raster(),
        range: Some((lo, hi)),
        latest: Some(latest),
        warning,
    })
}
