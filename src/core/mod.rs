//! Core functionality for sensor key graphs.
//!
//! This module contains:
//! - Sample storage with time-window retention
//! - Per-key settings and their property-inspector schema
//! - Graph rendering into fixed-size key images
//! - The sampling scheduler and the key controller that ties it together

pub mod canvas;
pub mod clock;
pub mod controller;
pub mod frame;
pub mod render;
pub mod scheduler;
pub mod settings;
pub mod store;

// Re-export commonly used types
pub use clock::SampleClock;
pub use controller::{KeyController, KeyError, KeyId, KeyRuntime, KeyState, TickOutcome};
pub use frame::{Dimensions, FrameError, FrameStamp, RasterImage, RenderedFrame};
pub use render::{render, render_graph, Graph, GraphStyle, RenderError};
pub use settings::{KeySettings, RenderStyle, SettingsIssue, ValueRange};
pub use store::{AppendError, Sample, SampleStore, StoreSnapshot};
