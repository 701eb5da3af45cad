//! Host-facing side of the plugin.
//!
//! Events arrive from the host, go through the [`PluginCoordinator`] to the
//! key controllers, and frames leave again through a [`HostSink`].

pub mod bridge;
pub mod coordinator;
pub mod events;
pub mod host;

pub use coordinator::{CoordinatorError, CoordinatorHandle, KeyStatus, PluginCoordinator};
pub use events::{HostEvent, HostOutput};
pub use host::{ChannelSink, FrameCache, HostError, HostSink};
