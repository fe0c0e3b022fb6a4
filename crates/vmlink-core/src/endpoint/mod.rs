//! OS audio endpoints
//!
//! The platform audio API is abstracted behind [`EndpointBackend`] (device
//! enumeration and opening) and [`EndpointDevice`] (one opened playback
//! device). Devices push volume/mute changes into a [`VolumeSink`], which
//! forwards them to the owning [`AudioEndpointAgent`]'s event channel.
//!
//! [`VirtualEndpoints`] is an in-process backend that behaves like a real
//! device: every write is echoed back as a notification. On Windows,
//! `MmDeviceBackend` talks to the MMDevice API.

mod agent;
mod memory;
#[cfg(target_os = "windows")]
mod mmdevice;

pub use agent::{AgentOptions, AudioEndpointAgent};
pub use memory::VirtualEndpoints;
#[cfg(target_os = "windows")]
pub use mmdevice::MmDeviceBackend;

use crate::error::LinkResult;
use flume::Sender;

/// Enumerated playback device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Stable OS identifier
    pub id: String,
    /// Friendly name shown to users (not guaranteed unique)
    pub name: String,
}

/// Volume/mute state pushed by a device
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointNotification {
    pub device_id: String,
    /// Master volume scalar, 0.0 to 1.0
    pub volume_scalar: f32,
    pub muted: bool,
}

/// Events emitted by an agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The bound device reported a volume or mute change
    Volume(EndpointNotification),
    Bound { device_id: String, name: String },
    Unbound,
    /// Friendly names of all active playback devices after a rescan
    DevicesChanged(Vec<String>),
}

/// Notification target handed to a device on subscribe
#[derive(Debug, Clone)]
pub struct VolumeSink {
    tx: Sender<AgentEvent>,
}

impl VolumeSink {
    pub fn new(tx: Sender<AgentEvent>) -> Self {
        Self { tx }
    }

    /// Forward a device notification; returns false once the agent is gone
    pub fn notify(&self, notification: EndpointNotification) -> bool {
        self.tx.send(AgentEvent::Volume(notification)).is_ok()
    }
}

/// Platform audio API: device discovery
pub trait EndpointBackend: Send {
    /// Active playback devices
    fn enumerate(&mut self) -> LinkResult<Vec<EndpointInfo>>;

    /// Open a device by id
    fn open(&mut self, id: &str) -> LinkResult<Box<dyn EndpointDevice>>;

    /// True if devices were added or removed since the last call
    fn devices_changed(&mut self) -> bool {
        false
    }
}

/// One opened playback device
pub trait EndpointDevice: Send {
    fn id(&self) -> &str;

    fn volume_scalar(&self) -> LinkResult<f32>;

    fn set_volume_scalar(&mut self, volume: f32) -> LinkResult<()>;

    fn is_muted(&self) -> LinkResult<bool>;

    fn set_mute(&mut self, muted: bool) -> LinkResult<()>;

    /// Start pushing volume/mute changes into `sink`
    fn subscribe(&mut self, sink: VolumeSink) -> LinkResult<()>;

    /// Stop notifications; called before the device is released
    fn unsubscribe(&mut self);
}
