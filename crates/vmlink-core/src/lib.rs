//! Mixing-engine ↔ OS audio endpoint volume link
//!
//! This crate provides:
//! - Typed, validated access to the engine's bus and strip parameters
//! - Dirty-check driven refresh and immediate or batched writes
//! - One worker thread per OS playback device, surviving hot-swap
//! - Lease-based echo suppression between the two sides of a link
//! - Linear dB ↔ volume-scalar mapping with a deadzone around 0 dB
//! - YAML settings with per-device link state
//!
//! # Architecture
//!
//! ```text
//! engine ──is_dirty──▶ PollLoop ──refresh──▶ ResourceEntity ──flume──▶ ChannelLink
//!   ▲                                             │                     │   ▲
//!   └──────────── ChangeBatcher ◀── set_gain ─────┘      set_volume ────┘   │ AgentEvent
//!                                                                ▼          │
//!                                                       AudioEndpointAgent ─┘
//! ```
//!
//! Every forward through a [`ChannelLink`] first takes the link's
//! [`LinkArbiter`] lease; the echo the far side produces arrives while the
//! lease is held and is dropped.

pub mod arbiter;
pub mod batcher;
pub mod cancel;
pub mod endpoint;
pub mod error;
pub mod gain;
pub mod link;
pub mod manager;
pub mod params;
pub mod poll;
pub mod remote;
pub mod resource;
pub mod session;
pub mod settings;

pub use arbiter::{LinkArbiter, LinkSide, LinkState, DEFAULT_LEASE};
pub use batcher::{ChangeBatcher, WriteMode};
pub use cancel::CancelToken;
pub use endpoint::{
    AgentEvent, AgentOptions, AudioEndpointAgent, EndpointBackend, EndpointDevice, EndpointInfo,
    EndpointNotification, VirtualEndpoints, VolumeSink,
};
#[cfg(target_os = "windows")]
pub use endpoint::MmDeviceBackend;
pub use error::{LinkError, LinkResult, RemoteProtocolError};
pub use gain::{
    apply_deadzone, endpoint_to_engine, engine_to_endpoint, proportional_gain, GainRange,
    DEFAULT_DEADZONE_DB, ENDPOINT_VOLUME_RANGE, ENGINE_GAIN_RANGE,
};
pub use link::ChannelLink;
pub use manager::LinkManager;
pub use params::{
    AccessMode, ChannelCounts, ChannelLayout, DescriptorTable, EngineVariant, ParamValue,
    ParameterDescriptor, Property, ResourceKind, ValueKind,
};
pub use poll::PollLoop;
pub use remote::{connect, DllEngine, EngineDevice, EngineVersion, LoginStatus, MemoryEngine, RemoteEngine};
pub use resource::{ResourceChange, ResourceEntity, ResourceKey, ResourceState};
pub use session::{Session, SessionOptions, DEFAULT_REFRESH_INTERVAL};
pub use settings::{
    default_settings_path, ConfiguredDevice, LinkSettings, LinkTuning, MemorySettingsStore,
    SettingsStore, SharedSettings, YamlSettingsStore,
};
