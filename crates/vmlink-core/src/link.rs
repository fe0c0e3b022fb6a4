//! Engine channel ↔ OS device volume link
//!
//! A [`ChannelLink`] couples one [`ResourceEntity`] to one
//! [`AudioEndpointAgent`]. A dispatcher thread waits on both change streams
//! and forwards gain and mute across, each direction gated by the link's
//! enable flag and by the [`LinkArbiter`] lease so a write's echo from the
//! far side is dropped.
//!
//! Bus links follow the device the engine reports for the bus. Strip links
//! bind to the virtual strip's own playback device.

use crate::arbiter::{LinkArbiter, LinkSide};
use crate::cancel::CancelToken;
use crate::endpoint::{AgentEvent, AudioEndpointAgent, EndpointBackend, EndpointNotification};
use crate::error::{LinkError, LinkResult};
use crate::gain::{endpoint_to_engine, engine_to_endpoint, GainRange};
use crate::params::{gain_range, ParamValue, Property, ResourceKind};
use crate::resource::{ResourceChange, ResourceEntity};
use crate::settings::{ConfiguredDevice, SharedSettings};
use flume::{Receiver, RecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the dispatcher blocks before re-checking cancellation
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(50);

/// Message picked up by the dispatcher
enum Inbound {
    Engine(ResourceChange),
    Endpoint(AgentEvent),
}

/// State shared by the link handle and its dispatcher
struct LinkCore {
    label: String,
    resource: Arc<ResourceEntity>,
    agent: AudioEndpointAgent,
    arbiter: LinkArbiter,
    settings: SharedSettings,
    link_volume: AtomicBool,
    engine_range: GainRange,
    deadzone_db: f32,
}

impl LinkCore {
    fn link_enabled(&self) -> bool {
        self.link_volume.load(Ordering::Acquire)
    }

    fn on_engine_change(&self, change: ResourceChange) {
        match (change.property, change.value) {
            (Property::Gain, ParamValue::Float(gain_db)) => {
                if !self.link_enabled() || !self.arbiter.try_take_lead(LinkSide::Engine) {
                    return;
                }
                let volume = engine_to_endpoint(self.engine_range, gain_db);
                log::trace!("[Link {}] engine gain {:.1} dB -> volume {:.3}", self.label, gain_db, volume);
                self.agent.set_volume(volume);
            }
            (Property::Mute, ParamValue::Bool(muted)) => {
                if !self.link_enabled() || !self.arbiter.try_take_lead(LinkSide::Engine) {
                    return;
                }
                self.agent.set_mute(muted);
            }
            (Property::DeviceName, ParamValue::Text(name)) if self.resource.kind() == ResourceKind::Bus => {
                self.follow_engine_device(&name);
            }
            (Property::Name, ParamValue::Text(name)) => {
                log::trace!("[Link {}] channel name '{}'", self.label, name);
            }
            _ => {}
        }
    }

    /// Point the agent at the device the engine routes the bus to
    fn follow_engine_device(&self, name: &str) {
        let name = name.trim();
        self.agent
            .use_device(if name.is_empty() { None } else { Some(name) });
    }

    fn on_endpoint_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::Volume(notification) => self.on_endpoint_volume(notification),
            AgentEvent::Bound { device_id, name } => self.restore_device(&device_id, &name),
            AgentEvent::Unbound => self.release_device(),
            AgentEvent::DevicesChanged(names) => {
                log::debug!("[Link {}] {} device(s) available", self.label, names.len());
            }
        }
    }

    fn on_endpoint_volume(&self, notification: EndpointNotification) {
        if !self.link_enabled() || !self.arbiter.try_take_lead(LinkSide::Endpoint) {
            return;
        }

        let gain_db = endpoint_to_engine(self.engine_range, notification.volume_scalar, self.deadzone_db);
        log::trace!(
            "[Link {}] device volume {:.3} -> {:.1} dB (muted: {})",
            self.label,
            notification.volume_scalar,
            gain_db,
            notification.muted
        );

        if let Err(e) = self.resource.set_mute(notification.muted) {
            log::warn!("[Link {}] failed to mirror mute: {}", self.label, e);
        }
        if let Err(e) = self.resource.set_gain(gain_db) {
            log::warn!("[Link {}] failed to mirror gain: {}", self.label, e);
        }
    }

    /// Apply the remembered state of a freshly bound device
    ///
    /// A device seen for the first time starts unlinked and unmuted, and that
    /// state is saved for it.
    fn restore_device(&self, device_id: &str, name: &str) {
        let Some(configured) = self.settings.device(device_id) else {
            log::info!("[Link {}] '{}' has no saved link state, link disabled", self.label, name);
            self.reset_state();
            self.persist_for(device_id, Some(name.to_string()), |device| {
                device.link_volume = false;
                device.mute = false;
            });
            return;
        };

        log::info!(
            "[Link {}] '{}' restored (link: {}, mute: {})",
            self.label,
            name,
            configured.link_volume,
            configured.mute
        );
        self.link_volume.store(configured.link_volume, Ordering::Release);
        if let Err(e) = self.resource.set_mute(configured.mute) {
            log::warn!("[Link {}] failed to restore mute: {}", self.label, e);
        }
    }

    /// Nothing is bound: stop mirroring and unmute the channel
    fn release_device(&self) {
        log::debug!("[Link {}] device released, link disabled", self.label);
        self.reset_state();
    }

    fn reset_state(&self) {
        self.link_volume.store(false, Ordering::Release);
        if let Err(e) = self.resource.set_mute(false) {
            log::warn!("[Link {}] failed to unmute: {}", self.label, e);
        }
    }

    /// Update the settings entry of the bound device, if any
    fn persist(&self, apply: impl FnOnce(&mut ConfiguredDevice)) {
        let Some(device_id) = self.agent.current_device_id() else {
            return;
        };
        self.persist_for(&device_id, self.agent.desired_device(), apply);
    }

    /// Update the settings entry of `device_id`, creating it if needed
    fn persist_for(&self, device_id: &str, device_name: Option<String>, apply: impl FnOnce(&mut ConfiguredDevice)) {
        let result = self.settings.update(|settings| {
            let entry = settings
                .configured_devices
                .entry(device_id.to_string())
                .or_insert_with(|| ConfiguredDevice {
                    device_name,
                    ..Default::default()
                });
            apply(entry);
        });
        if let Err(e) = result {
            log::warn!("[Link {}] {:#}", self.label, e);
        }
    }

    fn dispatch(&self, changes: Receiver<ResourceChange>, events: Receiver<AgentEvent>, cancel: &CancelToken) {
        log::debug!("[Link {}] dispatcher started", self.label);

        while !cancel.is_cancelled() {
            let inbound = flume::Selector::new()
                .recv(&changes, |r: Result<ResourceChange, RecvError>| r.map(Inbound::Engine))
                .recv(&events, |r: Result<AgentEvent, RecvError>| r.map(Inbound::Endpoint))
                .wait_timeout(DISPATCH_TIMEOUT);

            match inbound {
                Ok(Ok(Inbound::Engine(change))) => self.on_engine_change(change),
                Ok(Ok(Inbound::Endpoint(event))) => self.on_endpoint_event(event),
                Ok(Err(RecvError::Disconnected)) => {
                    log::debug!("[Link {}] source disconnected", self.label);
                    break;
                }
                // Timed out
                Err(_) => {}
            }
        }

        log::debug!("[Link {}] dispatcher stopped", self.label);
    }
}

/// Running link between one engine channel and one OS playback device
///
/// Dropping it stops the dispatcher and the endpoint agent.
pub struct ChannelLink {
    core: Arc<LinkCore>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl ChannelLink {
    /// Start linking `resource` to a device found through `backend`
    ///
    /// Timing and the deadzone come from the settings' tuning block.
    pub fn spawn(
        label: &str,
        resource: Arc<ResourceEntity>,
        backend: Box<dyn EndpointBackend>,
        settings: SharedSettings,
    ) -> LinkResult<Self> {
        let tuning = settings.tuning();
        let agent = AudioEndpointAgent::spawn(label, backend, tuning.agent_options())?;

        let core = Arc::new(LinkCore {
            label: label.to_string(),
            engine_range: gain_range(resource.kind()),
            resource,
            agent,
            arbiter: LinkArbiter::new(tuning.lease()),
            settings,
            link_volume: AtomicBool::new(false),
            deadzone_db: tuning.deadzone_db,
        });

        let changes = core.resource.subscribe();
        let events = core.agent.events();

        match core.resource.kind() {
            ResourceKind::Bus => core.follow_engine_device(&core.resource.device_name()),
            ResourceKind::Strip => core.agent.use_device(core.resource.virtual_device_name()),
        }

        let cancel = CancelToken::new();
        let dispatcher_core = core.clone();
        let dispatcher_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("link-{}", label))
            .spawn(move || dispatcher_core.dispatch(changes, events, &dispatcher_cancel))
            .map_err(|source| LinkError::Spawn {
                name: format!("link {}", label),
                source,
            })?;

        log::info!("[Link {}] started for {}", label, core.resource.key());

        Ok(Self {
            core,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }

    pub fn resource(&self) -> &Arc<ResourceEntity> {
        &self.core.resource
    }

    pub fn agent(&self) -> &AudioEndpointAgent {
        &self.core.agent
    }

    /// Whether volume is mirrored between channel and device
    pub fn link_volume(&self) -> bool {
        self.core.link_enabled()
    }

    /// Enable or disable mirroring; remembered for the bound device
    pub fn set_link_volume(&self, enabled: bool) {
        if self.core.link_volume.swap(enabled, Ordering::AcqRel) == enabled {
            return;
        }
        log::info!("[Link {}] link volume {}", self.core.label, if enabled { "on" } else { "off" });
        self.core.persist(|device| device.link_volume = enabled);
    }

    pub fn is_muted(&self) -> bool {
        self.core.resource.mute()
    }

    /// Mute the engine channel; remembered for the bound device
    pub fn set_mute(&self, muted: bool) -> LinkResult<()> {
        if self.core.resource.mute() == muted {
            return Ok(());
        }
        self.core.resource.set_mute(muted)?;
        self.core.persist(|device| device.mute = muted);
        Ok(())
    }

    /// Route a bus to another device
    ///
    /// The engine switches the bus; the link rebinds once the engine
    /// reports the new device.
    pub fn select_device(&self, name: &str) -> LinkResult<()> {
        let resource = &self.core.resource;
        if resource.kind() != ResourceKind::Bus {
            return Err(LinkError::NotMapped {
                kind: resource.kind(),
                property: Property::DesiredDevice,
            });
        }
        if resource.device_name() == name {
            return Ok(());
        }
        resource.set_desired_device(name)
    }

    /// Ask the agent to re-enumerate devices
    pub fn refresh_device_list(&self) {
        self.core.agent.request_rescan();
    }

    /// Playback device names from the last scan
    pub fn device_names(&self) -> Vec<String> {
        self.core.agent.device_names()
    }

    pub fn current_device_id(&self) -> Option<String> {
        self.core.agent.current_device_id()
    }

    /// Stop the dispatcher; the agent stops when the link is dropped
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[Link {}] dispatcher panicked", self.core.label);
            }
        }
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        self.stop();
    }
}
