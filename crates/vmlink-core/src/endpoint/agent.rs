//! Worker thread owning one OS playback device
//!
//! The agent binds the device whose friendly name matches the desired name,
//! forwards its volume/mute notifications as [`AgentEvent`]s and applies
//! queued volume/mute commands. Callers never touch the device directly:
//! every public operation is a non-blocking write to shared state or the
//! command queue, picked up on the next loop iteration.
//!
//! Loop, once per tick:
//! 1. rescan devices if requested, if the backend reports a topology change,
//!    or periodically while the desired device is not bound
//! 2. unbind/rebind when the bound device no longer matches the desired name;
//!    after a topology change the bound device is reopened and resubscribed,
//!    since a replugged device keeps its id but drops its subscriptions
//! 3. drain the command queue (mute first, then volume); commands arriving
//!    while unbound are dropped
//! 4. sleep one tick

use super::{AgentEvent, EndpointBackend, EndpointDevice, EndpointInfo, VolumeSink};
use crate::cancel::CancelToken;
use crate::error::{LinkError, LinkResult};
use crate::gain::ENDPOINT_VOLUME_RANGE;
use flume::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Agent timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentOptions {
    /// Sleep between loop iterations
    pub tick: Duration,
    /// Rescan period while the desired device is unresolved
    pub rescan_interval: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            rescan_interval: Duration::from_secs(1),
        }
    }
}

/// Queued device write
#[derive(Debug, Clone, Copy)]
struct EndpointCommand {
    volume: Option<f32>,
    mute: Option<bool>,
}

/// State shared between callers and the worker
struct Shared {
    label: String,
    /// Written by callers
    desired: RwLock<Option<String>>,
    /// Written by the worker
    current_device_id: RwLock<Option<String>>,
    device_names: RwLock<Vec<String>>,
    rescan: AtomicBool,
}

impl Shared {
    fn desired(&self) -> Option<String> {
        self.desired.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_current(&self, id: Option<String>) {
        *self
            .current_device_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = id;
    }
}

/// Handle to a running endpoint agent
///
/// Dropping it stops the worker and releases the bound device.
pub struct AudioEndpointAgent {
    shared: Arc<Shared>,
    commands: Sender<EndpointCommand>,
    events: Receiver<AgentEvent>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl AudioEndpointAgent {
    /// Start an agent on its own thread
    ///
    /// `label` names the thread and prefixes log messages.
    pub fn spawn(
        label: &str,
        backend: Box<dyn EndpointBackend>,
        options: AgentOptions,
    ) -> LinkResult<Self> {
        let shared = Arc::new(Shared {
            label: label.to_string(),
            desired: RwLock::new(None),
            current_device_id: RwLock::new(None),
            device_names: RwLock::new(Vec::new()),
            rescan: AtomicBool::new(true),
        });
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let cancel = CancelToken::new();

        let worker = Worker {
            shared: shared.clone(),
            backend,
            commands: command_rx,
            events: event_tx,
            cancel: cancel.clone(),
            options,
            devices: Vec::new(),
            bound: None,
            reopen_bound: false,
            last_scan: None,
        };

        let handle = thread::Builder::new()
            .name(format!("endpoint-{}", label))
            .spawn(move || worker.run())
            .map_err(|source| LinkError::Spawn {
                name: format!("endpoint {}", label),
                source,
            })?;

        Ok(Self {
            shared,
            commands: command_tx,
            events: event_rx,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Queue a master volume change (clamped to 0..1)
    pub fn set_volume(&self, volume_scalar: f32) {
        let volume = ENDPOINT_VOLUME_RANGE.clamp(volume_scalar);
        let _ = self.commands.send(EndpointCommand {
            volume: Some(volume),
            mute: None,
        });
    }

    /// Queue a mute change
    pub fn set_mute(&self, muted: bool) {
        let _ = self.commands.send(EndpointCommand {
            volume: None,
            mute: Some(muted),
        });
    }

    /// Re-enumerate devices and republish the name list on the next iteration
    pub fn request_rescan(&self) {
        self.shared.rescan.store(true, Ordering::Release);
    }

    /// Select the device to bind by friendly name, or unbind with `None`
    pub fn use_device(&self, name: Option<&str>) {
        let mut desired = self.shared.desired.write().unwrap_or_else(|e| e.into_inner());
        let name = name.map(str::to_string);
        if *desired != name {
            log::debug!("[Endpoint {}] desired device -> {:?}", self.shared.label, name);
            *desired = name;
        }
    }

    pub fn desired_device(&self) -> Option<String> {
        self.shared.desired()
    }

    /// Id of the bound device (eventually consistent)
    pub fn current_device_id(&self) -> Option<String> {
        self.shared
            .current_device_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Friendly names from the last rescan
    pub fn device_names(&self) -> Vec<String> {
        self.shared
            .device_names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Event stream (single consumer)
    pub fn events(&self) -> Receiver<AgentEvent> {
        self.events.clone()
    }

    /// Stop the worker and wait for it
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            log::debug!("[Endpoint {}] waiting for worker to stop...", self.shared.label);
            if handle.join().is_err() {
                log::error!("[Endpoint {}] worker panicked", self.shared.label);
            }
        }
    }
}

impl Drop for AudioEndpointAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the worker thread
struct Worker {
    shared: Arc<Shared>,
    backend: Box<dyn EndpointBackend>,
    commands: Receiver<EndpointCommand>,
    events: Sender<AgentEvent>,
    cancel: CancelToken,
    options: AgentOptions,
    devices: Vec<EndpointInfo>,
    bound: Option<Box<dyn EndpointDevice>>,
    /// Set by a topology change while bound
    reopen_bound: bool,
    last_scan: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        log::info!("[Endpoint {}] worker started", self.shared.label);

        loop {
            let desired = self.shared.desired();

            if self.rescan_due(desired.is_some()) {
                self.rescan();
            }
            self.reconcile(desired.as_deref());
            self.drain_commands();

            if !self.cancel.sleep(self.options.tick) {
                break;
            }
        }

        self.unbind();
        log::info!("[Endpoint {}] worker stopped", self.shared.label);
    }

    fn rescan_due(&mut self, wants_device: bool) -> bool {
        let requested = self.shared.rescan.swap(false, Ordering::AcqRel);
        let topology_changed = self.backend.devices_changed();
        if topology_changed && self.bound.is_some() {
            self.reopen_bound = true;
        }
        let unresolved = wants_device && self.bound.is_none();
        let periodic = self
            .last_scan
            .map_or(true, |at| at.elapsed() >= self.options.rescan_interval);
        requested || topology_changed || (unresolved && periodic)
    }

    fn rescan(&mut self) {
        self.last_scan = Some(Instant::now());
        let devices = match self.backend.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                log::warn!("[Endpoint {}] device enumeration failed: {}", self.shared.label, e);
                return;
            }
        };

        let names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
        self.devices = devices;

        let mut published = self.shared.device_names.write().unwrap_or_else(|e| e.into_inner());
        if *published != names {
            log::debug!("[Endpoint {}] {} playback device(s)", self.shared.label, names.len());
            *published = names.clone();
            let _ = self.events.send(AgentEvent::DevicesChanged(names));
        }
    }

    /// Bring the bound device in line with the desired name
    fn reconcile(&mut self, desired: Option<&str>) {
        // First match by friendly name
        let wanted = desired.and_then(|name| self.devices.iter().find(|d| d.name == name).cloned());

        let bound_id = self.bound.as_ref().map(|d| d.id().to_string());
        let still_listed = bound_id
            .as_deref()
            .is_some_and(|id| self.devices.iter().any(|d| d.id == id));

        match (&bound_id, &wanted) {
            (Some(id), Some(info)) if *id == info.id && still_listed => {
                if std::mem::take(&mut self.reopen_bound) {
                    self.reopen(info);
                }
                return;
            }
            (None, None) => return,
            _ => {}
        }

        self.unbind();

        let Some(info) = wanted else {
            if let Some(name) = desired {
                log::trace!("[Endpoint {}] '{}' not available yet", self.shared.label, name);
            }
            return;
        };

        match self.bind(&info) {
            Ok(()) => {
                log::info!("[Endpoint {}] bound to '{}' ({})", self.shared.label, info.name, info.id);
            }
            // Transient; retried next iteration
            Err(e) => {
                log::debug!("[Endpoint {}] bind to '{}' failed: {}", self.shared.label, info.name, e);
            }
        }
    }

    fn open_subscribed(&mut self, id: &str) -> LinkResult<Box<dyn EndpointDevice>> {
        let mut device = self.backend.open(id)?;
        device.subscribe(VolumeSink::new(self.events.clone()))?;
        Ok(device)
    }

    fn bind(&mut self, info: &EndpointInfo) -> LinkResult<()> {
        let device = self.open_subscribed(&info.id)?;

        self.shared.set_current(Some(info.id.clone()));
        self.bound = Some(device);
        self.reopen_bound = false;
        let _ = self.events.send(AgentEvent::Bound {
            device_id: info.id.clone(),
            name: info.name.clone(),
        });
        Ok(())
    }

    /// Swap the bound handle for a fresh one of the same device
    ///
    /// The binding itself does not change, so no events are emitted.
    fn reopen(&mut self, info: &EndpointInfo) {
        if let Some(device) = self.bound.as_mut() {
            device.unsubscribe();
        }
        match self.open_subscribed(&info.id) {
            Ok(device) => {
                self.bound = Some(device);
                log::debug!("[Endpoint {}] resubscribed to '{}'", self.shared.label, info.name);
            }
            Err(e) => {
                log::debug!("[Endpoint {}] reopen of '{}' failed: {}", self.shared.label, info.name, e);
                self.unbind();
            }
        }
    }

    fn unbind(&mut self) {
        self.reopen_bound = false;
        if let Some(mut device) = self.bound.take() {
            device.unsubscribe();
            self.shared.set_current(None);
            let _ = self.events.send(AgentEvent::Unbound);
            log::info!("[Endpoint {}] released {}", self.shared.label, device.id());
        }
    }

    fn drain_commands(&mut self) {
        let mut failed = false;

        for command in self.commands.try_iter() {
            let Some(device) = self.bound.as_mut() else {
                log::trace!("[Endpoint {}] no device bound, dropping {:?}", self.shared.label, command);
                continue;
            };
            if let Some(muted) = command.mute {
                if let Err(e) = device.set_mute(muted) {
                    log::warn!("[Endpoint {}] set mute failed: {}", self.shared.label, e);
                    failed = true;
                }
            }
            if let Some(volume) = command.volume {
                if let Err(e) = device.set_volume_scalar(volume) {
                    log::warn!("[Endpoint {}] set volume failed: {}", self.shared.label, e);
                    failed = true;
                }
            }
        }

        // A failing device has usually gone away
        if failed {
            self.shared.rescan.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::VirtualEndpoints;

    fn fast() -> AgentOptions {
        AgentOptions {
            tick: Duration::from_millis(2),
            rescan_interval: Duration::from_millis(10),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_binds_by_name_and_applies_commands() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{spk}", "Speakers");
        endpoints.add_device("{hp}", "Headphones");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        agent.use_device(Some("Headphones"));
        assert!(wait_until(|| agent.current_device_id().as_deref() == Some("{hp}")));
        assert_eq!(agent.device_names(), vec!["Speakers", "Headphones"]);

        agent.set_mute(true);
        agent.set_volume(0.25);
        assert!(wait_until(|| endpoints.volume("{hp}") == Some(0.25)));
        assert_eq!(endpoints.is_muted("{hp}"), Some(true));
        assert_eq!(endpoints.volume("{spk}"), Some(1.0));
    }

    #[test]
    fn test_commands_while_unbound_are_dropped() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{spk}", "Speakers");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        agent.set_volume(0.1);
        thread::sleep(Duration::from_millis(20));

        agent.use_device(Some("Speakers"));
        assert!(wait_until(|| agent.current_device_id().is_some()));
        thread::sleep(Duration::from_millis(20));

        assert_eq!(endpoints.volume("{spk}"), Some(1.0));
        assert_eq!(endpoints.volume_write_count(), 0);
    }

    #[test]
    fn test_missing_device_binds_once_it_appears() {
        let endpoints = VirtualEndpoints::new();
        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();

        agent.use_device(Some("USB DAC"));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(agent.current_device_id(), None);

        endpoints.add_device("{dac}", "USB DAC");
        assert!(wait_until(|| agent.current_device_id().as_deref() == Some("{dac}")));
        assert_eq!(agent.desired_device().as_deref(), Some("USB DAC"));
    }

    #[test]
    fn test_switching_device_rebinds() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{a}", "Speakers");
        endpoints.add_device("{b}", "Headphones");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        agent.use_device(Some("Speakers"));
        assert!(wait_until(|| agent.current_device_id().as_deref() == Some("{a}")));

        agent.use_device(Some("Headphones"));
        assert!(wait_until(|| agent.current_device_id().as_deref() == Some("{b}")));
        assert_eq!(endpoints.subscriber_count("{a}"), 0);
        assert_eq!(endpoints.subscriber_count("{b}"), 1);

        agent.use_device(None);
        assert!(wait_until(|| agent.current_device_id().is_none()));
        assert_eq!(endpoints.subscriber_count("{b}"), 0);
    }

    #[test]
    fn test_removed_device_unbinds() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{a}", "Speakers");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        agent.use_device(Some("Speakers"));
        assert!(wait_until(|| agent.current_device_id().is_some()));

        endpoints.remove_device("{a}");
        assert!(wait_until(|| agent.current_device_id().is_none()));

        endpoints.add_device("{a2}", "Speakers");
        assert!(wait_until(|| agent.current_device_id().as_deref() == Some("{a2}")));
    }

    #[test]
    fn test_replugged_device_is_resubscribed() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{a}", "Speakers");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        let events = agent.events();
        agent.use_device(Some("Speakers"));
        assert!(wait_until(|| endpoints.subscriber_count("{a}") == 1));

        // Same id comes back, as a USB device does after a replug
        endpoints.remove_device("{a}");
        endpoints.add_device("{a}", "Speakers");

        assert!(wait_until(|| endpoints.subscriber_count("{a}") == 1));
        assert_eq!(agent.current_device_id().as_deref(), Some("{a}"));
        thread::sleep(Duration::from_millis(20));
        events.drain();

        endpoints.set_from_os("{a}", 0.3, false);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = None;
        while seen.is_none() && Instant::now() < deadline {
            if let Ok(AgentEvent::Volume(n)) = events.recv_timeout(Duration::from_millis(50)) {
                seen = Some(n);
            }
        }
        assert_eq!(seen.map(|n| n.volume_scalar), Some(0.3));

        agent.set_volume(0.6);
        assert!(wait_until(|| endpoints.volume("{a}") == Some(0.6)));
    }

    #[test]
    fn test_unrelated_topology_change_keeps_binding_quiet() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{a}", "Speakers");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        let events = agent.events();
        agent.use_device(Some("Speakers"));
        assert!(wait_until(|| agent.current_device_id().is_some()));
        thread::sleep(Duration::from_millis(20));
        events.drain();

        endpoints.add_device("{b}", "Headphones");
        assert!(wait_until(|| agent.device_names().len() == 2));
        thread::sleep(Duration::from_millis(20));

        let seen: Vec<AgentEvent> = events.drain().collect();
        assert!(seen
            .iter()
            .all(|e| !matches!(e, AgentEvent::Bound { .. } | AgentEvent::Unbound)));
        assert_eq!(endpoints.subscriber_count("{a}"), 1);
    }

    #[test]
    fn test_forwards_device_notifications() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{a}", "Speakers");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        let events = agent.events();
        agent.use_device(Some("Speakers"));
        assert!(wait_until(|| agent.current_device_id().is_some()));

        endpoints.set_from_os("{a}", 0.4, false);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = None;
        while seen.is_none() && Instant::now() < deadline {
            if let Ok(AgentEvent::Volume(n)) = events.recv_timeout(Duration::from_millis(50)) {
                seen = Some(n);
            }
        }
        let notification = seen.unwrap();
        assert_eq!(notification.device_id, "{a}");
        assert_eq!(notification.volume_scalar, 0.4);
    }

    #[test]
    fn test_drop_releases_device() {
        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{a}", "Speakers");

        let agent = AudioEndpointAgent::spawn("test", endpoints.backend(), fast()).unwrap();
        agent.use_device(Some("Speakers"));
        assert!(wait_until(|| endpoints.subscriber_count("{a}") == 1));

        drop(agent);
        assert_eq!(endpoints.subscriber_count("{a}"), 0);
    }
}
