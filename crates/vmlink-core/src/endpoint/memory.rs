//! In-process OS endpoint simulator
//!
//! Behaves like a real playback device: every volume or mute write, whether
//! from an agent or from [`VirtualEndpoints::set_from_os`], is pushed to all
//! subscribers. Cloning shares the same device set.

use super::{EndpointBackend, EndpointDevice, EndpointInfo, EndpointNotification, VolumeSink};
use crate::error::{LinkError, LinkResult};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct VirtualDevice {
    info: EndpointInfo,
    volume: f32,
    muted: bool,
    /// (subscription token, sink)
    sinks: Vec<(u64, VolumeSink)>,
}

impl VirtualDevice {
    fn broadcast(&mut self) {
        let notification = EndpointNotification {
            device_id: self.info.id.clone(),
            volume_scalar: self.volume,
            muted: self.muted,
        };
        self.sinks.retain(|(_, sink)| sink.notify(notification.clone()));
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<VirtualDevice>,
    /// Bumped on every add/remove
    generation: u64,
    next_token: u64,
    volume_writes: usize,
    mute_writes: usize,
}

impl Inner {
    fn device_mut(&mut self, id: &str) -> LinkResult<&mut VirtualDevice> {
        self.devices
            .iter_mut()
            .find(|d| d.info.id == id)
            .ok_or_else(|| LinkError::Endpoint(format!("device {} has been removed", id)))
    }
}

/// Shared set of simulated playback devices
#[derive(Debug, Clone, Default)]
pub struct VirtualEndpoints {
    inner: Arc<Mutex<Inner>>,
}

impl VirtualEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plug in a device (full volume, unmuted)
    pub fn add_device(&self, id: &str, name: &str) {
        let mut inner = self.lock();
        inner.devices.push(VirtualDevice {
            info: EndpointInfo {
                id: id.to_string(),
                name: name.to_string(),
            },
            volume: 1.0,
            muted: false,
            sinks: Vec::new(),
        });
        inner.generation += 1;
    }

    /// Unplug a device; its subscriptions end
    pub fn remove_device(&self, id: &str) {
        let mut inner = self.lock();
        inner.devices.retain(|d| d.info.id != id);
        inner.generation += 1;
    }

    /// Change volume and mute as a user would in the OS mixer
    pub fn set_from_os(&self, id: &str, volume: f32, muted: bool) {
        let mut inner = self.lock();
        if let Ok(device) = inner.device_mut(id) {
            device.volume = volume;
            device.muted = muted;
            device.broadcast();
        }
    }

    pub fn volume(&self, id: &str) -> Option<f32> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.info.id == id)
            .map(|d| d.volume)
    }

    pub fn is_muted(&self, id: &str) -> Option<bool> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.info.id == id)
            .map(|d| d.muted)
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        self.lock()
            .devices
            .iter()
            .find(|d| d.info.id == id)
            .map_or(0, |d| d.sinks.len())
    }

    /// Volume writes made through opened devices
    pub fn volume_write_count(&self) -> usize {
        self.lock().volume_writes
    }

    /// Mute writes made through opened devices
    pub fn mute_write_count(&self) -> usize {
        self.lock().mute_writes
    }

    /// Backend handle for one agent
    pub fn backend(&self) -> Box<dyn EndpointBackend> {
        Box::new(VirtualBackend {
            endpoints: self.clone(),
            seen_generation: self.lock().generation,
        })
    }
}

struct VirtualBackend {
    endpoints: VirtualEndpoints,
    seen_generation: u64,
}

impl EndpointBackend for VirtualBackend {
    fn enumerate(&mut self) -> LinkResult<Vec<EndpointInfo>> {
        let inner = self.endpoints.lock();
        self.seen_generation = inner.generation;
        Ok(inner.devices.iter().map(|d| d.info.clone()).collect())
    }

    fn open(&mut self, id: &str) -> LinkResult<Box<dyn EndpointDevice>> {
        let inner = self.endpoints.lock();
        if !inner.devices.iter().any(|d| d.info.id == id) {
            return Err(LinkError::DeviceUnavailable(id.to_string()));
        }
        Ok(Box::new(VirtualDeviceHandle {
            endpoints: self.endpoints.clone(),
            id: id.to_string(),
            token: None,
        }))
    }

    fn devices_changed(&mut self) -> bool {
        self.endpoints.lock().generation != self.seen_generation
    }
}

struct VirtualDeviceHandle {
    endpoints: VirtualEndpoints,
    id: String,
    token: Option<u64>,
}

impl EndpointDevice for VirtualDeviceHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn volume_scalar(&self) -> LinkResult<f32> {
        Ok(self.endpoints.lock().device_mut(&self.id)?.volume)
    }

    fn set_volume_scalar(&mut self, volume: f32) -> LinkResult<()> {
        let mut inner = self.endpoints.lock();
        let device = inner.device_mut(&self.id)?;
        device.volume = volume;
        device.broadcast();
        inner.volume_writes += 1;
        Ok(())
    }

    fn is_muted(&self) -> LinkResult<bool> {
        Ok(self.endpoints.lock().device_mut(&self.id)?.muted)
    }

    fn set_mute(&mut self, muted: bool) -> LinkResult<()> {
        let mut inner = self.endpoints.lock();
        let device = inner.device_mut(&self.id)?;
        device.muted = muted;
        device.broadcast();
        inner.mute_writes += 1;
        Ok(())
    }

    fn subscribe(&mut self, sink: VolumeSink) -> LinkResult<()> {
        self.unsubscribe();
        let mut inner = self.endpoints.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.device_mut(&self.id)?.sinks.push((token, sink));
        self.token = Some(token);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Some(token) = self.token.take() {
            let mut inner = self.endpoints.lock();
            if let Ok(device) = inner.device_mut(&self.id) {
                device.sinks.retain(|(t, _)| *t != token);
            }
        }
    }
}
