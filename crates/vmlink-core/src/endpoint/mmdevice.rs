//! Windows MMDevice endpoints
//!
//! Render devices come from `IMMDeviceEnumerator`; master volume and mute go
//! through `IAudioEndpointVolume`, whose change callback feeds the agent's
//! [`VolumeSink`]. An `IMMNotificationClient` flags topology changes for
//! [`EndpointBackend::devices_changed`].
//!
//! COM objects are created lazily on the agent's worker thread and never
//! leave it; the backend value itself is built empty on the caller's thread.

use super::{EndpointBackend, EndpointDevice, EndpointInfo, EndpointNotification, VolumeSink};
use crate::error::{LinkError, LinkResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use windows::core::{implement, HSTRING, PCWSTR, PWSTR};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::PROPERTYKEY;
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
};
use windows::Win32::Media::Audio::{
    eRender, EDataFlow, ERole, IMMDevice, IMMDeviceEnumerator, IMMNotificationClient,
    IMMNotificationClient_Impl, MMDeviceEnumerator, AUDIO_VOLUME_NOTIFICATION_DATA, DEVICE_STATE,
    DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};

fn com_error(context: &'static str) -> impl FnOnce(windows::core::Error) -> LinkError {
    move |e| LinkError::Endpoint(format!("{}: {}", context, e))
}

/// Flags any add/remove/state change of an audio endpoint
#[implement(IMMNotificationClient)]
struct TopologyWatcher {
    changed: Arc<AtomicBool>,
}

impl IMMNotificationClient_Impl for TopologyWatcher_Impl {
    fn OnDeviceStateChanged(&self, _device_id: &PCWSTR, _state: DEVICE_STATE) -> windows::core::Result<()> {
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    fn OnDeviceAdded(&self, _device_id: &PCWSTR) -> windows::core::Result<()> {
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    fn OnDeviceRemoved(&self, _device_id: &PCWSTR) -> windows::core::Result<()> {
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    fn OnDefaultDeviceChanged(&self, _flow: EDataFlow, _role: ERole, _device_id: &PCWSTR) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnPropertyValueChanged(&self, _device_id: &PCWSTR, _key: &PROPERTYKEY) -> windows::core::Result<()> {
        Ok(())
    }
}

/// Forwards endpoint volume changes of one device
#[implement(IAudioEndpointVolumeCallback)]
struct VolumeCallback {
    device_id: String,
    sink: VolumeSink,
}

impl IAudioEndpointVolumeCallback_Impl for VolumeCallback_Impl {
    fn OnNotify(&self, data: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
        // Valid for the duration of the call
        let Some(data) = (unsafe { data.as_ref() }) else {
            return Ok(());
        };
        self.sink.notify(EndpointNotification {
            device_id: self.device_id.clone(),
            volume_scalar: data.fMasterVolume,
            muted: data.bMuted.as_bool(),
        });
        Ok(())
    }
}

/// COM state, created on the worker thread
struct Com {
    enumerator: IMMDeviceEnumerator,
    watcher: IMMNotificationClient,
}

/// Render endpoints of the local machine
#[derive(Default)]
pub struct MmDeviceBackend {
    com: Option<Com>,
    changed: Arc<AtomicBool>,
}

// COM objects are only created and used on the thread that owns the agent
// worker; the value crosses threads while `com` is still None.
unsafe impl Send for MmDeviceBackend {}

impl MmDeviceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn com(&mut self) -> LinkResult<&Com> {
        if self.com.is_none() {
            // S_FALSE and RPC_E_CHANGED_MODE both leave COM usable on this thread
            let _ = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };

            let enumerator: IMMDeviceEnumerator = unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
                .map_err(com_error("create device enumerator"))?;

            let watcher: IMMNotificationClient = TopologyWatcher {
                changed: self.changed.clone(),
            }
            .into();
            unsafe { enumerator.RegisterEndpointNotificationCallback(&watcher) }
                .map_err(com_error("register device notifications"))?;

            log::debug!("MMDevice: enumerator ready");
            self.com = Some(Com { enumerator, watcher });
        }
        self.com
            .as_ref()
            .ok_or_else(|| LinkError::Endpoint("device enumerator unavailable".into()))
    }
}

impl Drop for MmDeviceBackend {
    fn drop(&mut self) {
        if let Some(com) = self.com.take() {
            if let Err(e) = unsafe { com.enumerator.UnregisterEndpointNotificationCallback(&com.watcher) } {
                log::warn!("MMDevice: unregister notifications failed: {}", e);
            }
        }
    }
}

fn device_id(device: &IMMDevice) -> LinkResult<String> {
    let raw: PWSTR = unsafe { device.GetId() }.map_err(com_error("read device id"))?;
    let id = unsafe { raw.to_string() };
    unsafe { CoTaskMemFree(Some(raw.0 as *const _)) };
    id.map_err(|e| LinkError::Endpoint(format!("device id is not UTF-16: {}", e)))
}

fn friendly_name(device: &IMMDevice) -> LinkResult<String> {
    let store = unsafe { device.OpenPropertyStore(STGM_READ) }.map_err(com_error("open property store"))?;
    let value = unsafe { store.GetValue(&PKEY_Device_FriendlyName) }.map_err(com_error("read friendly name"))?;
    Ok(value.to_string())
}

impl EndpointBackend for MmDeviceBackend {
    fn enumerate(&mut self) -> LinkResult<Vec<EndpointInfo>> {
        let enumerator = &self.com()?.enumerator;
        let collection = unsafe { enumerator.EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE) }
            .map_err(com_error("enumerate render endpoints"))?;
        let count = unsafe { collection.GetCount() }.map_err(com_error("count render endpoints"))?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = unsafe { collection.Item(index) }.map_err(com_error("read render endpoint"))?;
            devices.push(EndpointInfo {
                id: device_id(&device)?,
                name: friendly_name(&device)?,
            });
        }
        Ok(devices)
    }

    fn open(&mut self, id: &str) -> LinkResult<Box<dyn EndpointDevice>> {
        let enumerator = &self.com()?.enumerator;
        let device = unsafe { enumerator.GetDevice(&HSTRING::from(id)) }
            .map_err(|_| LinkError::DeviceUnavailable(id.to_string()))?;
        let volume: IAudioEndpointVolume =
            unsafe { device.Activate(CLSCTX_ALL, None) }.map_err(com_error("activate endpoint volume"))?;

        Ok(Box::new(MmDevice {
            id: id.to_string(),
            volume,
            callback: None,
        }))
    }

    fn devices_changed(&mut self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }
}

/// One opened render endpoint
struct MmDevice {
    id: String,
    volume: IAudioEndpointVolume,
    callback: Option<IAudioEndpointVolumeCallback>,
}

// Opened and used on the agent worker thread only
unsafe impl Send for MmDevice {}

impl EndpointDevice for MmDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn volume_scalar(&self) -> LinkResult<f32> {
        unsafe { self.volume.GetMasterVolumeLevelScalar() }.map_err(com_error("read master volume"))
    }

    fn set_volume_scalar(&mut self, volume: f32) -> LinkResult<()> {
        unsafe { self.volume.SetMasterVolumeLevelScalar(volume, std::ptr::null()) }
            .map_err(com_error("set master volume"))
    }

    fn is_muted(&self) -> LinkResult<bool> {
        unsafe { self.volume.GetMute() }
            .map(|muted| muted.as_bool())
            .map_err(com_error("read mute"))
    }

    fn set_mute(&mut self, muted: bool) -> LinkResult<()> {
        unsafe { self.volume.SetMute(muted, std::ptr::null()) }.map_err(com_error("set mute"))
    }

    fn subscribe(&mut self, sink: VolumeSink) -> LinkResult<()> {
        self.unsubscribe();
        let callback: IAudioEndpointVolumeCallback = VolumeCallback {
            device_id: self.id.clone(),
            sink,
        }
        .into();
        unsafe { self.volume.RegisterControlChangeNotify(&callback) }
            .map_err(com_error("register volume notifications"))?;
        self.callback = Some(callback);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Some(callback) = self.callback.take() {
            // Fails once the device is gone; the registration died with it
            if let Err(e) = unsafe { self.volume.UnregisterControlChangeNotify(&callback) } {
                log::debug!("MMDevice: unregister volume notifications for {} failed: {}", self.id, e);
            }
        }
    }
}

impl Drop for MmDevice {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
