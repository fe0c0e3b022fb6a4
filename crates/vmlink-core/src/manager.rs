//! All links of one session
//!
//! Physical buses follow the device the engine routes them to; virtual
//! strips follow their own playback device. Virtual buses and physical
//! strips have no OS device to pair with and get no link.

use crate::endpoint::EndpointBackend;
use crate::error::LinkResult;
use crate::link::ChannelLink;
use crate::params::ResourceKind;
use crate::session::Session;
use crate::settings::SharedSettings;

/// Owns the [`ChannelLink`]s created for a session
pub struct LinkManager {
    links: Vec<ChannelLink>,
}

impl LinkManager {
    /// Create one link per linkable channel
    ///
    /// `backend` is called once per link; every agent owns its backend.
    pub fn start<F>(session: &Session, mut backend: F, settings: SharedSettings) -> LinkResult<Self>
    where
        F: FnMut() -> Box<dyn EndpointBackend>,
    {
        let mut links = Vec::new();

        for bus in session.buses().iter().filter(|bus| !bus.is_virtual()) {
            let label = format!("Bus {}", bus.label());
            links.push(ChannelLink::spawn(&label, bus.clone(), backend(), settings.clone())?);
        }

        for strip in session.strips() {
            let Some(device) = strip.virtual_device_name() else {
                continue;
            };
            links.push(ChannelLink::spawn(device, strip.clone(), backend(), settings.clone())?);
        }

        log::info!("LinkManager: {} link(s) for {} engine", links.len(), session.variant());
        Ok(Self { links })
    }

    pub fn links(&self) -> &[ChannelLink] {
        &self.links
    }

    pub fn bus_links(&self) -> impl Iterator<Item = &ChannelLink> {
        self.by_kind(ResourceKind::Bus)
    }

    pub fn strip_links(&self) -> impl Iterator<Item = &ChannelLink> {
        self.by_kind(ResourceKind::Strip)
    }

    fn by_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ChannelLink> {
        self.links.iter().filter(move |link| link.resource().kind() == kind)
    }

    /// Link by label, e.g. "Bus A1" or "VoiceMeeter Input"
    pub fn link(&self, label: &str) -> Option<&ChannelLink> {
        self.links.iter().find(|link| link.label() == label)
    }

    /// Rescan playback devices on every link
    pub fn refresh_device_lists(&self) {
        log::debug!("LinkManager: refreshing device lists");
        for link in &self.links {
            link.refresh_device_list();
        }
    }

    /// Stop every link
    pub fn shutdown(&mut self) {
        for mut link in self.links.drain(..) {
            link.stop();
        }
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::VirtualEndpoints;
    use crate::params::EngineVariant;
    use crate::remote::{MemoryEngine, RemoteEngine};
    use crate::session::SessionOptions;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn open(variant: EngineVariant) -> Session {
        let engine = Arc::new(MemoryEngine::new(variant));
        engine.login().unwrap();
        let options = SessionOptions {
            refresh_interval: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        Session::open(engine, options).unwrap()
    }

    #[test]
    fn test_links_physical_buses_and_virtual_strips() {
        let session = open(EngineVariant::Banana);
        let endpoints = VirtualEndpoints::new();
        let manager = LinkManager::start(&session, || endpoints.backend(), SharedSettings::in_memory()).unwrap();

        let buses: Vec<&str> = manager.bus_links().map(|l| l.label()).collect();
        let strips: Vec<&str> = manager.strip_links().map(|l| l.label()).collect();
        assert_eq!(buses, vec!["Bus A1", "Bus A2", "Bus A3"]);
        assert_eq!(strips, vec!["VoiceMeeter Input", "VoiceMeeter AUX Input"]);
        assert!(manager.link("Bus B1").is_none());
    }

    #[test]
    fn test_standard_engine_link_count() {
        let session = open(EngineVariant::Standard);
        let endpoints = VirtualEndpoints::new();
        let manager = LinkManager::start(&session, || endpoints.backend(), SharedSettings::in_memory()).unwrap();

        assert_eq!(manager.links().len(), 2);
        assert!(manager.link("Bus A1").is_some());
        assert!(manager.link("VoiceMeeter Input").is_some());
    }

    #[test]
    fn test_refresh_device_lists_reaches_every_link() {
        let session = open(EngineVariant::Standard);
        let endpoints = VirtualEndpoints::new();
        let manager = LinkManager::start(&session, || endpoints.backend(), SharedSettings::in_memory()).unwrap();

        endpoints.add_device("{usb}", "USB DAC");
        manager.refresh_device_lists();

        let deadline = Instant::now() + Duration::from_secs(3);
        let everywhere = || {
            manager
                .links()
                .iter()
                .all(|l| l.device_names().contains(&"USB DAC".to_string()))
        };
        while !everywhere() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(everywhere());
    }

    #[test]
    fn test_end_to_end_device_volume_reaches_bus() {
        use crate::params::ParamValue;
        use crate::settings::{ConfiguredDevice, LinkSettings, MemorySettingsStore};

        let engine = Arc::new(MemoryEngine::new(EngineVariant::Banana));
        engine.login().unwrap();
        engine.external_set("Bus[0].device.name", ParamValue::Text("Speakers".into()));

        let endpoints = VirtualEndpoints::new();
        endpoints.add_device("{spk}", "Speakers");

        let mut document = LinkSettings::default();
        document.tuning.refresh_interval_ms = Some(5);
        document.tuning.agent_tick_ms = 2;
        document.configured_devices.insert(
            "{spk}".into(),
            ConfiguredDevice {
                link_volume: true,
                mute: false,
                device_name: Some("Speakers".into()),
            },
        );
        let settings = SharedSettings::open(Arc::new(MemorySettingsStore::new(document)));

        let session = Session::open(engine.clone(), settings.tuning().session_options()).unwrap();
        let manager = LinkManager::start(&session, || endpoints.backend(), settings).unwrap();
        let bus = manager.link("Bus A1").unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while !(bus.link_volume() && bus.current_device_id().is_some()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(bus.link_volume());
        // Past any lease taken by the first refresh
        thread::sleep(Duration::from_millis(250));

        endpoints.set_from_os("{spk}", 0.5, false);

        let deadline = Instant::now() + Duration::from_secs(3);
        while engine.peek_float("Bus[0].Gain") != Some(-24.0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(-24.0));
    }
}
