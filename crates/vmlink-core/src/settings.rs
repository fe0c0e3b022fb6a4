//! Persisted link settings
//!
//! Per-device link state (link enabled, mute, friendly name), window
//! geometry, the engine variant to launch and timing knobs, stored as YAML.
//!
//! ```yaml
//! configured_devices:
//!   "{0.0.0.00000000}.{guid}":
//!     link_volume: true
//!     mute: false
//!     device_name: Speakers
//! engine_variant: banana
//! tuning:
//!   refresh_interval_ms: 150
//!   lease_ms: 200
//!   write_mode: immediate
//! ```

use crate::arbiter::DEFAULT_LEASE;
use crate::batcher::WriteMode;
use crate::endpoint::AgentOptions;
use crate::gain::DEFAULT_DEADZONE_DB;
use crate::params::EngineVariant;
use crate::session::SessionOptions;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Remembered state of one OS device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfiguredDevice {
    /// Mirror volume between engine and device
    pub link_volume: bool,
    pub mute: bool,
    pub device_name: Option<String>,
}

/// Timing and write behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTuning {
    /// Poll period; null refreshes once and never again
    pub refresh_interval_ms: Option<u64>,
    pub lease_ms: u64,
    pub agent_tick_ms: u64,
    pub rescan_interval_ms: u64,
    pub write_mode: WriteMode,
    /// Endpoint→engine results within this many dB of zero snap to 0 dB
    pub deadzone_db: f32,
}

impl Default for LinkTuning {
    fn default() -> Self {
        Self {
            refresh_interval_ms: Some(150),
            lease_ms: DEFAULT_LEASE.as_millis() as u64,
            agent_tick_ms: 50,
            rescan_interval_ms: 1000,
            write_mode: WriteMode::Immediate,
            deadzone_db: DEFAULT_DEADZONE_DB,
        }
    }
}

impl LinkTuning {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            refresh_interval: self.refresh_interval_ms.map(Duration::from_millis),
            write_mode: self.write_mode,
        }
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            tick: Duration::from_millis(self.agent_tick_ms),
            rescan_interval: Duration::from_millis(self.rescan_interval_ms),
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// Root settings document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Keyed by OS device id
    pub configured_devices: BTreeMap<String, ConfiguredDevice>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    /// Engine variant to launch when the engine is not running
    pub engine_variant: Option<EngineVariant>,
    pub tuning: LinkTuning,
}

/// Default settings file: `<config dir>/vmlink/settings.yaml`
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("vmlink")
        .join("settings.yaml")
}

/// Load a YAML document, falling back to defaults
///
/// A missing file yields defaults silently; an unreadable or invalid file
/// logs a warning and yields defaults.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("Settings: {:?} not found, using defaults", path);
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(config) => {
                log::info!("Settings: loaded {:?}", path);
                config
            }
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}, using defaults", path, e);
                T::default()
            }
        },
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

/// Save a YAML document, creating parent directories
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create settings directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize settings to YAML")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write settings file: {:?}", path))?;

    log::debug!("Settings: saved {:?}", path);
    Ok(())
}

/// Where settings live
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<LinkSettings>;

    fn save(&self, settings: &LinkSettings) -> Result<()>;
}

/// YAML file store
#[derive(Debug, Clone)]
pub struct YamlSettingsStore {
    path: PathBuf,
}

impl YamlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at [`default_settings_path`]
    pub fn at_default_path() -> Self {
        Self::new(default_settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for YamlSettingsStore {
    fn load(&self) -> Result<LinkSettings> {
        Ok(load_config(&self.path))
    }

    fn save(&self, settings: &LinkSettings) -> Result<()> {
        save_config(settings, &self.path)
    }
}

/// Volatile store, for tests and simulation
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    saved: Mutex<LinkSettings>,
    saves: Mutex<usize>,
}

impl MemorySettingsStore {
    pub fn new(initial: LinkSettings) -> Self {
        Self {
            saved: Mutex::new(initial),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last saved document
    pub fn saved(&self) -> LinkSettings {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<LinkSettings> {
        Ok(self.saved())
    }

    fn save(&self, settings: &LinkSettings) -> Result<()> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = settings.clone();
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

/// In-process settings cache over a store, shared by all links
#[derive(Clone)]
pub struct SharedSettings {
    store: Arc<dyn SettingsStore>,
    cache: Arc<RwLock<LinkSettings>>,
}

impl SharedSettings {
    /// Load from `store`; a failing store yields defaults
    pub fn open(store: Arc<dyn SettingsStore>) -> Self {
        let settings = store.load().unwrap_or_else(|e| {
            log::warn!("Settings: load failed: {:#}, using defaults", e);
            LinkSettings::default()
        });
        Self {
            store,
            cache: Arc::new(RwLock::new(settings)),
        }
    }

    /// Defaults in a volatile store
    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemorySettingsStore::default()))
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> LinkSettings {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn tuning(&self) -> LinkTuning {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).tuning.clone()
    }

    pub fn device(&self, device_id: &str) -> Option<ConfiguredDevice> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .configured_devices
            .get(device_id)
            .cloned()
    }

    /// Mutate and persist
    ///
    /// The cache keeps the change even if saving fails.
    pub fn update<R>(&self, f: impl FnOnce(&mut LinkSettings) -> R) -> Result<R> {
        let mut settings = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut *settings);
        self.store.save(&*settings).context("Failed to persist settings")?;
        Ok(result)
    }
}

impl std::fmt::Debug for SharedSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSettings")
            .field("settings", &self.get())
            .finish()
    }
}
