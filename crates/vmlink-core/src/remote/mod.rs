//! Remote control API of the mixing engine
//!
//! [`RemoteEngine`] is the seam between the synchronisation logic and the
//! engine's native remote library. Two implementations are provided:
//!
//! - [`DllEngine`]: loads the vendor library at runtime (Windows only in practice)
//! - [`MemoryEngine`]: in-process simulator used by tests and `vm-inspect --simulate`
//!
//! The native API reports failures as small negative integers. The
//! `check_*_result` functions translate those codes into [`LinkError`]s so
//! both implementations surface identical errors.

mod dll;
mod memory;

pub use dll::DllEngine;
pub use memory::MemoryEngine;

use crate::error::{LinkError, LinkResult, RemoteProtocolError};
use crate::params::{ChannelCounts, EngineVariant};
use std::fmt;
use std::time::{Duration, Instant};

/// How often `connect` re-checks a freshly launched engine
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Session status after a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Ok,
    /// Logged in, but the engine application is not running
    EngineNotRunning,
    /// Remote library could not reach the engine service
    NoClient,
    AlreadyLoggedIn,
    LoggedOff,
}

impl LoginStatus {
    /// Translate a native login return code
    pub fn from_code(code: i32) -> LinkResult<Self> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::EngineNotRunning),
            -1 => Ok(Self::NoClient),
            -2 => Ok(Self::AlreadyLoggedIn),
            other => Err(RemoteProtocolError::Engine {
                code: other,
                context: "login".into(),
            }
            .into()),
        }
    }
}

/// Reject calls made without a usable session
///
/// Everything except login needs [`LoginStatus::Ok`]; logout and launching
/// the engine are also allowed while the engine is not running.
pub fn ensure_logged_in(status: LoginStatus, allow_not_running: bool) -> LinkResult<()> {
    match status {
        LoginStatus::Ok => Ok(()),
        LoginStatus::EngineNotRunning if allow_not_running => Ok(()),
        _ => Err(LinkError::RemoteUnavailable),
    }
}

/// Engine version, unpacked from the native 32-bit representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
}

impl EngineVersion {
    /// One byte per component, most significant first
    pub fn from_packed(packed: i32) -> Self {
        let [major, minor, patch, build] = (packed as u32).to_be_bytes();
        Self {
            major,
            minor,
            patch,
            build,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }
}

/// Driver model of an engine output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDriver {
    Mme,
    Wdm,
    Ks,
    Asio,
    Unknown(i32),
}

impl DeviceDriver {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Mme,
            3 => Self::Wdm,
            4 => Self::Ks,
            5 => Self::Asio,
            other => Self::Unknown(other),
        }
    }
}

/// Output device as enumerated by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDevice {
    pub driver: DeviceDriver,
    pub name: String,
    pub hardware_id: String,
}

/// Remote control session with the mixing engine
///
/// Implementations serialise their calls internally; all methods take `&self`
/// so one engine can be shared by the poll loop, the batcher and the links.
pub trait RemoteEngine: Send + Sync {
    /// Open the session
    ///
    /// [`status`](Self::status) reports the returned status afterwards, except
    /// that [`LoginStatus::AlreadyLoggedIn`] leaves the session at [`LoginStatus::Ok`].
    fn login(&self) -> LinkResult<LoginStatus>;

    fn logout(&self) -> LinkResult<()>;

    fn status(&self) -> LoginStatus;

    /// Launch the engine application
    fn run_engine(&self, variant: EngineVariant) -> LinkResult<()>;

    /// Variant of the running engine
    fn engine_variant(&self) -> LinkResult<EngineVariant>;

    fn version(&self) -> LinkResult<EngineVersion>;

    /// True if any parameter changed since the last call
    fn is_dirty(&self) -> LinkResult<bool>;

    fn get_float(&self, name: &str) -> LinkResult<f32>;

    fn get_string(&self, name: &str) -> LinkResult<String>;

    fn set_float(&self, name: &str, value: f32) -> LinkResult<()>;

    fn set_string(&self, name: &str, value: &str) -> LinkResult<()>;

    /// Apply a multi-line `name = value` script atomically
    fn set_script(&self, script: &str) -> LinkResult<()>;

    fn output_devices(&self) -> LinkResult<Vec<EngineDevice>>;

    /// Strip and bus counts of the running engine
    fn channel_counts(&self) -> LinkResult<ChannelCounts> {
        Ok(self.engine_variant()?.layout().counts())
    }
}

/// Translate the return code of a parameter read
pub fn check_get_result(code: i32, name: &str) -> LinkResult<()> {
    match code {
        0 => Ok(()),
        -2 => Err(LinkError::RemoteUnavailable),
        -3 => Err(RemoteProtocolError::UnknownParameter(name.to_string()).into()),
        -5 => Err(RemoteProtocolError::StructureMismatch(name.to_string()).into()),
        other => Err(RemoteProtocolError::Engine {
            code: other,
            context: format!("get {}", name),
        }
        .into()),
    }
}

/// Translate the return code of a single parameter write
pub fn check_set_result(code: i32, name: &str) -> LinkResult<()> {
    match code {
        0 => Ok(()),
        -2 => Err(LinkError::RemoteUnavailable),
        -3 => Err(RemoteProtocolError::UnknownParameter(name.to_string()).into()),
        other => Err(RemoteProtocolError::Engine {
            code: other,
            context: format!("set {}", name),
        }
        .into()),
    }
}

/// Translate the return code of a script write (positive = failing line)
pub fn check_script_result(code: i32, script: &str) -> LinkResult<()> {
    match code {
        0 => Ok(()),
        line if line > 0 => Err(LinkError::Script {
            line: line as u32,
            script: script.to_string(),
        }),
        -2 => Err(LinkError::RemoteUnavailable),
        other => Err(RemoteProtocolError::Engine {
            code: other,
            context: "script".into(),
        }
        .into()),
    }
}

/// Log in, launching the engine if needed
///
/// When the engine is installed but not running, the `remembered` variant
/// (from a previous session) is launched and waited for up to `timeout`.
/// Without a remembered variant the caller gets [`LinkError::EngineNotRunning`].
pub fn connect(
    engine: &dyn RemoteEngine,
    remembered: Option<EngineVariant>,
    timeout: Duration,
) -> LinkResult<EngineVariant> {
    let status = engine.login()?;
    log::info!("Remote: login status {:?}", status);

    match status {
        LoginStatus::Ok | LoginStatus::AlreadyLoggedIn => engine.engine_variant(),
        LoginStatus::EngineNotRunning => {
            let variant = remembered.ok_or(LinkError::EngineNotRunning)?;
            log::info!("Remote: launching {} engine", variant);
            engine.run_engine(variant)?;
            wait_for_engine(engine, timeout)
        }
        LoginStatus::NoClient | LoginStatus::LoggedOff => Err(LinkError::RemoteUnavailable),
    }
}

fn wait_for_engine(engine: &dyn RemoteEngine, timeout: Duration) -> LinkResult<EngineVariant> {
    let deadline = Instant::now() + timeout;
    loop {
        match engine.engine_variant() {
            Ok(variant) => {
                log::info!("Remote: {} engine is up", variant);
                return Ok(variant);
            }
            Err(e) if Instant::now() >= deadline => {
                log::warn!("Remote: engine did not come up within {:?}: {}", timeout, e);
                return Err(LinkError::EngineNotRunning);
            }
            Err(_) => std::thread::sleep(LAUNCH_POLL_INTERVAL),
        }
    }
}
