//! Native remote library binding
//!
//! The vendor library is loaded at runtime with `libloading`, so the crate
//! builds and tests on machines without the engine installed. Every call
//! goes through one mutex: the native API is not re-entrant.

use super::{
    check_get_result, check_script_result, check_set_result, ensure_logged_in, DeviceDriver,
    EngineDevice, EngineVersion, LoginStatus, RemoteEngine,
};
use crate::error::{LinkError, LinkResult, RemoteProtocolError};
use crate::params::EngineVariant;
use libloading::Library;
use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Size of string buffers handed to the native API (plus terminator)
const STRING_BUFFER_LEN: usize = 512 + 1;

/// Default install location of the engine
const DEFAULT_INSTALL_DIR: &str = r"C:\Program Files (x86)\VB\Voicemeeter";

#[cfg(target_pointer_width = "64")]
const LIBRARY_NAME: &str = "VoicemeeterRemote64.dll";
#[cfg(not(target_pointer_width = "64"))]
const LIBRARY_NAME: &str = "VoicemeeterRemote.dll";

type NoArgFn = unsafe extern "system" fn() -> i32;
type RunFn = unsafe extern "system" fn(i32) -> i32;
type OutIntFn = unsafe extern "system" fn(*mut i32) -> i32;
type GetFloatFn = unsafe extern "system" fn(*const c_char, *mut f32) -> i32;
type GetStringFn = unsafe extern "system" fn(*const c_char, *mut c_char) -> i32;
type SetFloatFn = unsafe extern "system" fn(*const c_char, f32) -> i32;
type SetStringFn = unsafe extern "system" fn(*const c_char, *const c_char) -> i32;
type SetScriptFn = unsafe extern "system" fn(*const c_char) -> i32;
type DeviceDescFn = unsafe extern "system" fn(i32, *mut i32, *mut c_char, *mut c_char) -> i32;

/// Resolved entry points; valid for as long as `_library` is loaded
struct Api {
    login: NoArgFn,
    logout: NoArgFn,
    run: RunFn,
    get_type: OutIntFn,
    get_version: OutIntFn,
    is_dirty: NoArgFn,
    get_float: GetFloatFn,
    get_string: GetStringFn,
    set_float: SetFloatFn,
    set_string: SetStringFn,
    set_script: SetScriptFn,
    device_count: NoArgFn,
    device_desc: DeviceDescFn,
    _library: Library,
}

impl Api {
    fn load(path: &Path) -> LinkResult<Self> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| LinkError::Library(format!("{}: {}", path.display(), e)))?;

        // Copy each fn pointer out of its Symbol; the Library is kept alongside
        macro_rules! symbol {
            ($ty:ty, $name:literal) => {
                *unsafe { library.get::<$ty>($name) }.map_err(|e| {
                    LinkError::Library(format!(
                        "missing symbol {}: {}",
                        String::from_utf8_lossy($name),
                        e
                    ))
                })?
            };
        }

        let login: NoArgFn = symbol!(NoArgFn, b"VBVMR_Login");
        let logout: NoArgFn = symbol!(NoArgFn, b"VBVMR_Logout");
        let run: RunFn = symbol!(RunFn, b"VBVMR_RunVoicemeeter");
        let get_type: OutIntFn = symbol!(OutIntFn, b"VBVMR_GetVoicemeeterType");
        let get_version: OutIntFn = symbol!(OutIntFn, b"VBVMR_GetVoicemeeterVersion");
        let is_dirty: NoArgFn = symbol!(NoArgFn, b"VBVMR_IsParametersDirty");
        let get_float: GetFloatFn = symbol!(GetFloatFn, b"VBVMR_GetParameterFloat");
        let get_string: GetStringFn = symbol!(GetStringFn, b"VBVMR_GetParameterStringA");
        let set_float: SetFloatFn = symbol!(SetFloatFn, b"VBVMR_SetParameterFloat");
        let set_string: SetStringFn = symbol!(SetStringFn, b"VBVMR_SetParameterStringA");
        let set_script: SetScriptFn = symbol!(SetScriptFn, b"VBVMR_SetParameters");
        let device_count: NoArgFn = symbol!(NoArgFn, b"VBVMR_Output_GetDeviceNumber");
        let device_desc: DeviceDescFn = symbol!(DeviceDescFn, b"VBVMR_Output_GetDeviceDescA");

        Ok(Self {
            login,
            logout,
            run,
            get_type,
            get_version,
            is_dirty,
            get_float,
            get_string,
            set_float,
            set_string,
            set_script,
            device_count,
            device_desc,
            _library: library,
        })
    }
}

/// Remote engine backed by the vendor's native library
pub struct DllEngine {
    api: Api,
    /// Login status; also serialises every native call
    status: Mutex<LoginStatus>,
}

impl DllEngine {
    /// Load the remote library from an explicit path
    pub fn load(path: impl AsRef<Path>) -> LinkResult<Self> {
        let path = path.as_ref();
        let api = Api::load(path)?;
        log::info!("Remote: loaded {}", path.display());
        Ok(Self {
            api,
            status: Mutex::new(LoginStatus::LoggedOff),
        })
    }

    /// Load from the library search path, then from the default install directory
    pub fn load_default() -> LinkResult<Self> {
        match Self::load(LIBRARY_NAME) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                log::debug!("Remote: {} not on search path ({}), trying install dir", LIBRARY_NAME, e);
                Self::load(Self::default_library_path())
            }
        }
    }

    pub fn default_library_path() -> PathBuf {
        Path::new(DEFAULT_INSTALL_DIR).join(LIBRARY_NAME)
    }

    /// Run `f` under the call lock after checking the session
    fn guarded<T>(
        &self,
        allow_not_running: bool,
        f: impl FnOnce(&Api, &mut LoginStatus) -> LinkResult<T>,
    ) -> LinkResult<T> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        ensure_logged_in(*status, allow_not_running)?;
        f(&self.api, &mut *status)
    }
}

fn c_name(name: &str) -> LinkResult<CString> {
    CString::new(name).map_err(|_| RemoteProtocolError::UnknownParameter(name.to_string()).into())
}

fn c_value(name: &str, value: &str) -> LinkResult<CString> {
    CString::new(value).map_err(|_| {
        RemoteProtocolError::InvalidText {
            name: name.to_string(),
            reason: "contains a NUL byte",
        }
        .into()
    })
}

fn buffer_to_string(buffer: &[u8]) -> String {
    CStr::from_bytes_until_nul(buffer)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(buffer).into_owned())
}

impl RemoteEngine for DllEngine {
    fn login(&self) -> LinkResult<LoginStatus> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let code = unsafe { (self.api.login)() };
        let result = LoginStatus::from_code(code)?;
        // A second login keeps the existing session usable
        *status = match result {
            LoginStatus::AlreadyLoggedIn => LoginStatus::Ok,
            other => other,
        };
        Ok(result)
    }

    fn logout(&self) -> LinkResult<()> {
        self.guarded(true, |api, status| {
            let code = unsafe { (api.logout)() };
            if code != 0 {
                return Err(RemoteProtocolError::Engine {
                    code,
                    context: "logout".into(),
                }
                .into());
            }
            *status = LoginStatus::LoggedOff;
            Ok(())
        })
    }

    fn status(&self) -> LoginStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_engine(&self, variant: EngineVariant) -> LinkResult<()> {
        self.guarded(true, |api, _| {
            let code = unsafe { (api.run)(variant.code()) };
            match code {
                0 => Ok(()),
                -1 => Err(LinkError::Library("engine is not installed".into())),
                other => Err(RemoteProtocolError::Engine {
                    code: other,
                    context: format!("run {}", variant),
                }
                .into()),
            }
        })
    }

    fn engine_variant(&self) -> LinkResult<EngineVariant> {
        // Also polled right after launch, before the session reports Ok
        self.guarded(true, |api, status| {
            let mut code = 0i32;
            let result = unsafe { (api.get_type)(&mut code) };
            if result != 0 {
                return Err(LinkError::EngineNotRunning);
            }
            let variant = EngineVariant::from_code(code).ok_or_else(|| {
                LinkError::from(RemoteProtocolError::Engine {
                    code,
                    context: "engine type".into(),
                })
            })?;
            *status = LoginStatus::Ok;
            Ok(variant)
        })
    }

    fn version(&self) -> LinkResult<EngineVersion> {
        self.guarded(false, |api, _| {
            let mut packed = 0i32;
            let result = unsafe { (api.get_version)(&mut packed) };
            if result != 0 {
                return Err(RemoteProtocolError::Engine {
                    code: result,
                    context: "version".into(),
                }
                .into());
            }
            Ok(EngineVersion::from_packed(packed))
        })
    }

    fn is_dirty(&self) -> LinkResult<bool> {
        self.guarded(false, |api, _| match unsafe { (api.is_dirty)() } {
            0 => Ok(false),
            1 => Ok(true),
            -2 => Err(LinkError::RemoteUnavailable),
            other => Err(RemoteProtocolError::Engine {
                code: other,
                context: "dirty check".into(),
            }
            .into()),
        })
    }

    fn get_float(&self, name: &str) -> LinkResult<f32> {
        let c = c_name(name)?;
        self.guarded(false, |api, _| {
            let mut value = 0f32;
            let code = unsafe { (api.get_float)(c.as_ptr(), &mut value) };
            check_get_result(code, name)?;
            Ok(value)
        })
    }

    fn get_string(&self, name: &str) -> LinkResult<String> {
        let c = c_name(name)?;
        self.guarded(false, |api, _| {
            let mut buffer = vec![0u8; STRING_BUFFER_LEN];
            let code = unsafe { (api.get_string)(c.as_ptr(), buffer.as_mut_ptr() as *mut c_char) };
            check_get_result(code, name)?;
            Ok(buffer_to_string(&buffer))
        })
    }

    fn set_float(&self, name: &str, value: f32) -> LinkResult<()> {
        let c = c_name(name)?;
        self.guarded(false, |api, _| {
            let code = unsafe { (api.set_float)(c.as_ptr(), value) };
            check_set_result(code, name)
        })
    }

    fn set_string(&self, name: &str, value: &str) -> LinkResult<()> {
        let c = c_name(name)?;
        let v = c_value(name, value)?;
        self.guarded(false, |api, _| {
            let code = unsafe { (api.set_string)(c.as_ptr(), v.as_ptr()) };
            check_set_result(code, name)
        })
    }

    fn set_script(&self, script: &str) -> LinkResult<()> {
        let c = CString::new(script).map_err(|_| LinkError::Script {
            line: 1,
            script: script.to_string(),
        })?;
        self.guarded(false, |api, _| {
            let code = unsafe { (api.set_script)(c.as_ptr()) };
            check_script_result(code, script)
        })
    }

    fn output_devices(&self) -> LinkResult<Vec<EngineDevice>> {
        self.guarded(false, |api, _| {
            let count = unsafe { (api.device_count)() };
            if count < 0 {
                return Err(RemoteProtocolError::Engine {
                    code: count,
                    context: "output device count".into(),
                }
                .into());
            }

            let mut devices = Vec::with_capacity(count as usize);
            for index in 0..count {
                let mut driver = 0i32;
                let mut name = vec![0u8; STRING_BUFFER_LEN];
                let mut hardware_id = vec![0u8; STRING_BUFFER_LEN];
                let code = unsafe {
                    (api.device_desc)(
                        index,
                        &mut driver,
                        name.as_mut_ptr() as *mut c_char,
                        hardware_id.as_mut_ptr() as *mut c_char,
                    )
                };
                if code != 0 {
                    log::warn!("Remote: output device {} description failed ({})", index, code);
                    continue;
                }
                devices.push(EngineDevice {
                    driver: DeviceDriver::from_code(driver),
                    name: buffer_to_string(&name),
                    hardware_id: buffer_to_string(&hardware_id),
                });
            }
            Ok(devices)
        })
    }
}

impl Drop for DllEngine {
    fn drop(&mut self) {
        if matches!(self.status(), LoginStatus::Ok | LoginStatus::EngineNotRunning) {
            if let Err(e) = self.logout() {
                log::warn!("Remote: logout on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_to_string() {
        let mut buffer = vec![0u8; 16];
        buffer[..5].copy_from_slice(b"Bus A");
        assert_eq!(buffer_to_string(&buffer), "Bus A");
        assert_eq!(buffer_to_string(b"no-terminator"), "no-terminator");
    }

    #[test]
    fn test_nul_in_value_is_protocol_error() {
        assert!(c_value("Bus[0].Label", "Main").is_ok());
        assert!(matches!(
            c_value("Bus[0].Label", "Ma\0in"),
            Err(LinkError::RemoteProtocol(RemoteProtocolError::InvalidText { name, .. })) if name == "Bus[0].Label"
        ));
        assert!(matches!(
            c_name("Bus[0].\0Gain"),
            Err(LinkError::RemoteProtocol(RemoteProtocolError::UnknownParameter(_)))
        ));
    }

    #[test]
    fn test_missing_library_is_library_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = DllEngine::load(dir.path().join("missing-remote.dll"));
        assert!(matches!(result, Err(LinkError::Library(_))));
    }

    #[test]
    fn test_default_library_path() {
        let path = DllEngine::default_library_path();
        assert!(path.ends_with(LIBRARY_NAME));
    }
}
