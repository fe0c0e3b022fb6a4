//! In-process engine simulator
//!
//! Holds every parameter of the chosen variant in a map, reports dirtiness
//! like the real engine and counts reads and writes so callers can assert
//! on remote traffic. `external_set` plays the part of the engine's own UI.

use super::{
    check_get_result, check_script_result, check_set_result, ensure_logged_in, DeviceDriver,
    EngineDevice, EngineVersion, LoginStatus, RemoteEngine,
};
use crate::error::{LinkError, LinkResult};
use crate::params::{DescriptorTable, EngineVariant, ParamValue, ResourceKind, ValueKind};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Suffix of the write-only device selector and the parameter it updates
const DEVICE_SELECT_SUFFIX: &str = ".device.wdm";
const DEVICE_NAME_SUFFIX: &str = ".device.name";

#[derive(Debug)]
struct State {
    variant: EngineVariant,
    running: bool,
    status: LoginStatus,
    /// Float and bool parameters (bools are stored as 0.0/1.0, as the engine does)
    floats: HashMap<String, f32>,
    strings: HashMap<String, String>,
    dirty: bool,
    reads: usize,
    writes: usize,
    last_script: Option<String>,
    failing_reads: HashSet<String>,
    failing_script_line: Option<u32>,
    devices: Vec<EngineDevice>,
    /// Added to every parameter read and write
    latency: Duration,
}

impl State {
    /// Resolve a write to the parameter it actually stores into
    fn string_target(name: &str) -> String {
        match name.strip_suffix(DEVICE_SELECT_SUFFIX) {
            Some(prefix) => format!("{}{}", prefix, DEVICE_NAME_SUFFIX),
            None => name.to_string(),
        }
    }

    fn has_float(&self, name: &str) -> bool {
        self.floats.contains_key(name)
    }

    fn has_string(&self, name: &str) -> bool {
        self.strings.contains_key(&Self::string_target(name))
    }
}

/// Parsed script assignment
enum Assignment {
    Float(String, f32),
    Text(String, String),
}

/// Simulated remote engine
#[derive(Debug)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    /// Running engine of the given variant
    pub fn new(variant: EngineVariant) -> Self {
        Self::build(variant, true)
    }

    /// Installed but not running; login reports [`LoginStatus::EngineNotRunning`]
    pub fn stopped(variant: EngineVariant) -> Self {
        Self::build(variant, false)
    }

    fn build(variant: EngineVariant, running: bool) -> Self {
        let mut floats = HashMap::new();
        let mut strings = HashMap::new();
        let counts = variant.layout().counts();

        for kind in [ResourceKind::Strip, ResourceKind::Bus] {
            // Built-in tables are static and validated by their own tests
            let Ok(table) = DescriptorTable::for_kind(kind) else {
                continue;
            };
            for index in 0..counts.count(kind) {
                for desc in table.iter().filter(|d| d.applies_to(variant) && d.is_readable()) {
                    let name = desc.full_name(kind, index);
                    match desc.kind {
                        ValueKind::Float | ValueKind::Bool => {
                            floats.insert(name, 0.0);
                        }
                        ValueKind::String => {
                            strings.insert(name, String::new());
                        }
                    }
                }
            }
        }

        Self {
            state: Mutex::new(State {
                variant,
                running,
                status: LoginStatus::LoggedOff,
                floats,
                strings,
                dirty: true,
                reads: 0,
                writes: 0,
                last_script: None,
                failing_reads: HashSet::new(),
                failing_script_line: None,
                devices: Vec::new(),
                latency: Duration::ZERO,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change a parameter as if from the engine's own UI (not counted as a write)
    pub fn external_set(&self, name: &str, value: ParamValue) {
        let mut state = self.lock();
        match value {
            ParamValue::Float(v) => {
                state.floats.insert(name.to_string(), v);
            }
            ParamValue::Bool(v) => {
                state.floats.insert(name.to_string(), if v { 1.0 } else { 0.0 });
            }
            ParamValue::Text(v) => {
                let target = State::string_target(name);
                state.strings.insert(target, v);
            }
        }
        state.dirty = true;
    }

    /// Current float value without counting a read
    pub fn peek_float(&self, name: &str) -> Option<f32> {
        self.lock().floats.get(name).copied()
    }

    /// Current string value without counting a read
    pub fn peek_string(&self, name: &str) -> Option<String> {
        self.lock().strings.get(name).cloned()
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// Number of accepted single writes and scripts
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn reset_counters(&self) {
        let mut state = self.lock();
        state.reads = 0;
        state.writes = 0;
    }

    pub fn last_script(&self) -> Option<String> {
        self.lock().last_script.clone()
    }

    /// Make reads of `name` fail with a generic engine error
    pub fn fail_reads_of(&self, name: &str) {
        self.lock().failing_reads.insert(name.to_string());
    }

    pub fn clear_read_failures(&self) {
        self.lock().failing_reads.clear();
    }

    /// Reject every script on the given line (None to accept again)
    pub fn fail_scripts_at_line(&self, line: Option<u32>) {
        self.lock().failing_script_line = line;
    }

    pub fn set_output_devices(&self, devices: Vec<EngineDevice>) {
        self.lock().devices = devices;
    }

    /// Make every parameter read and write take at least `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Sleep the configured latency without holding the state lock
    fn round_trip(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }
    }

    fn parse_script(state: &State, script: &str) -> Result<Vec<Assignment>, u32> {
        let mut assignments = Vec::new();

        for (i, line) in script.lines().enumerate() {
            let line_no = i as u32 + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if state.failing_script_line == Some(line_no) {
                return Err(line_no);
            }

            let (name, value) = line.split_once('=').ok_or(line_no)?;
            let (name, value) = (name.trim(), value.trim());

            let assignment = if let Some(text) = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
            {
                if !state.has_string(name) {
                    return Err(line_no);
                }
                Assignment::Text(name.to_string(), text.to_string())
            } else {
                let parsed: f32 = value.parse().map_err(|_| line_no)?;
                if !state.has_float(name) {
                    return Err(line_no);
                }
                Assignment::Float(name.to_string(), parsed)
            };
            assignments.push(assignment);
        }

        Ok(assignments)
    }
}

impl RemoteEngine for MemoryEngine {
    fn login(&self) -> LinkResult<LoginStatus> {
        let mut state = self.lock();
        let result = match (state.status, state.running) {
            (LoginStatus::Ok, _) => LoginStatus::AlreadyLoggedIn,
            (_, true) => LoginStatus::Ok,
            (_, false) => LoginStatus::EngineNotRunning,
        };
        state.status = match result {
            LoginStatus::AlreadyLoggedIn => LoginStatus::Ok,
            other => other,
        };
        Ok(result)
    }

    fn logout(&self) -> LinkResult<()> {
        let mut state = self.lock();
        ensure_logged_in(state.status, true)?;
        state.status = LoginStatus::LoggedOff;
        Ok(())
    }

    fn status(&self) -> LoginStatus {
        self.lock().status
    }

    fn run_engine(&self, variant: EngineVariant) -> LinkResult<()> {
        let mut state = self.lock();
        ensure_logged_in(state.status, true)?;
        if state.variant != variant {
            return Err(LinkError::Library(format!("{} engine is not installed", variant)));
        }
        state.running = true;
        Ok(())
    }

    fn engine_variant(&self) -> LinkResult<EngineVariant> {
        let mut state = self.lock();
        ensure_logged_in(state.status, true)?;
        if !state.running {
            return Err(LinkError::EngineNotRunning);
        }
        state.status = LoginStatus::Ok;
        Ok(state.variant)
    }

    fn version(&self) -> LinkResult<EngineVersion> {
        let state = self.lock();
        ensure_logged_in(state.status, false)?;
        Ok(EngineVersion::from_packed((state.variant.code() << 24) | 0x0001_0009))
    }

    fn is_dirty(&self) -> LinkResult<bool> {
        let mut state = self.lock();
        ensure_logged_in(state.status, false)?;
        Ok(std::mem::take(&mut state.dirty))
    }

    fn get_float(&self, name: &str) -> LinkResult<f32> {
        self.round_trip();
        let mut state = self.lock();
        ensure_logged_in(state.status, false)?;
        state.reads += 1;
        if state.failing_reads.contains(name) {
            check_get_result(-1, name)?;
        }
        match state.floats.get(name) {
            Some(v) => Ok(*v),
            None => check_get_result(-3, name).map(|_| 0.0),
        }
    }

    fn get_string(&self, name: &str) -> LinkResult<String> {
        self.round_trip();
        let mut state = self.lock();
        ensure_logged_in(state.status, false)?;
        state.reads += 1;
        if state.failing_reads.contains(name) {
            check_get_result(-1, name)?;
        }
        match state.strings.get(name) {
            Some(v) => Ok(v.clone()),
            None => check_get_result(-3, name).map(|_| String::new()),
        }
    }

    fn set_float(&self, name: &str, value: f32) -> LinkResult<()> {
        self.round_trip();
        let mut state = self.lock();
        ensure_logged_in(state.status, false)?;
        if !state.has_float(name) {
            return check_set_result(-3, name);
        }
        state.floats.insert(name.to_string(), value);
        state.writes += 1;
        state.dirty = true;
        Ok(())
    }

    fn set_string(&self, name: &str, value: &str) -> LinkResult<()> {
        self.round_trip();
        let mut state = self.lock();
        ensure_logged_in(state.status, false)?;
        if !state.has_string(name) {
            return check_set_result(-3, name);
        }
        state.strings.insert(State::string_target(name), value.to_string());
        state.writes += 1;
        state.dirty = true;
        Ok(())
    }

    fn set_script(&self, script: &str) -> LinkResult<()> {
        self.round_trip();
        let mut state = self.lock();
        ensure_logged_in(state.status, false)?;

        let assignments = match Self::parse_script(&state, script) {
            Ok(assignments) => assignments,
            Err(line) => return check_script_result(line as i32, script),
        };

        for assignment in assignments {
            match assignment {
                Assignment::Float(name, value) => {
                    state.floats.insert(name, value);
                }
                Assignment::Text(name, value) => {
                    state.strings.insert(State::string_target(&name), value);
                }
            }
        }
        state.writes += 1;
        state.dirty = true;
        state.last_script = Some(script.to_string());
        Ok(())
    }

    fn output_devices(&self) -> LinkResult<Vec<EngineDevice>> {
        let state = self.lock();
        ensure_logged_in(state.status, false)?;
        Ok(state.devices.clone())
    }
}

impl EngineDevice {
    /// WDM device entry, as most OS playback devices are exposed
    pub fn wdm(name: &str) -> Self {
        Self {
            driver: DeviceDriver::Wdm,
            name: name.to_string(),
            hardware_id: format!("SIM\\{}", name.replace(' ', "_")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteProtocolError;

    fn logged_in(variant: EngineVariant) -> MemoryEngine {
        let engine = MemoryEngine::new(variant);
        engine.login().unwrap();
        engine
    }

    #[test]
    fn test_calls_require_login() {
        let engine = MemoryEngine::new(EngineVariant::Banana);
        assert!(matches!(engine.get_float("Bus[0].Gain"), Err(LinkError::RemoteUnavailable)));

        assert_eq!(engine.login().unwrap(), LoginStatus::Ok);
        assert_eq!(engine.login().unwrap(), LoginStatus::AlreadyLoggedIn);
        assert_eq!(engine.status(), LoginStatus::Ok);
        assert_eq!(engine.get_float("Bus[0].Gain").unwrap(), 0.0);

        engine.logout().unwrap();
        assert!(engine.is_dirty().is_err());
    }

    #[test]
    fn test_parameters_follow_layout() {
        let engine = logged_in(EngineVariant::Banana);

        assert!(engine.get_float("Bus[4].Gain").is_ok());
        assert!(engine.get_float("Strip[4].Mute").is_ok());
        assert!(matches!(
            engine.get_float("Bus[5].Gain"),
            Err(LinkError::RemoteProtocol(RemoteProtocolError::UnknownParameter(_)))
        ));
        // Potato-only parameter
        assert!(engine.get_float("Bus[0].EQ.AB").is_err());
    }

    #[test]
    fn test_dirty_flag() {
        let engine = logged_in(EngineVariant::Standard);

        assert!(engine.is_dirty().unwrap());
        assert!(!engine.is_dirty().unwrap());

        engine.external_set("Strip[0].Gain", ParamValue::Float(-6.0));
        assert!(engine.is_dirty().unwrap());
        assert_eq!(engine.write_count(), 0);
    }

    #[test]
    fn test_device_selection_updates_name() {
        let engine = logged_in(EngineVariant::Banana);

        engine.set_string("Bus[1].device.wdm", "Speakers").unwrap();
        assert_eq!(engine.get_string("Bus[1].device.name").unwrap(), "Speakers");
        assert_eq!(engine.write_count(), 1);
    }

    #[test]
    fn test_script_is_atomic() {
        let engine = logged_in(EngineVariant::Banana);

        let err = engine
            .set_script("Bus[0].Gain = -3\nBus[9].Gain = 1\n")
            .unwrap_err();
        assert!(matches!(err, LinkError::Script { line: 2, .. }));
        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(0.0));

        engine
            .set_script("Bus[0].Gain = -3.5\nBus[0].Label = \"Main\"\nBus[0].Mute = 1\n")
            .unwrap();
        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(-3.5));
        assert_eq!(engine.peek_float("Bus[0].Mute"), Some(1.0));
        assert_eq!(engine.peek_string("Bus[0].Label").as_deref(), Some("Main"));
        assert_eq!(engine.write_count(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let engine = logged_in(EngineVariant::Standard);

        engine.fail_scripts_at_line(Some(1));
        assert!(matches!(
            engine.set_script("Bus[0].Gain = 1\n"),
            Err(LinkError::Script { line: 1, .. })
        ));

        engine.fail_reads_of("Bus[0].Gain");
        assert!(engine.get_float("Bus[0].Gain").is_err());
        engine.clear_read_failures();
        assert!(engine.get_float("Bus[0].Gain").is_ok());
    }

    #[test]
    fn test_latency_applies_to_reads_and_writes() {
        let engine = logged_in(EngineVariant::Standard);
        engine.set_latency(Duration::from_millis(20));

        let started = std::time::Instant::now();
        engine.get_float("Bus[0].Gain").unwrap();
        engine.set_float("Bus[0].Gain", -1.0).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));

        // Counters are unaffected
        assert_eq!(engine.read_count(), 1);
        assert_eq!(engine.write_count(), 1);
    }
}
