//! Single funnel for writes to the remote engine
//!
//! In immediate mode every write is a synchronous remote call. In batched
//! mode writes accumulate in a pending change set (last write per parameter
//! wins) that `flush` submits as one `name = value` script. The engine
//! rejects a bad script as a whole, so a failed flush leaves both the engine
//! and the pending set untouched.

use crate::error::{LinkError, LinkResult, RemoteProtocolError};
use crate::params::ParamValue;
use crate::remote::RemoteEngine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// How writes reach the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Immediate,
    Batched,
}

/// Remote write funnel shared by every resource of a session
pub struct ChangeBatcher {
    engine: Arc<dyn RemoteEngine>,
    batched: AtomicBool,
    /// Remote name → serialised value
    pending: Mutex<BTreeMap<String, String>>,
}

impl ChangeBatcher {
    pub fn new(engine: Arc<dyn RemoteEngine>, mode: WriteMode) -> Self {
        Self {
            engine,
            batched: AtomicBool::new(mode == WriteMode::Batched),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn mode(&self) -> WriteMode {
        if self.batched.load(Ordering::Acquire) {
            WriteMode::Batched
        } else {
            WriteMode::Immediate
        }
    }

    /// Switch write mode
    ///
    /// Changes still pending when leaving batched mode stay queued and are
    /// submitted by the next flush after switching back.
    pub fn set_mode(&self, mode: WriteMode) {
        self.batched.store(mode == WriteMode::Batched, Ordering::Release);
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write one parameter, or stage it when batching
    pub fn write(&self, name: &str, value: &ParamValue) -> LinkResult<()> {
        if self.mode() == WriteMode::Batched {
            let value_text = script_value(name, value)?;
            self.pending().insert(name.to_string(), value_text);
            log::trace!("Batcher: staged {} = {}", name, value);
            return Ok(());
        }

        log::trace!("Batcher: writing {} = {}", name, value);
        match value {
            ParamValue::Float(v) => self.engine.set_float(name, *v),
            ParamValue::Bool(v) => self.engine.set_float(name, if *v { 1.0 } else { 0.0 }),
            ParamValue::Text(v) => self.engine.set_string(name, v),
        }
    }

    /// Submit all staged changes as one script
    ///
    /// Returns the number of parameters written. The pending set is cleared
    /// only after the engine accepted the script.
    pub fn flush(&self) -> LinkResult<usize> {
        self.require_batched("flush")?;

        let mut pending = self.pending();
        if pending.is_empty() {
            return Ok(0);
        }

        let script = render_script(&pending);
        match self.engine.set_script(&script) {
            Ok(()) => {
                let count = pending.len();
                pending.clear();
                log::debug!("Batcher: flushed {} change(s)", count);
                Ok(count)
            }
            Err(e) => {
                log::warn!("Batcher: flush of {} change(s) failed: {}", pending.len(), e);
                Err(e)
            }
        }
    }

    /// Drop all staged changes
    pub fn discard_pending(&self) -> LinkResult<()> {
        self.require_batched("discard_pending")?;
        let mut pending = self.pending();
        log::debug!("Batcher: discarding {} staged change(s)", pending.len());
        pending.clear();
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Script the next flush would submit
    pub fn pending_script(&self) -> String {
        render_script(&self.pending())
    }

    fn require_batched(&self, operation: &'static str) -> LinkResult<()> {
        if self.mode() == WriteMode::Immediate {
            log::error!("Batcher: {} called in immediate mode", operation);
            return Err(LinkError::ImmediateMode { operation });
        }
        Ok(())
    }
}

/// Serialise a value the way engine scripts expect it
///
/// Scripts have no escape syntax, so text containing a double quote or a
/// line break is rejected.
fn script_value(name: &str, value: &ParamValue) -> LinkResult<String> {
    let text = match value {
        ParamValue::Float(v) => v.to_string(),
        ParamValue::Bool(true) => "1".to_string(),
        ParamValue::Bool(false) => "0".to_string(),
        ParamValue::Text(v) => {
            let reason = if v.contains('"') {
                Some("contains a double quote")
            } else if v.contains(['\n', '\r']) {
                Some("spans several lines")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(RemoteProtocolError::InvalidText {
                    name: name.to_string(),
                    reason,
                }
                .into());
            }
            format!("\"{}\"", v)
        }
    };
    Ok(text)
}

fn render_script(pending: &BTreeMap<String, String>) -> String {
    pending
        .iter()
        .map(|(name, value)| format!("{} = {}\n", name, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::EngineVariant;
    use crate::remote::MemoryEngine;

    fn setup(mode: WriteMode) -> (Arc<MemoryEngine>, ChangeBatcher) {
        let engine = Arc::new(MemoryEngine::new(EngineVariant::Banana));
        engine.login().unwrap();
        let batcher = ChangeBatcher::new(engine.clone(), mode);
        (engine, batcher)
    }

    #[test]
    fn test_script_values() {
        let value = |v: ParamValue| script_value("Bus[0].Label", &v).unwrap();
        assert_eq!(value(ParamValue::Float(-3.5)), "-3.5");
        assert_eq!(value(ParamValue::Float(0.0)), "0");
        assert_eq!(value(ParamValue::Bool(true)), "1");
        assert_eq!(value(ParamValue::Bool(false)), "0");
        assert_eq!(value(ParamValue::Text("Main".into())), "\"Main\"");
    }

    #[test]
    fn test_unscriptable_text_is_rejected() {
        let (engine, batcher) = setup(WriteMode::Batched);

        for text in ["Say \"hi\"", "two\nlines"] {
            let err = batcher
                .write("Bus[0].Label", &ParamValue::Text(text.into()))
                .unwrap_err();
            assert!(matches!(
                err,
                LinkError::RemoteProtocol(RemoteProtocolError::InvalidText { .. })
            ));
        }
        assert_eq!(batcher.pending_count(), 0);

        // Immediate writes pass the string as is
        batcher.set_mode(WriteMode::Immediate);
        batcher
            .write("Bus[0].Label", &ParamValue::Text("Say \"hi\"".into()))
            .unwrap();
        assert_eq!(engine.peek_string("Bus[0].Label").as_deref(), Some("Say \"hi\""));
    }

    #[test]
    fn test_mode_switch_keeps_staged_changes() {
        let (engine, batcher) = setup(WriteMode::Batched);
        batcher.write("Bus[0].Gain", &ParamValue::Float(-6.0)).unwrap();

        batcher.set_mode(WriteMode::Immediate);
        assert_eq!(batcher.mode(), WriteMode::Immediate);
        batcher.write("Bus[1].Gain", &ParamValue::Float(-3.0)).unwrap();
        assert_eq!(engine.peek_float("Bus[1].Gain"), Some(-3.0));
        assert_eq!(batcher.pending_count(), 1);

        batcher.set_mode(WriteMode::Batched);
        assert_eq!(batcher.flush().unwrap(), 1);
        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(-6.0));
    }

    #[test]
    fn test_immediate_write_hits_engine() {
        let (engine, batcher) = setup(WriteMode::Immediate);

        batcher.write("Bus[0].Gain", &ParamValue::Float(-12.0)).unwrap();
        batcher.write("Bus[0].Mute", &ParamValue::Bool(true)).unwrap();

        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(-12.0));
        assert_eq!(engine.peek_float("Bus[0].Mute"), Some(1.0));
        assert_eq!(engine.write_count(), 2);
        assert_eq!(batcher.pending_count(), 0);
    }

    #[test]
    fn test_immediate_write_surfaces_errors() {
        let (_engine, batcher) = setup(WriteMode::Immediate);
        assert!(batcher.write("Bus[42].Gain", &ParamValue::Float(1.0)).is_err());
    }

    #[test]
    fn test_last_write_wins_in_batch() {
        let (engine, batcher) = setup(WriteMode::Batched);

        batcher.write("Bus[1].Gain", &ParamValue::Float(-1.0)).unwrap();
        batcher.write("Bus[1].Gain", &ParamValue::Float(-2.0)).unwrap();
        batcher.write("Bus[1].Gain", &ParamValue::Float(-3.0)).unwrap();
        assert_eq!(engine.write_count(), 0);

        assert_eq!(batcher.pending_script(), "Bus[1].Gain = -3\n");
        assert_eq!(batcher.flush().unwrap(), 1);

        assert_eq!(engine.last_script().as_deref(), Some("Bus[1].Gain = -3\n"));
        assert_eq!(engine.peek_float("Bus[1].Gain"), Some(-3.0));
        assert_eq!(batcher.pending_count(), 0);
    }

    #[test]
    fn test_failed_flush_keeps_pending() {
        let (engine, batcher) = setup(WriteMode::Batched);

        batcher.write("Bus[0].Gain", &ParamValue::Float(-6.0)).unwrap();
        batcher.write("Bus[0].Label", &ParamValue::Text("Out".into())).unwrap();
        engine.fail_scripts_at_line(Some(2));

        let err = batcher.flush().unwrap_err();
        assert!(matches!(err, LinkError::Script { line: 2, .. }));
        assert_eq!(batcher.pending_count(), 2);
        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(0.0));

        // Retry after the engine recovers
        engine.fail_scripts_at_line(None);
        assert_eq!(batcher.flush().unwrap(), 2);
        assert_eq!(engine.peek_string("Bus[0].Label").as_deref(), Some("Out"));
    }

    #[test]
    fn test_discard_pending() {
        let (engine, batcher) = setup(WriteMode::Batched);

        batcher.write("Strip[0].Mute", &ParamValue::Bool(true)).unwrap();
        batcher.discard_pending().unwrap();

        assert_eq!(batcher.flush().unwrap(), 0);
        assert_eq!(engine.write_count(), 0);
    }

    #[test]
    fn test_flush_in_immediate_mode_is_rejected() {
        let (_engine, batcher) = setup(WriteMode::Immediate);

        assert!(matches!(
            batcher.flush(),
            Err(LinkError::ImmediateMode { operation: "flush" })
        ));
        assert!(matches!(
            batcher.discard_pending(),
            Err(LinkError::ImmediateMode { operation: "discard_pending" })
        ));
    }

    #[test]
    fn test_not_logged_in_flush() {
        let engine = Arc::new(MemoryEngine::new(EngineVariant::Standard));
        let batcher = ChangeBatcher::new(engine, WriteMode::Batched);

        batcher.write("Bus[0].Gain", &ParamValue::Float(1.0)).unwrap();
        assert!(matches!(batcher.flush(), Err(LinkError::RemoteUnavailable)));
        assert_eq!(batcher.pending_count(), 1);
    }
}
