//! Live connection to one running engine
//!
//! A session discovers the engine's buses and strips, builds one
//! [`ResourceEntity`] per channel and keeps them refreshed with a
//! [`PollLoop`]. All entities share one [`ChangeBatcher`].

use crate::batcher::{ChangeBatcher, WriteMode};
use crate::cancel::CancelToken;
use crate::error::{LinkError, LinkResult, RemoteProtocolError};
use crate::params::{EngineVariant, ResourceKind};
use crate::poll::PollLoop;
use crate::remote::RemoteEngine;
use crate::resource::ResourceEntity;
use std::sync::Arc;
use std::time::Duration;

/// Default refresh period
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Poll period; `None` refreshes once at open and never again
    pub refresh_interval: Option<Duration>,
    pub write_mode: WriteMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Some(DEFAULT_REFRESH_INTERVAL),
            write_mode: WriteMode::Immediate,
        }
    }
}

/// Engine session with its discovered channels
pub struct Session {
    engine: Arc<dyn RemoteEngine>,
    variant: EngineVariant,
    buses: Vec<Arc<ResourceEntity>>,
    strips: Vec<Arc<ResourceEntity>>,
    batcher: Arc<ChangeBatcher>,
    cancel: CancelToken,
    poll: Option<PollLoop>,
}

impl Session {
    /// Discover channels and start refreshing them
    ///
    /// The engine must already be logged in (see [`crate::remote::connect`]).
    pub fn open(engine: Arc<dyn RemoteEngine>, options: SessionOptions) -> LinkResult<Self> {
        let variant = engine.engine_variant()?;
        let counts = engine.channel_counts()?;
        let batcher = Arc::new(ChangeBatcher::new(engine.clone(), options.write_mode));

        let build = |kind: ResourceKind| -> LinkResult<Vec<Arc<ResourceEntity>>> {
            (0..counts.count(kind))
                .map(|index| ResourceEntity::new(kind, index, variant, batcher.clone()).map(Arc::new))
                .collect()
        };
        let strips = build(ResourceKind::Strip)?;
        let buses = build(ResourceKind::Bus)?;

        log::info!(
            "Session: {} engine, {} strip(s), {} bus(es), {:?} writes",
            variant,
            strips.len(),
            buses.len(),
            options.write_mode
        );

        let cancel = CancelToken::new();
        let resources: Vec<Arc<ResourceEntity>> =
            strips.iter().chain(buses.iter()).cloned().collect();
        let poll = PollLoop::spawn(engine.clone(), resources, options.refresh_interval, cancel.clone())?;

        Ok(Self {
            engine,
            variant,
            buses,
            strips,
            batcher,
            cancel,
            poll: Some(poll),
        })
    }

    pub fn engine(&self) -> &Arc<dyn RemoteEngine> {
        &self.engine
    }

    pub fn variant(&self) -> EngineVariant {
        self.variant
    }

    pub fn batcher(&self) -> &Arc<ChangeBatcher> {
        &self.batcher
    }

    pub fn buses(&self) -> &[Arc<ResourceEntity>] {
        &self.buses
    }

    pub fn strips(&self) -> &[Arc<ResourceEntity>] {
        &self.strips
    }

    pub fn bus(&self, index: usize) -> LinkResult<&Arc<ResourceEntity>> {
        self.buses.get(index).ok_or_else(|| missing(ResourceKind::Bus, index))
    }

    pub fn strip(&self, index: usize) -> LinkResult<&Arc<ResourceEntity>> {
        self.strips.get(index).ok_or_else(|| missing(ResourceKind::Strip, index))
    }

    /// Token cancelled when the session closes
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop refreshing; entities stay readable but are no longer updated
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(mut poll) = self.poll.take() {
            poll.stop();
            log::info!("Session: closed after {} poll tick(s)", poll.ticks());
        }
    }
}

/// Channel index beyond what the engine reported
fn missing(kind: ResourceKind, index: usize) -> LinkError {
    RemoteProtocolError::UnknownParameter(format!("{}[{}]", kind, index)).into()
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use crate::remote::MemoryEngine;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn open(variant: EngineVariant, options: SessionOptions) -> (Arc<MemoryEngine>, Session) {
        let engine = Arc::new(MemoryEngine::new(variant));
        engine.login().unwrap();
        let session = Session::open(engine.clone(), options).unwrap();
        (engine, session)
    }

    #[test]
    fn test_discovers_layout() {
        let (_engine, session) = open(EngineVariant::Potato, SessionOptions::default());

        assert_eq!(session.variant(), EngineVariant::Potato);
        assert_eq!(session.strips().len(), 8);
        assert_eq!(session.buses().len(), 8);
        assert!(!session.bus(4).unwrap().is_virtual());
        assert!(session.bus(5).unwrap().is_virtual());
        assert_eq!(session.strip(7).unwrap().virtual_device_name(), Some("VoiceMeeter VAIO3 Input"));
        assert!(session.bus(8).is_err());
    }

    #[test]
    fn test_requires_login() {
        let engine = Arc::new(MemoryEngine::new(EngineVariant::Standard));
        assert!(matches!(
            Session::open(engine, SessionOptions::default()),
            Err(LinkError::RemoteUnavailable)
        ));
    }

    #[test]
    fn test_refreshes_engine_changes() {
        let options = SessionOptions {
            refresh_interval: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let (engine, session) = open(EngineVariant::Banana, options);

        engine.external_set("Bus[2].Gain", ParamValue::Float(-18.0));
        let bus = session.bus(2).unwrap().clone();
        assert!(wait_until(|| bus.gain() == -18.0));
    }

    #[test]
    fn test_batched_session() {
        let options = SessionOptions {
            refresh_interval: None,
            write_mode: WriteMode::Batched,
        };
        let (engine, session) = open(EngineVariant::Standard, options);

        session.strip(0).unwrap().set_gain(-5.0).unwrap();
        session.bus(1).unwrap().set_mute(true).unwrap();
        assert_eq!(engine.peek_float("Strip[0].Gain"), Some(0.0));

        assert_eq!(session.batcher().flush().unwrap(), 2);
        assert_eq!(engine.peek_float("Strip[0].Gain"), Some(-5.0));
        assert_eq!(engine.peek_float("Bus[1].Mute"), Some(1.0));
    }

    #[test]
    fn test_close_stops_refresh() {
        let options = SessionOptions {
            refresh_interval: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let (engine, mut session) = open(EngineVariant::Standard, options);
        session.close();
        assert!(session.cancel_token().is_cancelled());

        engine.external_set("Bus[0].Gain", ParamValue::Float(-30.0));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(session.bus(0).unwrap().gain(), 0.0);
    }
}
