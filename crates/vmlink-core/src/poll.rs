//! Dirty-check driven refresh of engine state
//!
//! One thread per session. Each tick asks the engine whether anything
//! changed and, only if so, refreshes every resource. Ticks run back to back
//! on the same thread, so a slow tick delays the next one instead of
//! overlapping it. Without an interval the loop runs a single immediate tick
//! and exits.

use crate::cancel::CancelToken;
use crate::error::{LinkError, LinkResult};
use crate::remote::RemoteEngine;
use crate::resource::ResourceEntity;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to the running poll thread
///
/// Dropping it cancels the loop and waits for the current tick to finish.
pub struct PollLoop {
    cancel: CancelToken,
    ticks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl PollLoop {
    /// Start polling `resources`
    ///
    /// With `Some(interval)` the first tick happens after one interval; with
    /// `None` exactly one tick runs right away.
    pub fn spawn(
        engine: Arc<dyn RemoteEngine>,
        resources: Vec<Arc<ResourceEntity>>,
        interval: Option<Duration>,
        cancel: CancelToken,
    ) -> LinkResult<Self> {
        let ticks = Arc::new(AtomicU64::new(0));
        let ticks_clone = ticks.clone();
        let cancel_clone = cancel.clone();

        let handle = thread::Builder::new()
            .name("vm-poll".into())
            .spawn(move || {
                Self::run(engine.as_ref(), &resources, interval, &cancel_clone, &ticks_clone);
            })
            .map_err(|source| LinkError::Spawn {
                name: "poll".into(),
                source,
            })?;

        Ok(Self {
            cancel,
            ticks,
            handle: Some(handle),
        })
    }

    fn run(
        engine: &dyn RemoteEngine,
        resources: &[Arc<ResourceEntity>],
        interval: Option<Duration>,
        cancel: &CancelToken,
        ticks: &AtomicU64,
    ) {
        let Some(interval) = interval else {
            log::debug!("PollLoop: one-shot refresh of {} resource(s)", resources.len());
            if let Err(e) = run_tick(engine, resources) {
                log::warn!("PollLoop: refresh failed: {}", e);
            }
            ticks.fetch_add(1, Ordering::Relaxed);
            return;
        };

        log::info!(
            "PollLoop: started ({} resource(s), every {:?})",
            resources.len(),
            interval
        );

        while cancel.sleep(interval) {
            if let Err(e) = run_tick(engine, resources) {
                log::warn!("PollLoop: tick failed: {}", e);
            }
            ticks.fetch_add(1, Ordering::Relaxed);
        }

        log::info!("PollLoop: stopped");
    }

    /// Number of completed ticks
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Cancel and wait for the thread to exit
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("PollLoop: thread panicked");
            }
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run a single poll tick
///
/// Returns whether the engine reported changes. A resource that fails to
/// refresh is logged and skipped; the others are still refreshed.
pub fn run_tick(engine: &dyn RemoteEngine, resources: &[Arc<ResourceEntity>]) -> LinkResult<bool> {
    if !engine.is_dirty()? {
        return Ok(false);
    }

    for resource in resources {
        if let Err(e) = resource.refresh_from(engine) {
            log::warn!("PollLoop: refresh of {} failed: {}", resource.key(), e);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{ChangeBatcher, WriteMode};
    use crate::params::{EngineVariant, ParamValue, ResourceKind};
    use crate::remote::MemoryEngine;
    use std::time::Instant;

    fn setup() -> (Arc<MemoryEngine>, Vec<Arc<ResourceEntity>>) {
        let engine = Arc::new(MemoryEngine::new(EngineVariant::Standard));
        engine.login().unwrap();
        let batcher = Arc::new(ChangeBatcher::new(engine.clone(), WriteMode::Immediate));
        let resources = vec![
            Arc::new(ResourceEntity::new(ResourceKind::Bus, 0, EngineVariant::Standard, batcher.clone()).unwrap()),
            Arc::new(ResourceEntity::new(ResourceKind::Strip, 0, EngineVariant::Standard, batcher).unwrap()),
        ];
        (engine, resources)
    }

    #[test]
    fn test_clean_tick_reads_nothing() {
        let (engine, resources) = setup();
        engine.is_dirty().unwrap();
        engine.reset_counters();

        assert!(!run_tick(engine.as_ref(), &resources).unwrap());
        assert_eq!(engine.read_count(), 0);
    }

    #[test]
    fn test_dirty_tick_reads_each_descriptor_once() {
        let (engine, resources) = setup();
        let bus_changes = resources[0].subscribe();
        let strip_changes = resources[1].subscribe();
        engine.reset_counters();

        assert!(run_tick(engine.as_ref(), &resources).unwrap());

        // Bus on Standard: 6 readable; strip: Label, Gain, Mute, device.name
        assert_eq!(engine.read_count(), 10);
        assert_eq!(bus_changes.try_iter().count(), 6);
        assert_eq!(strip_changes.try_iter().count(), 4);
    }

    #[test]
    fn test_failing_resource_does_not_block_others() {
        let (engine, resources) = setup();
        engine.fail_reads_of("Bus[0].Label");
        engine.external_set("Strip[0].Gain", ParamValue::Float(-9.0));

        assert!(run_tick(engine.as_ref(), &resources).unwrap());
        assert_eq!(resources[1].gain(), -9.0);
    }

    #[test]
    fn test_one_shot_refresh() {
        let (engine, resources) = setup();
        engine.external_set("Bus[0].Gain", ParamValue::Float(-4.0));

        let mut poll = PollLoop::spawn(engine.clone(), resources.clone(), None, CancelToken::new()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while poll.ticks() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        poll.stop();

        assert_eq!(poll.ticks(), 1);
        assert_eq!(resources[0].gain(), -4.0);

        // No further refresh happens
        engine.external_set("Bus[0].Gain", ParamValue::Float(-8.0));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(resources[0].gain(), -4.0);
    }

    #[test]
    fn test_interval_polling_and_cancel() {
        let (engine, resources) = setup();
        let cancel = CancelToken::new();
        let poll = PollLoop::spawn(
            engine.clone(),
            resources.clone(),
            Some(Duration::from_millis(5)),
            cancel.clone(),
        )
        .unwrap();

        engine.external_set("Strip[0].Mute", ParamValue::Bool(true));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !resources[1].mute() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(resources[1].mute());

        cancel.cancel();
        drop(poll);

        engine.external_set("Strip[0].Mute", ParamValue::Bool(false));
        thread::sleep(Duration::from_millis(30));
        assert!(resources[1].mute());
    }

    #[test]
    fn test_cancel_mid_tick_finishes_the_tick() {
        let (engine, resources) = setup();
        engine.external_set("Bus[0].Gain", ParamValue::Float(-4.0));
        engine.external_set("Strip[0].Gain", ParamValue::Float(-9.0));
        engine.set_latency(Duration::from_millis(20));
        engine.reset_counters();

        let mut poll = PollLoop::spawn(
            engine.clone(),
            resources.clone(),
            Some(Duration::from_millis(1)),
            CancelToken::new(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.read_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(engine.read_count() > 0);
        assert!(engine.read_count() < 10);

        // Cancelled while the first refresh is still reading
        poll.stop();

        assert_eq!(engine.read_count(), 10);
        assert_eq!(resources[0].gain(), -4.0);
        assert_eq!(resources[1].gain(), -9.0);
        assert!(poll.ticks() >= 1);
    }
}
