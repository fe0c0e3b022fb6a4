//! Cached, validated view of one engine channel
//!
//! A [`ResourceEntity`] mirrors one bus or strip. Reads come from the local
//! cache; writes are validated against the descriptor table and routed to
//! the session's [`ChangeBatcher`]. The poll loop refreshes the cache through
//! [`ResourceEntity::refresh_from`], which notifies subscribers of every
//! readable property, changed or not.

use crate::batcher::ChangeBatcher;
use crate::error::{LinkError, LinkResult};
use crate::params::{
    AccessMode, DescriptorTable, EngineVariant, Field, ParamValue, ParameterDescriptor, Property,
    ResourceKind, ValueKind,
};
use crate::remote::RemoteEngine;
use flume::{Receiver, Sender};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Identity of a channel: kind plus index, fixed for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub index: usize,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.index)
    }
}

/// Change notification emitted by a resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange {
    pub key: ResourceKey,
    pub property: Property,
    pub value: ParamValue,
}

/// Cached parameter values (one slot per backing field)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceState {
    pub label: String,
    pub gain: f32,
    pub mute: bool,
    pub mono: bool,
    pub eq_enabled: bool,
    pub eq_b_enabled: bool,
    pub device_name: String,
}

impl ResourceState {
    fn get(&self, field: Field) -> ParamValue {
        match field {
            Field::Label => ParamValue::Text(self.label.clone()),
            Field::Gain => ParamValue::Float(self.gain),
            Field::Mute => ParamValue::Bool(self.mute),
            Field::Mono => ParamValue::Bool(self.mono),
            Field::EqEnabled => ParamValue::Bool(self.eq_enabled),
            Field::EqBEnabled => ParamValue::Bool(self.eq_b_enabled),
            Field::DeviceName => ParamValue::Text(self.device_name.clone()),
        }
    }

    /// Store a value; the caller has already checked that its kind matches the field
    fn put(&mut self, field: Field, value: ParamValue) {
        match (field, value) {
            (Field::Label, ParamValue::Text(v)) => self.label = v,
            (Field::Gain, ParamValue::Float(v)) => self.gain = v,
            (Field::Mute, ParamValue::Bool(v)) => self.mute = v,
            (Field::Mono, ParamValue::Bool(v)) => self.mono = v,
            (Field::EqEnabled, ParamValue::Bool(v)) => self.eq_enabled = v,
            (Field::EqBEnabled, ParamValue::Bool(v)) => self.eq_b_enabled = v,
            (Field::DeviceName, ParamValue::Text(v)) => self.device_name = v,
            (field, value) => {
                log::error!("Resource: dropped {:?} value for field {:?}", value.kind(), field)
            }
        }
    }
}

/// Kind-specific discovery metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discovery {
    Bus { is_virtual: bool },
    Strip { virtual_device_name: Option<&'static str> },
}

/// One bus or strip of the running engine
pub struct ResourceEntity {
    key: ResourceKey,
    variant: EngineVariant,
    discovery: Discovery,
    /// Display label, e.g. "A1" or "Strip 4"
    label: String,
    table: &'static DescriptorTable,
    state: RwLock<ResourceState>,
    batcher: Arc<ChangeBatcher>,
    subscribers: Mutex<Vec<Sender<ResourceChange>>>,
}

impl ResourceEntity {
    /// Create the entity for `kind[index]` on the given variant
    pub fn new(
        kind: ResourceKind,
        index: usize,
        variant: EngineVariant,
        batcher: Arc<ChangeBatcher>,
    ) -> LinkResult<Self> {
        let table = DescriptorTable::for_kind(kind)?;
        let layout = variant.layout();

        let (discovery, label) = match kind {
            ResourceKind::Bus => (
                Discovery::Bus {
                    is_virtual: layout.is_virtual_bus(index),
                },
                layout.bus_label(index),
            ),
            ResourceKind::Strip => (
                Discovery::Strip {
                    virtual_device_name: layout.virtual_device_name(index),
                },
                format!("Strip {}", index + 1),
            ),
        };

        Ok(Self {
            key: ResourceKey { kind, index },
            variant,
            discovery,
            label,
            table,
            state: RwLock::new(ResourceState::default()),
            batcher,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn kind(&self) -> ResourceKind {
        self.key.kind
    }

    pub fn index(&self) -> usize {
        self.key.index
    }

    pub fn variant(&self) -> EngineVariant {
        self.variant
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bus: fixed at discovery. Strip: true while the engine reports no device.
    pub fn is_virtual(&self) -> bool {
        match self.discovery {
            Discovery::Bus { is_virtual } => is_virtual,
            Discovery::Strip { .. } => self.read_state().device_name.trim().is_empty(),
        }
    }

    /// OS playback device behind a virtual strip
    pub fn virtual_device_name(&self) -> Option<&'static str> {
        match self.discovery {
            Discovery::Strip { virtual_device_name } => virtual_device_name,
            Discovery::Bus { .. } => None,
        }
    }

    pub fn descriptors(&self) -> &'static DescriptorTable {
        self.table
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ResourceState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ResourceState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the whole cache
    pub fn snapshot(&self) -> ResourceState {
        self.read_state().clone()
    }

    fn descriptor(&self, property: Property) -> LinkResult<&'static ParameterDescriptor> {
        self.table.get(property).ok_or(LinkError::NotMapped {
            kind: self.key.kind,
            property,
        })
    }

    /// Cached value of a property
    pub fn get(&self, property: Property) -> LinkResult<ParamValue> {
        let desc = self.descriptor(property)?;
        Ok(self.read_state().get(desc.field))
    }

    /// Validate and store a new value
    ///
    /// Equal values are a silent no-op. Out-of-range floats are rejected with
    /// the cache untouched. Read-only properties only update the cache and
    /// notify; everything else is written through the batcher, and cached
    /// only once that write succeeded.
    pub fn set(&self, property: Property, value: ParamValue) -> LinkResult<()> {
        let desc = self.descriptor(property)?;

        if value.kind() != desc.kind {
            return Err(LinkError::TypeMismatch {
                property,
                expected: desc.kind,
                found: value.kind(),
            });
        }

        if self.read_state().get(desc.field) == value {
            return Ok(());
        }

        if let (Some(range), ParamValue::Float(v)) = (desc.range, &value) {
            if !range.contains(*v) {
                return Err(LinkError::RangeViolation {
                    property,
                    value: *v,
                    min: range.min,
                    max: range.max,
                });
            }
        }

        if !desc.applies_to(self.variant) {
            return Err(LinkError::NotApplicable {
                property,
                variant: self.variant,
            });
        }

        if desc.access == AccessMode::ReadOnly {
            self.write_state().put(desc.field, value.clone());
            self.notify(property, value);
            return Ok(());
        }

        // Cache lock is not held across the remote call
        let name = desc.full_name(self.key.kind, self.key.index);
        self.batcher.write(&name, &value)?;
        self.write_state().put(desc.field, value);
        Ok(())
    }

    /// Re-read every readable parameter from the engine
    ///
    /// All reads happen before anything is stored, so a failed read leaves
    /// the cache as it was. On success one notification per readable
    /// property is emitted. Returns the number of parameters read.
    pub fn refresh_from(&self, engine: &dyn RemoteEngine) -> LinkResult<usize> {
        let mut values = Vec::new();

        for desc in self.table.readable(self.variant) {
            let name = desc.full_name(self.key.kind, self.key.index);
            let value = match desc.kind {
                ValueKind::Float => {
                    let raw = engine.get_float(&name)?;
                    ParamValue::Float(desc.range.map_or(raw, |r| r.clamp(raw)))
                }
                ValueKind::Bool => ParamValue::Bool(engine.get_float(&name)? != 0.0),
                ValueKind::String => ParamValue::Text(engine.get_string(&name)?),
            };
            values.push((desc.property, desc.field, value));
        }

        {
            let mut state = self.write_state();
            for (_, field, value) in &values {
                state.put(*field, value.clone());
            }
        }

        let count = values.len();
        for (property, _, value) in values {
            self.notify(property, value);
        }
        Ok(count)
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> Receiver<ResourceChange> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn notify(&self, property: Property, value: ParamValue) {
        let change = ResourceChange {
            key: self.key,
            property,
            value,
        };
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    // Typed accessors

    pub fn name(&self) -> String {
        self.read_state().label.clone()
    }

    pub fn set_name(&self, name: &str) -> LinkResult<()> {
        self.set(Property::Name, ParamValue::Text(name.to_string()))
    }

    /// Gain in dB
    pub fn gain(&self) -> f32 {
        self.read_state().gain
    }

    pub fn set_gain(&self, gain_db: f32) -> LinkResult<()> {
        self.set(Property::Gain, ParamValue::Float(gain_db))
    }

    pub fn mute(&self) -> bool {
        self.read_state().mute
    }

    pub fn set_mute(&self, mute: bool) -> LinkResult<()> {
        self.set(Property::Mute, ParamValue::Bool(mute))
    }

    pub fn mono(&self) -> bool {
        self.read_state().mono
    }

    pub fn set_mono(&self, mono: bool) -> LinkResult<()> {
        self.set(Property::Mono, ParamValue::Bool(mono))
    }

    pub fn eq_enabled(&self) -> bool {
        self.read_state().eq_enabled
    }

    pub fn set_eq_enabled(&self, enabled: bool) -> LinkResult<()> {
        self.set(Property::EqEnabled, ParamValue::Bool(enabled))
    }

    /// True when EQ memory slot B is selected
    pub fn eq_b_enabled(&self) -> bool {
        self.read_state().eq_b_enabled
    }

    pub fn set_eq_b_enabled(&self, enabled: bool) -> LinkResult<()> {
        self.set(Property::EqBEnabled, ParamValue::Bool(enabled))
    }

    /// Device the engine reports for this channel
    pub fn device_name(&self) -> String {
        self.read_state().device_name.clone()
    }

    /// Ask the engine to route this channel to a WDM device
    pub fn set_desired_device(&self, name: &str) -> LinkResult<()> {
        self.set(Property::DesiredDevice, ParamValue::Text(name.to_string()))
    }
}

impl fmt::Debug for ResourceEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEntity")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("state", &*self.read_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::WriteMode;
    use crate::remote::MemoryEngine;

    fn setup(kind: ResourceKind, index: usize) -> (Arc<MemoryEngine>, ResourceEntity) {
        let engine = Arc::new(MemoryEngine::new(EngineVariant::Banana));
        engine.login().unwrap();
        let batcher = Arc::new(ChangeBatcher::new(engine.clone(), WriteMode::Immediate));
        let entity = ResourceEntity::new(kind, index, EngineVariant::Banana, batcher).unwrap();
        (engine, entity)
    }

    #[test]
    fn test_range_is_enforced() {
        let (engine, bus) = setup(ResourceKind::Bus, 0);

        bus.set_gain(-12.0).unwrap();
        assert_eq!(bus.gain(), -12.0);

        let err = bus.set_gain(12.5).unwrap_err();
        assert!(matches!(err, LinkError::RangeViolation { property: Property::Gain, .. }));
        assert!(bus.set_gain(-60.5).is_err());
        assert!(bus.set_gain(f32::NAN).is_err());

        assert_eq!(bus.gain(), -12.0);
        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(-12.0));

        bus.set_gain(12.0).unwrap();
        bus.set_gain(-60.0).unwrap();
        assert_eq!(engine.write_count(), 3);
    }

    #[test]
    fn test_noop_write_is_silent() {
        let (engine, strip) = setup(ResourceKind::Strip, 1);
        let changes = strip.subscribe();

        strip.set_mute(false).unwrap();
        strip.set_gain(0.0).unwrap();

        assert_eq!(engine.write_count(), 0);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_read_write_property_does_not_notify() {
        let (engine, strip) = setup(ResourceKind::Strip, 0);
        let changes = strip.subscribe();

        strip.set_mute(true).unwrap();

        assert!(strip.mute());
        assert_eq!(engine.peek_float("Strip[0].Mute"), Some(1.0));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_read_only_property_notifies_without_remote_write() {
        let (engine, bus) = setup(ResourceKind::Bus, 0);
        let changes = bus.subscribe();

        bus.set(Property::DeviceName, ParamValue::Text("Speakers".into()))
            .unwrap();

        assert_eq!(bus.device_name(), "Speakers");
        assert_eq!(engine.write_count(), 0);
        let change = changes.try_recv().unwrap();
        assert_eq!(change.property, Property::DeviceName);
        assert_eq!(change.value, ParamValue::Text("Speakers".into()));
    }

    #[test]
    fn test_desired_device_shares_device_field() {
        let (engine, bus) = setup(ResourceKind::Bus, 1);

        bus.set_desired_device("Headphones").unwrap();

        assert_eq!(bus.device_name(), "Headphones");
        assert_eq!(engine.peek_string("Bus[1].device.name").as_deref(), Some("Headphones"));
    }

    #[test]
    fn test_type_and_mapping_errors() {
        let (_engine, strip) = setup(ResourceKind::Strip, 0);

        assert!(matches!(
            strip.set(Property::Gain, ParamValue::Bool(true)),
            Err(LinkError::TypeMismatch { .. })
        ));
        assert!(matches!(
            strip.set_mono(true),
            Err(LinkError::NotMapped { kind: ResourceKind::Strip, .. })
        ));
    }

    #[test]
    fn test_variant_specific_write_is_rejected() {
        let (_engine, bus) = setup(ResourceKind::Bus, 0);
        assert!(matches!(
            bus.set_eq_b_enabled(true),
            Err(LinkError::NotApplicable { variant: EngineVariant::Banana, .. })
        ));
    }

    #[test]
    fn test_failed_remote_write_leaves_cache() {
        let (engine, bus) = setup(ResourceKind::Bus, 0);
        engine.logout().unwrap();

        assert!(matches!(bus.set_gain(-3.0), Err(LinkError::RemoteUnavailable)));
        assert_eq!(bus.gain(), 0.0);
    }

    #[test]
    fn test_reads_are_not_blocked_by_a_slow_write() {
        let (engine, bus) = setup(ResourceKind::Bus, 0);
        let bus = Arc::new(bus);
        engine.set_latency(std::time::Duration::from_millis(200));

        let writer = {
            let bus = bus.clone();
            std::thread::spawn(move || bus.set_gain(-6.0))
        };
        std::thread::sleep(std::time::Duration::from_millis(30));

        // The write is still in flight; the cache answers at once with the old value
        let started = std::time::Instant::now();
        assert_eq!(bus.gain(), 0.0);
        assert!(bus.snapshot().label.is_empty());
        assert!(started.elapsed() < std::time::Duration::from_millis(100));

        writer.join().unwrap().unwrap();
        assert_eq!(bus.gain(), -6.0);
        assert_eq!(engine.peek_float("Bus[0].Gain"), Some(-6.0));
    }

    #[test]
    fn test_refresh_notifies_every_readable_property() {
        let (engine, bus) = setup(ResourceKind::Bus, 2);
        let changes = bus.subscribe();
        engine.external_set("Bus[2].Gain", ParamValue::Float(-6.0));
        engine.external_set("Bus[2].device.name", ParamValue::Text("Speakers".into()));
        engine.reset_counters();

        let read = bus.refresh_from(engine.as_ref()).unwrap();

        // Label, Mono, Mute, EQ.on, Gain, device.name (no EQ.AB on Banana)
        assert_eq!(read, 6);
        assert_eq!(engine.read_count(), 6);
        assert_eq!(changes.try_iter().count(), 6);
        assert_eq!(bus.gain(), -6.0);
        assert_eq!(bus.device_name(), "Speakers");

        // Unchanged values still notify
        bus.refresh_from(engine.as_ref()).unwrap();
        assert_eq!(changes.try_iter().count(), 6);
    }

    #[test]
    fn test_refresh_clamps_and_is_all_or_nothing() {
        let (engine, strip) = setup(ResourceKind::Strip, 0);
        engine.external_set("Strip[0].Gain", ParamValue::Float(20.0));
        strip.refresh_from(engine.as_ref()).unwrap();
        assert_eq!(strip.gain(), 12.0);

        engine.external_set("Strip[0].Gain", ParamValue::Float(-10.0));
        engine.fail_reads_of("Strip[0].device.name");
        assert!(strip.refresh_from(engine.as_ref()).is_err());
        assert_eq!(strip.gain(), 12.0);
    }

    #[test]
    fn test_virtual_flags() {
        let (_engine, bus) = setup(ResourceKind::Bus, 3);
        assert!(bus.is_virtual());
        assert_eq!(bus.label(), "B1");

        let (_engine, strip) = setup(ResourceKind::Strip, 3);
        assert!(strip.is_virtual());
        assert_eq!(strip.virtual_device_name(), Some("VoiceMeeter Input"));

        strip
            .set(Property::DeviceName, ParamValue::Text("Mic".into()))
            .unwrap();
        assert!(!strip.is_virtual());
    }
}
