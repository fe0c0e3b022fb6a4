//! Declarative mapping between local resource properties and engine parameters
//!
//! Each resource kind (bus, strip) has one static descriptor table. A
//! descriptor names the engine parameter (`"{Kind}[{index}].{param}"`), its
//! value kind, access mode, the engine variants it exists on, an optional
//! valid range and the backing field the value is cached in.
//!
//! Tables are validated once, the first time they are requested; metadata
//! that points at a missing or mistyped backing field is a
//! [`LinkError::Configuration`].

mod layout;

pub use layout::{ChannelCounts, ChannelLayout};

use crate::error::{LinkError, LinkResult};
use crate::gain::{GainRange, ENGINE_GAIN_RANGE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Engine edition, as reported by the remote API type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineVariant {
    Standard,
    Banana,
    Potato,
}

impl EngineVariant {
    pub const ALL: &'static [EngineVariant] = &[Self::Standard, Self::Banana, Self::Potato];

    /// Map the remote API type code to a variant
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Standard),
            2 => Some(Self::Banana),
            3 => Some(Self::Potato),
            _ => None,
        }
    }

    /// Remote API type code (also used to launch the engine)
    pub fn code(&self) -> i32 {
        match self {
            Self::Standard => 1,
            Self::Banana => 2,
            Self::Potato => 3,
        }
    }

    /// Parse a user-supplied variant name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "standard" | "voicemeeter" => Some(Self::Standard),
            "banana" => Some(Self::Banana),
            "potato" => Some(Self::Potato),
            _ => None,
        }
    }
}

impl fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standard => "Standard",
            Self::Banana => "Banana",
            Self::Potato => "Potato",
        };
        f.write_str(name)
    }
}

/// Channel kinds exposed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Output bus
    Bus,
    /// Input strip
    Strip,
}

impl ResourceKind {
    /// Backing fields a resource of this kind caches
    pub fn fields(&self) -> &'static [Field] {
        match self {
            Self::Bus => &[
                Field::Label,
                Field::Gain,
                Field::Mute,
                Field::Mono,
                Field::EqEnabled,
                Field::EqBEnabled,
                Field::DeviceName,
            ],
            Self::Strip => &[Field::Label, Field::Gain, Field::Mute, Field::DeviceName],
        }
    }

    /// Static descriptor metadata for this kind
    pub fn descriptors(&self) -> &'static [ParameterDescriptor] {
        match self {
            Self::Bus => BUS_DESCRIPTORS,
            Self::Strip => STRIP_DESCRIPTORS,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus => f.write_str("Bus"),
            Self::Strip => f.write_str("Strip"),
        }
    }
}

/// Value types understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Bool,
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => f.write_str("float"),
            Self::Bool => f.write_str("bool"),
            Self::String => f.write_str("string"),
        }
    }
}

/// A typed parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Float(_) => ValueKind::Float,
            Self::Bool(_) => ValueKind::Bool,
            Self::Text(_) => ValueKind::String,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{:?}", v),
        }
    }
}

/// Direction(s) in which a parameter is synchronised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Refreshed from the engine, never written back
    ReadOnly,
    /// Written to the engine, never refreshed
    WriteOnly,
    ReadWrite,
}

/// Local property names of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Name,
    Gain,
    Mute,
    Mono,
    EqEnabled,
    EqBEnabled,
    DeviceName,
    DesiredDevice,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Gain => "gain",
            Self::Mute => "mute",
            Self::Mono => "mono",
            Self::EqEnabled => "eq_enabled",
            Self::EqBEnabled => "eq_b_enabled",
            Self::DeviceName => "device_name",
            Self::DesiredDevice => "desired_device",
        }
    }

    /// Look up a property by its local name
    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::Name,
            Self::Gain,
            Self::Mute,
            Self::Mono,
            Self::EqEnabled,
            Self::EqBEnabled,
            Self::DeviceName,
            Self::DesiredDevice,
        ]
        .into_iter()
        .find(|p| p.as_str() == name)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Backing storage slot of a resource's cached state
///
/// Several properties may share one field (the engine-reported device name
/// and the write-only desired device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Label,
    Gain,
    Mute,
    Mono,
    EqEnabled,
    EqBEnabled,
    DeviceName,
}

impl Field {
    /// Value kind stored in this field
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Label | Self::DeviceName => ValueKind::String,
            Self::Gain => ValueKind::Float,
            Self::Mute | Self::Mono | Self::EqEnabled | Self::EqBEnabled => ValueKind::Bool,
        }
    }
}

/// Mapping of one local property to one engine parameter
#[derive(Debug, Clone, Copy)]
pub struct ParameterDescriptor {
    pub property: Property,
    /// Parameter suffix after `"{Kind}[{index}]."`
    pub remote_name: &'static str,
    pub kind: ValueKind,
    pub access: AccessMode,
    /// Engine variants this parameter exists on
    pub variants: &'static [EngineVariant],
    /// Valid range for float parameters
    pub range: Option<GainRange>,
    pub field: Field,
}

impl ParameterDescriptor {
    /// Read-write descriptor available on every variant
    const fn rw(property: Property, remote_name: &'static str, kind: ValueKind, field: Field) -> Self {
        Self {
            property,
            remote_name,
            kind,
            access: AccessMode::ReadWrite,
            variants: EngineVariant::ALL,
            range: None,
            field,
        }
    }

    const fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    const fn with_range(mut self, range: GainRange) -> Self {
        self.range = Some(range);
        self
    }

    const fn only_on(mut self, variants: &'static [EngineVariant]) -> Self {
        self.variants = variants;
        self
    }

    /// Refreshed by the poll loop
    pub fn is_readable(&self) -> bool {
        matches!(self.access, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    /// Written through the change batcher
    pub fn is_writable(&self) -> bool {
        matches!(self.access, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }

    pub fn applies_to(&self, variant: EngineVariant) -> bool {
        self.variants.contains(&variant)
    }

    /// Full engine parameter name, e.g. `Bus[2].Gain`
    pub fn full_name(&self, kind: ResourceKind, index: usize) -> String {
        format!("{}[{}].{}", kind, index, self.remote_name)
    }
}

static BUS_DESCRIPTORS: &[ParameterDescriptor] = &[
    ParameterDescriptor::rw(Property::Name, "Label", ValueKind::String, Field::Label),
    ParameterDescriptor::rw(Property::Mono, "Mono", ValueKind::Bool, Field::Mono),
    ParameterDescriptor::rw(Property::Mute, "Mute", ValueKind::Bool, Field::Mute),
    ParameterDescriptor::rw(Property::EqEnabled, "EQ.on", ValueKind::Bool, Field::EqEnabled),
    // false means memory slot A is in use
    ParameterDescriptor::rw(Property::EqBEnabled, "EQ.AB", ValueKind::Bool, Field::EqBEnabled)
        .only_on(&[EngineVariant::Potato]),
    ParameterDescriptor::rw(Property::Gain, "Gain", ValueKind::Float, Field::Gain)
        .with_range(ENGINE_GAIN_RANGE),
    ParameterDescriptor::rw(Property::DeviceName, "device.name", ValueKind::String, Field::DeviceName)
        .with_access(AccessMode::ReadOnly),
    ParameterDescriptor::rw(Property::DesiredDevice, "device.wdm", ValueKind::String, Field::DeviceName)
        .with_access(AccessMode::WriteOnly),
];

static STRIP_DESCRIPTORS: &[ParameterDescriptor] = &[
    ParameterDescriptor::rw(Property::Name, "Label", ValueKind::String, Field::Label),
    ParameterDescriptor::rw(Property::Gain, "Gain", ValueKind::Float, Field::Gain)
        .with_range(ENGINE_GAIN_RANGE),
    ParameterDescriptor::rw(Property::Mute, "Mute", ValueKind::Bool, Field::Mute),
    ParameterDescriptor::rw(Property::DeviceName, "device.name", ValueKind::String, Field::DeviceName)
        .with_access(AccessMode::ReadOnly),
    ParameterDescriptor::rw(Property::DesiredDevice, "device.wdm", ValueKind::String, Field::DeviceName)
        .with_access(AccessMode::WriteOnly),
];

/// Validated descriptor table for one resource kind, indexed by property
#[derive(Debug)]
pub struct DescriptorTable {
    kind: ResourceKind,
    descriptors: Vec<ParameterDescriptor>,
    by_property: HashMap<Property, usize>,
}

type TableCell = OnceLock<Result<DescriptorTable, (Property, String)>>;

impl DescriptorTable {
    /// Get the validated built-in table for a resource kind
    pub fn for_kind(kind: ResourceKind) -> LinkResult<&'static DescriptorTable> {
        static BUS: TableCell = OnceLock::new();
        static STRIP: TableCell = OnceLock::new();

        let cell = match kind {
            ResourceKind::Bus => &BUS,
            ResourceKind::Strip => &STRIP,
        };

        cell.get_or_init(|| Self::validate(kind, kind.descriptors().to_vec()))
            .as_ref()
            .map_err(|(property, reason)| LinkError::Configuration {
                kind,
                property: *property,
                reason: reason.clone(),
            })
    }

    /// Build and validate a table from arbitrary descriptors
    pub fn build(kind: ResourceKind, descriptors: Vec<ParameterDescriptor>) -> LinkResult<Self> {
        Self::validate(kind, descriptors).map_err(|(property, reason)| LinkError::Configuration {
            kind,
            property,
            reason,
        })
    }

    fn validate(
        kind: ResourceKind,
        descriptors: Vec<ParameterDescriptor>,
    ) -> Result<Self, (Property, String)> {
        let mut by_property = HashMap::with_capacity(descriptors.len());

        for (i, desc) in descriptors.iter().enumerate() {
            // Readable and writable descriptors both need a backing field to read or store
            if !kind.fields().contains(&desc.field) {
                return Err((
                    desc.property,
                    format!("backing field {:?} does not exist on {}", desc.field, kind),
                ));
            }
            if desc.field.kind() != desc.kind {
                return Err((
                    desc.property,
                    format!(
                        "backing field {:?} holds {} but parameter is {}",
                        desc.field,
                        desc.field.kind(),
                        desc.kind
                    ),
                ));
            }
            if desc.range.is_some() && desc.kind != ValueKind::Float {
                return Err((desc.property, "range declared on non-float parameter".into()));
            }
            if by_property.insert(desc.property, i).is_some() {
                return Err((desc.property, "property mapped twice".into()));
            }
        }

        log::debug!("{} descriptor table validated ({} parameters)", kind, descriptors.len());

        Ok(Self {
            kind,
            descriptors,
            by_property,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Descriptor for a property, or None if not mapped
    pub fn get(&self, property: Property) -> Option<&ParameterDescriptor> {
        self.by_property.get(&property).map(|&i| &self.descriptors[i])
    }

    /// Descriptor for a local property name
    pub fn get_by_name(&self, name: &str) -> Option<&ParameterDescriptor> {
        Property::from_name(name).and_then(|p| self.get(p))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.descriptors.iter()
    }

    /// Descriptors refreshed by the poll loop on the given variant
    pub fn readable(&self, variant: EngineVariant) -> impl Iterator<Item = &ParameterDescriptor> {
        self.descriptors
            .iter()
            .filter(move |d| d.is_readable() && d.applies_to(variant))
    }
}

/// Valid gain range declared for a resource kind
pub fn gain_range(kind: ResourceKind) -> GainRange {
    kind.descriptors()
        .iter()
        .find(|d| d.property == Property::Gain)
        .and_then(|d| d.range)
        .unwrap_or(ENGINE_GAIN_RANGE)
}
