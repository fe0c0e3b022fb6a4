//! Channel layout per engine variant

use super::{EngineVariant, ResourceKind};

/// Number of strips and buses exposed by the running engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCounts {
    pub strips: usize,
    pub buses: usize,
}

impl ChannelCounts {
    pub fn count(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Bus => self.buses,
            ResourceKind::Strip => self.strips,
        }
    }
}

/// Physical/virtual split of strips and buses
///
/// Physical channels come first, virtual ones follow, in both lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub physical_strips: usize,
    pub virtual_strips: usize,
    pub physical_buses: usize,
    pub virtual_buses: usize,
}

/// OS-visible playback device names of the virtual inputs, in strip order
const VIRTUAL_STRIP_DEVICES: &[&str] = &[
    "VoiceMeeter Input",
    "VoiceMeeter AUX Input",
    "VoiceMeeter VAIO3 Input",
];

impl ChannelLayout {
    pub fn counts(&self) -> ChannelCounts {
        ChannelCounts {
            strips: self.physical_strips + self.virtual_strips,
            buses: self.physical_buses + self.virtual_buses,
        }
    }

    pub fn is_virtual_bus(&self, index: usize) -> bool {
        index >= self.physical_buses
    }

    pub fn is_virtual_strip(&self, index: usize) -> bool {
        index >= self.physical_strips
    }

    /// Bus label as shown by the engine: `A1..An` for physical, `B1..Bm` for virtual
    pub fn bus_label(&self, index: usize) -> String {
        if self.is_virtual_bus(index) {
            format!("B{}", index - self.physical_buses + 1)
        } else {
            format!("A{}", index + 1)
        }
    }

    /// OS playback device backing a virtual strip, or None for physical strips
    pub fn virtual_device_name(&self, index: usize) -> Option<&'static str> {
        if !self.is_virtual_strip(index) {
            return None;
        }
        VIRTUAL_STRIP_DEVICES.get(index - self.physical_strips).copied()
    }
}

impl EngineVariant {
    pub fn layout(&self) -> ChannelLayout {
        match self {
            Self::Standard => ChannelLayout {
                physical_strips: 2,
                virtual_strips: 1,
                physical_buses: 1,
                virtual_buses: 1,
            },
            Self::Banana => ChannelLayout {
                physical_strips: 3,
                virtual_strips: 2,
                physical_buses: 3,
                virtual_buses: 2,
            },
            Self::Potato => ChannelLayout {
                physical_strips: 5,
                virtual_strips: 3,
                physical_buses: 5,
                virtual_buses: 3,
            },
        }
    }
}
