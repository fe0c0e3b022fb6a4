//! Gain range mapping between the engine and OS endpoints
//!
//! The engine expresses channel gain in decibels (e.g. -60 dB to +12 dB),
//! while OS endpoints use a normalized master volume scalar (0.0 to 1.0).
//! This module converts between the two with a straight linear mapping.

/// A closed value range used as the source or destination of a mapping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRange {
    pub min: f32,
    pub max: f32,
}

impl GainRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Check if a value lies inside the range (inclusive)
    pub fn contains(&self, value: f32) -> bool {
        self.min <= value && value <= self.max
    }

    /// Clamp a value into the range
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// Engine channel gain in dB
pub const ENGINE_GAIN_RANGE: GainRange = GainRange::new(-60.0, 12.0);

/// OS endpoint master volume scalar
///
/// Some devices report bogus dB ranges, so only the percentage scale is used.
pub const ENDPOINT_VOLUME_RANGE: GainRange = GainRange::new(0.0, 1.0);

/// Default jitter deadzone (in dB) applied when mapping endpoint volume to engine gain
pub const DEFAULT_DEADZONE_DB: f32 = 0.3;

/// Linearly rescale `value` from `source` into `destination`
///
/// Values above `source.max` are clamped first. Values below `source.min`
/// are extrapolated.
pub fn proportional_gain(source: GainRange, destination: GainRange, value: f32) -> f32 {
    let value = if value > source.max { source.max } else { value };

    let slope = (destination.max - destination.min) / (source.max - source.min);
    destination.min + slope * (value - source.min)
}

/// Collapse values within `deadzone` of zero to exactly zero
pub fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() <= deadzone {
        0.0
    } else {
        value
    }
}

/// Engine gain (dB) → endpoint volume scalar
pub fn engine_to_endpoint(engine_range: GainRange, gain_db: f32) -> f32 {
    proportional_gain(engine_range, ENDPOINT_VOLUME_RANGE, gain_db)
}

/// Endpoint volume scalar → engine gain (dB), with near-zero jitter removed
pub fn endpoint_to_engine(engine_range: GainRange, volume_scalar: f32, deadzone: f32) -> f32 {
    apply_deadzone(
        proportional_gain(ENDPOINT_VOLUME_RANGE, engine_range, volume_scalar),
        deadzone,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_endpoints() {
        assert_eq!(proportional_gain(ENGINE_GAIN_RANGE, ENDPOINT_VOLUME_RANGE, -60.0), 0.0);
        assert_eq!(proportional_gain(ENGINE_GAIN_RANGE, ENDPOINT_VOLUME_RANGE, 12.0), 1.0);
        assert_eq!(proportional_gain(ENDPOINT_VOLUME_RANGE, ENGINE_GAIN_RANGE, 0.0), -60.0);
        assert_eq!(proportional_gain(ENDPOINT_VOLUME_RANGE, ENGINE_GAIN_RANGE, 1.0), 12.0);
    }

    #[test]
    fn test_above_max_is_clamped() {
        assert_eq!(proportional_gain(ENGINE_GAIN_RANGE, ENDPOINT_VOLUME_RANGE, 24.0), 1.0);
        assert_eq!(proportional_gain(ENDPOINT_VOLUME_RANGE, ENGINE_GAIN_RANGE, 1.5), 12.0);
    }

    #[test]
    fn test_unity_gain_maps_to_five_sixths() {
        let scalar = engine_to_endpoint(ENGINE_GAIN_RANGE, 0.0);
        assert!((scalar - 0.8333).abs() < 0.001);
    }

    #[test]
    fn test_deadzone() {
        assert_eq!(apply_deadzone(0.3, DEFAULT_DEADZONE_DB), 0.0);
        assert_eq!(apply_deadzone(-0.29, DEFAULT_DEADZONE_DB), 0.0);
        assert_eq!(apply_deadzone(0.31, DEFAULT_DEADZONE_DB), 0.31);
        assert_eq!(apply_deadzone(-6.0, DEFAULT_DEADZONE_DB), -6.0);

        // 0.836 → about +0.19 dB, inside the deadzone
        assert_eq!(endpoint_to_engine(ENGINE_GAIN_RANGE, 0.836, DEFAULT_DEADZONE_DB), 0.0);
        // 0.5 → -24 dB
        assert!((endpoint_to_engine(ENGINE_GAIN_RANGE, 0.5, DEFAULT_DEADZONE_DB) + 24.0).abs() < 0.001);
    }

    #[test]
    fn test_round_trip_is_stable() {
        let scalar = engine_to_endpoint(ENGINE_GAIN_RANGE, 0.0);
        let back = endpoint_to_engine(ENGINE_GAIN_RANGE, scalar, DEFAULT_DEADZONE_DB);
        assert_eq!(back, 0.0);
    }
}
