//! Error types for engine/endpoint synchronisation
//!
//! Structured errors for parameter metadata, value validation, the remote
//! engine protocol and device handling. Conditions that are silent by
//! design (no-op writes, echoes suppressed by a lease) never surface here.

use crate::params::{EngineVariant, Property, ResourceKind, ValueKind};
use thiserror::Error;

/// Protocol-level failure reported by the remote engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteProtocolError {
    /// The parameter name is not known to the engine
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    /// The engine answered with a structure it did not expect
    #[error("Structure mismatch while reading '{0}'")]
    StructureMismatch(String),

    /// A text value the engine cannot represent
    #[error("Text value for '{name}' {reason}")]
    InvalidText { name: String, reason: &'static str },

    /// Generic engine failure with the raw return code
    #[error("Engine error {code} ({context})")]
    Engine { code: i32, context: String },
}

/// Errors that can occur while mirroring engine state
#[derive(Debug, Error)]
pub enum LinkError {
    /// Parameter metadata references a backing field that does not exist
    #[error("Invalid parameter metadata for {kind}.{property}: {reason}")]
    Configuration {
        kind: ResourceKind,
        property: Property,
        reason: String,
    },

    /// Write outside the declared valid range
    #[error("{property} value {value} outside valid range [{min}, {max}]")]
    RangeViolation {
        property: Property,
        value: f32,
        min: f32,
        max: f32,
    },

    /// Engine is not logged in
    #[error("Remote engine unavailable: not logged in")]
    RemoteUnavailable,

    /// Engine rejected the call
    #[error("Remote engine error: {0}")]
    RemoteProtocol(#[from] RemoteProtocolError),

    /// Batched script rejected on a specific (1-based) line
    #[error("Script error on line {line}")]
    Script { line: u32, script: String },

    /// Named OS device is not currently enumerable
    #[error("Audio device '{0}' is not currently available")]
    DeviceUnavailable(String),

    /// OS audio endpoint call failed
    #[error("Audio endpoint error: {0}")]
    Endpoint(String),

    /// `flush`/`discard_pending` called while writes are applied immediately
    #[error("{operation} is only valid in batched write mode")]
    ImmediateMode { operation: &'static str },

    /// Value kind does not match the descriptor
    #[error("{property} expects a {expected} value, got {found}")]
    TypeMismatch {
        property: Property,
        expected: ValueKind,
        found: ValueKind,
    },

    /// Property exists but not on the running engine variant
    #[error("{property} is not available on {variant}")]
    NotApplicable {
        property: Property,
        variant: EngineVariant,
    },

    /// Property is not mapped for this resource kind
    #[error("{property} is not mapped on {kind}")]
    NotMapped {
        kind: ResourceKind,
        property: Property,
    },

    /// Engine application is installed but not running, and no variant is known to launch
    #[error("Mixing engine is not running")]
    EngineNotRunning,

    /// Remote API library could not be loaded
    #[error("Failed to load remote library: {0}")]
    Library(String),

    /// Worker thread could not be started
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinkError::RangeViolation {
            property: Property::Gain,
            value: 13.0,
            min: -60.0,
            max: 12.0,
        };
        let text = err.to_string();
        assert!(text.contains("gain"));
        assert!(text.contains("13"));
        assert!(text.contains("-60"));

        let err = LinkError::Script {
            line: 3,
            script: "Bus[0].Gain = 1\n".to_string(),
        };
        assert_eq!(err.to_string(), "Script error on line 3");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: LinkError = RemoteProtocolError::UnknownParameter("Bus[9].Gain".into()).into();
        assert!(matches!(err, LinkError::RemoteProtocol(_)));
        assert!(err.to_string().contains("Bus[9].Gain"));
    }
}
