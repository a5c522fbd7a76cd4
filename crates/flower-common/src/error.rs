//! Error types for the flower offload engine

use std::fmt;

use thiserror::Error;

/// Status code reported by the firmware channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareCode(pub i32);

impl fmt::Display for FirmwareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}", self.0)
    }
}

/// Flower engine error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowerError {
    /// Malformed item or action, unsupported type, or size overflow.
    /// Always raised before any resource is touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A pool or table ran out of entries
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// An identical non-mergeable rule is already installed
    #[error("duplicate rule (hash key {hash_key:#010x})")]
    DuplicateRule {
        /// Digest of the rejected rule's exact key
        hash_key: u32,
    },

    /// The firmware channel rejected a request
    #[error("firmware error: {0}")]
    Firmware(FirmwareCode),
}

impl FlowerError {
    /// Shorthand for [`FlowerError::InvalidArgument`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<FirmwareCode> for FlowerError {
    fn from(code: FirmwareCode) -> Self {
        Self::Firmware(code)
    }
}

/// Result type for the flower engine
pub type FlowerResult<T> = Result<T, FlowerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = FlowerError::DuplicateRule { hash_key: 0xab };
        assert_eq!(err.to_string(), "duplicate rule (hash key 0x000000ab)");

        let err: FlowerError = FirmwareCode(-5).into();
        assert_eq!(err.to_string(), "firmware error: code -5");
    }

    #[test]
    fn test_invalid_shorthand() {
        assert_eq!(
            FlowerError::invalid("bad item"),
            FlowerError::InvalidArgument("bad item".into())
        );
    }
}
