//! Protocol error types.

use thiserror::Error;

/// Errors that can occur when translating or framing PCOM messages.
///
/// Every variant is scoped to a single message: callers drop the offending
/// message and keep the connection alive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No format descriptor is known for the destination and item.
    #[error("no format descriptor for {kind} {item} on destination 0x{destination:04X}")]
    UnknownFormat {
        /// Destination id the message was addressed to.
        destination: u16,
        /// Kind of item that was looked up.
        kind: &'static str,
        /// Item name or id as given by the caller.
        item: String,
    },

    /// The message kind/action combination has no wire representation.
    #[error("unsupported message shape: {0}")]
    UnsupportedMessageShape(String),

    /// Frame or message shorter than its fixed header.
    #[error("malformed frame: expected at least {expected} bytes, got {actual}")]
    MalformedFrame {
        /// Minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// A required logical message field is missing or has the wrong type.
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    /// The format string contains an unknown character or dangling count.
    #[error("invalid format string {format:?}: {reason}")]
    InvalidFormat {
        /// The offending format string.
        format: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A value does not fit the field type it is packed into.
    #[error("value {value} does not fit format character '{field}'")]
    ValueOutOfRange {
        /// Format character of the field.
        field: char,
        /// Rendered value.
        value: String,
    },

    /// A string field had no NUL terminator in the remaining bytes.
    #[error("string field at offset {offset} is not NUL terminated")]
    UnterminatedString {
        /// Offset of the field within the data section.
        offset: usize,
    },

    /// Data section length or value count disagrees with the format string.
    #[error("data does not match format {format:?}: expected {expected}, got {actual}")]
    LengthMismatch {
        /// The format string in use.
        format: String,
        /// Expected count (bytes or values).
        expected: usize,
        /// Actual count.
        actual: usize,
    },

    /// Payload does not fit the frame length field.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Largest allowed payload.
        max: usize,
    },

    /// Every id in the dynamic range is bound to a live name.
    #[error("no dynamic id left for endpoint {0:?}")]
    IdentitiesExhausted(String),

    /// Format string or string field was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Error codes reported by devices in the status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    /// Command or property not implemented.
    Unsupported,
    /// Unknown command, property or stream id.
    UnknownId,
    /// Parameter out of range or malformed.
    InvalidParam,
    /// Device busy.
    Busy,
    /// Order timed out inside the device.
    Timeout,
    /// Hardware fault.
    HardwareFault,
    /// Property is read-only.
    ReadOnly,
    /// Code not in the table.
    Unknown(u16),
}

impl std::fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceErrorCode::Unsupported => write!(f, "unsupported command"),
            DeviceErrorCode::UnknownId => write!(f, "unknown id"),
            DeviceErrorCode::InvalidParam => write!(f, "invalid parameter"),
            DeviceErrorCode::Busy => write!(f, "device busy"),
            DeviceErrorCode::Timeout => write!(f, "device timeout"),
            DeviceErrorCode::HardwareFault => write!(f, "hardware fault"),
            DeviceErrorCode::ReadOnly => write!(f, "read-only property"),
            DeviceErrorCode::Unknown(code) => write!(f, "unknown error (0x{:04X})", code),
        }
    }
}

impl From<u16> for DeviceErrorCode {
    fn from(code: u16) -> Self {
        use crate::constants::*;
        match code {
            ERR_CODE_UNSUPPORTED => DeviceErrorCode::Unsupported,
            ERR_CODE_UNKNOWN_ID => DeviceErrorCode::UnknownId,
            ERR_CODE_INVALID_PARAM => DeviceErrorCode::InvalidParam,
            ERR_CODE_BUSY => DeviceErrorCode::Busy,
            ERR_CODE_TIMEOUT => DeviceErrorCode::Timeout,
            ERR_CODE_HARDWARE_FAULT => DeviceErrorCode::HardwareFault,
            ERR_CODE_READ_ONLY => DeviceErrorCode::ReadOnly,
            _ => DeviceErrorCode::Unknown(code),
        }
    }
}

impl From<DeviceErrorCode> for u16 {
    fn from(code: DeviceErrorCode) -> Self {
        use crate::constants::*;
        match code {
            DeviceErrorCode::Unsupported => ERR_CODE_UNSUPPORTED,
            DeviceErrorCode::UnknownId => ERR_CODE_UNKNOWN_ID,
            DeviceErrorCode::InvalidParam => ERR_CODE_INVALID_PARAM,
            DeviceErrorCode::Busy => ERR_CODE_BUSY,
            DeviceErrorCode::Timeout => ERR_CODE_TIMEOUT,
            DeviceErrorCode::HardwareFault => ERR_CODE_HARDWARE_FAULT,
            DeviceErrorCode::ReadOnly => ERR_CODE_READ_ONLY,
            DeviceErrorCode::Unknown(code) => code,
        }
    }
}

/// Maps device status codes to human-readable descriptions.
///
/// Starts with the built-in [`DeviceErrorCode`] table; deployments can add or
/// override entries for device-specific codes.
#[derive(Debug, Clone, Default)]
pub struct ErrorCodeTable {
    overrides: std::collections::HashMap<u16, String>,
}

impl ErrorCodeTable {
    /// Create a table with only the built-in codes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the description for a status code.
    pub fn insert(&mut self, code: u16, description: impl Into<String>) {
        self.overrides.insert(code, description.into());
    }

    /// Describe a status code. Unknown codes yield an empty string.
    pub fn describe(&self, code: u16) -> String {
        if let Some(text) = self.overrides.get(&code) {
            return text.clone();
        }
        match DeviceErrorCode::from(code) {
            DeviceErrorCode::Unknown(_) => String::new(),
            known => known.to_string(),
        }
    }
}
