//! Wire-level types: message shapes, scalar values and the wire message.

use serde_json::Value;

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::format;

/// Top-level category of a message, from the top two bits of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    /// Request sent to an item.
    Order,
    /// Reply to an order.
    OrderResponse,
    /// Unsolicited notification.
    Notification,
}

/// Every message shape the protocol knows.
///
/// A shape is a (category, subtype, option) triple. The type byte packs it
/// as `category << 6 | subtype << 4 | option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageShape {
    /// Invoke a command.
    Command,
    /// Read a property.
    PropertyGet,
    /// Write a property.
    PropertySet,
    /// Start a datastream.
    StreamOn,
    /// Stop a datastream.
    StreamOff,
    /// Command finished.
    CommandComplete,
    /// Command accepted and still running.
    CommandInProgress,
    /// Reply to a property read.
    PropertyGetResponse,
    /// Reply to a property write.
    PropertySetResponse,
    /// Streamed value.
    StreamResponse,
    /// Broadcast meant for the host side.
    ExternalBroadcast,
    /// Broadcast meant for other devices only.
    InternalBroadcast,
    /// Notification addressed to one endpoint.
    DirectNotification,
}

impl MessageShape {
    /// All shapes.
    pub const ALL: [MessageShape; 13] = [
        MessageShape::Command,
        MessageShape::PropertyGet,
        MessageShape::PropertySet,
        MessageShape::StreamOn,
        MessageShape::StreamOff,
        MessageShape::CommandComplete,
        MessageShape::CommandInProgress,
        MessageShape::PropertyGetResponse,
        MessageShape::PropertySetResponse,
        MessageShape::StreamResponse,
        MessageShape::ExternalBroadcast,
        MessageShape::InternalBroadcast,
        MessageShape::DirectNotification,
    ];

    /// The (category, subtype, option) field values of this shape.
    pub const fn parts(self) -> (u8, u8, u8) {
        match self {
            MessageShape::Command => (CATEGORY_ORDER, SUB_TYPE_COMMAND, OPTION_COMMAND_NORMAL),
            MessageShape::PropertyGet => (CATEGORY_ORDER, SUB_TYPE_PROPERTY, OPTION_PROPERTY_GET),
            MessageShape::PropertySet => (CATEGORY_ORDER, SUB_TYPE_PROPERTY, OPTION_PROPERTY_SET),
            MessageShape::StreamOn => (CATEGORY_ORDER, SUB_TYPE_PROPERTY, OPTION_STREAM_ON),
            MessageShape::StreamOff => (CATEGORY_ORDER, SUB_TYPE_PROPERTY, OPTION_STREAM_OFF),
            MessageShape::CommandComplete => {
                (CATEGORY_ORDER_RESPONSE, SUB_TYPE_COMMAND, OPTION_COMMAND_COMPLETE)
            }
            MessageShape::CommandInProgress => {
                (CATEGORY_ORDER_RESPONSE, SUB_TYPE_COMMAND, OPTION_COMMAND_IN_PROGRESS)
            }
            MessageShape::PropertyGetResponse => {
                (CATEGORY_ORDER_RESPONSE, SUB_TYPE_PROPERTY, OPTION_GET_RESPONSE)
            }
            MessageShape::PropertySetResponse => {
                (CATEGORY_ORDER_RESPONSE, SUB_TYPE_PROPERTY, OPTION_SET_RESPONSE)
            }
            MessageShape::StreamResponse => {
                (CATEGORY_ORDER_RESPONSE, SUB_TYPE_PROPERTY, OPTION_STREAM_RESPONSE)
            }
            MessageShape::ExternalBroadcast => {
                (CATEGORY_NOTIFICATION, SUB_TYPE_BROADCAST, OPTION_BROADCAST_EXTERNAL)
            }
            MessageShape::InternalBroadcast => {
                (CATEGORY_NOTIFICATION, SUB_TYPE_BROADCAST, OPTION_BROADCAST_INTERNAL)
            }
            MessageShape::DirectNotification => (CATEGORY_NOTIFICATION, SUB_TYPE_DIRECT, 0),
        }
    }

    /// Pack this shape into a type byte.
    pub const fn type_byte(self) -> u8 {
        let (category, sub_type, option) = self.parts();
        ((category << CATEGORY_SHIFT) & CATEGORY_MASK)
            | ((sub_type << SUB_TYPE_SHIFT) & SUB_TYPE_MASK)
            | ((option << OPTION_SHIFT) & OPTION_MASK)
    }

    /// Unpack a type byte.
    pub fn from_type_byte(byte: u8) -> ProtocolResult<Self> {
        let category = (byte & CATEGORY_MASK) >> CATEGORY_SHIFT;
        let sub_type = (byte & SUB_TYPE_MASK) >> SUB_TYPE_SHIFT;
        let option = (byte & OPTION_MASK) >> OPTION_SHIFT;
        Self::ALL
            .iter()
            .copied()
            .find(|shape| shape.parts() == (category, sub_type, option))
            .ok_or_else(|| {
                ProtocolError::UnsupportedMessageShape(format!(
                    "type byte 0x{:02X} (category {}, subtype {}, option {})",
                    byte, category, sub_type, option
                ))
            })
    }

    /// Category of this shape.
    pub const fn category(self) -> MessageCategory {
        match self.parts().0 {
            CATEGORY_ORDER => MessageCategory::Order,
            CATEGORY_ORDER_RESPONSE => MessageCategory::OrderResponse,
            _ => MessageCategory::Notification,
        }
    }

    /// Whether this shape is an order.
    pub const fn is_order(self) -> bool {
        matches!(self.category(), MessageCategory::Order)
    }
}

/// One scalar in a wire message's data section.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// String (or single character).
    Str(String),
}

impl DataValue {
    /// Convert a JSON content value. `null` becomes `0`, booleans become
    /// integers, arrays and objects are carried as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => DataValue::Int(0),
            Value::Bool(b) => DataValue::Int(*b as i64),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    DataValue::UInt(u)
                } else if let Some(i) = n.as_i64() {
                    DataValue::Int(i)
                } else {
                    DataValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => DataValue::Str(s.clone()),
            other => DataValue::Str(other.to_string()),
        }
    }

    /// Convert to a JSON content value.
    pub fn to_json(&self) -> Value {
        match self {
            DataValue::Int(i) => Value::from(*i),
            DataValue::UInt(u) => Value::from(*u),
            DataValue::Float(f) => Value::from(*f),
            DataValue::Str(s) => Value::from(s.as_str()),
        }
    }

    /// Integer view, if the value is integral.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            DataValue::Int(i) => Some(*i as i128),
            DataValue::UInt(u) => Some(*u as i128),
            DataValue::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i128),
            DataValue::Float(_) | DataValue::Str(_) => None,
        }
    }

    /// Unsigned 16-bit view, used for ids carried in data.
    pub fn as_u16(&self) -> Option<u16> {
        self.as_i128().and_then(|v| u16::try_from(v).ok())
    }

    /// Floating point view of a numeric value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Int(i) => Some(*i as f64),
            DataValue::UInt(u) => Some(*u as f64),
            DataValue::Float(f) => Some(*f),
            DataValue::Str(_) => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataValue::Int(i) => write!(f, "{}", i),
            DataValue::UInt(u) => write!(f, "{}", u),
            DataValue::Float(x) => write!(f, "{}", x),
            DataValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int(v)
    }
}

impl From<u64> for DataValue {
    fn from(v: u64) -> Self {
        DataValue::UInt(v)
    }
}

impl From<u16> for DataValue {
    fn from(v: u16) -> Self {
        DataValue::UInt(v as u64)
    }
}

impl From<u8> for DataValue {
    fn from(v: u8) -> Self {
        DataValue::UInt(v as u64)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Str(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Str(v)
    }
}

/// The binary-oriented intermediate form of a message.
///
/// ```text
/// +--------+------+----+---------------+--------+------+-------+--------+-------+
/// | msg_id | from | to | response_code | status | type | attrs | format | data  |
/// |  u16   | u16  |u16 |      u16      |  u16   |  u8  |  u8   | ..\0   | ...   |
/// +--------+------+----+---------------+--------+------+-------+--------+-------+
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Exchange id; responses echo it.
    pub msg_id: u16,
    /// Sender id.
    pub from: u16,
    /// Destination id.
    pub to: u16,
    /// Command, property, stream or event id depending on the shape.
    pub response_code: u16,
    /// Status; 0 is success.
    pub status: u16,
    /// Packed category, subtype and option.
    pub type_byte: u8,
    /// Attribute bits.
    pub attributes: u8,
    /// ASCII format string describing `data`; may be empty.
    pub format: String,
    /// Scalars, one per non-padding field of the expanded format.
    pub data: Vec<DataValue>,
}

impl WireMessage {
    /// Create a message with no data.
    pub fn new(msg_id: u16, from: u16, to: u16, shape: MessageShape, response_code: u16) -> Self {
        WireMessage {
            msg_id,
            from,
            to,
            response_code,
            status: STATUS_SUCCESS,
            type_byte: shape.type_byte(),
            attributes: 0,
            format: String::new(),
            data: Vec::new(),
        }
    }

    /// Attach a data section.
    pub fn with_data(mut self, format: impl Into<String>, data: Vec<DataValue>) -> Self {
        self.format = format.into();
        self.data = data;
        self
    }

    /// Set the status field.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Decode the type byte.
    pub fn shape(&self) -> ProtocolResult<MessageShape> {
        MessageShape::from_type_byte(self.type_byte)
    }

    /// Whether the priority attribute is set.
    pub fn is_priority(&self) -> bool {
        self.attributes & ATTR_PRIORITY != 0
    }

    /// Serialize to payload bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let data = if self.format.is_empty() {
            if !self.data.is_empty() {
                return Err(ProtocolError::LengthMismatch {
                    format: String::new(),
                    expected: 0,
                    actual: self.data.len(),
                });
            }
            Vec::new()
        } else {
            format::pack(&self.format, &self.data)?
        };

        let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE + self.format.len() + 1 + data.len());
        buf.extend_from_slice(&self.msg_id.to_le_bytes());
        buf.extend_from_slice(&self.from.to_le_bytes());
        buf.extend_from_slice(&self.to.to_le_bytes());
        buf.extend_from_slice(&self.response_code.to_le_bytes());
        buf.extend_from_slice(&self.status.to_le_bytes());
        buf.push(self.type_byte);
        buf.push(self.attributes);
        buf.extend_from_slice(self.format.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&data);
        if buf.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: buf.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(buf)
    }

    /// Parse only the fixed header, leaving the format and data empty.
    ///
    /// Used to address an error reply when the data section is unreadable.
    pub fn decode_header(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame {
                expected: MESSAGE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Ok(WireMessage {
            msg_id: u16_at(0),
            from: u16_at(2),
            to: u16_at(4),
            response_code: u16_at(6),
            status: u16_at(8),
            type_byte: bytes[10],
            attributes: bytes[11],
            format: String::new(),
            data: Vec::new(),
        })
    }

    /// Parse payload bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let header = Self::decode_header(bytes)?;

        let rest = &bytes[MESSAGE_HEADER_SIZE..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString {
                offset: MESSAGE_HEADER_SIZE,
            })?;
        let format = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ProtocolError::InvalidUtf8("format string"))?
            .to_string();

        let data = if format.is_empty() {
            Vec::new()
        } else {
            format::unpack(&format, &rest[nul + 1..])?
        };

        Ok(header.with_data(format, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_byte_round_trip_all_shapes() {
        for shape in MessageShape::ALL {
            assert_eq!(MessageShape::from_type_byte(shape.type_byte()).unwrap(), shape);
        }
    }

    #[test]
    fn test_type_byte_layout() {
        assert_eq!(MessageShape::Command.type_byte(), 0x00);
        assert_eq!(MessageShape::PropertySet.type_byte(), 0x11);
        assert_eq!(MessageShape::StreamOff.type_byte(), 0x13);
        assert_eq!(MessageShape::CommandInProgress.type_byte(), 0x41);
        assert_eq!(MessageShape::StreamResponse.type_byte(), 0x52);
        assert_eq!(MessageShape::DirectNotification.type_byte(), 0x90);
    }

    #[test]
    fn test_unknown_type_byte() {
        assert!(matches!(
            MessageShape::from_type_byte(0xC0),
            Err(ProtocolError::UnsupportedMessageShape(_))
        ));
        assert!(MessageShape::from_type_byte(0x05).is_err());
    }

    #[test]
    fn test_wire_message_header_layout() {
        let msg = WireMessage::new(0x0102, 0xFC01, 0x0201, MessageShape::Command, 5)
            .with_data("B", vec![DataValue::UInt(3)]);
        let bytes = msg.encode().unwrap();

        assert_eq!(
            bytes,
            vec![0x02, 0x01, 0x01, 0xFC, 0x01, 0x02, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, b'B', 0, 3]
        );
        assert_eq!(WireMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_wire_message_empty_format() {
        let msg = WireMessage::new(9, 1, 2, MessageShape::PropertyGet, 4);
        let bytes = msg.encode().unwrap();

        assert_eq!(bytes.len(), MESSAGE_HEADER_SIZE + 1);
        let decoded = WireMessage::decode(&bytes).unwrap();
        assert!(decoded.data.is_empty());
        assert_eq!(decoded.shape().unwrap(), MessageShape::PropertyGet);
    }

    #[test]
    fn test_wire_message_short_header() {
        assert_eq!(
            WireMessage::decode(&[0u8; 7]),
            Err(ProtocolError::MalformedFrame {
                expected: MESSAGE_HEADER_SIZE,
                actual: 7
            })
        );
    }

    #[test]
    fn test_header_survives_bad_data() {
        let mut bytes = WireMessage::new(0x0042, 0x0101, 0xFC00, MessageShape::CommandComplete, 5)
            .with_data("H", vec![DataValue::UInt(1)])
            .encode()
            .unwrap();
        bytes.pop();

        assert!(WireMessage::decode(&bytes).is_err());
        let header = WireMessage::decode_header(&bytes).unwrap();
        assert_eq!((header.msg_id, header.from, header.to), (0x0042, 0x0101, 0xFC00));
        assert!(header.format.is_empty());
    }

    #[test]
    fn test_huge_repeat_count_is_rejected() {
        let mut bytes = WireMessage::new(1, 0x0101, 0xFC00, MessageShape::CommandComplete, 5)
            .encode()
            .unwrap();
        bytes.pop();
        bytes.extend_from_slice(b"4000000000B\0");
        bytes.push(7);

        assert!(matches!(
            WireMessage::decode(&bytes),
            Err(ProtocolError::InvalidFormat { .. })
        ));
        assert_eq!(WireMessage::decode_header(&bytes).unwrap().msg_id, 1);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let msg = WireMessage::new(1, 1, 2, MessageShape::PropertySet, 3)
            .with_data("s", vec![DataValue::from("x".repeat(MAX_PAYLOAD_SIZE))]);
        assert!(matches!(
            msg.encode(),
            Err(ProtocolError::PayloadTooLarge { max: MAX_PAYLOAD_SIZE, .. })
        ));
    }

    #[test]
    fn test_wire_message_data_without_format() {
        let msg = WireMessage::new(1, 1, 2, MessageShape::Command, 0);
        let msg = WireMessage {
            data: vec![DataValue::UInt(1)],
            ..msg
        };
        assert!(matches!(msg.encode(), Err(ProtocolError::LengthMismatch { .. })));
    }

    #[test]
    fn test_data_value_json() {
        assert_eq!(DataValue::from_json(&serde_json::json!(true)), DataValue::Int(1));
        assert_eq!(DataValue::from_json(&serde_json::json!(null)), DataValue::Int(0));
        assert_eq!(DataValue::from_json(&serde_json::json!(-4)), DataValue::Int(-4));
        assert_eq!(DataValue::from_json(&serde_json::json!(4)), DataValue::UInt(4));
        assert_eq!(DataValue::from_json(&serde_json::json!(1.5)), DataValue::Float(1.5));
        assert_eq!(DataValue::Str("ab".into()).to_json(), serde_json::json!("ab"));
        assert_eq!(DataValue::Float(2.0).as_u16(), Some(2));
    }
}
