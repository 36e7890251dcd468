//! Protocol constants
//!
//! Byte values, bit masks and reserved identifiers of the PCOM serial
//! protocol. All multi-byte fields on the wire are little-endian.

// ============================================================================
// Framing
// ============================================================================

/// Marks the start of a frame.
pub const START_BYTE: u8 = 0x02;
/// Marks the end of a frame.
pub const END_BYTE: u8 = 0x03;
/// Precedes an escaped byte. The escaped byte is sent as `byte + ESCAPE_BYTE`.
pub const ESCAPE_BYTE: u8 = 0x10;

/// Size of the unescaped frame header: sequence, checksum, length (2 bytes).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Low nibble of the sequence byte.
pub const PACKET_SEQ_MASK: u8 = 0x0F;
/// High nibble of the sequence byte.
pub const PACKET_TYPE_MASK: u8 = 0xF0;

/// Plain data frame, no acknowledgment expected.
pub const PACKET_TYPE_NORMAL: u8 = 0x00;
/// Acknowledgment of a received frame.
pub const PACKET_TYPE_ACK: u8 = 0x20;
/// Negative acknowledgment of a received frame.
pub const PACKET_TYPE_NAK: u8 = 0x30;
/// Data frame that must be acknowledged.
pub const PACKET_TYPE_ACK_REQUESTED: u8 = 0x80;

/// Number of distinct sequence numbers (4-bit sequence space).
pub const SEQUENCE_MODULUS: u8 = 16;

// ============================================================================
// Message Header
// ============================================================================

/// Size of the fixed message header:
/// msg_id, from, to, response_code, status (u16 each), type, attributes (u8 each).
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Category occupies the top two bits of the type byte.
pub const CATEGORY_MASK: u8 = 0xC0;
/// Shift of the category field.
pub const CATEGORY_SHIFT: u8 = 6;
/// Subtype occupies bits 5-4 of the type byte.
pub const SUB_TYPE_MASK: u8 = 0x30;
/// Shift of the subtype field.
pub const SUB_TYPE_SHIFT: u8 = 4;
/// Option occupies the low nibble of the type byte.
pub const OPTION_MASK: u8 = 0x0F;
/// Shift of the option field.
pub const OPTION_SHIFT: u8 = 0;

/// Category: request sent to an item.
pub const CATEGORY_ORDER: u8 = 0;
/// Category: reply to an order.
pub const CATEGORY_ORDER_RESPONSE: u8 = 1;
/// Category: unsolicited notification.
pub const CATEGORY_NOTIFICATION: u8 = 2;

/// Order/response subtype for commands.
pub const SUB_TYPE_COMMAND: u8 = 0;
/// Order/response subtype for properties and streams.
pub const SUB_TYPE_PROPERTY: u8 = 1;
/// Notification subtype for broadcasts.
pub const SUB_TYPE_BROADCAST: u8 = 0;
/// Notification subtype for directed notifications.
pub const SUB_TYPE_DIRECT: u8 = 1;

/// Command order option.
pub const OPTION_COMMAND_NORMAL: u8 = 0;
/// Property order option: read.
pub const OPTION_PROPERTY_GET: u8 = 0;
/// Property order option: write.
pub const OPTION_PROPERTY_SET: u8 = 1;
/// Property order option: start streaming.
pub const OPTION_STREAM_ON: u8 = 2;
/// Property order option: stop streaming.
pub const OPTION_STREAM_OFF: u8 = 3;
/// Command response option: finished.
pub const OPTION_COMMAND_COMPLETE: u8 = 0;
/// Command response option: still running.
pub const OPTION_COMMAND_IN_PROGRESS: u8 = 1;
/// Property response option: reply to a get.
pub const OPTION_GET_RESPONSE: u8 = 0;
/// Property response option: reply to a set.
pub const OPTION_SET_RESPONSE: u8 = 1;
/// Property response option: streamed value.
pub const OPTION_STREAM_RESPONSE: u8 = 2;
/// Broadcast option: meant for the host side.
pub const OPTION_BROADCAST_EXTERNAL: u8 = 0;
/// Broadcast option: meant for other devices only.
pub const OPTION_BROADCAST_INTERNAL: u8 = 1;

/// Attribute bit marking a high priority message.
pub const ATTR_PRIORITY: u8 = 0x01;

/// Status value reported for a successful order.
pub const STATUS_SUCCESS: u16 = 0;

// ============================================================================
// Addressing
// ============================================================================

/// High byte of an id selects the subsystem.
pub const SUBSYSTEM_MASK: u16 = 0xFF00;
/// Shift of the subsystem field within an id.
pub const SUBSYSTEM_SHIFT: u16 = 8;
/// Subsystem number reserved for broadcasts.
pub const BROADCAST_SUBSYSTEM: u16 = 0x80;
/// Destination of the discovery broadcast (broadcast subsystem, device 0).
pub const BROADCAST_ID: u16 = BROADCAST_SUBSYSTEM << SUBSYSTEM_SHIFT;

/// Command id reserved for enumeration during discovery.
pub const ENUMERATE_COMMAND: u16 = 0;
/// Source id used by the gateway's discovery service.
pub const DISCOVERY_SERVICE_ID: u16 = 0xFEFE;
/// Name bound to [`DISCOVERY_SERVICE_ID`] in every identity registry.
pub const DISCOVERY_SERVICE_NAME: &str = "DISCOVERY";

/// First id handed out to names seen for the first time.
pub const DYNAMIC_ID_MIN: u16 = 0xFC00;
/// Last id handed out to names seen for the first time.
pub const DYNAMIC_ID_MAX: u16 = 0xFFFF;

/// Returns the subsystem number of an id.
pub const fn subsystem_of(id: u16) -> u16 {
    (id & SUBSYSTEM_MASK) >> SUBSYSTEM_SHIFT
}

// ============================================================================
// Device Error Codes
// ============================================================================

/// Command or property is not implemented by the device.
pub const ERR_CODE_UNSUPPORTED: u16 = 1;
/// Unknown command, property or stream id.
pub const ERR_CODE_UNKNOWN_ID: u16 = 2;
/// A parameter was out of range or malformed.
pub const ERR_CODE_INVALID_PARAM: u16 = 3;
/// The device is busy with another order.
pub const ERR_CODE_BUSY: u16 = 4;
/// The order timed out inside the device.
pub const ERR_CODE_TIMEOUT: u16 = 5;
/// A hardware fault prevented the order from completing.
pub const ERR_CODE_HARDWARE_FAULT: u16 = 6;
/// The property is read-only.
pub const ERR_CODE_READ_ONLY: u16 = 7;

/// Rate reported for stream values (not learned during discovery).
pub const DEFAULT_STREAM_RATE_MS: u64 = 1000;
