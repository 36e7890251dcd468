//! Logical message ⇄ wire message translation.

use serde_json::{Map, Value};

use crate::constants::*;
use crate::descriptor::{DescriptorTable, FormatDescriptor, ItemKind};
use crate::error::{ErrorCodeTable, ProtocolError, ProtocolResult};
use crate::format;
use crate::message::{LogicalMessage, MessageKind, MessageStatus, Topics, TxType};
use crate::registry::IdentityRegistry;
use crate::types::{DataValue, MessageCategory, MessageShape, WireMessage};

/// Content field that overrides the descriptor's format string.
pub const FORMAT_OVERRIDE_KEY: &str = "__format__";

/// Read-only context for decoding.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Known format descriptors.
    pub table: &'a DescriptorTable,
    /// Known endpoint names.
    pub registry: &'a IdentityRegistry,
    /// Device status code descriptions.
    pub errors: &'a ErrorCodeTable,
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Work out the wire shape of an outbound logical message.
pub fn shape_of(msg: &LogicalMessage) -> ProtocolResult<MessageShape> {
    match msg.kind() {
        MessageKind::Command => Ok(MessageShape::Command),
        MessageKind::Property => match msg.content_str("ACTION") {
            Some("GET") => Ok(MessageShape::PropertyGet),
            Some("SET") => Ok(MessageShape::PropertySet),
            other => Err(ProtocolError::UnsupportedMessageShape(format!(
                "PROPERTY with ACTION {:?}",
                other
            ))),
        },
        MessageKind::Stream if truthy(msg.content("STOP")) => Ok(MessageShape::StreamOff),
        MessageKind::Stream => Ok(MessageShape::StreamOn),
        kind @ (MessageKind::Response | MessageKind::Event) => Err(
            ProtocolError::UnsupportedMessageShape(format!("outbound {}", kind.as_str())),
        ),
    }
}

fn item_kind(shape: MessageShape) -> ItemKind {
    match shape {
        MessageShape::Command | MessageShape::CommandComplete | MessageShape::CommandInProgress => {
            ItemKind::Command
        }
        MessageShape::StreamOn | MessageShape::StreamOff | MessageShape::StreamResponse => {
            ItemKind::Stream
        }
        _ => ItemKind::Property,
    }
}

fn spread(value: &Value) -> Vec<DataValue> {
    match value {
        Value::Array(items) => items.iter().map(DataValue::from_json).collect(),
        other => vec![DataValue::from_json(other)],
    }
}

/// Translate an outbound logical message into a wire message.
///
/// Names are resolved (and allocated if new) through `registry`; the item's
/// format comes from `table`. A broadcast item with no descriptor under
/// [`BROADCAST_ID`] may still be sent by numeric id, with no data.
pub fn encode_message(
    msg: &LogicalMessage,
    table: &DescriptorTable,
    registry: &mut IdentityRegistry,
) -> ProtocolResult<WireMessage> {
    let shape = shape_of(msg)?;

    let to = match msg.to() {
        Some(endpoint) => registry.resolve(endpoint)?,
        None if msg.topics.tx_type == TxType::Broadcast => BROADCAST_ID,
        None => return Err(ProtocolError::MissingField("TO")),
    };
    let from = registry.resolve(msg.from())?;

    let kind = item_kind(shape);
    let key = kind.content_key();
    let item = msg.content(key).ok_or(ProtocolError::MissingField(key))?;
    let bare;
    let descriptor = match (table.lookup(to, kind, item), item.as_u64()) {
        (Some(descriptor), _) => descriptor,
        (None, Some(id)) if to == BROADCAST_ID && id <= u16::MAX as u64 => {
            bare = FormatDescriptor::new(id as u16, id.to_string(), "");
            &bare
        }
        (None, _) => {
            return Err(ProtocolError::UnknownFormat {
                destination: to,
                kind: key,
                item: match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            })
        }
    };

    let (fmt, data) = match shape {
        MessageShape::Command => {
            let data = descriptor
                .input_params
                .iter()
                .map(|name| msg.content(name).map(DataValue::from_json).unwrap_or(DataValue::Int(0)))
                .collect();
            (descriptor.format.clone(), data)
        }
        MessageShape::PropertySet => {
            let value = msg.content("VALUE").ok_or(ProtocolError::MissingField("VALUE"))?;
            (descriptor.format.clone(), spread(value))
        }
        _ => (String::new(), Vec::new()),
    };
    let fmt = match msg.content_str(FORMAT_OVERRIDE_KEY) {
        Some(over) => over.to_string(),
        None => fmt,
    };

    let expected = if fmt.is_empty() { 0 } else { format::value_count(&fmt)? };
    if expected != data.len() {
        return Err(ProtocolError::LengthMismatch {
            format: fmt,
            expected,
            actual: data.len(),
        });
    }

    let mut wire = WireMessage::new(msg.msg_id(), from, to, shape, descriptor.id).with_data(fmt, data);
    if truthy(msg.topics.extra.get("PRIORITY")) {
        wire.attributes |= ATTR_PRIORITY;
    }
    Ok(wire)
}

/// Map data values onto parameter names.
///
/// A first name ending in `[]` receives the whole data list. Values beyond
/// the named parameters are dropped.
pub fn map_params(names: &[String], data: &[DataValue]) -> Map<String, Value> {
    let mut out = Map::new();
    match names.first() {
        Some(first) if first.ends_with("[]") => {
            out.insert(
                first.clone(),
                Value::Array(data.iter().map(DataValue::to_json).collect()),
            );
        }
        _ => {
            for (name, value) in names.iter().zip(data) {
                out.insert(name.clone(), value.to_json());
            }
        }
    }
    out
}

fn first_value(data: &[DataValue]) -> Value {
    match data {
        [] => Value::Null,
        [single] => single.to_json(),
        many => Value::Array(many.iter().map(DataValue::to_json).collect()),
    }
}

/// Translate a received wire message into a logical message.
pub fn decode_message(wire: &WireMessage, ctx: DecodeContext<'_>) -> ProtocolResult<LogicalMessage> {
    let shape = wire.shape()?;
    let kind = item_kind(shape);

    // orders name items on their destination, everything else on the sender
    let owner = if shape.is_order() { wire.to } else { wire.from };
    let descriptor: Option<&FormatDescriptor> = ctx.table.get(owner, kind, wire.response_code);
    let item = descriptor
        .map(|d| Value::from(d.name.as_str()))
        .unwrap_or_else(|| Value::from(wire.response_code));

    let tx_type = if subsystem_of(wire.to) == BROADCAST_SUBSYSTEM {
        TxType::Broadcast
    } else {
        TxType::Direct
    };

    let mut msg = LogicalMessage {
        topics: Topics {
            to: Some(ctx.registry.name_for(wire.to)),
            from: ctx.registry.name_for(wire.from),
            msg_id: wire.msg_id,
            tx_type,
            msg_type: MessageKind::Response,
            response_req: shape.is_order(),
            msg_status: MessageStatus::Ok,
            extra: Map::new(),
        },
        contents: Map::new(),
    };
    let contents = &mut msg.contents;

    match shape {
        MessageShape::Command => {
            msg.topics.msg_type = MessageKind::Command;
            contents.insert("COMMAND".into(), item);
            match descriptor {
                Some(d) => contents.extend(map_params(&d.input_params, &wire.data)),
                None if !wire.data.is_empty() => {
                    contents.insert("DATA".into(), first_value(&wire.data));
                }
                None => {}
            }
        }
        MessageShape::PropertyGet | MessageShape::PropertySet => {
            msg.topics.msg_type = MessageKind::Property;
            contents.insert("PROPERTY".into(), item);
            if shape == MessageShape::PropertyGet {
                contents.insert("ACTION".into(), Value::from("GET"));
            } else {
                contents.insert("ACTION".into(), Value::from("SET"));
                contents.insert("VALUE".into(), first_value(&wire.data));
            }
        }
        MessageShape::StreamOn | MessageShape::StreamOff => {
            msg.topics.msg_type = MessageKind::Stream;
            contents.insert("STREAM".into(), item);
            if shape == MessageShape::StreamOff {
                contents.insert("STOP".into(), Value::Bool(true));
            }
        }
        MessageShape::CommandComplete | MessageShape::CommandInProgress => {
            contents.insert("COMMAND".into(), item);
            let outputs = descriptor.map(|d| d.output_params.as_slice()).unwrap_or(&[]);
            contents.insert("RESULT".into(), Value::Object(map_params(outputs, &wire.data)));
            if shape == MessageShape::CommandInProgress {
                msg.topics.msg_status = MessageStatus::Progress;
            }
        }
        MessageShape::PropertyGetResponse | MessageShape::PropertySetResponse => {
            contents.insert("PROPERTY".into(), item);
            contents.insert("ACTION".into(), Value::from("RESPONSE"));
            if shape == MessageShape::PropertyGetResponse {
                contents.insert("VALUE".into(), first_value(&wire.data));
            }
        }
        MessageShape::StreamResponse => {
            msg.topics.msg_type = MessageKind::Stream;
            msg.topics.extra.insert("STREAM".into(), item.clone());
            contents.insert("STREAM".into(), item);
            contents.insert("VALUE".into(), first_value(&wire.data));
            contents.insert("RATE".into(), Value::from(DEFAULT_STREAM_RATE_MS));
        }
        MessageShape::InternalBroadcast => {
            return Err(ProtocolError::UnsupportedMessageShape(
                "internal broadcast notification".to_string(),
            ));
        }
        MessageShape::ExternalBroadcast | MessageShape::DirectNotification => {
            msg.topics.msg_type = MessageKind::Event;
            contents.insert("EVENT".into(), Value::from(wire.response_code));
            contents.insert("ERROR_CODE".into(), Value::from(wire.status));
            contents.insert(
                "INFO".into(),
                Value::Array(wire.data.iter().map(DataValue::to_json).collect()),
            );
            contents.insert("DESCRIPTION".into(), Value::from(ctx.errors.describe(wire.status)));
            // the status field is signed for notifications
            msg.topics.msg_status = match wire.status as i16 {
                0 => MessageStatus::Info,
                s if s > 0 => MessageStatus::Error,
                _ => MessageStatus::Warning,
            };
            if shape == MessageShape::ExternalBroadcast {
                msg.topics.tx_type = TxType::Broadcast;
                msg.topics.to = None;
            }
            return Ok(msg);
        }
    }

    if shape.category() != MessageCategory::Order && wire.status != STATUS_SUCCESS {
        msg.topics.msg_status = MessageStatus::Error;
        msg.contents.insert("ERROR_CODE".into(), Value::from(wire.status));
        msg.contents
            .insert("DESCRIPTION".into(), Value::from(ctx.errors.describe(wire.status)));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EndpointRef;
    use serde_json::json;

    struct Fixture {
        table: DescriptorTable,
        registry: IdentityRegistry,
        errors: ErrorCodeTable,
        motor: u16,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = IdentityRegistry::new();
            let motor = 0x0101;
            registry.bind("motor1", motor);
            let mut table = DescriptorTable::new();
            table.insert(
                motor,
                ItemKind::Command,
                FormatDescriptor::new(5, "home", "B")
                    .with_inputs(["motor_num"])
                    .with_outputs(["position"]),
            );
            table.insert(
                motor,
                ItemKind::Command,
                FormatDescriptor::new(6, "dump", "").with_outputs(["samples[]"]),
            );
            table.insert(motor, ItemKind::Property, FormatDescriptor::new(2, "speed", "H"));
            table.insert(motor, ItemKind::Property, FormatDescriptor::new(3, "limits", "2h"));
            table.insert(motor, ItemKind::Stream, FormatDescriptor::new(1, "position", "f"));
            Fixture {
                table,
                registry,
                errors: ErrorCodeTable::new(),
                motor,
            }
        }

        fn ctx(&self) -> DecodeContext<'_> {
            DecodeContext {
                table: &self.table,
                registry: &self.registry,
                errors: &self.errors,
            }
        }

        fn round_trip(&mut self, msg: &LogicalMessage) -> LogicalMessage {
            let wire = encode_message(msg, &self.table, &mut self.registry).unwrap();
            let bytes = wire.encode().unwrap();
            let decoded = WireMessage::decode(&bytes).unwrap();
            assert_eq!(decoded, wire);
            decode_message(&decoded, self.ctx()).unwrap()
        }
    }

    #[test]
    fn test_home_command_end_to_end() {
        let mut fx = Fixture::new();
        let msg = LogicalMessage::command("motor1", "ui", 1, "home", [("motor_num", json!(3))]);

        let wire = encode_message(&msg, &fx.table, &mut fx.registry).unwrap();
        assert_eq!(wire.format, "B");
        assert_eq!(wire.data, vec![DataValue::UInt(3)]);
        assert_eq!(wire.to, fx.motor);
        assert_eq!(wire.from, DYNAMIC_ID_MIN);
        assert_eq!(wire.response_code, 5);
        assert_eq!(wire.shape().unwrap(), MessageShape::Command);

        assert_eq!(fx.round_trip(&msg), msg);
    }

    #[test]
    fn test_missing_parameter_defaults_to_zero() {
        let mut fx = Fixture::new();
        let msg = LogicalMessage::command("motor1", "ui", 1, "home", Vec::<(String, Value)>::new());
        let wire = encode_message(&msg, &fx.table, &mut fx.registry).unwrap();
        assert_eq!(wire.data, vec![DataValue::Int(0)]);
    }

    #[test]
    fn test_property_round_trips() {
        let mut fx = Fixture::new();

        let get = LogicalMessage::get_property("motor1", "ui", 2, "speed");
        assert_eq!(fx.round_trip(&get), get);

        let set = LogicalMessage::set_property("motor1", "ui", 3, "speed", 1200);
        assert_eq!(fx.round_trip(&set), set);

        let set_many = LogicalMessage::set_property("motor1", "ui", 4, "limits", json!([-5, 5]));
        assert_eq!(fx.round_trip(&set_many), set_many);
    }

    #[test]
    fn test_stream_round_trips() {
        let mut fx = Fixture::new();

        let on = LogicalMessage::stream("motor1", "ui", 5, "position", false);
        let wire = encode_message(&on, &fx.table, &mut fx.registry).unwrap();
        assert_eq!(wire.shape().unwrap(), MessageShape::StreamOn);
        assert!(wire.data.is_empty());
        assert_eq!(fx.round_trip(&on), on);

        let off = LogicalMessage::stream("motor1", "ui", 6, "position", true);
        assert_eq!(
            encode_message(&off, &fx.table, &mut fx.registry).unwrap().shape().unwrap(),
            MessageShape::StreamOff
        );
        assert_eq!(fx.round_trip(&off), off);
    }

    #[test]
    fn test_numeric_endpoints_and_ids() {
        let mut fx = Fixture::new();
        let msg = LogicalMessage::get_property(0x0101u16, 0x0005u16, 8, 2);
        let wire = encode_message(&msg, &fx.table, &mut fx.registry).unwrap();
        assert_eq!((wire.to, wire.from, wire.response_code), (0x0101, 0x0005, 2));
    }

    #[test]
    fn test_unknown_format() {
        let mut fx = Fixture::new();
        let msg = LogicalMessage::command("motor1", "ui", 1, "jump", Vec::<(String, Value)>::new());
        assert_eq!(
            encode_message(&msg, &fx.table, &mut fx.registry),
            Err(ProtocolError::UnknownFormat {
                destination: 0x0101,
                kind: "COMMAND",
                item: "jump".to_string(),
            })
        );

        let msg = LogicalMessage::command("motor2", "ui", 1, "home", Vec::<(String, Value)>::new());
        assert!(matches!(
            encode_message(&msg, &fx.table, &mut fx.registry),
            Err(ProtocolError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn test_external_broadcast_by_numeric_id() {
        let mut fx = Fixture::new();
        let mut msg = LogicalMessage::command("motor1", "ui", 11, 0, Vec::<(String, Value)>::new());
        msg.topics.to = None;
        msg.topics.tx_type = TxType::Broadcast;

        let wire = encode_message(&msg, &fx.table, &mut fx.registry).unwrap();
        assert_eq!(wire.to, BROADCAST_ID);
        assert_eq!(wire.response_code, 0);
        assert_eq!(wire.shape().unwrap(), MessageShape::Command);
        assert!(wire.format.is_empty() && wire.data.is_empty());

        // names need a descriptor registered on the broadcast address
        msg.contents.insert("COMMAND".into(), json!("ping"));
        assert_eq!(
            encode_message(&msg, &fx.table, &mut fx.registry),
            Err(ProtocolError::UnknownFormat {
                destination: BROADCAST_ID,
                kind: "COMMAND",
                item: "ping".to_string(),
            })
        );
        fx.table.insert(BROADCAST_ID, ItemKind::Command, FormatDescriptor::new(9, "ping", "B").with_inputs(["n"]));
        msg.contents.insert("n".into(), json!(2));
        let wire = encode_message(&msg, &fx.table, &mut fx.registry).unwrap();
        assert_eq!((wire.response_code, wire.data.clone()), (9, vec![DataValue::UInt(2)]));
    }

    #[test]
    fn test_exhausted_identities_fail_the_message() {
        let mut fx = Fixture::new();
        for i in 0..(DYNAMIC_ID_MAX - DYNAMIC_ID_MIN) {
            fx.registry.id_for(&format!("client{}", i)).unwrap();
        }
        let msg = LogicalMessage::get_property("motor1", "late", 1, "speed");
        assert_eq!(
            encode_message(&msg, &fx.table, &mut fx.registry),
            Err(ProtocolError::IdentitiesExhausted("late".to_string()))
        );
    }

    #[test]
    fn test_unsupported_shapes() {
        let mut fx = Fixture::new();
        let mut msg = LogicalMessage::get_property("motor1", "ui", 1, "speed");
        msg.contents.insert("ACTION".into(), json!("TOGGLE"));
        assert!(matches!(
            encode_message(&msg, &fx.table, &mut fx.registry),
            Err(ProtocolError::UnsupportedMessageShape(_))
        ));

        let event = LogicalMessage::new("motor1", "ui", 1, MessageKind::Event);
        assert!(matches!(
            encode_message(&event, &fx.table, &mut fx.registry),
            Err(ProtocolError::UnsupportedMessageShape(_))
        ));
    }

    #[test]
    fn test_format_override() {
        let mut fx = Fixture::new();
        let mut msg = LogicalMessage::set_property("motor1", "ui", 1, "speed", 70_000);
        msg.contents.insert(FORMAT_OVERRIDE_KEY.into(), json!("I"));
        let wire = encode_message(&msg, &fx.table, &mut fx.registry).unwrap();
        assert_eq!(wire.format, "I");
        assert_eq!(wire.encode().unwrap().len(), MESSAGE_HEADER_SIZE + 2 + 4);
    }

    #[test]
    fn test_priority_attribute() {
        let mut fx = Fixture::new();
        let mut msg = LogicalMessage::get_property("motor1", "ui", 1, "speed");
        msg.topics.extra.insert("PRIORITY".into(), json!(true));
        let wire = encode_message(&msg, &fx.table, &mut fx.registry).unwrap();
        assert!(wire.is_priority());
    }

    #[test]
    fn test_decode_command_response() {
        let mut fx = Fixture::new();
        let ui = fx.registry.id_for("ui").unwrap();
        let wire = WireMessage::new(9, fx.motor, ui, MessageShape::CommandComplete, 5)
            .with_data("h", vec![DataValue::Int(-40)]);
        let msg = decode_message(&wire, fx.ctx()).unwrap();

        assert!(msg.is_response_to(9));
        assert_eq!(msg.status(), MessageStatus::Ok);
        assert_eq!(msg.to(), Some(&EndpointRef::from("ui")));
        assert_eq!(msg.from(), &EndpointRef::from("motor1"));
        assert_eq!(msg.content("COMMAND"), Some(&json!("home")));
        assert_eq!(msg.content("RESULT"), Some(&json!({"position": -40})));
    }

    #[test]
    fn test_decode_list_output_and_progress() {
        let fx = Fixture::new();
        let wire = WireMessage::new(9, fx.motor, 0xFC00, MessageShape::CommandInProgress, 6)
            .with_data("3B", vec![1u8.into(), 2u8.into(), 3u8.into()]);
        let msg = decode_message(&wire, fx.ctx()).unwrap();

        assert_eq!(msg.status(), MessageStatus::Progress);
        assert_eq!(msg.content("RESULT"), Some(&json!({"samples[]": [1, 2, 3]})));
    }

    #[test]
    fn test_decode_error_status() {
        let fx = Fixture::new();
        let wire = WireMessage::new(3, fx.motor, 0xFC00, MessageShape::PropertySetResponse, 2)
            .with_status(ERR_CODE_READ_ONLY);
        let msg = decode_message(&wire, fx.ctx()).unwrap();

        assert_eq!(msg.status(), MessageStatus::Error);
        assert_eq!(msg.content("ERROR_CODE"), Some(&json!(7)));
        assert_eq!(msg.content_str("DESCRIPTION"), Some("read-only property"));
        assert_eq!(msg.content_str("ACTION"), Some("RESPONSE"));
    }

    #[test]
    fn test_decode_property_and_stream_responses() {
        let fx = Fixture::new();
        let get = WireMessage::new(3, fx.motor, 0xFC00, MessageShape::PropertyGetResponse, 2)
            .with_data("H", vec![DataValue::UInt(1200)]);
        let msg = decode_message(&get, fx.ctx()).unwrap();
        assert_eq!(msg.content("PROPERTY"), Some(&json!("speed")));
        assert_eq!(msg.content("VALUE"), Some(&json!(1200)));

        let stream = WireMessage::new(0, fx.motor, 0xFC00, MessageShape::StreamResponse, 1)
            .with_data("f", vec![DataValue::Float(2.5)]);
        let msg = decode_message(&stream, fx.ctx()).unwrap();
        assert_eq!(msg.kind(), MessageKind::Stream);
        assert_eq!(msg.topics.extra.get("STREAM"), Some(&json!("position")));
        assert_eq!(msg.content("VALUE"), Some(&json!(2.5)));
        assert_eq!(msg.content("RATE"), Some(&json!(1000)));
    }

    #[test]
    fn test_notification_severity() {
        let fx = Fixture::new();
        let event = |status: u16| {
            let wire = WireMessage::new(0, fx.motor, 0xFC00, MessageShape::DirectNotification, 12)
                .with_status(status);
            decode_message(&wire, fx.ctx()).unwrap()
        };

        assert_eq!(event(0).status(), MessageStatus::Info);
        assert_eq!(event(4).status(), MessageStatus::Error);
        assert_eq!(event(0xFFFF).status(), MessageStatus::Warning);
        assert_eq!(event(4).content_str("DESCRIPTION"), Some("device busy"));
        assert_eq!(event(0).kind(), MessageKind::Event);
    }

    #[test]
    fn test_external_broadcast_has_no_destination() {
        let fx = Fixture::new();
        let wire = WireMessage::new(0, fx.motor, BROADCAST_ID, MessageShape::ExternalBroadcast, 1)
            .with_data("B", vec![DataValue::UInt(9)]);
        let msg = decode_message(&wire, fx.ctx()).unwrap();

        assert_eq!(msg.to(), None);
        assert_eq!(msg.topics.tx_type, TxType::Broadcast);
        assert_eq!(msg.content("INFO"), Some(&json!([9])));
    }

    #[test]
    fn test_internal_broadcast_rejected() {
        let fx = Fixture::new();
        let wire = WireMessage::new(0, fx.motor, BROADCAST_ID, MessageShape::InternalBroadcast, 1);
        assert!(matches!(
            decode_message(&wire, fx.ctx()),
            Err(ProtocolError::UnsupportedMessageShape(_))
        ));
    }
}
