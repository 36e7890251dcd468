//! Logical messages exchanged with the broker.
//!
//! A logical message is the structured, name-addressed form of a PCOM
//! message. Its JSON form is `{"TOPICS": {...}, "CONTENTS": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An endpoint given either by name or by numeric wire id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointRef {
    /// Numeric id, used verbatim on the wire.
    Id(u16),
    /// Name resolved through the identity registry.
    Name(String),
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRef::Id(id) => write!(f, "0x{:04X}", id),
            EndpointRef::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for EndpointRef {
    fn from(name: &str) -> Self {
        EndpointRef::Name(name.to_string())
    }
}

impl From<String> for EndpointRef {
    fn from(name: String) -> Self {
        EndpointRef::Name(name)
    }
}

impl From<u16> for EndpointRef {
    fn from(id: u16) -> Self {
        EndpointRef::Id(id)
    }
}

/// How a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    /// Addressed to a single endpoint.
    #[default]
    Direct,
    /// Addressed to every listener.
    Broadcast,
}

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Invoke a command on an item.
    Command,
    /// Get or set a property.
    Property,
    /// Start or stop a datastream.
    Stream,
    /// Reply to an order.
    Response,
    /// Unsolicited notification.
    Event,
}

impl MessageKind {
    /// Wire name of the kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "COMMAND",
            MessageKind::Property => "PROPERTY",
            MessageKind::Stream => "STREAM",
            MessageKind::Response => "RESPONSE",
            MessageKind::Event => "EVENT",
        }
    }
}

/// Status topic of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Success.
    #[default]
    Ok,
    /// Failure; `CONTENTS.DESCRIPTION` explains.
    Error,
    /// Acknowledgment only.
    Ack,
    /// Order still running.
    Progress,
    /// Informational event.
    Info,
    /// Warning event.
    Warning,
}

/// Routing fields of a logical message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topics {
    /// Destination. Absent on external broadcast events.
    #[serde(rename = "TO", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<EndpointRef>,
    /// Sender.
    #[serde(rename = "FROM")]
    pub from: EndpointRef,
    /// Id unique per in-flight exchange; responses echo it.
    #[serde(rename = "MSG_ID", default)]
    pub msg_id: u16,
    /// Direct or broadcast.
    #[serde(rename = "TX_TYPE", default)]
    pub tx_type: TxType,
    /// Message kind.
    #[serde(rename = "MSG_TYPE")]
    pub msg_type: MessageKind,
    /// Whether the sender expects a response.
    #[serde(rename = "RESPONSE_REQ", default)]
    pub response_req: bool,
    /// Message status.
    #[serde(rename = "MSG_STATUS", default)]
    pub msg_status: MessageStatus,
    /// Any other topic fields (e.g. `STREAM` on stream values).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A broker-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    /// Routing fields.
    #[serde(rename = "TOPICS")]
    pub topics: Topics,
    /// Named content fields; meaning depends on the message kind.
    #[serde(rename = "CONTENTS", default)]
    pub contents: Map<String, Value>,
}

impl LogicalMessage {
    /// Create a message with empty contents.
    pub fn new(
        to: impl Into<EndpointRef>,
        from: impl Into<EndpointRef>,
        msg_id: u16,
        msg_type: MessageKind,
    ) -> Self {
        LogicalMessage {
            topics: Topics {
                to: Some(to.into()),
                from: from.into(),
                msg_id,
                tx_type: TxType::Direct,
                msg_type,
                response_req: false,
                msg_status: MessageStatus::Ok,
                extra: Map::new(),
            },
            contents: Map::new(),
        }
    }

    /// Build a COMMAND order. `params` are the command's input parameters.
    pub fn command<I, K>(
        to: impl Into<EndpointRef>,
        from: impl Into<EndpointRef>,
        msg_id: u16,
        command: impl Into<Value>,
        params: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut msg = Self::new(to, from, msg_id, MessageKind::Command);
        msg.topics.response_req = true;
        msg.contents.insert("COMMAND".to_string(), command.into());
        for (key, value) in params {
            msg.contents.insert(key.into(), value);
        }
        msg
    }

    /// Build a PROPERTY get order.
    pub fn get_property(
        to: impl Into<EndpointRef>,
        from: impl Into<EndpointRef>,
        msg_id: u16,
        property: impl Into<Value>,
    ) -> Self {
        let mut msg = Self::new(to, from, msg_id, MessageKind::Property);
        msg.topics.response_req = true;
        msg.contents.insert("PROPERTY".to_string(), property.into());
        msg.contents.insert("ACTION".to_string(), Value::from("GET"));
        msg
    }

    /// Build a PROPERTY set order.
    pub fn set_property(
        to: impl Into<EndpointRef>,
        from: impl Into<EndpointRef>,
        msg_id: u16,
        property: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Self {
        let mut msg = Self::new(to, from, msg_id, MessageKind::Property);
        msg.topics.response_req = true;
        msg.contents.insert("PROPERTY".to_string(), property.into());
        msg.contents.insert("ACTION".to_string(), Value::from("SET"));
        msg.contents.insert("VALUE".to_string(), value.into());
        msg
    }

    /// Build a STREAM subscription (or cancellation when `stop` is set).
    pub fn stream(
        to: impl Into<EndpointRef>,
        from: impl Into<EndpointRef>,
        msg_id: u16,
        stream: impl Into<Value>,
        stop: bool,
    ) -> Self {
        let mut msg = Self::new(to, from, msg_id, MessageKind::Stream);
        msg.topics.response_req = true;
        msg.contents.insert("STREAM".to_string(), stream.into());
        if stop {
            msg.contents.insert("STOP".to_string(), Value::Bool(true));
        }
        msg
    }

    /// Build the RESPONSE/ERROR message routed back to the sender of `original`.
    pub fn error_response(original: &LogicalMessage, description: impl Into<String>) -> Self {
        let from = original
            .topics
            .to
            .clone()
            .unwrap_or(EndpointRef::Id(crate::constants::BROADCAST_ID));
        let mut msg = Self::new(
            original.topics.from.clone(),
            from,
            original.topics.msg_id,
            MessageKind::Response,
        );
        msg.topics.msg_status = MessageStatus::Error;
        msg.contents
            .insert("DESCRIPTION".to_string(), Value::from(description.into()));
        msg
    }

    /// Destination, if any.
    pub fn to(&self) -> Option<&EndpointRef> {
        self.topics.to.as_ref()
    }

    /// Sender.
    pub fn from(&self) -> &EndpointRef {
        &self.topics.from
    }

    /// Message id.
    pub fn msg_id(&self) -> u16 {
        self.topics.msg_id
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.topics.msg_type
    }

    /// Message status.
    pub fn status(&self) -> MessageStatus {
        self.topics.msg_status
    }

    /// Look up a content field.
    pub fn content(&self, key: &str) -> Option<&Value> {
        self.contents.get(key)
    }

    /// Look up a string content field.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.contents.get(key).and_then(Value::as_str)
    }

    /// Whether this is a response with the given message id.
    pub fn is_response_to(&self, msg_id: u16) -> bool {
        self.topics.msg_type == MessageKind::Response && self.topics.msg_id == msg_id
    }
}
