//! One device connection: codec, link transport and discovery glued together.
//!
//! A [`Connection`] speaks logical messages on one side and framed bytes on
//! the other. It owns the per-connection identity registry and descriptor
//! table, so two connections never share ids. Like [`LinkEngine`] it is
//! sans-IO; [`crate::driver`] runs it on a tokio task.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use pcom_metrics::metric_defs;
use pcom_protocol::{
    decode_message, encode_message, DecodeContext, DescriptorTable, EndpointRef, ErrorCodeTable,
    FormatDescriptor, IdentityRegistry, ItemKind, LogicalMessage, MessageKind, MessageStatus,
    ProtocolError, WireMessage,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::LinkConfig;
use crate::discovery::{Begin, DiscoveryAction, DiscoverySession, DiscoveryState};
use crate::engine::{LinkEngine, LinkEvent, SendToken};
use crate::error::{LinkError, LinkResult};

/// Outcome reported by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A logical message for the broker: decoded inbound traffic, or an
    /// error response generated locally.
    Message(LogicalMessage),
    /// A published message was delivered or abandoned.
    SendComplete {
        /// Token returned by [`Connection::publish`].
        token: SendToken,
        /// Link-level outcome.
        result: LinkResult<()>,
    },
    /// A discovery session ended.
    DiscoveryFinished(LinkResult<Vec<u16>>),
}

/// One learned descriptor, flattened for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescriptorEntry {
    /// Id of the item that owns the descriptor.
    pub destination: u16,
    /// Name of the item, if known.
    pub endpoint: EndpointRef,
    /// Command, property or stream.
    pub kind: ItemKind,
    /// The descriptor itself.
    pub descriptor: FormatDescriptor,
}

#[derive(Debug)]
enum Outstanding {
    Published(LogicalMessage),
    Discovery,
}

/// A device connection.
#[derive(Debug)]
pub struct Connection {
    config: LinkConfig,
    engine: LinkEngine,
    registry: IdentityRegistry,
    table: DescriptorTable,
    errors: ErrorCodeTable,
    discovery: DiscoverySession,
    in_flight: HashMap<SendToken, Outstanding>,
    events: VecDeque<ConnectionEvent>,
    labels: Vec<(&'static str, String)>,
}

impl Connection {
    /// Create a connection with empty tables.
    pub fn new(config: LinkConfig) -> Self {
        Connection {
            engine: LinkEngine::new(&config),
            registry: IdentityRegistry::new(),
            table: DescriptorTable::new(),
            errors: ErrorCodeTable::new(),
            discovery: DiscoverySession::new(config.discovery_timeout()),
            in_flight: HashMap::new(),
            events: VecDeque::new(),
            labels: pcom_metrics::LinkLabels::new(config.name.clone()).to_labels(),
            config,
        }
    }

    /// Use a custom status code table for error descriptions.
    pub fn with_error_codes(mut self, errors: ErrorCodeTable) -> Self {
        self.errors = errors;
        self
    }

    /// Get the link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Get the identity registry.
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Get the identity registry mutably (e.g. to bind static names).
    pub fn registry_mut(&mut self) -> &mut IdentityRegistry {
        &mut self.registry
    }

    /// Get the descriptor table.
    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    /// Get the descriptor table mutably (e.g. to preload descriptors).
    pub fn table_mut(&mut self) -> &mut DescriptorTable {
        &mut self.table
    }

    /// State of discovery.
    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    /// Encode a logical message and queue it for the device.
    ///
    /// The outcome arrives later as [`ConnectionEvent::SendComplete`] with
    /// the returned token.
    pub fn publish(&mut self, msg: LogicalMessage, now: Instant) -> LinkResult<SendToken> {
        if self.engine.is_closed() {
            return Err(LinkError::Closed);
        }
        let payload = encode_message(&msg, &self.table, &mut self.registry)
            .and_then(|wire| wire.encode())
            .map_err(|e| {
                metrics::counter!(metric_defs::CODEC_ENCODE_ERRORS.name, &self.labels).increment(1);
                debug!("Connection[{}]: cannot encode message {}: {}", self.config.name, msg.msg_id(), e);
                e
            })?;

        let token = self.engine.enqueue(payload, self.config.ack_required, now)?;
        self.in_flight.insert(token, Outstanding::Published(msg));
        self.drain_engine(now);
        Ok(token)
    }

    /// Start discovery, or join the session already running.
    ///
    /// The result arrives as [`ConnectionEvent::DiscoveryFinished`].
    pub fn begin_discovery(&mut self, now: Instant) -> LinkResult<Begin> {
        if self.engine.is_closed() {
            return Err(LinkError::Closed);
        }
        let begin = self.discovery.begin(now);
        if let Begin::Started(wire) = &begin {
            metrics::counter!(metric_defs::DISCOVERY_SESSIONS.name, &self.labels).increment(1);
            self.send_query(wire.clone(), now);
            self.drain_engine(now);
        }
        Ok(begin)
    }

    /// Feed bytes read from the device.
    pub fn handle_bytes(&mut self, data: &[u8], now: Instant) {
        self.engine.handle_bytes(data, now);
        self.drain_engine(now);
    }

    /// Advance timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.engine.handle_timeout(now);
        self.drain_engine(now);
        if let Some(action) = self.discovery.handle_timeout(now) {
            self.apply_discovery(action, now);
            self.drain_engine(now);
        }
    }

    /// Earliest time [`Connection::handle_timeout`] needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.engine.next_deadline(), self.discovery.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Next frame to write to the device.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.engine.poll_transmit()
    }

    /// Next event, in order.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Close the connection. Everything in flight fails with
    /// [`LinkError::Closed`].
    pub fn close(&mut self, now: Instant) {
        if let Some(action) = self.discovery.abort(LinkError::Closed) {
            self.apply_discovery(action, now);
        }
        self.engine.close();
        self.drain_engine(now);
    }

    /// Whether [`Connection::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Every learned descriptor, ordered by destination.
    pub fn descriptors(&self) -> Vec<DescriptorEntry> {
        let mut entries = Vec::new();
        for destination in self.table.destinations() {
            for kind in [ItemKind::Command, ItemKind::Property, ItemKind::Stream] {
                for descriptor in self.table.items(destination, kind) {
                    entries.push(DescriptorEntry {
                        destination,
                        endpoint: self.registry.name_for(destination),
                        kind,
                        descriptor: descriptor.clone(),
                    });
                }
            }
        }
        entries
    }

    fn drain_engine(&mut self, now: Instant) {
        while let Some(event) = self.engine.poll_event() {
            match event {
                LinkEvent::Received(payload) => self.handle_payload(&payload, now),
                LinkEvent::Delivered(token) => match self.in_flight.remove(&token) {
                    Some(Outstanding::Published(_)) => self.events.push_back(ConnectionEvent::SendComplete {
                        token,
                        result: Ok(()),
                    }),
                    Some(Outstanding::Discovery) | None => {}
                },
                LinkEvent::Failed { token, error } => match self.in_flight.remove(&token) {
                    Some(Outstanding::Published(msg)) => {
                        self.events.push_back(ConnectionEvent::SendComplete {
                            token,
                            result: Err(error.clone()),
                        });
                        if error != LinkError::Closed {
                            let response = LogicalMessage::error_response(&msg, error.to_string());
                            self.events.push_back(ConnectionEvent::Message(response));
                        }
                    }
                    Some(Outstanding::Discovery) => {
                        if let Some(action) = self.discovery.handle_send_failed(error) {
                            self.apply_discovery(action, now);
                        }
                    }
                    None => {}
                },
            }
        }
    }

    fn handle_payload(&mut self, payload: &[u8], now: Instant) {
        let wire = match WireMessage::decode(payload) {
            Ok(wire) => wire,
            Err(e) => {
                metrics::counter!(metric_defs::CODEC_DECODE_ERRORS.name, &self.labels).increment(1);
                match WireMessage::decode_header(payload) {
                    Ok(header) => {
                        warn!(
                            "Connection[{}]: undecodable data in message {} from 0x{:04X}: {}",
                            self.config.name, header.msg_id, header.from, e
                        );
                        let response = self.decode_error_response(&header, &e);
                        self.events.push_back(ConnectionEvent::Message(response));
                    }
                    Err(_) => warn!("Connection[{}]: dropping payload: {}", self.config.name, e),
                }
                return;
            }
        };

        if self.discovery.is_reply(&wire) {
            if let Some(action) = self
                .discovery
                .handle_reply(&wire, &mut self.table, &mut self.registry, now)
            {
                self.apply_discovery(action, now);
            }
            return;
        }

        let ctx = DecodeContext {
            table: &self.table,
            registry: &self.registry,
            errors: &self.errors,
        };
        match decode_message(&wire, ctx) {
            Ok(msg) => self.events.push_back(ConnectionEvent::Message(msg)),
            Err(e) => {
                metrics::counter!(metric_defs::CODEC_DECODE_ERRORS.name, &self.labels).increment(1);
                warn!(
                    "Connection[{}]: cannot decode message {} from 0x{:04X}: {}",
                    self.config.name, wire.msg_id, wire.from, e
                );
                let response = self.decode_error_response(&wire, &e);
                self.events.push_back(ConnectionEvent::Message(response));
            }
        }
    }

    fn decode_error_response(&self, header: &WireMessage, error: &ProtocolError) -> LogicalMessage {
        let mut msg = LogicalMessage::new(
            self.registry.name_for(header.to),
            self.registry.name_for(header.from),
            header.msg_id,
            MessageKind::Response,
        );
        msg.topics.msg_status = MessageStatus::Error;
        msg.contents
            .insert("DESCRIPTION".to_string(), Value::from(error.to_string()));
        msg
    }

    fn apply_discovery(&mut self, action: DiscoveryAction, now: Instant) {
        match action {
            DiscoveryAction::Send(wire) => self.send_query(wire, now),
            DiscoveryAction::Finished(result) => {
                if let Ok(subsystems) = &result {
                    debug!(
                        "Connection[{}]: discovery found {} subsystems, {} descriptors",
                        self.config.name,
                        subsystems.len(),
                        self.table.len()
                    );
                }
                metrics::gauge!(metric_defs::DISCOVERY_DESCRIPTORS.name, &self.labels)
                    .set(self.table.len() as f64);
                self.events.push_back(ConnectionEvent::DiscoveryFinished(result));
            }
        }
    }

    fn send_query(&mut self, wire: WireMessage, now: Instant) {
        let sent = wire
            .encode()
            .map_err(LinkError::from)
            .and_then(|payload| self.engine.enqueue(payload, self.config.ack_required, now));
        match sent {
            Ok(token) => {
                self.in_flight.insert(token, Outstanding::Discovery);
            }
            Err(e) => {
                if let Some(action) = self.discovery.handle_send_failed(e) {
                    self.apply_discovery(action, now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pcom_protocol::{
        ack_frame, deframe, frame, DataValue, MessageShape, BROADCAST_ID, DISCOVERY_SERVICE_ID,
    };
    use serde_json::json;

    fn connection() -> Connection {
        Connection::new(LinkConfig::default().with_name("test"))
    }

    fn sent_wires(conn: &mut Connection) -> Vec<WireMessage> {
        std::iter::from_fn(|| conn.poll_transmit())
            .filter_map(|raw| deframe(&raw).ok()?.payload)
            .map(|payload| WireMessage::decode(&payload).unwrap())
            .collect()
    }

    fn events(conn: &mut Connection) -> Vec<ConnectionEvent> {
        std::iter::from_fn(|| conn.poll_event()).collect()
    }

    fn device_frame(wire: WireMessage, seq: u8) -> Vec<u8> {
        frame(&wire.encode().unwrap(), seq, false).unwrap()
    }

    fn preload_home(conn: &mut Connection) {
        conn.registry_mut().bind("motor1", 0x0101);
        conn.table_mut().insert(
            0x0101,
            ItemKind::Command,
            FormatDescriptor::new(5, "home", "B").with_inputs(["motor_num"]),
        );
    }

    #[test]
    fn test_publish_and_ack() {
        let mut conn = connection();
        preload_home(&mut conn);
        let t0 = Instant::now();
        let msg = LogicalMessage::command("motor1", "ui", 1, "home", [("motor_num", json!(3))]);
        let token = conn.publish(msg, t0).unwrap();

        let sent = sent_wires(&mut conn);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, 0x0101);
        assert_eq!(sent[0].data, vec![DataValue::UInt(3)]);

        conn.handle_bytes(&ack_frame(0), t0);
        assert_eq!(
            events(&mut conn),
            vec![ConnectionEvent::SendComplete { token, result: Ok(()) }]
        );
    }

    #[test]
    fn test_unknown_item_is_rejected() {
        let mut conn = connection();
        let msg = LogicalMessage::command("motor1", "ui", 1, "home", Vec::<(String, Value)>::new());
        assert!(matches!(
            conn.publish(msg, Instant::now()),
            Err(LinkError::Protocol(ProtocolError::UnknownFormat { .. }))
        ));
        assert!(conn.poll_transmit().is_none());
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let mut conn = connection();
        conn.registry_mut().bind("motor1", 0x0101);
        conn.table_mut()
            .insert(0x0101, ItemKind::Property, FormatDescriptor::new(2, "label", "s"));
        let msg = LogicalMessage::set_property("motor1", "ui", 1, "label", "x".repeat(70_000));

        assert!(matches!(
            conn.publish(msg, Instant::now()),
            Err(LinkError::Protocol(ProtocolError::PayloadTooLarge { .. }))
        ));
        assert!(conn.poll_transmit().is_none());

        let small = LogicalMessage::set_property("motor1", "ui", 2, "label", "ok");
        assert!(conn.publish(small, Instant::now()).is_ok());
    }

    #[test]
    fn test_delivery_failure_produces_error_response() {
        let mut conn = connection();
        preload_home(&mut conn);
        let mut now = Instant::now();
        let msg = LogicalMessage::command("motor1", "ui", 7, "home", [("motor_num", json!(1))]);
        let token = conn.publish(msg, now).unwrap();

        while let Some(deadline) = conn.next_deadline() {
            now = deadline;
            conn.handle_timeout(now);
        }

        let events = events(&mut conn);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ConnectionEvent::SendComplete { token: t, result: Err(LinkError::DeliveryFailed { attempts: 4, .. }) } if *t == token
        ));
        let ConnectionEvent::Message(response) = &events[1] else {
            panic!("expected an error response");
        };
        assert_eq!(response.to(), Some(&EndpointRef::from("ui")));
        assert_eq!(response.from(), &EndpointRef::from("motor1"));
        assert_eq!(response.msg_id(), 7);
        assert_eq!(response.status(), MessageStatus::Error);
    }

    #[test]
    fn test_inbound_response_is_decoded() {
        let mut conn = connection();
        preload_home(&mut conn);
        let ui = conn.registry_mut().id_for("ui").unwrap();

        let reply = WireMessage::new(1, 0x0101, ui, MessageShape::CommandComplete, 5);
        conn.handle_bytes(&device_frame(reply, 0), Instant::now());

        let events = events(&mut conn);
        let [ConnectionEvent::Message(msg)] = &events[..] else {
            panic!("expected one message, got {:?}", events);
        };
        assert!(msg.is_response_to(1));
        assert_eq!(msg.to(), Some(&EndpointRef::from("ui")));
        assert_eq!(msg.from(), &EndpointRef::from("motor1"));
    }

    #[test]
    fn test_undecodable_data_produces_error_response() {
        let mut conn = connection();
        conn.registry_mut().bind("motor1", 0x0101);
        let ui = conn.registry_mut().id_for("ui").unwrap();

        let mut payload = WireMessage::new(9, 0x0101, ui, MessageShape::CommandComplete, 5)
            .with_data("H", vec![DataValue::UInt(1)])
            .encode()
            .unwrap();
        payload.pop();
        conn.handle_bytes(&frame(&payload, 0, false).unwrap(), Instant::now());

        let events = events(&mut conn);
        let [ConnectionEvent::Message(msg)] = &events[..] else {
            panic!("expected one message, got {:?}", events);
        };
        assert_eq!(msg.status(), MessageStatus::Error);
        assert_eq!(msg.msg_id(), 9);
        assert_eq!(msg.to(), Some(&EndpointRef::from("ui")));
    }

    #[test]
    fn test_short_payload_is_dropped() {
        let mut conn = connection();
        conn.handle_bytes(&frame(&[1, 2, 3], 0, false).unwrap(), Instant::now());
        assert!(events(&mut conn).is_empty());
    }

    #[test]
    fn test_discovery_round() {
        let mut conn = connection();
        let t0 = Instant::now();
        assert!(matches!(conn.begin_discovery(t0), Ok(Begin::Started(_))));
        assert_eq!(conn.begin_discovery(t0), Ok(Begin::Joined));

        let sent = sent_wires(&mut conn);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, BROADCAST_ID);
        conn.handle_bytes(&ack_frame(0), t0);

        let answer = WireMessage::new(sent[0].msg_id, 0x0100, DISCOVERY_SERVICE_ID, MessageShape::CommandComplete, 0)
            .with_data("B", vec![1u8.into()]);
        conn.handle_bytes(&device_frame(answer, 0), t0);

        let query = sent_wires(&mut conn);
        assert_eq!(query.len(), 1);
        assert_eq!(query[0].to, 0x0100);
        conn.handle_bytes(&ack_frame(1), t0);

        let items = WireMessage::new(query[0].msg_id, 0x0100, DISCOVERY_SERVICE_ID, MessageShape::CommandComplete, 0)
            .with_data(
                "HBHsHBHs",
                vec![
                    0x0101u16.into(),
                    3u8.into(),
                    0u16.into(),
                    "motor1".into(),
                    0x0101u16.into(),
                    1u8.into(),
                    2u16.into(),
                    "speed|H|value|".into(),
                ],
            );
        conn.handle_bytes(&device_frame(items, 1), t0);

        assert_eq!(events(&mut conn), vec![ConnectionEvent::DiscoveryFinished(Ok(vec![1]))]);
        assert_eq!(conn.discovery_state(), DiscoveryState::Complete);

        let descriptors = conn.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].endpoint, EndpointRef::from("motor1"));
        assert_eq!(descriptors[0].kind, ItemKind::Property);

        // learned descriptors are usable right away
        let get = LogicalMessage::get_property("motor1", "ui", 2, "speed");
        assert!(conn.publish(get, t0).is_ok());
    }

    #[test]
    fn test_discovery_fails_when_broadcast_undelivered() {
        let mut conn = connection();
        let t0 = Instant::now();
        let mut now = t0;
        conn.begin_discovery(now).unwrap();

        let mut seen = Vec::new();
        while let Some(deadline) = conn.next_deadline() {
            now = deadline;
            conn.handle_timeout(now);
            seen.extend(events(&mut conn));
        }

        // the link gives up after four transmissions, before the query timeout
        assert_eq!(now - t0, Duration::from_millis(2000));
        assert!(matches!(
            &seen[..],
            [ConnectionEvent::DiscoveryFinished(Err(LinkError::DeliveryFailed { attempts: 4, .. }))]
        ));
        assert_eq!(conn.discovery_state(), DiscoveryState::Complete);
    }

    #[test]
    fn test_close_fails_outstanding() {
        let mut conn = connection();
        preload_home(&mut conn);
        let t0 = Instant::now();
        let a = conn
            .publish(LogicalMessage::command("motor1", "ui", 1, "home", [("motor_num", json!(1))]), t0)
            .unwrap();
        let b = conn
            .publish(LogicalMessage::command("motor1", "ui", 2, "home", [("motor_num", json!(2))]), t0)
            .unwrap();
        conn.close(t0);

        assert_eq!(
            events(&mut conn),
            vec![
                ConnectionEvent::SendComplete { token: a, result: Err(LinkError::Closed) },
                ConnectionEvent::SendComplete { token: b, result: Err(LinkError::Closed) },
            ]
        );
        assert!(conn.is_closed());
        assert_eq!(
            conn.publish(LogicalMessage::get_property("motor1", "ui", 3, "x"), t0),
            Err(LinkError::Closed)
        );
    }
}
