//! Discovery session.
//!
//! Discovery learns which subsystems are attached and what each one exposes:
//!
//! 1. broadcast command 0 to `0x8000`; the reply lists subsystem numbers
//! 2. for each subsystem, send command 0 to `subsystem << 8`; the reply is a
//!    list of item records
//!
//! Item records are groups of four values, `H B H s`:
//!
//! | Field    | Meaning                                                  |
//! |----------|----------------------------------------------------------|
//! | item_id  | endpoint id of the item                                  |
//! | kind     | 0 command, 1 property, 2 stream, 3 item name             |
//! | local_id | command/property/stream id (unused for kind 3)           |
//! | spec     | `name\|format\|in1,in2\|out1,out2`, or the item name     |
//!
//! Like the engine, the session is sans-IO: it hands back wire messages to
//! send and is told about replies, send failures and the time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use pcom_protocol::{
    DataValue, DescriptorTable, FormatDescriptor, IdentityRegistry, ItemKind, MessageShape,
    WireMessage, BROADCAST_ID, BROADCAST_SUBSYSTEM, DISCOVERY_SERVICE_ID, ENUMERATE_COMMAND,
    SUBSYSTEM_SHIFT,
};
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};

/// Kind code of an item-name record.
pub const ITEM_NAME_KIND: u8 = 3;

/// Lifecycle of a discovery session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Never run.
    NotStarted,
    /// Waiting on the broadcast or an enumeration reply.
    InProgress,
    /// Last run finished (successfully or not).
    Complete,
}

/// Result of asking for discovery.
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// A new session started; send this broadcast.
    Started(WireMessage),
    /// A session is already running; wait for its result.
    Joined,
}

/// What the caller should do after feeding the session.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryAction {
    /// Send this query.
    Send(WireMessage),
    /// The session ended; hand the result to every waiter.
    Finished(LinkResult<Vec<u16>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Broadcast,
    Subsystem(u16),
}

#[derive(Debug, Clone)]
struct Query {
    msg_id: u16,
    target: Target,
    deadline: Instant,
}

/// State of the bootstrap handshake for one connection.
#[derive(Debug)]
pub struct DiscoverySession {
    state: DiscoveryState,
    timeout: Duration,
    subsystems: Vec<u16>,
    remaining: VecDeque<u16>,
    outstanding: Option<Query>,
    next_msg_id: u16,
}

impl DiscoverySession {
    /// Create an idle session. `timeout` bounds each query.
    pub fn new(timeout: Duration) -> Self {
        DiscoverySession {
            state: DiscoveryState::NotStarted,
            timeout,
            subsystems: Vec::new(),
            remaining: VecDeque::new(),
            outstanding: None,
            next_msg_id: 1,
        }
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Subsystems found by the current or last session.
    pub fn subsystems(&self) -> &[u16] {
        &self.subsystems
    }

    /// Start a session, or join the running one.
    pub fn begin(&mut self, now: Instant) -> Begin {
        if self.state == DiscoveryState::InProgress {
            debug!("Discovery: joining session in progress");
            return Begin::Joined;
        }
        info!("Discovery: broadcasting");
        self.state = DiscoveryState::InProgress;
        self.subsystems.clear();
        self.remaining.clear();
        Begin::Started(self.query(Target::Broadcast, now))
    }

    /// Whether a received message answers the outstanding query.
    pub fn is_reply(&self, wire: &WireMessage) -> bool {
        wire.to == DISCOVERY_SERVICE_ID
            && self
                .outstanding
                .as_ref()
                .is_some_and(|q| q.msg_id == wire.msg_id)
    }

    /// Msg id of the outstanding query.
    pub fn outstanding_msg_id(&self) -> Option<u16> {
        self.outstanding.as_ref().map(|q| q.msg_id)
    }

    /// Consume a reply. Learned names and descriptors go into `registry` and
    /// `table`. Returns `None` if the message is not a reply to this session.
    pub fn handle_reply(
        &mut self,
        wire: &WireMessage,
        table: &mut DescriptorTable,
        registry: &mut IdentityRegistry,
        now: Instant,
    ) -> Option<DiscoveryAction> {
        if !self.is_reply(wire) {
            return None;
        }
        let query = self.outstanding.take()?;

        if wire.status != 0 {
            warn!(
                "Discovery: {:?} answered with status {}",
                query.target, wire.status
            );
        }

        match query.target {
            Target::Broadcast => {
                for value in &wire.data {
                    match subsystem_number(value) {
                        Some(sub) if sub != BROADCAST_SUBSYSTEM && !self.subsystems.contains(&sub) => {
                            self.subsystems.push(sub)
                        }
                        Some(_) => {}
                        None => warn!("Discovery: ignoring subsystem value {}", value),
                    }
                }
                info!("Discovery: found subsystems {:?}", self.subsystems);
                self.remaining = self.subsystems.iter().copied().collect();
            }
            Target::Subsystem(sub) => {
                let learned = load_item_records(&wire.data, table, registry);
                debug!("Discovery: subsystem {} described {} items", sub, learned);
            }
        }
        Some(self.advance(now))
    }

    /// Fail the session because the link could not carry the outstanding
    /// query.
    pub fn handle_send_failed(&mut self, error: LinkError) -> Option<DiscoveryAction> {
        if self.state != DiscoveryState::InProgress {
            return None;
        }
        warn!("Discovery: query could not be delivered: {}", error);
        Some(self.finish(Err(error)))
    }

    /// Advance timers.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<DiscoveryAction> {
        let query = self.outstanding.as_ref()?;
        if now < query.deadline {
            return None;
        }
        match query.target {
            Target::Broadcast => Some(self.finish(Err(LinkError::Discovery(
                "no reply to discovery broadcast".to_string(),
            )))),
            Target::Subsystem(sub) => {
                warn!("Discovery: subsystem {} did not answer, skipping", sub);
                self.outstanding = None;
                Some(self.advance(now))
            }
        }
    }

    /// When [`DiscoverySession::handle_timeout`] next needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|q| q.deadline)
    }

    /// Abort a running session.
    pub fn abort(&mut self, error: LinkError) -> Option<DiscoveryAction> {
        if self.state != DiscoveryState::InProgress {
            return None;
        }
        Some(self.finish(Err(error)))
    }

    fn advance(&mut self, now: Instant) -> DiscoveryAction {
        match self.remaining.pop_front() {
            Some(sub) => DiscoveryAction::Send(self.query(Target::Subsystem(sub), now)),
            None => {
                info!("Discovery: complete");
                let found = self.subsystems.clone();
                self.finish(Ok(found))
            }
        }
    }

    fn finish(&mut self, result: LinkResult<Vec<u16>>) -> DiscoveryAction {
        self.state = DiscoveryState::Complete;
        self.outstanding = None;
        self.remaining.clear();
        DiscoveryAction::Finished(result)
    }

    fn query(&mut self, target: Target, now: Instant) -> WireMessage {
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
        self.outstanding = Some(Query {
            msg_id,
            target,
            deadline: now + self.timeout,
        });
        let to = match target {
            Target::Broadcast => BROADCAST_ID,
            Target::Subsystem(sub) => sub << SUBSYSTEM_SHIFT,
        };
        WireMessage::new(msg_id, DISCOVERY_SERVICE_ID, to, MessageShape::Command, ENUMERATE_COMMAND)
    }
}

/// Subsystem number carried in a broadcast reply value: an integer, or the
/// first byte of a string.
fn subsystem_number(value: &DataValue) -> Option<u16> {
    match value {
        DataValue::Str(s) => s.bytes().next().map(u16::from),
        other => other.as_u16().filter(|&n| n <= 0xFF),
    }
}

/// Load item records into the tables. Returns how many records were used.
pub fn load_item_records(
    data: &[DataValue],
    table: &mut DescriptorTable,
    registry: &mut IdentityRegistry,
) -> usize {
    let chunks = data.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        warn!(
            "Discovery: ignoring {} trailing values in item records",
            chunks.remainder().len()
        );
    }

    let mut learned = 0;
    for record in chunks {
        let (Some(item_id), Some(kind), Some(local_id), Some(spec)) = (
            record[0].as_u16(),
            record[1].as_u16(),
            record[2].as_u16(),
            record[3].as_str(),
        ) else {
            warn!("Discovery: malformed item record {:?}", record);
            continue;
        };

        if kind == ITEM_NAME_KIND as u16 {
            registry.bind(spec, item_id);
            learned += 1;
            continue;
        }
        let Some(kind) = u8::try_from(kind).ok().and_then(ItemKind::from_code) else {
            warn!("Discovery: unknown item kind {} for 0x{:04X}", kind, item_id);
            continue;
        };
        match FormatDescriptor::parse_spec(local_id, spec) {
            Ok(descriptor) => {
                debug!(
                    "Discovery: 0x{:04X} {} {} = {:?}",
                    item_id, kind, local_id, descriptor.name
                );
                table.insert(item_id, kind, descriptor);
                learned += 1;
            }
            Err(e) => warn!("Discovery: bad spec {:?} for 0x{:04X}: {}", spec, item_id, e),
        }
    }
    learned
}
