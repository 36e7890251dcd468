//! Link transport state machine.
//!
//! The engine performs no I/O and reads no clock. Callers feed it received
//! bytes and the current time, then drain frames to write with
//! [`LinkEngine::poll_transmit`] and outcomes with [`LinkEngine::poll_event`].
//!
//! ```text
//!            enqueue / pump
//!   Idle ─────────────────────► AwaitingAck(seq, retries_left)
//!    ▲                                 │
//!    │   ACK(seq) / retries exhausted  │ timeout: resend, retries_left - 1
//!    └─────────────────────────────────┘
//!
//!   close() from any state ──► Closed
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use pcom_metrics::metric_defs;
use pcom_protocol::{ack_frame, deframe, frame, FrameAccumulator, ProtocolError, MAX_PAYLOAD_SIZE, SEQUENCE_MODULUS};
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};

/// Identifies one enqueued send.
pub type SendToken = u64;

/// Outcome reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A data frame arrived.
    Received(Vec<u8>),
    /// A send was acknowledged (or written, if it needed no ACK).
    Delivered(SendToken),
    /// A send was abandoned.
    Failed {
        /// The abandoned send.
        token: SendToken,
        /// Why it was abandoned.
        error: LinkError,
    },
}

#[derive(Debug)]
struct Queued {
    token: SendToken,
    payload: Vec<u8>,
    ack_required: bool,
}

#[derive(Debug)]
struct Pending {
    token: SendToken,
    sequence: u8,
    frame: Vec<u8>,
    retries_left: u32,
    attempts: u32,
    first_sent: Instant,
    deadline: Instant,
}

#[derive(Debug)]
enum State {
    Idle,
    AwaitingAck(Pending),
    Closed,
}

/// Per-connection link transport.
#[derive(Debug)]
pub struct LinkEngine {
    name: String,
    ack_timeout: Duration,
    max_retries: u32,
    state: State,
    queue: VecDeque<Queued>,
    next_sequence: u8,
    next_token: SendToken,
    accumulator: FrameAccumulator,
    outbox: VecDeque<Vec<u8>>,
    events: VecDeque<LinkEvent>,
    labels: Vec<(&'static str, String)>,
}

impl LinkEngine {
    /// Create an idle engine.
    pub fn new(config: &LinkConfig) -> Self {
        LinkEngine {
            name: config.name.clone(),
            ack_timeout: config.ack_timeout(),
            max_retries: config.max_retries,
            state: State::Idle,
            queue: VecDeque::new(),
            next_sequence: 0,
            next_token: 1,
            accumulator: FrameAccumulator::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            labels: pcom_metrics::LinkLabels::new(config.name.clone()).to_labels(),
        }
    }

    /// Queue a payload for transmission. Sends go out strictly in order.
    pub fn enqueue(&mut self, payload: Vec<u8>, ack_required: bool, now: Instant) -> LinkResult<SendToken> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        let token = self.next_token;
        self.next_token += 1;
        self.queue.push_back(Queued {
            token,
            payload,
            ack_required,
        });
        self.pump(now);
        self.record_queue_depth();
        Ok(token)
    }

    /// Feed bytes read from the wire.
    pub fn handle_bytes(&mut self, data: &[u8], now: Instant) {
        if self.is_closed() {
            return;
        }
        self.accumulator.push(data);
        while let Some(raw) = self.accumulator.next_frame() {
            self.handle_frame(&raw, now);
        }
    }

    /// Advance timers. Call when [`LinkEngine::next_deadline`] has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        let State::AwaitingAck(pending) = &mut self.state else {
            return;
        };
        if now < pending.deadline {
            return;
        }

        if pending.retries_left > 0 {
            pending.retries_left -= 1;
            pending.attempts += 1;
            pending.deadline = now + self.ack_timeout;
            debug!(
                "LinkEngine[{}]: no ACK for seq {}, retransmitting (attempt {})",
                self.name, pending.sequence, pending.attempts
            );
            self.outbox.push_back(pending.frame.clone());
            metrics::counter!(metric_defs::LINK_RETRANSMISSIONS.name, &self.labels).increment(1);
            metrics::counter!(metric_defs::LINK_FRAMES_SENT.name, &self.labels).increment(1);
            return;
        }

        let (token, sequence, attempts) = (pending.token, pending.sequence, pending.attempts);
        warn!(
            "LinkEngine[{}]: giving up on seq {} after {} transmissions",
            self.name, sequence, attempts
        );
        metrics::counter!(metric_defs::LINK_DELIVERY_FAILURES.name, &self.labels).increment(1);
        self.state = State::Idle;
        self.events.push_back(LinkEvent::Failed {
            token,
            error: LinkError::DeliveryFailed { sequence, attempts },
        });
        self.pump(now);
        self.record_queue_depth();
    }

    /// When [`LinkEngine::handle_timeout`] next needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            State::AwaitingAck(pending) => Some(pending.deadline),
            State::Idle | State::Closed => None,
        }
    }

    /// Next frame to write, in order.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    /// Next outcome, in order.
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Close the link, failing the in-flight send and everything queued.
    pub fn close(&mut self) {
        if let State::AwaitingAck(pending) = std::mem::replace(&mut self.state, State::Closed) {
            self.events.push_back(LinkEvent::Failed {
                token: pending.token,
                error: LinkError::Closed,
            });
        }
        for queued in self.queue.drain(..) {
            self.events.push_back(LinkEvent::Failed {
                token: queued.token,
                error: LinkError::Closed,
            });
        }
        self.accumulator.clear();
        self.record_queue_depth();
        debug!("LinkEngine[{}]: closed", self.name);
    }

    /// Whether [`LinkEngine::close`] was called.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Whether nothing is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Sequence number awaiting an ACK, if any.
    pub fn pending_sequence(&self) -> Option<u8> {
        match &self.state {
            State::AwaitingAck(pending) => Some(pending.sequence),
            State::Idle | State::Closed => None,
        }
    }

    /// Number of sends waiting behind the in-flight one.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn pump(&mut self, now: Instant) {
        while matches!(self.state, State::Idle) {
            let Some(next) = self.queue.pop_front() else {
                return;
            };
            let sequence = self.next_sequence;
            let bytes = match frame(&next.payload, sequence, next.ack_required) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.events.push_back(LinkEvent::Failed {
                        token: next.token,
                        error: e.into(),
                    });
                    continue;
                }
            };
            self.next_sequence = (sequence + 1) % SEQUENCE_MODULUS;
            trace!(
                "LinkEngine[{}]: sending seq {} ({} byte payload, ack={})",
                self.name,
                sequence,
                next.payload.len(),
                next.ack_required
            );
            metrics::counter!(metric_defs::LINK_FRAMES_SENT.name, &self.labels).increment(1);

            if next.ack_required {
                self.outbox.push_back(bytes.clone());
                self.state = State::AwaitingAck(Pending {
                    token: next.token,
                    sequence,
                    frame: bytes,
                    retries_left: self.max_retries,
                    attempts: 1,
                    first_sent: now,
                    deadline: now + self.ack_timeout,
                });
            } else {
                self.outbox.push_back(bytes);
                self.events.push_back(LinkEvent::Delivered(next.token));
            }
        }
    }

    fn handle_frame(&mut self, raw: &[u8], now: Instant) {
        let parsed = match deframe(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("LinkEngine[{}]: dropping frame: {}", self.name, e);
                return;
            }
        };
        metrics::counter!(metric_defs::LINK_FRAMES_RECEIVED.name, &self.labels).increment(1);
        if !parsed.checksum_ok {
            metrics::counter!(metric_defs::LINK_CHECKSUM_MISMATCHES.name, &self.labels).increment(1);
        }

        if parsed.is_ack {
            self.handle_ack(parsed.sequence, now);
            return;
        }
        if parsed.is_nak {
            // the pending timeout drives the retry
            debug!("LinkEngine[{}]: NAK for seq {}", self.name, parsed.sequence);
            return;
        }

        if parsed.ack_required {
            self.outbox.push_back(ack_frame(parsed.sequence));
            metrics::counter!(metric_defs::LINK_ACKS_SENT.name, &self.labels).increment(1);
            metrics::counter!(metric_defs::LINK_FRAMES_SENT.name, &self.labels).increment(1);
        }
        if let Some(payload) = parsed.payload {
            self.events.push_back(LinkEvent::Received(payload));
        }
    }

    fn handle_ack(&mut self, sequence: u8, now: Instant) {
        match &self.state {
            State::AwaitingAck(pending) if pending.sequence == sequence => {
                let latency = now.saturating_duration_since(pending.first_sent);
                metrics::histogram!(metric_defs::LINK_ACK_LATENCY.name, &self.labels)
                    .record(latency.as_micros() as f64);
                trace!("LinkEngine[{}]: ACK for seq {}", self.name, sequence);
                self.events.push_back(LinkEvent::Delivered(pending.token));
                self.state = State::Idle;
                self.pump(now);
                self.record_queue_depth();
            }
            _ => {
                debug!("LinkEngine[{}]: ignoring ACK for unknown seq {}", self.name, sequence);
                metrics::counter!(metric_defs::LINK_STALE_ACKS.name, &self.labels).increment(1);
            }
        }
    }

    fn record_queue_depth(&self) {
        metrics::gauge!(metric_defs::LINK_QUEUE_DEPTH.name, &self.labels).set(self.queue.len() as f64);
    }
}
