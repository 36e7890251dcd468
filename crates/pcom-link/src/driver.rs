//! Async driver: runs a [`Connection`] on a tokio task.
//!
//! The task owns the byte stream and the connection. Callers talk to it
//! through a cloneable [`LinkHandle`]; every request carries a oneshot
//! channel for its answer, and subscribers get inbound messages on unbounded
//! channels so a slow consumer never stalls the frame loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pcom_protocol::{EndpointRef, LogicalMessage, MessageKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionEvent, DescriptorEntry};
use crate::engine::SendToken;
use crate::error::{LinkError, LinkResult};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

type Predicate = Box<dyn Fn(&LogicalMessage) -> bool + Send>;

enum Command {
    Publish {
        msg: LogicalMessage,
        done: oneshot::Sender<LinkResult<()>>,
        response: Option<oneshot::Sender<LogicalMessage>>,
    },
    Discover {
        done: oneshot::Sender<LinkResult<Vec<u16>>>,
    },
    Subscribe {
        filter: Predicate,
        sender: mpsc::UnboundedSender<LogicalMessage>,
    },
    Descriptors {
        done: oneshot::Sender<Vec<DescriptorEntry>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

struct Subscriber {
    filter: Predicate,
    sender: mpsc::UnboundedSender<LogicalMessage>,
}

/// A caller waiting for the RESPONSE to one of its orders. Replies match on
/// msg id with the order's endpoints swapped.
struct ResponseWaiter {
    msg_id: u16,
    requester: u16,
    target: Option<u16>,
    sender: oneshot::Sender<LogicalMessage>,
}

impl ResponseWaiter {
    fn matches(&self, msg_id: u16, to: Option<u16>, from: Option<u16>) -> bool {
        self.msg_id == msg_id
            && to == Some(self.requester)
            && self.target.map_or(true, |target| from == Some(target))
    }
}

/// Matches inbound messages by routing fields. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicFilter {
    /// Required destination.
    pub to: Option<EndpointRef>,
    /// Required sender.
    pub from: Option<EndpointRef>,
    /// Required message kind.
    pub msg_type: Option<MessageKind>,
}

impl TopicFilter {
    /// Create a filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a destination.
    pub fn with_to(mut self, to: impl Into<EndpointRef>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Require a sender.
    pub fn with_from(mut self, from: impl Into<EndpointRef>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Require a message kind.
    pub fn with_msg_type(mut self, msg_type: MessageKind) -> Self {
        self.msg_type = Some(msg_type);
        self
    }

    /// Whether a message passes the filter.
    pub fn matches(&self, msg: &LogicalMessage) -> bool {
        self.to.as_ref().map_or(true, |to| msg.to() == Some(to))
            && self.from.as_ref().map_or(true, |from| msg.from() == from)
            && self.msg_type.map_or(true, |kind| msg.kind() == kind)
    }
}

/// Cloneable handle to a running link task.
#[derive(Clone)]
pub struct LinkHandle {
    name: String,
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle").field("name", &self.name).finish()
    }
}

impl LinkHandle {
    /// Name of the link.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, command: Command) -> LinkResult<()> {
        self.commands.send(command).await.map_err(|_| LinkError::Closed)
    }

    /// Send a message to the device. Resolves once the link has delivered or
    /// abandoned it.
    pub async fn publish(&self, msg: LogicalMessage) -> LinkResult<()> {
        let (done, delivered) = oneshot::channel();
        self.send(Command::Publish {
            msg,
            done,
            response: None,
        })
        .await?;
        delivered.await.map_err(|_| LinkError::Closed)?
    }

    /// Send a message and wait for the RESPONSE with the same msg id, sent
    /// back from the destination to the sender.
    ///
    /// Giving up on the wait, or dropping the future, does not cancel link
    /// retries.
    pub async fn request(&self, msg: LogicalMessage, timeout: Duration) -> LinkResult<LogicalMessage> {
        let msg_id = msg.msg_id();
        let (done, delivered) = oneshot::channel();
        let (response_tx, response) = oneshot::channel();
        self.send(Command::Publish {
            msg,
            done,
            response: Some(response_tx),
        })
        .await?;

        // the task drops the waiter once `response` is gone
        let wait = async {
            delivered.await.map_err(|_| LinkError::Closed)??;
            response.await.map_err(|_| LinkError::Closed)
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::ResponseTimeout {
                msg_id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Run discovery, or join the session in progress. Resolves with the
    /// subsystems found.
    pub async fn discover(&self) -> LinkResult<Vec<u16>> {
        let (done, finished) = oneshot::channel();
        self.send(Command::Discover { done }).await?;
        finished.await.map_err(|_| LinkError::Closed)?
    }

    /// Receive every inbound message that passes `filter`.
    pub async fn subscribe<F>(&self, filter: F) -> LinkResult<mpsc::UnboundedReceiver<LogicalMessage>>
    where
        F: Fn(&LogicalMessage) -> bool + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.send(Command::Subscribe {
            filter: Box::new(filter),
            sender,
        })
        .await?;
        Ok(receiver)
    }

    /// Receive every inbound message whose topics match `filter`.
    pub async fn subscribe_topics(&self, filter: TopicFilter) -> LinkResult<mpsc::UnboundedReceiver<LogicalMessage>> {
        self.subscribe(move |msg| filter.matches(msg)).await
    }

    /// Snapshot of the learned descriptors.
    pub async fn descriptors(&self) -> LinkResult<Vec<DescriptorEntry>> {
        let (done, snapshot) = oneshot::channel();
        self.send(Command::Descriptors { done }).await?;
        snapshot.await.map_err(|_| LinkError::Closed)
    }

    /// Close the link. Outstanding sends fail with [`LinkError::Closed`].
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.send(Command::Close { done }).await.is_ok() {
            let _ = closed.await;
        }
    }
}

/// Spawn a link task over `io` with a fresh connection.
pub fn spawn<T>(io: T, config: LinkConfig) -> (LinkHandle, JoinHandle<LinkResult<()>>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    spawn_connection(io, Connection::new(config))
}

/// Spawn a link task over `io` with a prepared connection (preloaded names,
/// descriptors or error codes).
pub fn spawn_connection<T>(io: T, connection: Connection) -> (LinkHandle, JoinHandle<LinkResult<()>>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let name = connection.config().name.clone();
    let (reader, writer) = tokio::io::split(io);
    let driver = Driver {
        reader,
        writer,
        connection,
        commands: receiver,
        pending_sends: HashMap::new(),
        responses: Vec::new(),
        discovery_waiters: Vec::new(),
        subscribers: Vec::new(),
    };
    let task = tokio::spawn(driver.run());
    (LinkHandle { name, commands }, task)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

struct Driver<T> {
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    connection: Connection,
    commands: mpsc::Receiver<Command>,
    pending_sends: HashMap<SendToken, oneshot::Sender<LinkResult<()>>>,
    responses: Vec<ResponseWaiter>,
    discovery_waiters: Vec<oneshot::Sender<LinkResult<Vec<u16>>>>,
    subscribers: Vec<Subscriber>,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) -> LinkResult<()> {
        let name = self.connection.config().name.clone();
        let mut read_buf = vec![0u8; self.connection.config().read_buffer_size.max(1)];
        info!("Link[{}]: started", name);

        loop {
            if let Err(e) = self.flush().await {
                warn!("Link[{}]: write failed: {}", name, e);
                return self.shutdown(Err(e.into()));
            }
            self.dispatch();
            if self.connection.is_closed() {
                info!("Link[{}]: closed", name);
                return Ok(());
            }

            let deadline = self.connection.next_deadline();
            tokio::select! {
                result = self.reader.read(&mut read_buf) => match result {
                    Ok(0) => {
                        debug!("Link[{}]: stream ended", name);
                        self.connection.close(now());
                    }
                    Ok(n) => {
                        trace!("Link[{}]: read {} bytes", name, n);
                        self.connection.handle_bytes(&read_buf[..n], now());
                    }
                    Err(e) => {
                        warn!("Link[{}]: read failed: {}", name, e);
                        return self.shutdown(Err(e.into()));
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Link[{}]: all handles dropped", name);
                        self.connection.close(now());
                    }
                },
                _ = sleep_until(deadline) => self.connection.handle_timeout(now()),
            }
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        let mut wrote = false;
        while let Some(frame) = self.connection.poll_transmit() {
            self.writer.write_all(&frame).await?;
            wrote = true;
        }
        if wrote {
            self.writer.flush().await?;
        }
        Ok(())
    }

    fn shutdown(mut self, result: LinkResult<()>) -> LinkResult<()> {
        self.connection.close(now());
        self.dispatch();
        result
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish { msg, done, response } => {
                let msg_id = msg.msg_id();
                let from = msg.from().clone();
                let to = msg.to().cloned();
                match self.connection.publish(msg, now()) {
                    Ok(token) => {
                        self.pending_sends.insert(token, done);
                        if let Some(sender) = response {
                            self.wait_for_response(msg_id, &from, to.as_ref(), sender);
                        }
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                }
            }
            Command::Discover { done } => match self.connection.begin_discovery(now()) {
                Ok(_) => self.discovery_waiters.push(done),
                Err(e) => {
                    let _ = done.send(Err(e));
                }
            },
            Command::Subscribe { filter, sender } => {
                self.subscribers.push(Subscriber { filter, sender });
            }
            Command::Descriptors { done } => {
                let _ = done.send(self.connection.descriptors());
            }
            Command::Close { done } => {
                self.connection.close(now());
                self.dispatch();
                let _ = done.send(());
            }
        }
    }

    fn wait_for_response(
        &mut self,
        msg_id: u16,
        from: &EndpointRef,
        to: Option<&EndpointRef>,
        sender: oneshot::Sender<LogicalMessage>,
    ) {
        let registry = self.connection.registry();
        // publish just resolved both endpoints
        let Some(requester) = registry.lookup(from) else {
            return;
        };
        let target = to.and_then(|to| registry.lookup(to));
        self.responses.retain(|w| !w.sender.is_closed());
        self.responses.push(ResponseWaiter {
            msg_id,
            requester,
            target,
            sender,
        });
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.connection.poll_event() {
            match event {
                ConnectionEvent::Message(msg) => self.deliver(msg),
                ConnectionEvent::SendComplete { token, result } => {
                    if let Some(done) = self.pending_sends.remove(&token) {
                        let _ = done.send(result);
                    }
                }
                ConnectionEvent::DiscoveryFinished(result) => {
                    for waiter in self.discovery_waiters.drain(..) {
                        let _ = waiter.send(result.clone());
                    }
                }
            }
        }
    }

    fn deliver(&mut self, msg: LogicalMessage) {
        if msg.kind() == MessageKind::Response {
            self.responses.retain(|w| !w.sender.is_closed());
            let registry = self.connection.registry();
            let to = msg.to().and_then(|to| registry.lookup(to));
            let from = registry.lookup(msg.from());
            if let Some(i) = self.responses.iter().position(|w| w.matches(msg.msg_id(), to, from)) {
                let waiter = self.responses.remove(i);
                let _ = waiter.sender.send(msg.clone());
            }
        }
        self.subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in &self.subscribers {
            if (subscriber.filter)(&msg) {
                let _ = subscriber.sender.send(msg.clone());
            }
        }
    }
}
