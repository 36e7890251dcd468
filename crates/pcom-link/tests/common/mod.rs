//! In-memory fake device for driving a link task end to end.

#![allow(dead_code)]

use std::time::Duration;

use pcom_link::{spawn_connection, Connection, LinkConfig, LinkHandle, LinkResult};
use pcom_protocol::{
    deframe, frame, Deframed, FormatDescriptor, FrameAccumulator, ItemKind, WireMessage,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub const MOTOR1: u16 = 0x0101;

/// The device end of a duplex pipe.
pub struct FakeDevice {
    stream: DuplexStream,
    accumulator: FrameAccumulator,
    next_sequence: u8,
}

impl FakeDevice {
    /// Read the next frame written by the link, ACKs included.
    pub async fn next_frame(&mut self) -> Deframed {
        let mut buf = [0u8; 256];
        loop {
            if let Some(raw) = self.accumulator.next_frame() {
                return deframe(&raw).expect("link wrote a malformed frame");
            }
            let n = self.stream.read(&mut buf).await.expect("read from link");
            assert!(n > 0, "link closed the stream");
            self.accumulator.push(&buf[..n]);
        }
    }

    /// Read the next data frame, skipping ACKs.
    pub async fn next_message(&mut self) -> (Deframed, WireMessage) {
        loop {
            let parsed = self.next_frame().await;
            if let Some(payload) = &parsed.payload {
                let wire = WireMessage::decode(payload).expect("link wrote a bad message");
                return (parsed, wire);
            }
        }
    }

    /// Whether the link writes anything within `wait`.
    pub async fn is_silent_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.next_frame()).await.is_err()
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to link");
    }

    pub async fn ack(&mut self, sequence: u8) {
        self.write_raw(&pcom_protocol::ack_frame(sequence)).await;
    }

    /// Send a message without asking for an ACK.
    pub async fn send(&mut self, wire: WireMessage) {
        self.send_with(wire, false).await;
    }

    pub async fn send_with(&mut self, wire: WireMessage, ack_required: bool) -> u8 {
        let sequence = self.next_sequence;
        self.next_sequence = (sequence + 1) % 16;
        let bytes = frame(&wire.encode().expect("encode device message"), sequence, ack_required)
            .expect("frame device message");
        self.write_raw(&bytes).await;
        sequence
    }
}

/// Connection with `motor1` and its `home` command preloaded.
pub fn motor_connection() -> Connection {
    let mut connection = Connection::new(LinkConfig::default().with_name("fake"));
    connection.registry_mut().bind("motor1", MOTOR1);
    connection.table_mut().insert(
        MOTOR1,
        ItemKind::Command,
        FormatDescriptor::new(5, "home", "B")
            .with_inputs(["motor_num"])
            .with_outputs(["position"]),
    );
    connection
}

/// Spawn a link task talking to a fake device.
pub fn start(connection: Connection) -> (LinkHandle, JoinHandle<LinkResult<()>>, FakeDevice) {
    let (link_end, device_end) = tokio::io::duplex(4096);
    let (handle, task) = spawn_connection(link_end, connection);
    let device = FakeDevice {
        stream: device_end,
        accumulator: FrameAccumulator::new(),
        next_sequence: 0,
    };
    (handle, task, device)
}
