//! PCOM link layer
//!
//! Reliable delivery of PCOM frames over a byte stream, the discovery
//! handshake, and an async driver that exposes a device connection to the
//! rest of the gateway.
//!
//! The layers stack like this:
//!
//! - [`LinkEngine`]: stop-and-wait transport with 4-bit sequence numbers,
//!   ACK timeout and bounded retransmission
//! - [`DiscoverySession`]: broadcast, then per-subsystem enumeration
//! - [`Connection`]: codec plus engine plus discovery for one device
//! - [`spawn`]: runs a connection on a tokio task behind a [`LinkHandle`]
//!
//! The first three take the current time as an argument and perform no
//! I/O, so they can be tested without a runtime.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pcom_link::{spawn, LinkConfig};
//! use pcom_protocol::LogicalMessage;
//!
//! # async fn demo() -> pcom_link::LinkResult<()> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:4000").await?;
//! let (link, _task) = spawn(stream, LinkConfig::default().with_name("bench"));
//!
//! link.discover().await?;
//! let speed = LogicalMessage::get_property("motor1", "ui", 1, "speed");
//! let response = link.request(speed, Duration::from_secs(2)).await?;
//! println!("{}", serde_json::to_string(&response).unwrap());
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod discovery;
mod driver;
mod engine;
mod error;

pub use config::LinkConfig;
pub use connection::{Connection, ConnectionEvent, DescriptorEntry};
pub use discovery::{load_item_records, Begin, DiscoveryAction, DiscoverySession, DiscoveryState, ITEM_NAME_KIND};
pub use driver::{spawn, spawn_connection, LinkHandle, TopicFilter};
pub use engine::{LinkEngine, LinkEvent, SendToken};
pub use error::{LinkError, LinkResult};
