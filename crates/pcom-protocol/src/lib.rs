//! PCOM device wire protocol
//!
//! This crate turns the structured logical messages used by the gateway into
//! the compact binary form PCOM devices speak over a serial link, and back.
//! Everything here is pure: the link transport and discovery live in
//! `pcom-link`.
//!
//! # Protocol Overview
//!
//! A message passes through three representations:
//!
//! - **Logical message** ([`LogicalMessage`]): `TOPICS`/`CONTENTS` JSON with
//!   endpoints and items addressed by name
//! - **Wire message** ([`WireMessage`]): 12-byte header, format string and
//!   typed data values
//! - **Frame** ([`frame()`]): escaped, checksummed and sequenced bytes
//!
//! Names map to 16-bit ids through an [`IdentityRegistry`]; the data layout
//! of each command, property and stream comes from a [`DescriptorTable`]
//! filled in by discovery.
//!
//! # Example
//!
//! ```rust
//! use pcom_protocol::*;
//! use serde_json::json;
//!
//! let mut registry = IdentityRegistry::new();
//! registry.bind("motor1", 0x0101);
//! let mut table = DescriptorTable::new();
//! table.insert(
//!     0x0101,
//!     ItemKind::Command,
//!     FormatDescriptor::new(5, "home", "B").with_inputs(["motor_num"]),
//! );
//!
//! let msg = LogicalMessage::command("motor1", "ui", 1, "home", [("motor_num", json!(3))]);
//! let wire = encode_message(&msg, &table, &mut registry).unwrap();
//! let bytes = frame(&wire.encode().unwrap(), 0, true).unwrap();
//!
//! let payload = deframe(&bytes).unwrap().payload.unwrap();
//! assert_eq!(WireMessage::decode(&payload).unwrap(), wire);
//! ```

mod codec;
mod constants;
mod descriptor;
mod error;
pub mod format;
mod frame;
mod message;
mod registry;
mod types;

pub use codec::*;
pub use constants::*;
pub use descriptor::*;
pub use error::*;
pub use frame::*;
pub use message::*;
pub use registry::*;
pub use types::*;
