//! tetra-pei: session layer and SDS messaging for the PEI of TETRA terminals.
//!
//! One tokio task owns the serial transport. It runs one AT command exchange
//! at a time, routes unsolicited indications to registered handlers while an
//! exchange is in flight, and releases the port on shutdown.
//!
//! # Architecture
//!
//! - [`protocol`] -- line framing and final result codes
//! - [`indication`] -- prefix registration and trailing-line collection
//! - [`io`] -- the session handle ([`Pei`]) and its IO task
//! - [`lifecycle`] -- initialization, background loops and ordered shutdown
//! - [`builder`] -- fluent configuration of a [`Radio`]
//! - [`commands`] -- AT command builders and response parsers
//! - [`sds`] -- SDS PDU encoding and decoding
//! - [`ack`] -- waiting for delivery reports of a sent message
//! - [`concat`] -- paced transmission of concatenated message parts

pub mod ack;
pub mod builder;
pub mod commands;
pub mod concat;
pub mod indication;
pub mod io;
pub mod lifecycle;
pub mod protocol;
pub mod sds;

pub use ack::send_with_acknowledgment;
pub use builder::RadioBuilder;
pub use concat::{TransferError, send_parts};
pub use indication::{IndicationGuard, IndicationHandler};
pub use io::{Pei, PeiConfig};
pub use lifecycle::{InitCommands, Initializer, NoInit, Radio};
