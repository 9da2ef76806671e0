//! tetra-core: Core traits, types, and error definitions for TETRA PEI control.
//!
//! This crate defines the abstractions shared by the transport, session and
//! command layers. Applications depend on these types without pulling in a
//! specific serial implementation.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel to the radio
//! - [`MessageReference`], [`Identity`], [`ReportRequest`] -- SDS value types
//! - [`Error`] / [`Result`] -- error handling
//! - [`cancel_after`] -- deadline-bound cancellation tokens

pub mod cancel;
pub mod error;
pub mod transport;
pub mod types;

pub use cancel::cancel_after;
pub use error::{Error, Result};
pub use transport::Transport;
pub use types::*;
