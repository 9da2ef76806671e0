//! tetra-test-harness: Test utilities and mock transports for the PEI stack.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the session layer without a radio attached, and [`MockHandle`] for
//! injecting unsolicited indications and inspecting what was sent after the
//! transport has been moved into a session.

pub mod mock_serial;

pub use mock_serial::{MockHandle, MockTransport, SentRecord};
