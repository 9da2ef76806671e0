//! Transport implementations for the PEI stack.
//!
//! This crate provides concrete implementations of the
//! [`Transport`](tetra_core::Transport) trait from `tetra-core`:
//!
//! - [`SerialTransport`]: the USB virtual COM port a TETRA terminal exposes
//!   for its peripheral equipment interface
//! - [`TraceTransport`]: a wrapper that appends all raw traffic to a file
//!
//! plus [`find_radio_port`] / [`list_serial_devices`] for locating the PEI.
//!
//! # Example
//!
//! ```no_run
//! use tetra_transport::SerialTransport;
//! use tetra_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> tetra_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyUSB0", 38400).await?;
//! transport.send(b"ATI\r\n").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;
pub mod trace;

pub use serial::{
    DataBits, FlowControl, Parity, SerialConfig, SerialDevice, SerialTransport, StopBits,
    find_radio_port, list_serial_devices,
};
pub use trace::TraceTransport;
