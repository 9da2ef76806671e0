//! RadioBuilder -- fluent builder for opening a [`Radio`].
//!
//! Separates configuration from construction so that callers can choose the
//! device, serial parameters, timeouts and tracing before the connection is
//! established. There is no process-wide configuration: everything the
//! session needs travels in the builder.
//!
//! # Example
//!
//! ```no_run
//! use tetra_pei::builder::RadioBuilder;
//! use tetra_pei::lifecycle::NoInit;
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() -> tetra_core::Result<()> {
//! let radio = RadioBuilder::new()
//!     .device("/dev/ttyACM0")
//!     .command_timeout(Duration::from_secs(5))
//!     .build(&CancellationToken::new(), &NoInit)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tetra_core::error::Result;
use tetra_core::transport::Transport;
use tetra_transport::{SerialConfig, SerialTransport, TraceTransport, find_radio_port};

use crate::io::{Pei, PeiConfig};
use crate::lifecycle::{Initializer, Radio};

/// Device name that selects automatic PEI discovery.
pub const AUTO_DEVICE: &str = "auto";

/// Fluent builder for [`Radio`].
#[derive(Debug, Clone)]
pub struct RadioBuilder {
    device: Option<String>,
    serial: SerialConfig,
    pei: PeiConfig,
    trace_file: Option<PathBuf>,
}

impl Default for RadioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioBuilder {
    pub fn new() -> Self {
        RadioBuilder {
            device: None,
            serial: SerialConfig::default(),
            pei: PeiConfig::default(),
            trace_file: None,
        }
    }

    /// Set the serial device (e.g. `/dev/ttyACM0` or `COM4`). An empty name
    /// or `auto` selects the first device that identifies as a PEI.
    pub fn device(mut self, device: &str) -> Self {
        let device = device.trim();
        self.device = if device.is_empty() || device.eq_ignore_ascii_case(AUTO_DEVICE) {
            None
        } else {
            Some(device.to_string())
        };
        self
    }

    /// Override the baud rate (default: 38400).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.serial.baud_rate = baud;
        self
    }

    /// Replace the complete serial configuration.
    pub fn serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = config;
        self
    }

    /// Set the timeout for a single command exchange (default: 5s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.pei.command_timeout = timeout;
        self
    }

    /// Replace the complete session configuration.
    pub fn pei_config(mut self, config: PeiConfig) -> Self {
        self.pei = config;
        self
    }

    /// Append all raw PEI traffic to `path`.
    pub fn trace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_file = Some(path.into());
        self
    }

    pub fn get_command_timeout(&self) -> Duration {
        self.pei.command_timeout
    }

    /// The device to open, discovering it if none was configured.
    pub fn resolve_device(&self) -> Result<String> {
        match &self.device {
            Some(device) => Ok(device.clone()),
            None => find_radio_port(),
        }
    }

    /// Open the transport and start a session without initializing the
    /// radio.
    pub async fn connect(&self) -> Result<Pei> {
        let device = self.resolve_device()?;
        let transport = SerialTransport::open_with_config(&device, self.serial.clone()).await?;
        self.connect_with_transport(Box::new(transport)).await
    }

    /// Start a session on a caller-provided transport.
    pub async fn connect_with_transport(&self, transport: Box<dyn Transport>) -> Result<Pei> {
        let transport: Box<dyn Transport> = match &self.trace_file {
            Some(path) => Box::new(TraceTransport::open(transport, path).await?),
            None => transport,
        };
        Ok(Pei::open(transport, self.pei.clone()))
    }

    /// Open the configured device and initialize the radio.
    pub async fn build(
        &self,
        cancel: &CancellationToken,
        initializer: &dyn Initializer,
    ) -> Result<Radio> {
        let pei = self.connect().await?;
        Radio::open(cancel, pei, initializer).await
    }

    /// Initialize a radio on a caller-provided transport.
    ///
    /// This is the entry point for testing (pass a `MockTransport` from
    /// `tetra-test-harness`).
    pub async fn build_with_transport(
        &self,
        cancel: &CancellationToken,
        transport: Box<dyn Transport>,
        initializer: &dyn Initializer,
    ) -> Result<Radio> {
        let pei = self.connect_with_transport(transport).await?;
        Radio::open(cancel, pei, initializer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{InitCommands, NoInit};
    use tetra_test_harness::MockTransport;

    fn expect_init(mock: &mut MockTransport) {
        mock.expect_command("AT", &["OK"]);
        mock.expect_command("ATZ", &["OK"]);
        mock.expect_command("ATE0", &["OK"]);
    }

    #[test]
    fn builder_defaults() {
        let builder = RadioBuilder::new();
        assert!(builder.device.is_none());
        assert_eq!(builder.serial.baud_rate, 38400);
        assert_eq!(builder.get_command_timeout(), Duration::from_secs(5));
        assert!(builder.trace_file.is_none());
    }

    #[test]
    fn auto_device_selects_discovery() {
        assert!(RadioBuilder::new().device("auto").device.is_none());
        assert!(RadioBuilder::new().device("AUTO").device.is_none());
        assert!(RadioBuilder::new().device("  ").device.is_none());
        assert_eq!(
            RadioBuilder::new().device("/dev/ttyACM0").resolve_device().unwrap(),
            "/dev/ttyACM0"
        );
    }

    #[test]
    fn builder_chaining() {
        let builder = RadioBuilder::new()
            .baud_rate(115_200)
            .command_timeout(Duration::from_millis(300))
            .trace_file("/tmp/pei.trace");
        assert_eq!(builder.serial.baud_rate, 115_200);
        assert_eq!(builder.get_command_timeout(), Duration::from_millis(300));
        assert_eq!(
            builder.trace_file.as_deref(),
            Some(std::path::Path::new("/tmp/pei.trace"))
        );
    }

    #[tokio::test]
    async fn build_with_transport_initializes() {
        let mut mock = MockTransport::new();
        expect_init(&mut mock);
        mock.expect_command("AT+CSCS=8859-1", &["OK"]);
        mock.expect_command("ATZ", &["OK"]);
        let handle = mock.handle();

        let radio = RadioBuilder::new()
            .build_with_transport(
                &CancellationToken::new(),
                Box::new(mock),
                &InitCommands::new(["AT+CSCS=8859-1"]),
            )
            .await
            .unwrap();
        radio.close(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            handle.sent_lines(),
            vec!["AT", "ATZ", "ATE0", "AT+CSCS=8859-1", "ATZ"]
        );
    }

    #[tokio::test]
    async fn build_with_trace_file_records_traffic() {
        let path = std::env::temp_dir().join(format!(
            "tetra-builder-trace-{}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let mut mock = MockTransport::new();
        expect_init(&mut mock);
        mock.expect_command("ATZ", &["OK"]);

        let radio = RadioBuilder::new()
            .trace_file(&path)
            .build_with_transport(&CancellationToken::new(), Box::new(mock), &NoInit)
            .await
            .unwrap();
        radio.close(Duration::from_secs(1)).await.unwrap();

        let trace = std::fs::read_to_string(&path).unwrap();
        assert!(trace.starts_with("AT\r\nOK\r\nATZ\r\n"));
        let _ = std::fs::remove_file(&path);
    }
}
