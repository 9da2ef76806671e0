//! Raw traffic tracing.
//!
//! [`TraceTransport`] wraps any [`Transport`] and appends every byte sent to
//! or received from the radio to a trace file, unmodified and in the order it
//! crossed the wire. This is a developer aid for diagnosing PEI dialects;
//! failures to write the trace are logged and never fail the transport.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use tetra_core::error::Result;
use tetra_core::transport::Transport;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// A transport that mirrors all raw traffic into an append-only file.
pub struct TraceTransport {
    inner: Box<dyn Transport>,
    trace: File,
}

impl TraceTransport {
    /// Wrap `inner`, appending its traffic to the file at `path` (created if
    /// missing).
    pub async fn open(inner: Box<dyn Transport>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let trace = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        tracing::debug!(path = %path.display(), "tracing PEI traffic");
        Ok(Self::new(inner, trace))
    }

    /// Wrap `inner`, appending its traffic to an already opened file.
    pub fn new(inner: Box<dyn Transport>, trace: File) -> Self {
        TraceTransport { inner, trace }
    }

    async fn record(&mut self, data: &[u8]) {
        if let Err(e) = self.trace.write_all(data).await {
            tracing::warn!(error = %e, "cannot write PEI trace");
        }
    }
}

#[async_trait]
impl Transport for TraceTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.record(data).await;
        self.inner.send(data).await
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self.inner.receive(buf, timeout).await?;
        self.record(&buf[..n]).await;
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.trace.flush().await {
            tracing::warn!(error = %e, "cannot flush PEI trace");
        }
        self.inner.close().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetra_test_harness::MockTransport;

    fn trace_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tetra-trace-{}-{name}.log", std::process::id()))
    }

    #[tokio::test]
    async fn trace_records_both_directions_in_order() {
        let path = trace_path("both");
        let _ = std::fs::remove_file(&path);

        let mut mock = MockTransport::new();
        mock.expect_command("ATI", &["MTP3550", "OK"]);

        let mut transport = TraceTransport::open(Box::new(mock), &path).await.unwrap();
        transport.send(b"ATI\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"MTP3550\r\nOK\r\n");
        transport.close().await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"ATI\r\nMTP3550\r\nOK\r\n");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn trace_appends_to_existing_file() {
        let path = trace_path("append");
        std::fs::write(&path, b"previous\n").unwrap();

        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"");
        let mut transport = TraceTransport::open(Box::new(mock), &path).await.unwrap();
        transport.send(b"AT\r\n").await.unwrap();
        transport.close().await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"previous\nAT\r\n");
        let _ = std::fs::remove_file(&path);
    }
}
