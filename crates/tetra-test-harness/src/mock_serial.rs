//! Mock transport for deterministic testing of the PEI session layer.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. Unlike a real radio it never says anything
//! unless told to: responses are queued when the matching request is sent,
//! and unsolicited indications are pushed in through a [`MockHandle`].
//!
//! # Example
//!
//! ```
//! use tetra_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the session sends `AT+CBC?`, answer with a battery report.
//! mock.expect_command("AT+CBC?", &["+CBC: 1,80", "OK"]);
//! let handle = mock.handle();
//! // Later, from the test: an unsolicited status indication.
//! handle.inject_lines(&["+CTSDSR: 13,1234567,0,7654321,0,16", "8002"]);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use tetra_core::error::{Error, Result};
use tetra_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to return once the matching request is received.
    response: Vec<u8>,
}

/// Data pushed into the mock from the test side.
#[derive(Debug)]
enum Injection {
    Data(Vec<u8>),
    Disconnect,
}

/// One `send()` call as observed by the mock.
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// When the bytes were handed to the transport.
    pub at: Instant,
    /// The bytes exactly as sent.
    pub data: Vec<u8>,
}

impl SentRecord {
    /// The sent bytes as text with the trailing line terminator removed.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    }
}

/// A mock [`Transport`] for testing the session layer without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation; on a match the
/// corresponding response is queued for `receive()`. A mismatch or an
/// exhausted queue makes `send()` fail with [`Error::Protocol`].
#[derive(Debug)]
pub struct MockTransport {
    /// Ordered queue of expected request/response pairs.
    expectations: VecDeque<Expectation>,
    /// Bytes waiting to be returned by `receive()`.
    inbound: VecDeque<u8>,
    /// Kept so the injection channel never closes while the mock lives.
    injected_tx: mpsc::UnboundedSender<Injection>,
    injected_rx: mpsc::UnboundedReceiver<Injection>,
    /// Send log shared with every [`MockHandle`].
    sent_log: Arc<Mutex<Vec<SentRecord>>>,
    /// Whether the transport is "connected".
    connected: bool,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        let (injected_tx, injected_rx) = mpsc::unbounded_channel();
        MockTransport {
            expectations: VecDeque::new(),
            inbound: VecDeque::new(),
            injected_tx,
            injected_rx,
            sent_log: Arc::new(Mutex::new(Vec::new())),
            connected: true,
        }
    }

    /// Add an expected request/response pair.
    ///
    /// When `send()` is called with data matching `request`, `response` is
    /// queued for the following `receive()` calls. An empty response means
    /// the radio stays silent.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Add an expected AT command and the lines the radio answers with.
    ///
    /// The command is matched with a trailing CR LF, and every response line
    /// is terminated with CR LF.
    pub fn expect_command(&mut self, command: &str, response_lines: &[&str]) {
        let request = format!("{command}\r\n");
        let response: String = response_lines
            .iter()
            .map(|line| format!("{line}\r\n"))
            .collect();
        self.expect(request.as_bytes(), response.as_bytes());
    }

    /// Create a handle for injecting data and inspecting the send log after
    /// the transport has been moved into a session.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            injected_tx: self.injected_tx.clone(),
            sent_log: Arc::clone(&self.sent_log),
        }
    }

    /// Return the data of all `send()` calls so far.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.sent_log).iter().map(|r| r.data.clone()).collect()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(log: &Mutex<Vec<SentRecord>>) -> std::sync::MutexGuard<'_, Vec<SentRecord>> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        lock(&self.sent_log).push(SentRecord {
            at: Instant::now(),
            data: data.to_vec(),
        });

        match self.expectations.pop_front() {
            Some(expectation) if data == expectation.request.as_slice() => {
                self.inbound.extend(expectation.response);
                Ok(())
            }
            Some(expectation) => Err(Error::Protocol(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            ))),
            None => Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            )),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        if self.inbound.is_empty() {
            match tokio::time::timeout(timeout, self.injected_rx.recv()).await {
                Ok(Some(Injection::Data(data))) => self.inbound.extend(data),
                Ok(Some(Injection::Disconnect)) => {
                    self.connected = false;
                    return Err(Error::ConnectionLost);
                }
                Ok(None) | Err(_) => return Err(Error::Timeout),
            }
        }

        let n = self.inbound.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.inbound.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Test-side handle to a [`MockTransport`] that has been moved elsewhere.
#[derive(Debug, Clone)]
pub struct MockHandle {
    injected_tx: mpsc::UnboundedSender<Injection>,
    sent_log: Arc<Mutex<Vec<SentRecord>>>,
}

impl MockHandle {
    /// Make raw bytes available to the next `receive()` calls.
    pub fn inject(&self, data: &[u8]) {
        let _ = self.injected_tx.send(Injection::Data(data.to_vec()));
    }

    /// Inject a single CR LF terminated line.
    pub fn inject_line(&self, line: &str) {
        self.inject(format!("{line}\r\n").as_bytes());
    }

    /// Inject several lines as one burst.
    pub fn inject_lines(&self, lines: &[&str]) {
        let data: String = lines.iter().map(|line| format!("{line}\r\n")).collect();
        self.inject(data.as_bytes());
    }

    /// Simulate the device disappearing: the next idle `receive()` fails with
    /// [`Error::ConnectionLost`] and the mock stays disconnected.
    pub fn disconnect(&self) {
        let _ = self.injected_tx.send(Injection::Disconnect);
    }

    /// Snapshot of every `send()` call so far.
    pub fn sent(&self) -> Vec<SentRecord> {
        lock(&self.sent_log).clone()
    }

    /// Snapshot of every `send()` call so far, as trimmed text.
    pub fn sent_lines(&self) -> Vec<String> {
        lock(&self.sent_log).iter().map(SentRecord::text).collect()
    }

    /// Wait until at least `count` sends have been recorded.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_for_sends(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if lock(&self.sent_log).len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
