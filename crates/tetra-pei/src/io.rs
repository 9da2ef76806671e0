//! The PEI session: one IO task per radio.
//!
//! The IO task owns the transport exclusively. Command requests arrive over
//! a bounded channel and are executed strictly one at a time; while an
//! exchange is in flight, further requests wait in the channel. Every line
//! the radio sends is offered, in this order, to
//!
//! 1. an indication whose trailing lines are still being collected,
//! 2. the echo check for the pending request (echo is skipped),
//! 3. the indication table (longest prefix wins),
//! 4. the pending exchange (final result codes complete it),
//!
//! and is discarded with a debug log if nobody claims it.
//!
//! A caller that gives up on an exchange (cancellation) gets
//! [`Error::Cancelled`] right away, but the exchange stays in the slot until
//! its final result code or its deadline, so a late response is drained
//! instead of being attributed to the next request.
//!
//! An exchange that reaches its deadline is still unanswered as far as the
//! radio is concerned. The session then drains: no new request is sent until
//! a final result code arrives or another command timeout passes, and every
//! line not claimed by an indication is discarded meanwhile.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tetra_core::error::{Error, Result};
use tetra_core::transport::Transport;

use crate::indication::{IndicationGuard, IndicationHandler, IndicationRouter, IndicationTable};
use crate::protocol::{self, DecodeResult, FinalResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for a PEI session.
#[derive(Debug, Clone)]
pub struct PeiConfig {
    /// How long a single command exchange may take before it fails with
    /// [`Error::Timeout`].
    pub command_timeout: Duration,
    /// How long one transport read may block. Bounds shutdown latency.
    pub poll_interval: Duration,
    /// Number of requests that may queue behind the one in flight.
    pub queue_depth: usize,
}

impl Default for PeiConfig {
    fn default() -> Self {
        PeiConfig {
            command_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            queue_depth: 32,
        }
    }
}

/// A request sent from a [`Pei`] handle to the IO task.
struct Request {
    line: String,
    reply: oneshot::Sender<Result<Vec<String>>>,
}

/// The exchange currently in flight.
struct Exchange {
    request: String,
    lines: Vec<String>,
    deadline: Instant,
    reply: oneshot::Sender<Result<Vec<String>>>,
}

impl Exchange {
    fn complete(self, result: Result<Vec<String>>) {
        if self.reply.send(result).is_err() {
            debug!(request = %protocol::command_line(&self.request), "late response drained");
        }
    }
}

/// Handle to a PEI session. Cheap to clone; all clones talk to the same IO
/// task.
#[derive(Clone)]
pub struct Pei {
    tx: mpsc::Sender<Request>,
    indications: IndicationTable,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl std::fmt::Debug for Pei {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pei")
            .field("closed", &self.closed())
            .field("indications", &self.indications.len())
            .finish()
    }
}

impl Pei {
    /// Start a session on `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(transport: Box<dyn Transport>, config: PeiConfig) -> Pei {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let indications = IndicationTable::new();
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        tokio::spawn(io_loop(
            transport,
            config,
            rx,
            indications.clone(),
            shutdown.clone(),
            closed.clone(),
        ));

        Pei {
            tx,
            indications,
            shutdown,
            closed,
        }
    }

    /// Send a raw request and return the response lines before the final
    /// result code.
    ///
    /// `request` is sent as it is, terminated with CR LF unless it ends with
    /// Ctrl-Z. A final `ERROR`, `+CME ERROR` or `+CMS ERROR` is returned as
    /// [`Error::Protocol`].
    pub async fn request(&self, cancel: &CancellationToken, request: &str) -> Result<Vec<String>> {
        if self.closed() {
            return Err(Error::NotConnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            line: request.to_string(),
            reply: reply_tx,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sent = self.tx.send(request) => sent.map_err(|_| Error::NotConnected)?,
        }

        tokio::select! {
            biased;
            result = reply_rx => result.unwrap_or(Err(Error::NotConnected)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Send an AT command, prepending `AT` if it is missing.
    pub async fn at(&self, cancel: &CancellationToken, command: &str) -> Result<Vec<String>> {
        self.request(cancel, &protocol::normalize_command(command))
            .await
    }

    /// Send several AT commands in order. The first failure stops the
    /// sequence.
    pub async fn ats<S: AsRef<str>>(&self, cancel: &CancellationToken, commands: &[S]) -> Result<()> {
        for command in commands {
            self.at(cancel, command.as_ref()).await?;
        }
        Ok(())
    }

    /// Register an indication for the rest of the session.
    pub fn add_indication(
        &self,
        prefix: &str,
        trailing_lines: usize,
        handler: impl IndicationHandler,
    ) -> Result<()> {
        self.watch_indication(prefix, trailing_lines, handler)?
            .detach();
        Ok(())
    }

    /// Register an indication for as long as the returned guard lives.
    pub fn watch_indication(
        &self,
        prefix: &str,
        trailing_lines: usize,
        handler: impl IndicationHandler,
    ) -> Result<IndicationGuard> {
        if self.closed() {
            return Err(Error::NotConnected);
        }
        self.indications.register(prefix, trailing_lines, handler)
    }

    /// Remove the indication registered for `prefix`.
    pub fn unregister_indication(&self, prefix: &str) -> bool {
        self.indications.unregister(prefix)
    }

    /// The indication table of this session.
    pub fn indications(&self) -> &IndicationTable {
        &self.indications
    }

    /// Bring the radio's command parser into a known state.
    ///
    /// A previous program may have left half a command in the radio's input
    /// buffer, so the first `AT` can fail. Up to three attempts are made.
    pub async fn clear_syntax_errors(&self, cancel: &CancellationToken) -> Result<()> {
        const ATTEMPTS: usize = 3;

        for attempt in 1..=ATTEMPTS {
            match self.request(cancel, "AT").await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_fatal() || matches!(e, Error::Cancelled) => return Err(e),
                Err(e) => debug!(attempt, error = %e, "radio did not accept AT"),
            }
        }
        Err(Error::Protocol(format!(
            "radio did not accept AT after {ATTEMPTS} attempts"
        )))
    }

    /// Ask the IO task to stop. Pending and queued requests fail.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the IO task has exited.
    pub fn closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the IO task has exited and the transport is released.
    pub async fn wait_until_closed(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(()),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Maximum buffer size before reset to prevent unbounded growth.
/// PEI lines rarely exceed a few hundred bytes; 8192 is generous headroom.
const MAX_BUF: usize = 8192;

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Shutdown
/// 2. Deadline of the exchange in flight, or of the drain after a timeout
/// 3. The next request, only while no exchange is in flight or draining
/// 4. Reading from the transport
async fn io_loop(
    mut transport: Box<dyn Transport>,
    config: PeiConfig,
    mut rx: mpsc::Receiver<Request>,
    indications: IndicationTable,
    shutdown: CancellationToken,
    closed: CancellationToken,
) {
    let mut router = IndicationRouter::new(indications.clone());
    let mut read_buf: Vec<u8> = Vec::new();
    let mut pending: Option<Exchange> = None;
    let mut draining: Option<Instant> = None;
    let mut failure: Option<Error> = None;

    loop {
        let deadline = pending
            .as_ref()
            .map(|exchange| exchange.deadline)
            .or(draining);

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("PEI session shutdown requested");
                break;
            }

            _ = expire(deadline) => {
                if let Some(exchange) = pending.take() {
                    warn!(
                        request = %protocol::command_line(&exchange.request),
                        timeout = ?config.command_timeout,
                        "command timed out"
                    );
                    exchange.complete(Err(Error::Timeout));
                    draining = Some(Instant::now() + config.command_timeout);
                } else if draining.take().is_some() {
                    warn!("no late response arrived, resuming requests");
                }
            }

            req = rx.recv(), if pending.is_none() && draining.is_none() => {
                let Some(req) = req else {
                    debug!("all PEI handles dropped, exiting IO task");
                    break;
                };
                match start_exchange(&mut *transport, req, &config).await {
                    Ok(exchange) => pending = exchange,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            received = async {
                let mut buf = [0u8; 256];
                transport
                    .receive(&mut buf, config.poll_interval)
                    .await
                    .map(|n| buf[..n].to_vec())
            } => {
                match received {
                    Ok(data) => {
                        read_buf.extend_from_slice(&data);
                        if read_buf.len() > MAX_BUF {
                            warn!(len = read_buf.len(), "receive buffer overflow, resetting");
                            read_buf.clear();
                            router.reset();
                            continue;
                        }
                        while let DecodeResult::Line { line, consumed } =
                            protocol::decode_line(&read_buf)
                        {
                            read_buf.drain(..consumed);
                            handle_line(line, &mut router, &mut pending, &mut draining);
                        }
                    }
                    Err(Error::Timeout) => {}
                    Err(e) if e.is_fatal() => {
                        warn!(error = %e, "PEI transport failed");
                        failure = Some(e);
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "receive failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }

    // Teardown: fail everything that is still waiting, then release the
    // transport.
    let pending_error = if failure.is_some() {
        Error::ConnectionLost
    } else {
        Error::NotConnected
    };
    if let Some(exchange) = pending.take() {
        exchange.complete(Err(pending_error));
    }
    rx.close();
    while let Ok(req) = rx.try_recv() {
        let _ = req.reply.send(Err(Error::NotConnected));
    }
    router.reset();
    indications.clear();

    if let Err(e) = transport.close().await {
        debug!(error = %e, "closing transport failed");
    }
    closed.cancel();
    info!("PEI session closed");
}

/// Resolve at `deadline`, or never if there is none.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Write a request to the transport.
///
/// Returns the exchange to wait for, `None` if the request was answered
/// right away, or the transport error that ends the session (the request is
/// answered in that case too).
async fn start_exchange(
    transport: &mut dyn Transport,
    req: Request,
    config: &PeiConfig,
) -> Result<Option<Exchange>> {
    let command = protocol::command_line(&req.line);

    if req.reply.is_closed() {
        debug!(request = %command, "request abandoned before it was sent");
        return Ok(None);
    }

    debug!(request = %command, "sending request");
    trace!(data = %req.line.escape_debug(), "request bytes");

    match transport.send(&protocol::encode_request(&req.line)).await {
        Ok(()) => Ok(Some(Exchange {
            deadline: Instant::now() + config.command_timeout,
            lines: Vec::new(),
            request: req.line,
            reply: req.reply,
        })),
        Err(e) if e.is_fatal() => {
            warn!(request = %command, error = %e, "cannot send request");
            let _ = req.reply.send(Err(Error::ConnectionLost));
            Err(e)
        }
        Err(e) => {
            debug!(request = %command, error = %e, "cannot send request");
            let _ = req.reply.send(Err(e));
            Ok(None)
        }
    }
}

/// Route one received line.
fn handle_line(
    line: String,
    router: &mut IndicationRouter,
    pending: &mut Option<Exchange>,
    draining: &mut Option<Instant>,
) {
    if line.is_empty() {
        return;
    }

    if !router.is_collecting()
        && pending
            .as_ref()
            .is_some_and(|exchange| protocol::is_echo(&line, &exchange.request))
    {
        trace!(line = %line, "skipping echo");
        return;
    }

    if router.dispatch(&line) {
        return;
    }

    let Some(mut exchange) = pending.take() else {
        if draining.is_some() && protocol::final_result(&line).is_some() {
            debug!(line = %line, "late response drained");
            *draining = None;
        } else if draining.is_some() {
            trace!(line = %line, "discarding late response line");
        } else {
            debug!(line = %line, "discarding unsolicited line");
        }
        return;
    };

    match protocol::final_result(&line) {
        Some(FinalResult::Ok) => {
            let lines = std::mem::take(&mut exchange.lines);
            exchange.complete(Ok(lines));
        }
        Some(FinalResult::Error(code)) => {
            debug!(
                request = %protocol::command_line(&exchange.request),
                code = %code,
                "radio rejected request"
            );
            exchange.complete(Err(Error::Protocol(code)));
        }
        None => {
            exchange.lines.push(line);
            *pending = Some(exchange);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
