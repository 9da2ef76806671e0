//! Session lifecycle: initialization, background loops and orderly shutdown.
//!
//! A [`Radio`] wraps a [`Pei`] session. Opening it resets the radio into a
//! known state and runs a caller supplied [`Initializer`]. Background loops
//! (periodic scans, watchers) are started with [`Radio::run_loop`] and are
//! bound to the connection: they are cancelled when the session is lost or
//! the radio is closed.
//!
//! [`Radio::close`] stops every loop and waits for it to return before it
//! sends the final reset, so no loop can issue a command on a session that
//! is shutting down.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tetra_core::cancel_after;
use tetra_core::error::Result;

use crate::io::Pei;

/// Resets the radio to its stored profile.
pub const RESET_COMMAND: &str = "ATZ";

/// Commands sent to every radio after the syntax error recovery.
pub const INIT_SEQUENCE: [&str; 2] = [RESET_COMMAND, "ATE0"];

/// Custom initialization run by [`Radio::open`] after the fixed sequence.
///
/// An initializer may send commands and register indications.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self, cancel: &CancellationToken, pei: &Pei) -> Result<()>;
}

/// No custom initialization.
pub struct NoInit;

#[async_trait]
impl Initializer for NoInit {
    async fn initialize(&self, _cancel: &CancellationToken, _pei: &Pei) -> Result<()> {
        Ok(())
    }
}

/// Send a fixed list of AT commands.
#[derive(Debug, Clone, Default)]
pub struct InitCommands(pub Vec<String>);

impl InitCommands {
    pub fn new<S: Into<String>>(commands: impl IntoIterator<Item = S>) -> Self {
        InitCommands(commands.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl Initializer for InitCommands {
    async fn initialize(&self, cancel: &CancellationToken, pei: &Pei) -> Result<()> {
        pei.ats(cancel, self.0.as_slice()).await
    }
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// An initialized radio with its background loops.
pub struct Radio {
    pei: Pei,
    /// Parent of every loop token. Cancelled on close and on session loss.
    loops_cancel: CancellationToken,
    loops: Mutex<Vec<LoopHandle>>,
}

impl Radio {
    /// Initialize the radio on an open session.
    ///
    /// Runs the syntax error recovery, the fixed [`INIT_SEQUENCE`] and then
    /// `initializer`. If any step fails, the session is closed and the error
    /// returned.
    pub async fn open(
        cancel: &CancellationToken,
        pei: Pei,
        initializer: &dyn Initializer,
    ) -> Result<Radio> {
        let initialized = async {
            pei.clear_syntax_errors(cancel).await?;
            pei.ats(cancel, &INIT_SEQUENCE).await?;
            initializer.initialize(cancel, &pei).await
        }
        .await;

        if let Err(e) = initialized {
            warn!(error = %e, "cannot initialize radio");
            pei.close();
            return Err(e);
        }

        let loops_cancel = CancellationToken::new();
        let watcher = pei.clone();
        let on_loss = loops_cancel.clone();
        tokio::spawn(async move {
            if watcher.wait_until_closed(&on_loss).await.is_ok() {
                debug!("session closed, cancelling loops");
                on_loss.cancel();
            }
        });

        info!("radio initialized");
        Ok(Radio {
            pei,
            loops_cancel,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// The underlying session.
    pub fn pei(&self) -> &Pei {
        &self.pei
    }

    /// Whether the session is still open.
    pub fn is_connected(&self) -> bool {
        !self.pei.closed() && !self.loops_cancel.is_cancelled()
    }

    fn lock_loops(&self) -> MutexGuard<'_, Vec<LoopHandle>> {
        self.loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a background loop bound to this connection.
    ///
    /// `f` receives a token that is cancelled when the loop has to stop, and
    /// a handle to the session. Returns `false` without starting anything if
    /// the radio is no longer connected.
    pub fn run_loop<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce(CancellationToken, Pei) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.is_connected() {
            debug!("not connected, loop not started");
            return false;
        }

        let cancel = self.loops_cancel.child_token();
        let task = tokio::spawn(f(cancel.clone(), self.pei.clone()));
        self.lock_loops().push(LoopHandle { cancel, task });
        true
    }

    /// Number of loops started and not yet reaped by [`close`](Self::close).
    pub fn loop_count(&self) -> usize {
        self.lock_loops().len()
    }

    /// Wait until every loop started so far has returned on its own.
    pub async fn wait_for_loops(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .lock_loops()
            .drain(..)
            .map(|handle| handle.task)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "loop failed");
            }
        }
    }

    /// Shut down: stop all loops, wait for them, reset the radio, close the
    /// session and wait for the IO task to exit.
    ///
    /// `timeout` bounds the whole shutdown. A loop that ignores its token
    /// past the deadline is aborted.
    pub async fn close(self, timeout: Duration) -> Result<()> {
        let deadline = cancel_after(&CancellationToken::new(), timeout);

        let loops: Vec<LoopHandle> = self.lock_loops().drain(..).collect();
        for handle in &loops {
            handle.cancel.cancel();
        }
        self.loops_cancel.cancel();

        for LoopHandle { mut task, .. } in loops {
            tokio::select! {
                joined = &mut task => {
                    if let Err(e) = joined {
                        warn!(error = %e, "loop failed");
                    }
                }
                _ = deadline.cancelled() => {
                    warn!("loop did not stop in time, aborting it");
                    task.abort();
                    let _ = task.await;
                }
            }
        }
        debug!("all loops stopped");

        if !self.pei.closed() {
            if let Err(e) = self.pei.request(&deadline, RESET_COMMAND).await {
                debug!(error = %e, "reset on close failed");
            }
        }
        self.pei.close();
        self.pei.wait_until_closed(&deadline).await?;
        info!("radio closed");
        Ok(())
    }
}
