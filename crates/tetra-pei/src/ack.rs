//! Delivery report correlation for outgoing SDS.
//!
//! [`send_with_acknowledgment`] registers a watcher for incoming SDS-TL
//! indications before the message leaves, sends the message, then waits for
//! the reports that were asked for. Reports are matched by message
//! reference; everything else arriving on the indication is ignored. The
//! watcher is unregistered on every exit path, so a report arriving after
//! the wait ended is dropped by the router.

use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tetra_core::error::{Error, Result};
use tetra_core::types::{Identity, MessageReference, ReportKind, ReportRequest};

use crate::indication::IndicationHandler;
use crate::io::Pei;
use crate::sds::{self, Pdu};

/// Indication carrying incoming SDS-TL PDUs: the header line plus one line
/// of hex PDU.
pub const REPORT_INDICATION: &str = "+CTSDSR: 12,";

/// A one-shot notification that may be fired any number of times.
struct Signal(Mutex<Option<oneshot::Sender<()>>>);

impl Signal {
    fn new() -> (Signal, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Signal(Mutex::new(Some(tx))), rx)
    }

    fn fire(&self) -> bool {
        let sender = self
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Fires `received` and `consumed` when a matching report arrives.
struct ReportWatcher {
    reference: MessageReference,
    received: Signal,
    consumed: Signal,
}

impl IndicationHandler for ReportWatcher {
    fn on_match(&self, lines: &[String]) {
        let [header, pdu, ..] = lines else {
            return;
        };
        let message = match sds::parse_incoming(header, pdu) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "could not decode incoming SDS");
                return;
            }
        };

        match message.report() {
            Some((kind, Some(reference))) if reference == self.reference => {
                let fired = match kind {
                    ReportKind::Received => self.received.fire(),
                    ReportKind::Consumed => {
                        // Consumption implies reception.
                        self.received.fire();
                        self.consumed.fire()
                    }
                };
                if fired {
                    debug!(%reference, %kind, source = %message.source, "delivery report");
                }
            }
            Some((kind, reference)) => {
                debug!(?reference, %kind, "ignoring report for another message");
            }
            None => {}
        }
    }
}

/// Send `pdu` to `destination` and wait for the `requested` reports for
/// `reference`.
///
/// Returns once every requested report has arrived. Without requested
/// reports this returns as soon as the radio accepted the message.
/// Cancelling `cancel` ends the wait with [`Error::Cancelled`].
pub async fn send_with_acknowledgment(
    cancel: &CancellationToken,
    pei: &Pei,
    destination: &Identity,
    pdu: &Pdu,
    reference: MessageReference,
    requested: ReportRequest,
) -> Result<()> {
    let (received, received_rx) = Signal::new();
    let (consumed, consumed_rx) = Signal::new();
    let watcher = ReportWatcher {
        reference,
        received,
        consumed,
    };
    let _guard = pei.watch_indication(REPORT_INDICATION, 1, watcher)?;

    pei.request(cancel, &sds::send_message(destination, pdu))
        .await?;
    debug!(%reference, %destination, "message accepted by the radio");

    if requested.received {
        wait_for(cancel, received_rx, ReportKind::Received).await?;
    }
    if requested.consumed {
        wait_for(cancel, consumed_rx, ReportKind::Consumed).await?;
    }
    Ok(())
}

async fn wait_for(
    cancel: &CancellationToken,
    signal: oneshot::Receiver<()>,
    kind: ReportKind,
) -> Result<()> {
    tokio::select! {
        biased;
        fired = signal => fired.map_err(|_| Error::NotConnected),
        _ = cancel.cancelled() => {
            debug!(%kind, "stopped waiting for delivery report");
            Err(Error::Cancelled)
        }
    }
}
