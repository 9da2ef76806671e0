//! Sequenced transmission of concatenated SDS parts.
//!
//! Terminals accept the next `AT+CMGS` only after the previous message was
//! handed to the air interface, which they confirm with an unsolicited
//! `+CMGS: 0,<reference>` line. [`send_parts`] sends one part, waits for that
//! confirmation, and only then sends the next. No confirmation is awaited
//! after the last part.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tetra_core::error::Error;
use tetra_core::types::Identity;

use crate::indication::IndicationHandler;
use crate::io::Pei;
use crate::sds::{self, Pdu};

/// Confirmation that a message left the terminal.
pub const PART_CONFIRMATION_INDICATION: &str = "+CMGS: 0,";

/// A concatenated transfer stopped before every part was sent.
#[derive(Debug, thiserror::Error)]
#[error("sent {sent} of {total} parts: {source}")]
pub struct TransferError {
    /// Parts accepted by the radio before the failure.
    pub sent: usize,
    pub total: usize,
    #[source]
    pub source: Error,
}

struct PartConfirmation {
    tx: mpsc::Sender<String>,
}

impl IndicationHandler for PartConfirmation {
    fn on_match(&self, lines: &[String]) {
        let Some(line) = lines.first() else {
            return;
        };
        trace!(%line, "part confirmation");
        if self.tx.try_send(line.clone()).is_err() {
            debug!(%line, "confirmation not awaited, dropped");
        }
    }
}

/// Send `parts` to `destination` in order, pacing them by the radio's
/// confirmations.
///
/// Returns the number of parts sent. On failure the error tells how many
/// parts went out before it.
pub async fn send_parts(
    cancel: &CancellationToken,
    pei: &Pei,
    destination: &Identity,
    parts: &[Pdu],
) -> Result<usize, TransferError> {
    let total = parts.len();
    let fail = |sent: usize, source: Error| TransferError {
        sent,
        total,
        source,
    };

    let (tx, mut confirmations) = mpsc::channel(1);
    let _guard = pei
        .watch_indication(PART_CONFIRMATION_INDICATION, 0, PartConfirmation { tx })
        .map_err(|e| fail(0, e))?;

    for (index, part) in parts.iter().enumerate() {
        pei.request(cancel, &sds::send_message(destination, part))
            .await
            .map_err(|e| fail(index, e))?;
        let sent = index + 1;
        debug!(part = sent, total, "part sent");

        if sent == total {
            break;
        }

        tokio::select! {
            biased;
            confirmation = confirmations.recv() => {
                if confirmation.is_none() {
                    return Err(fail(sent, Error::NotConnected));
                }
            }
            _ = cancel.cancelled() => return Err(fail(sent, Error::Cancelled)),
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tetra_core::cancel_after;
    use tetra_core::types::{MessageReference, ReportRequest};
    use tetra_test_harness::MockTransport;

    use crate::io::PeiConfig;
    use crate::sds::TextEncoding;

    fn open(mock: MockTransport) -> Pei {
        Pei::open(
            Box::new(mock),
            PeiConfig {
                command_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(10),
                queue_depth: 8,
            },
        )
    }

    fn destination() -> Identity {
        "7654321".parse().unwrap()
    }

    fn three_parts() -> Vec<Pdu> {
        let text = "x".repeat(200);
        let parts = sds::concatenated_message_transfer(
            MessageReference::new(10).unwrap(),
            ReportRequest::NONE,
            TextEncoding::Latin1,
            668,
            &text,
        )
        .unwrap();
        assert_eq!(parts.len(), 3);
        parts
    }

    #[tokio::test]
    async fn waits_for_confirmation_between_parts() {
        let parts = three_parts();
        let mut mock = MockTransport::new();
        for (i, part) in parts.iter().enumerate() {
            let request = sds::send_message(&destination(), part);
            let response = format!("\r\n+CMGS: 0,{}\r\nOK\r\n", 11 + i);
            mock.expect(request.as_bytes(), response.as_bytes());
        }
        mock.expect_command("ATI", &["MTP3550", "OK"]);
        let handle = mock.handle();
        let pei = open(mock);

        let cancel = cancel_after(&CancellationToken::new(), Duration::from_secs(2));
        let sent = send_parts(&cancel, &pei, &destination(), &parts)
            .await
            .unwrap();
        assert_eq!(sent, 3);
        assert_eq!(handle.sent().len(), 3);
        assert!(!pei.indications().contains(PART_CONFIRMATION_INDICATION));

        // The watcher is gone, so a confirmation is an ordinary line again.
        let lines = pei.at(&CancellationToken::new(), "ATI").await.unwrap();
        assert_eq!(lines, vec!["MTP3550"]);
    }

    #[tokio::test]
    async fn next_part_waits_for_late_confirmation() {
        let parts = three_parts();
        let mut mock = MockTransport::new();
        for part in &parts {
            let request = sds::send_message(&destination(), part);
            mock.expect(request.as_bytes(), b"\r\nOK\r\n");
        }
        let handle = mock.handle();
        let pei = open(mock);

        let transfer = {
            let pei = pei.clone();
            let parts = parts.clone();
            tokio::spawn(async move {
                let cancel = cancel_after(&CancellationToken::new(), Duration::from_secs(2));
                send_parts(&cancel, &pei, &destination(), &parts).await
            })
        };

        assert!(handle.wait_for_sends(1, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.sent().len(), 1);

        handle.inject_line("+CMGS: 0,11");
        assert!(handle.wait_for_sends(2, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.sent().len(), 2);

        handle.inject_line("+CMGS: 0,12");
        assert_eq!(transfer.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_confirmation_reports_progress() {
        let parts = three_parts();
        let mut mock = MockTransport::new();
        let request = sds::send_message(&destination(), &parts[0]);
        mock.expect(request.as_bytes(), b"\r\nOK\r\n");
        let pei = open(mock);

        let cancel = cancel_after(&CancellationToken::new(), Duration::from_millis(100));
        let err = send_parts(&cancel, &pei, &destination(), &parts)
            .await
            .unwrap_err();
        assert_eq!(err.sent, 1);
        assert_eq!(err.total, 3);
        assert!(matches!(err.source, Error::Cancelled));
        assert!(!pei.indications().contains(PART_CONFIRMATION_INDICATION));
    }

    #[tokio::test]
    async fn rejected_part_stops_the_transfer() {
        let parts = three_parts();
        let mut mock = MockTransport::new();
        let request = sds::send_message(&destination(), &parts[0]);
        mock.expect(request.as_bytes(), b"\r\n+CMS ERROR: 4\r\n");
        let pei = open(mock);

        let err = send_parts(&CancellationToken::new(), &pei, &destination(), &parts)
            .await
            .unwrap_err();
        assert_eq!(err.sent, 0);
        assert!(matches!(err.source, Error::Protocol(_)));
    }
}
