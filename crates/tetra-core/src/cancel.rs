//! Deadline-bound cancellation.
//!
//! Every suspending PEI operation takes a [`CancellationToken`]. A command
//! line tool usually wants "this whole operation may take at most N
//! seconds"; [`cancel_after`] derives such a token from a parent so that
//! both an outer Ctrl-C and the deadline cancel the operation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Derive a child of `parent` that is cancelled after `timeout`.
///
/// The timer task exits early when the child is cancelled by other means.
/// Must be called from within a tokio runtime.
pub fn cancel_after(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let child = parent.child_token();
    let timer = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(timeout) => timer.cancel(),
        }
    });
    child
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_after_fires() {
        let root = CancellationToken::new();
        let token = cancel_after(&root, Duration::from_millis(20));
        assert!(!token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should be cancelled after the deadline");
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_after_follows_parent() {
        let root = CancellationToken::new();
        let token = cancel_after(&root, Duration::from_secs(60));
        root.cancel();
        assert!(token.is_cancelled());
    }
}
