//! Replies of one invocation as an async stream.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::session::Outcome;
use super::SandboxRunner;
use crate::wasm::ContextIds;

/// Guest replies in the order they were sent, then an [`Outcome`].
///
/// A background task drives the worker session. Dropping the stream aborts
/// that task, which kills the worker.
pub struct ReplyStream {
    replies: mpsc::UnboundedReceiver<String>,
    driver: Option<JoinHandle<Outcome>>,
}

impl ReplyStream {
    /// Must be called from inside a Tokio runtime.
    pub(crate) fn start(runner: SandboxRunner, source: String, context: ContextIds) -> Self {
        // Unbounded so a slow consumer never holds the worker past its deadline.
        let (tx, replies) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            let mut session = match runner.spawn_for(&source, context).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(category = ?e.category(), "invocation refused: {}", e);
                    return e.into();
                }
            };
            while let Some(reply) = session.next_reply().await {
                if tx.send(reply).is_err() {
                    tracing::debug!("reply stream dropped");
                    session.cancel().await;
                    break;
                }
            }
            session.finish().await
        });
        Self {
            replies,
            driver: Some(driver),
        }
    }

    /// Wait for the next reply. `None` once the guest is done.
    pub async fn next_reply(&mut self) -> Option<String> {
        self.replies.recv().await
    }

    /// Discard remaining replies and wait for the outcome.
    pub async fn outcome(mut self) -> Outcome {
        while self.replies.recv().await.is_some() {}
        match self.driver.take() {
            Some(driver) => driver.await.unwrap_or_else(|e| Outcome::Faulted {
                reason: format!("session task failed: {}", e),
            }),
            None => Outcome::Faulted {
                reason: "session ended without an outcome".to_string(),
            },
        }
    }
}

impl Stream for ReplyStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.replies.poll_recv(cx)
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyStream")
            .field("running", &self.driver.as_ref().is_some_and(|d| !d.is_finished()))
            .finish()
    }
}
