//! Applied-index watermark and the Sync wait built on it.

use std::time::Duration;
use tokio::sync::watch;

use crate::error::MetaError;
use crate::types::LogIndex;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct Watermark {
    index: LogIndex,
    closed: bool,
}

/// The highest log index applied to the local state machine.
///
/// Waiters suspend on a watch channel until the watermark reaches their
/// index, their deadline passes, or the store closes.
#[derive(Debug)]
pub struct AppliedIndex {
    tx: watch::Sender<Watermark>,
}

impl Default for AppliedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl AppliedIndex {
    /// Watermark at zero, open.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Watermark::default());
        Self { tx }
    }

    /// Current applied index.
    pub fn current(&self) -> LogIndex {
        self.tx.borrow().index
    }

    /// Moves the watermark forward. Never moves it backwards.
    pub fn advance(&self, index: LogIndex) {
        self.tx.send_if_modified(|w| {
            if index > w.index {
                w.index = index;
                true
            } else {
                false
            }
        });
    }

    /// Sets the watermark after loading state and reopens it for waiters.
    pub fn reset(&self, index: LogIndex) {
        self.tx.send_replace(Watermark {
            index,
            closed: false,
        });
    }

    /// Releases every waiter with `ServerClosed`.
    pub fn close(&self) {
        self.tx.send_modify(|w| w.closed = true);
    }

    /// Waits until the watermark is at least `index`.
    pub async fn wait(&self, index: LogIndex, timeout: Duration) -> Result<(), MetaError> {
        let mut rx = self.tx.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|w| w.index >= index || w.closed))
            .await
            .map_err(|_| MetaError::SyncTimeout { index })?
            .map(|w| w.index >= index)
            .map_err(|_| MetaError::ServerClosed)?;
        if reached {
            Ok(())
        } else {
            Err(MetaError::ServerClosed)
        }
    }
}
