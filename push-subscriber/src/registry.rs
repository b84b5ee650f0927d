//! Registry of open output channels.
//!
//! Every successful subscription registers the close signal of its output
//! channel here so that closing the subscriber can terminate all of them
//! at once.

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// One registered output channel.
#[derive(Debug)]
struct OutputChannel {
    route: String,
    closed: CancellationToken,
}

/// Tracks the output channels created by a subscriber.
///
/// Channels are only ever appended while the subscriber is open and are all
/// closed together by [`drain`](OutputRegistry::drain).
#[derive(Debug, Default)]
pub(crate) struct OutputRegistry {
    channels: Mutex<Vec<OutputChannel>>,
}

impl OutputRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new output channel for `route`.
    ///
    /// Returns the token that signals the channel has been closed.
    pub(crate) fn register(&self, route: &str) -> CancellationToken {
        let closed = CancellationToken::new();
        self.lock().push(OutputChannel {
            route: route.to_string(),
            closed: closed.clone(),
        });
        closed
    }

    /// Close every registered channel and forget about them.
    ///
    /// Returns how many channels were closed.
    pub(crate) fn drain(&self) -> usize {
        let channels = std::mem::take(&mut *self.lock());
        for channel in &channels {
            tracing::debug!(route = %channel.route, "Closing output channel");
            channel.closed.cancel();
        }
        channels.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutputChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
