//! Response observers.
//!
//! An [`Observer`] receives every decoded response, decode failures, and one
//! completion event per batch. [`ChannelObserver`] forwards the same events
//! into an unbounded channel for callers that prefer a stream.

use tokio::sync::mpsc;

use crate::error::PipeLinkError;

/// Receives responses pushed by a client's callback loop.
///
/// Callbacks run on the receive task; they should not block for long.
pub trait Observer<T>: Send + Sync + 'static {
    /// One response arrived.
    fn on_next(&self, value: &T);

    /// A callback could not be delivered as a value.
    ///
    /// Called for an undecodable frame, for an item the server failed to
    /// process ([`PipeLinkError::ItemFailed`]), and once when the callback
    /// connection drops with responses outstanding
    /// ([`PipeLinkError::ConnectionClosed`]).
    fn on_error(&self, error: &PipeLinkError) {
        tracing::debug!(error = %error, "Unhandled observer error");
    }

    /// The last response of a batch was delivered.
    fn on_completed(&self) {}
}

/// Event delivered by a [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<T> {
    /// A response value.
    Next(T),
    /// A failed callback, rendered as text.
    Error(String),
    /// End of one batch.
    Completed,
}

/// Observer that forwards notifications into an mpsc channel.
pub struct ChannelObserver<T> {
    tx: mpsc::UnboundedSender<Notification<T>>,
}

impl<T> ChannelObserver<T> {
    /// Create the observer together with the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<T: Clone + Send + Sync + 'static> Observer<T> for ChannelObserver<T> {
    fn on_next(&self, value: &T) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(Notification::Next(value.clone()));
    }

    fn on_error(&self, error: &PipeLinkError) {
        let _ = self.tx.send(Notification::Error(error.to_string()));
    }

    fn on_completed(&self) {
        let _ = self.tx.send(Notification::Completed);
    }
}
