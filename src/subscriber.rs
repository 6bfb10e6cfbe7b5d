use axum::body::Bytes;
use futures_channel::mpsc::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::WriteError;

/// A live connection that wants the events of one case.
///
/// Implementations must not block: the broadcaster calls `write` for every
/// subscriber of a case in turn.
pub trait Subscriber: Send + Sync {
    fn write(&self, message: &Bytes) -> Result<(), WriteError>;
}

/// Subscriber backed by a bounded channel whose receiving half is the
/// HTTP response body.
///
/// A client that stops reading fills the channel, and the next write fails
/// with [`WriteError::Lagging`].
// The socket sink cannot be shared between the publisher and the response
// task, so messages go through the channel.
#[derive(Debug)]
pub struct ChannelSubscriber {
    sender: Mutex<Sender<Bytes>>,
}

impl ChannelSubscriber {
    /// At most `max_queued` messages (minimum one) wait for the reader.
    pub fn new(max_queued: usize) -> (Self, Receiver<Bytes>) {
        // The sender owns one slot on top of the buffer.
        let (sender, receiver) = mpsc::channel(max_queued.saturating_sub(1));
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl Subscriber for ChannelSubscriber {
    fn write(&self, message: &Bytes) -> Result<(), WriteError> {
        self.sender
            .lock()
            .try_send(message.clone())
            .map_err(|e| {
                if e.is_full() {
                    WriteError::Lagging
                } else {
                    WriteError::Closed
                }
            })
    }
}
