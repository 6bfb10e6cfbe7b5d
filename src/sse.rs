//! Response body for a live-update connection.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_channel::mpsc::Receiver;
use futures_util::{Stream, StreamExt};
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};

use crate::broadcaster::Unsubscribe;

/// Comment line, ignored by EventSource clients.
pub const KEEPALIVE: &[u8] = b": keep-alive\n\n";

/// Yields the messages written to a [`crate::subscriber::ChannelSubscriber`]
/// and keeps idle connections alive.
///
/// The HTTP layer drops the body when the client goes away, which detaches
/// the subscriber.
pub struct EventStream {
    receiver: Receiver<Bytes>,
    heartbeat: Option<Interval>,
    unsubscribe: Unsubscribe,
}

impl EventStream {
    /// `keepalive` of `None` disables heartbeats.
    pub fn new(
        receiver: Receiver<Bytes>,
        unsubscribe: Unsubscribe,
        keepalive: Option<Duration>,
    ) -> Self {
        let heartbeat = keepalive.map(|period| {
            // First tick one period from now, not immediately.
            let mut heartbeat = interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat
        });

        Self {
            receiver,
            heartbeat,
            unsubscribe,
        }
    }
}

impl Stream for EventStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_next_unpin(cx) {
            Poll::Ready(Some(message)) => {
                if let Some(heartbeat) = self.heartbeat.as_mut() {
                    heartbeat.reset();
                }
                return Poll::Ready(Some(Ok(message)));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        if let Some(heartbeat) = self.heartbeat.as_mut() {
            if heartbeat.poll_tick(cx).is_ready() {
                return Poll::Ready(Some(Ok(Bytes::from_static(KEEPALIVE))));
            }
        }
        Poll::Pending
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe.detach();
    }
}
