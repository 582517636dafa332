use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};

use super::FetchEvent;

/// The sending half handed to the producer of an [`EventStream`].
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<FetchEvent>,
}

impl EventSender {
    /// Emits an event. Events sent after the stream was dropped are discarded.
    pub fn send(&self, event: FetchEvent) {
        self.sender.unbounded_send(event).ok();
    }
}

/// A lazy stream of [`FetchEvent`]s driven by a producer future.
///
/// The producer does not start before the stream is first polled, and it only makes progress
/// while the stream is being polled. Dropping the stream drops the producer, which aborts
/// whatever it was waiting on.
pub struct EventStream {
    producer: Option<BoxFuture<'static, ()>>,
    events: mpsc::UnboundedReceiver<FetchEvent>,
}

impl EventStream {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(EventSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, events) = mpsc::unbounded();
        let producer = f(EventSender { sender });
        Self {
            producer: Some(producer.boxed()),
            events,
        }
    }
}

impl EventStream {
    /// Drops the producer, aborting whatever it was waiting on.
    ///
    /// Events it already queued are still handed out.
    pub fn abort(&mut self) {
        self.producer = None;
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("running", &self.producer.is_some())
            .finish()
    }
}

impl Stream for EventStream {
    type Item = FetchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Queued events are handed out before the producer is driven any further.
        if let Poll::Ready(Some(event)) = self.events.poll_next_unpin(cx) {
            return Poll::Ready(Some(event));
        }

        if let Some(producer) = self.producer.as_mut()
            && producer.poll_unpin(cx).is_ready()
        {
            self.producer = None;
        }

        match self.events.poll_next_unpin(cx) {
            Poll::Ready(event) => Poll::Ready(event),
            // The sender lives inside the producer, so a finished producer means no more events.
            Poll::Pending if self.producer.is_none() => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
