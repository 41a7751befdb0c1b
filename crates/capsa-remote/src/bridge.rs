//! Stream bridge: turns inbound data/error/end messages into a lazily
//! consumed ordered sequence.

use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::RemoteError;

/// One entry in a bridged sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEntry {
    /// An item of the sequence.
    Item(Value),
    /// Terminal failure; iteration fails at this point.
    Error(String),
    /// Clean terminal; no further reads yield anything.
    End,
}

/// Producer half of a bridged stream.
///
/// Pushing an entry wakes one waiting consumer; entries are consumed
/// in push order.
#[derive(Debug, Clone)]
pub struct StreamBridge {
    tx: mpsc::UnboundedSender<StreamEntry>,
}

impl StreamBridge {
    /// Create a bridge and its consumer stream.
    #[must_use]
    pub fn channel() -> (Self, BridgeStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            BridgeStream {
                rx,
                terminated: false,
            },
        )
    }

    /// Queue one item. Returns `false` if the consumer is gone.
    pub fn push(&self, item: Value) -> bool {
        self.tx.send(StreamEntry::Item(item)).is_ok()
    }

    /// Terminate the sequence with a failure.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(StreamEntry::Error(message.into()));
    }

    /// Terminate the sequence cleanly.
    pub fn end(&self) {
        let _ = self.tx.send(StreamEntry::End);
    }
}

/// Consumer half: an ordered stream of items ending at the first
/// terminal entry.
#[derive(Debug)]
pub struct BridgeStream {
    rx: mpsc::UnboundedReceiver<StreamEntry>,
    terminated: bool,
}

impl Stream for BridgeStream {
    type Item = Result<Value, RemoteError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEntry::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(StreamEntry::Error(message))) => {
                this.terminated = true;
                this.rx.close();
                Poll::Ready(Some(Err(RemoteError::Remote { message })))
            },
            Poll::Ready(Some(StreamEntry::End) | None) => {
                this.terminated = true;
                this.rx.close();
                Poll::Ready(None)
            },
            Poll::Pending => Poll::Pending,
        }
    }
}
