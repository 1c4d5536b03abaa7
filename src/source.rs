//! Frame source abstraction over the message bus.
//!
//! The capture loop is written against [`FrameSource`] so the bus technology
//! is swappable: production wires a subscriber socket, tests feed an
//! in-memory channel. [`ChannelSource`] is the in-process implementation,
//! with subscriber-side topic filtering matching pub/sub prefix semantics.

use crate::codec::BusMessage;
use crate::error::{Result, SaverError};
use tokio::sync::mpsc;

/// A subscription delivering frame messages to the capture loop.
pub trait FrameSource: Send {
    /// Non-blocking poll for the next message.
    ///
    /// `Ok(None)` means nothing pending; the loop sleeps its backoff and
    /// retries. [`SaverError::SourceDisconnected`] means the producer side
    /// is gone for good.
    fn poll(&mut self) -> Result<Option<BusMessage>>;
}

/// In-process frame source backed by an unbounded channel.
///
/// Messages whose topic does not start with the subscribed filter are
/// discarded at poll time, the way a SUB socket drops unsubscribed topics.
/// An empty filter subscribes to everything.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    topic: String,
}

impl ChannelSource {
    /// Create a publisher/subscriber pair for the given topic filter.
    pub fn pair(topic: impl Into<String>) -> (mpsc::UnboundedSender<BusMessage>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, topic))
    }

    /// Wrap an existing receiver with a topic filter.
    pub fn new(rx: mpsc::UnboundedReceiver<BusMessage>, topic: impl Into<String>) -> Self {
        Self {
            rx,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl FrameSource for ChannelSource {
    fn poll(&mut self) -> Result<Option<BusMessage>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if msg.topic.starts_with(&self.topic) => return Ok(Some(msg)),
                // Unsubscribed topic: drop and keep draining without backoff.
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(SaverError::SourceDisconnected)
                }
            }
        }
    }
}
