//! Message channels.
//!
//! A [`Channel`] is the outbound half of a per-pair, send-order-preserving
//! link between two dispatch participants.  Alongside each [`Envelope`] it can
//! carry a [`TransferList`]: owned buffers whose ownership moves to the
//! receiver.  Because `post` takes the list by value, the sender can no longer
//! touch the buffers once they are handed over.
//!
//! [`LocalChannel`] is the in-process implementation, built on
//! [`tokio::sync::mpsc`].  Every envelope is encoded to JSON on send and
//! decoded on receive so that only serializable payloads ever cross, exactly
//! as they would between separate processes.  Transfer lists travel out of
//! band, next to the encoded frame.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use relay_kernel::channel::{Channel, LocalChannel};
//! # use relay_kernel::{DispatchConfig, Envelope};
//! # async fn example() {
//! let (left, mut right) = LocalChannel::pair(&DispatchConfig::default());
//! left.channel.post(Envelope::default(), None).unwrap();
//! let delivery = right.inbox.recv().await.unwrap();
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::message::Envelope;

/// An owned buffer whose ownership moves with a message.
pub type Transferable = Vec<u8>;

/// Buffers moved (not copied) to the receiver of a message.
pub type TransferList = Vec<Transferable>;

/// One inbound message together with any buffers transferred with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub transfer: Option<TransferList>,
}

impl Delivery {
    /// A delivery with no transfer list.
    pub fn new(envelope: impl Into<Envelope>) -> Self {
        Self {
            envelope: envelope.into(),
            transfer: None,
        }
    }
}

/// Outbound half of a link to one peer.
pub trait Channel: Send + Sync {
    /// Send `envelope` to the peer, moving `transfer` along with it.
    ///
    /// `None` means the sender supplied no transfer list at all, which is
    /// distinct from an empty one.
    fn post(&self, envelope: Envelope, transfer: Option<TransferList>) -> Result<()>;

    /// Stop sending.  The peer's inbox ends once everything already posted has
    /// been received.
    fn close(&self);

    /// Whether [`Channel::close`] has been called.
    fn is_closed(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------------------

struct Frame {
    bytes: Vec<u8>,
    transfer: Option<TransferList>,
}

/// In-process [`Channel`] backed by an unbounded tokio mpsc queue.
pub struct LocalChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    max_frame_bytes: usize,
}

/// Inbound half of a [`LocalChannel`] link.
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Both halves owned by one side of a link.
pub struct Endpoint {
    /// Sends to the opposite side.
    pub channel: Arc<LocalChannel>,
    /// Receives what the opposite side sends.
    pub inbox: ChannelReceiver,
}

impl LocalChannel {
    /// Create a connected pair of endpoints.
    #[must_use]
    pub fn pair(config: &DispatchConfig) -> (Endpoint, Endpoint) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        let left = Endpoint {
            channel: Arc::new(Self::new(right_tx, config)),
            inbox: ChannelReceiver { rx: left_rx },
        };
        let right = Endpoint {
            channel: Arc::new(Self::new(left_tx, config)),
            inbox: ChannelReceiver { rx: right_rx },
        };
        (left, right)
    }

    fn new(tx: mpsc::UnboundedSender<Frame>, config: &DispatchConfig) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Frame>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Channel for LocalChannel {
    fn post(&self, envelope: Envelope, transfer: Option<TransferList>) -> Result<()> {
        let bytes = envelope.to_json()?;
        if bytes.len() > self.max_frame_bytes {
            return Err(DispatchError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }

        let guard = self.sender();
        let tx = guard.as_ref().ok_or(DispatchError::ChannelClosed)?;
        tracing::trace!(bytes = bytes.len(), "frame posted");
        tx.send(Frame { bytes, transfer })
            .map_err(|_| DispatchError::ChannelClosed)
    }

    fn close(&self) {
        if self.sender().take().is_some() {
            tracing::debug!("local channel closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.sender().as_ref().is_none_or(|tx| tx.is_closed())
    }
}

impl ChannelReceiver {
    /// Wait for the next decodable message.
    ///
    /// Frames that fail to decode are logged and skipped.  Returns `None` once
    /// the sending side has closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let frame = self.rx.recv().await?;
            match Envelope::from_json(&frame.bytes) {
                Ok(envelope) => {
                    return Some(Delivery {
                        envelope,
                        transfer: frame.transfer,
                    });
                }
                Err(err) => tracing::error!(error = %err, "dropping undecodable frame"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recording channel
// ---------------------------------------------------------------------------

/// Something observed on a [`RecordingChannel`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Posted(Delivery),
    Closed,
}

/// A [`Channel`] that delivers nowhere and remembers everything.
///
/// Used to observe exactly what a participant sends (and when it closes)
/// without running a peer.
#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<ChannelEvent>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self) -> MutexGuard<'_, Vec<ChannelEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every post and close so far.
    pub fn events(&self) -> Vec<ChannelEvent> {
        self.log().clone()
    }

    /// Every posted delivery so far.
    pub fn posted(&self) -> Vec<Delivery> {
        self.log()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Posted(delivery) => Some(delivery.clone()),
                ChannelEvent::Closed => None,
            })
            .collect()
    }

    /// Posted envelopes, classified.
    pub fn inbound(&self) -> Vec<crate::message::Inbound> {
        self.posted()
            .into_iter()
            .map(|delivery| delivery.envelope.classify())
            .collect()
    }
}

impl Channel for RecordingChannel {
    fn post(&self, envelope: Envelope, transfer: Option<TransferList>) -> Result<()> {
        let mut log = self.log();
        if log.contains(&ChannelEvent::Closed) {
            return Err(DispatchError::ChannelClosed);
        }
        log.push(ChannelEvent::Posted(Delivery { envelope, transfer }));
        Ok(())
    }

    fn close(&self) {
        let mut log = self.log();
        if !log.contains(&ChannelEvent::Closed) {
            log.push(ChannelEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.log().contains(&ChannelEvent::Closed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
