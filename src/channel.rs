//! Command and notice channels between callers and the runtime

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::runtime::{Notice, Op};

/// Runtime side of the channel
pub struct ChannelPair {
    pub op_rx: mpsc::UnboundedReceiver<Op>,
    pub notice_tx: mpsc::UnboundedSender<Notice>,
}

/// Caller side: submit ops, read notices
#[derive(Clone)]
pub struct RuntimeChannel {
    op_tx: mpsc::UnboundedSender<Op>,
    notice_rx: Arc<Mutex<mpsc::UnboundedReceiver<Notice>>>,
}

impl RuntimeChannel {
    /// Returns the caller channel and the pair the runtime consumes
    pub fn new() -> (Self, ChannelPair) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let channel = Self {
            op_tx,
            notice_rx: Arc::new(Mutex::new(notice_rx)),
        };
        (channel, ChannelPair { op_rx, notice_tx })
    }

    pub fn send(&self, op: Op) -> Result<(), ChannelError> {
        self.op_tx.send(op).map_err(|_| ChannelError::Closed)
    }

    /// Non-blocking; `None` if nothing is queued or another reader holds the receiver
    pub fn try_recv(&self) -> Option<Notice> {
        self.notice_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Next notice; `None` once the runtime has dropped its sender
    pub async fn recv(&self) -> Option<Notice> {
        self.notice_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.op_tx.is_closed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Runtime channel is closed")]
    Closed,
}

impl From<ChannelError> for crate::error::SyndicateError {
    fn from(err: ChannelError) -> Self {
        crate::error::SyndicateError::ChannelError(err.to_string())
    }
}
