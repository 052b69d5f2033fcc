use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::{io::AsyncWrite, sync::oneshot};

use crate::{
    compress::compress_frame,
    context::RuntimeContext,
    error::{Error, Result},
    protocol::{CompressionStatus, Header, MessageType, HEADER_SIZE},
};

/// Whether a message reached the transport before the send call returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SendStatus {
    /// Fully written to the transport.
    Sent,
    /// Waiting in the send queue.
    Queued,
}

/// A framed message waiting to be written.
pub(crate) struct OutgoingMessage {
    pub(crate) id: u64,
    pub(crate) message_type: MessageType,
    frame: BytesMut,
    offset: usize,
    compress: bool,
    prepared: bool,
    sent_tx: Option<oneshot::Sender<Result<()>>>,
    /// Set once any byte reached the transport, shared with the invocation
    transmitted: Arc<AtomicBool>,
}

impl OutgoingMessage {
    pub(crate) fn new(message_type: MessageType, frame: BytesMut, compress: bool) -> Self {
        OutgoingMessage {
            id: 0,
            message_type,
            frame,
            offset: 0,
            compress,
            prepared: false,
            sent_tx: None,
            transmitted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers interest in the message being fully written.
    pub(crate) fn notify_sent(&mut self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.sent_tx = Some(tx);
        rx
    }

    pub(crate) fn transmitted(&self) -> Arc<AtomicBool> {
        self.transmitted.clone()
    }

    pub(crate) fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub(crate) fn is_untouched(&self) -> bool {
        self.offset == 0
    }

    /// Finalizes the header and compresses the frame when asked to and worthwhile.
    ///
    /// Runs once, right before the first byte is written, so the frame can still be changed while it
    /// waits in the queue.
    pub(crate) fn prepare(&mut self, ctx: &RuntimeContext) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        self.prepared = true;

        let size = self.frame.len();
        let compressor = match ctx.compressor() {
            Some(compressor) if self.compress => compressor,
            _ => {
                Header::rewrite(&mut self.frame, CompressionStatus::NotCompressed, size);
                return Ok(());
            }
        };

        if size - HEADER_SIZE >= ctx.config().compression_threshold {
            if let Some(compressed) = compress_frame(compressor, &self.frame)? {
                self.frame = compressed;
                return Ok(());
            }
        }
        Header::rewrite(&mut self.frame, CompressionStatus::Supported, size);
        Ok(())
    }

    /// Writes as much of the remaining frame as the transport takes.
    ///
    /// Returns `Ready(Ok(()))` once the whole frame is written.
    pub(crate) fn poll_write<W>(&mut self, writer: &mut W, cx: &mut Context<'_>) -> Poll<Result<()>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while self.offset < self.frame.len() {
            match Pin::new(&mut *writer).poll_write(cx, &self.frame[self.offset..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.offset += n;
                    self.transmitted.store(true, Ordering::Release);
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.prepared && self.offset == self.frame.len()
    }

    /// Fires the sent notification.
    pub(crate) fn complete(mut self) {
        if let Some(tx) = self.sent_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Fails the sent notification.
    pub(crate) fn fail(mut self, err: Error) {
        if let Some(tx) = self.sent_tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Drops interest in completion, used when the owning invocation is canceled mid write.
    pub(crate) fn detach(&mut self, err: Error) {
        if let Some(tx) = self.sent_tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// FIFO of outgoing messages. Only the head may be partially written.
#[derive(Default)]
pub(crate) struct SendQueue {
    messages: VecDeque<OutgoingMessage>,
    next_id: u64,
}

impl SendQueue {
    /// Assigns the message its queue id without queuing it.
    pub(crate) fn assign_id(&mut self, message: &mut OutgoingMessage) -> u64 {
        self.next_id += 1;
        message.id = self.next_id;
        self.next_id
    }

    pub(crate) fn push(&mut self, message: OutgoingMessage) {
        self.messages.push_back(message);
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut OutgoingMessage> {
        self.messages.front_mut()
    }

    pub(crate) fn pop(&mut self) -> Option<OutgoingMessage> {
        self.messages.pop_front()
    }

    /// Removes a message none of which was written yet.
    ///
    /// A partially written message stays queued and is returned as `Err` with a mutable borrow so
    /// the caller can detach it instead.
    pub(crate) fn remove_unsent(&mut self, id: u64) -> Option<std::result::Result<OutgoingMessage, &mut OutgoingMessage>> {
        let index = self.messages.iter().position(|message| message.id == id)?;
        if self.messages[index].is_untouched() {
            self.messages.remove(index).map(Ok)
        } else {
            self.messages.get_mut(index).map(Err)
        }
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = OutgoingMessage> + '_ {
        self.messages.drain(..)
    }
}
