//! Output queue: a fixed-capacity byte ring holding whole framed messages.
//!
//! The queue does no locking of its own. It lives inside the driver's locked
//! state, so holding `&mut MessageQueue` already proves the driver lock is held.

use bytes::Bytes;
use tracing::warn;

use crate::constants::MSG_HEADER_SIZE;
use crate::error::{Result, TofError};
use crate::message::{Message, MessageHeader, decode_header};

/// How a successful [`MessageQueue::push`] went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full: earlier contents were dropped and an overflow record
    /// now precedes the new message.
    RecoveredFromOverflow,
}

pub struct MessageQueue {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
}

impl MessageQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Buffered bytes, always a whole number of messages.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn utilization_percent(&self) -> u32 {
        if self.capacity() == 0 {
            return 0;
        }
        (self.len * 100 / self.capacity()) as u32
    }

    /// Append one framed message, recovering from overflow if needed.
    ///
    /// On overflow the queue is cleared, an overflow record is enqueued and the
    /// message is retried once. A message that still does not fit is reported as
    /// [`TofError::Overflow`]; the queue then holds only the overflow record.
    pub fn push(&mut self, message: &[u8]) -> Result<PushOutcome> {
        let header = decode_header(message)?;
        if header.length as usize != message.len() {
            return Err(TofError::Format(format!(
                "header claims {} bytes, frame has {}",
                header.length,
                message.len()
            )));
        }

        if self.try_push(message) {
            return Ok(PushOutcome::Queued);
        }

        warn!(
            len = message.len(),
            queued = self.len,
            capacity = self.capacity(),
            "Output queue full, clearing buffer"
        );
        self.reset();
        let overflow = Message::overflow().encode();
        // an empty queue smaller than the record cannot report anything
        let _ = self.try_push(&overflow);
        if self.try_push(message) {
            Ok(PushOutcome::RecoveredFromOverflow)
        } else {
            Err(TofError::Overflow {
                len: message.len(),
                capacity: self.capacity(),
            })
        }
    }

    /// Header of the next message, if that message is completely buffered.
    pub fn peek_header(&self) -> Option<MessageHeader> {
        if self.len < MSG_HEADER_SIZE {
            return None;
        }
        let mut raw = [0u8; MSG_HEADER_SIZE];
        self.copy_out(&mut raw);
        let header = decode_header(&raw).ok()?;
        (header.length as usize <= self.len).then_some(header)
    }

    pub fn peek_next_length(&self) -> Option<u16> {
        self.peek_header().map(|h| h.length)
    }

    /// Move exactly one message into `into`, returning its size (0 when empty).
    ///
    /// `into` must be at least [`Self::peek_next_length`] bytes; otherwise the
    /// queue is left untouched and `InvalidArgument` is returned.
    pub fn pop_message(&mut self, into: &mut [u8]) -> Result<usize> {
        let Some(header) = self.peek_header() else {
            return Ok(0);
        };
        let n = header.length as usize;
        if into.len() < n {
            return Err(TofError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold a {} byte message",
                into.len(),
                n
            )));
        }
        self.copy_out(&mut into[..n]);
        self.advance(n);
        Ok(n)
    }

    /// Owned variant of [`Self::pop_message`].
    pub fn take_message(&mut self) -> Option<Bytes> {
        let n = self.peek_next_length()? as usize;
        let mut out = vec![0u8; n];
        self.copy_out(&mut out);
        self.advance(n);
        Some(Bytes::from(out))
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn try_push(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap.max(1);
        let first = data.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.len += data.len();
        true
    }

    fn copy_out(&self, dst: &mut [u8]) {
        let cap = self.capacity();
        let first = dst.len().min(cap - self.head);
        dst[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&self.buf[..rest]);
    }

    fn advance(&mut self, n: usize) {
        self.len -= n;
        self.head = if self.len == 0 { 0 } else { (self.head + n) % self.capacity() };
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
