//! HSMS frame extraction from the receive queue.
//!
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForLength`: need the 4-byte length prefix
//! - `WaitingForFrame`: length parsed, need N more bytes
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use secs_transport::protocol::{Block, FrameBuffer, HsmsBlock, HsmsHeader};
//! use secs_transport::transport::ByteQueue;
//!
//! let queue = ByteQueue::new();
//! let block = HsmsBlock::new(HsmsHeader::data(1, 1, 1, true, 7), Bytes::new());
//! queue.push(&block.encode());
//!
//! let mut frames = FrameBuffer::new();
//! let received = frames.extract(&queue).unwrap().unwrap();
//! assert_eq!(received.header.system, 7);
//! ```

use super::hsms::{HsmsBlock, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, LENGTH_PREFIX_SIZE};
use crate::error::{Result, SecsError};
use crate::transport::ByteQueue;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the length prefix.
    WaitingForLength,
    /// Length consumed, waiting for header + data.
    WaitingForFrame { length: usize },
}

/// Extracts complete HSMS frames from a [`ByteQueue`].
#[derive(Debug)]
pub struct FrameBuffer {
    state: State,
    /// Maximum allowed frame length (header + data).
    max_message_size: u32,
}

impl FrameBuffer {
    /// Create a frame buffer with the default maximum message size.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            state: State::WaitingForLength,
            max_message_size,
        }
    }

    /// Try to extract one frame.
    ///
    /// Returns:
    /// - `Ok(Some(block))` if a complete, decodable frame was consumed
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the length is beyond the maximum; the stream cannot be
    ///   resynchronised and the caller should drop the connection
    ///
    /// Frames shorter than a header are consumed, logged and skipped.
    pub fn extract(&mut self, queue: &ByteQueue) -> Result<Option<HsmsBlock>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    let Some(prefix) = queue.pop(LENGTH_PREFIX_SIZE) else {
                        return Ok(None);
                    };
                    let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);

                    if length > self.max_message_size {
                        return Err(SecsError::Protocol(format!(
                            "Frame length {} exceeds maximum {}",
                            length, self.max_message_size
                        )));
                    }

                    self.state = State::WaitingForFrame {
                        length: length as usize,
                    };
                }

                State::WaitingForFrame { length } => {
                    let Some(body) = queue.pop(length) else {
                        return Ok(None);
                    };
                    self.state = State::WaitingForLength;

                    if length < HEADER_SIZE {
                        tracing::warn!("Dropping HSMS frame with length {}", length);
                        continue;
                    }

                    return Ok(HsmsBlock::decode_body(&body));
                }
            }
        }
    }

    /// Extract every complete frame currently buffered.
    pub fn extract_all(&mut self, queue: &ByteQueue) -> Result<Vec<HsmsBlock>> {
        let mut blocks = Vec::new();
        while let Some(block) = self.extract(queue)? {
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Reset to the start of a frame (after a reconnect).
    pub fn reset(&mut self) {
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Block, HsmsHeader};
    use bytes::Bytes;

    fn frame(system: u32, payload: &'static [u8]) -> Bytes {
        HsmsBlock::new(
            HsmsHeader::data(1, 1, 3, true, system),
            Bytes::from_static(payload),
        )
        .encode()
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let queue = ByteQueue::new();
        queue.push(&frame(1, b"first"));
        queue.push(&frame(2, b"second"));
        queue.push(&frame(3, b""));

        let mut buffer = FrameBuffer::new();
        let blocks = buffer.extract_all(&queue).unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].header.system, 1);
        assert_eq!(&blocks[1].data[..], b"second");
        assert!(blocks[2].data.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fragmented_frame() {
        let queue = ByteQueue::new();
        let bytes = frame(42, b"fragmented payload");
        let mut buffer = FrameBuffer::new();

        queue.push(&bytes[..2]);
        assert!(buffer.extract(&queue).unwrap().is_none());
        assert_eq!(buffer.state_name(), "WaitingForLength");

        queue.push(&bytes[2..9]);
        assert!(buffer.extract(&queue).unwrap().is_none());
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        queue.push(&bytes[9..]);
        let block = buffer.extract(&queue).unwrap().unwrap();
        assert_eq!(block.header.system, 42);
        assert_eq!(&block.data[..], b"fragmented payload");
    }

    #[test]
    fn test_byte_at_a_time() {
        let queue = ByteQueue::new();
        let mut buffer = FrameBuffer::new();
        let mut received = Vec::new();

        for byte in frame(5, b"hi").iter() {
            queue.push(&[*byte]);
            received.extend(buffer.extract_all(&queue).unwrap());
        }

        assert_eq!(received.len(), 1);
        assert_eq!(&received[0].data[..], b"hi");
    }

    #[test]
    fn test_short_frame_is_skipped() {
        let queue = ByteQueue::new();
        queue.push(&[0, 0, 0, 3, 0xAA, 0xBB, 0xCC]);
        queue.push(&frame(9, b"ok"));

        let mut buffer = FrameBuffer::new();
        let block = buffer.extract(&queue).unwrap().unwrap();
        assert_eq!(block.header.system, 9);
    }

    #[test]
    fn test_oversized_length_is_error() {
        let queue = ByteQueue::new();
        queue.push(&1000u32.to_be_bytes());

        let mut buffer = FrameBuffer::with_max_message_size(100);
        let err = buffer.extract(&queue).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_reset_discards_partial_state() {
        let queue = ByteQueue::new();
        queue.push(&20u32.to_be_bytes());

        let mut buffer = FrameBuffer::new();
        assert!(buffer.extract(&queue).unwrap().is_none());
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        buffer.reset();
        assert_eq!(buffer.state_name(), "WaitingForLength");
    }
}
