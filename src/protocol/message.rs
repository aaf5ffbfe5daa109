//! Message assembly shared by HSMS and SECS-I.
//!
//! A [`Message`] is an ordered list of blocks sharing one system id. It is
//! complete once the block carrying the last-block flag has been appended.
//! [`SecsMessage`] is the protocol-neutral view handed to handlers and waiters.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Result, SecsError};

/// Fields every protocol header exposes.
pub trait Header: Copy + fmt::Debug + PartialEq + Send + Sync + 'static {
    fn session_id(&self) -> u16;
    fn stream(&self) -> u8;
    fn function(&self) -> u8;
    fn require_response(&self) -> bool;
    fn system(&self) -> u32;
}

/// The unit placed on the wire.
pub trait Block: Clone + fmt::Debug + Send + Sync + 'static {
    type Header: Header;

    fn header(&self) -> &Self::Header;

    fn data(&self) -> &Bytes;

    /// Whether this block closes its message.
    fn is_last(&self) -> bool;

    /// Full wire representation, including length and checksum where applicable.
    fn encode(&self) -> Bytes;
}

/// Chunk `data` into pieces of at most `block_size` bytes.
///
/// Always yields at least one (possibly empty) chunk. Chunks share the
/// original allocation.
pub fn split_payload(data: &Bytes, block_size: usize) -> Vec<Bytes> {
    assert!(block_size > 0, "block size must be positive");
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    (0..data.len())
        .step_by(block_size)
        .map(|start| data.slice(start..(start + block_size).min(data.len())))
        .collect()
}

/// Blocks of one message, in arrival order.
#[derive(Debug, Clone)]
pub struct Message<B: Block> {
    blocks: Vec<B>,
    complete: bool,
}

impl<B: Block> Message<B> {
    /// Create an empty, incomplete message.
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            complete: false,
        }
    }

    /// Create a message from blocks that already form a whole.
    pub fn from_blocks(blocks: Vec<B>) -> Result<Self> {
        let mut message = Self::new();
        for block in blocks {
            message.append(block)?;
        }
        Ok(message)
    }

    /// Append the next block.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the message is already complete or the
    /// block belongs to another system id.
    pub fn append(&mut self, block: B) -> Result<()> {
        if self.complete {
            return Err(SecsError::Protocol(format!(
                "Message for system {} is already complete",
                block.header().system()
            )));
        }
        if let Some(system) = self.system() {
            if block.header().system() != system {
                return Err(SecsError::Protocol(format!(
                    "Block for system {} appended to message for system {}",
                    block.header().system(),
                    system
                )));
            }
        }
        self.complete = block.is_last();
        self.blocks.push(block);
        Ok(())
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn blocks(&self) -> &[B] {
        &self.blocks
    }

    /// Header of the first block.
    pub fn header(&self) -> Option<&B::Header> {
        self.blocks.first().map(|b| b.header())
    }

    pub fn system(&self) -> Option<u32> {
        self.header().map(|h| h.system())
    }

    /// Concatenated payload of all blocks.
    pub fn data(&self) -> Bytes {
        match self.blocks.as_slice() {
            [] => Bytes::new(),
            [single] => single.data().clone(),
            blocks => {
                let total = blocks.iter().map(|b| b.data().len()).sum();
                let mut buf = BytesMut::with_capacity(total);
                for block in blocks {
                    buf.extend_from_slice(block.data());
                }
                buf.freeze()
            }
        }
    }

    /// Protocol-neutral view, `None` while the message has no blocks.
    pub fn to_secs_message(&self) -> Option<SecsMessage> {
        let header = self.header()?;
        Some(SecsMessage {
            session_id: header.session_id(),
            stream: header.stream(),
            function: header.function(),
            require_response: header.require_response(),
            system: header.system(),
            data: self.data(),
        })
    }
}

impl<B: Block> Default for Message<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// A completed data message, independent of the transport that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecsMessage {
    pub session_id: u16,
    pub stream: u8,
    pub function: u8,
    pub require_response: bool,
    pub system: u32,
    /// Opaque SECS-II body.
    pub data: Bytes,
}

impl SecsMessage {
    /// Primary messages have odd function numbers.
    #[inline]
    pub fn is_primary(&self) -> bool {
        self.function % 2 == 1
    }

    /// Function 0 aborts the transaction.
    #[inline]
    pub fn is_abort(&self) -> bool {
        self.function == 0
    }

    /// Function number of the secondary message answering this one.
    #[inline]
    pub fn reply_function(&self) -> u8 {
        self.function.wrapping_add(1)
    }
}

impl fmt::Display for SecsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}F{}", self.stream, self.function)?;
        if self.require_response {
            write!(f, " W")?;
        }
        write!(f, " system={} len={}", self.system, self.data.len())
    }
}
