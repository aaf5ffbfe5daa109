//! Protocol module - headers, blocks, messages and framing.
//!
//! This module implements the two wire formats:
//! - HSMS: 4-byte length + 10-byte header + data, one block per message
//! - SECS-I: length byte + 10-byte header + data + checksum, up to 244 data
//!   bytes per block
//!
//! Both produce blocks that assemble into a [`Message`].

mod frame_buffer;
mod hsms;
mod message;
mod secsi;

pub use frame_buffer::FrameBuffer;
pub use hsms::{
    deselect_status, reject_reason, select_status, HsmsBlock, HsmsHeader, SType,
    CONTROL_SESSION_ID, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE as HSMS_HEADER_SIZE,
    LENGTH_PREFIX_SIZE,
};
pub use message::{split_payload, Block, Header, Message, SecsMessage};
pub use secsi::{
    checksum, control, SecsIBlock, SecsIHeader, HEADER_SIZE as SECSI_HEADER_SIZE,
    MAX_BLOCK_DATA, MAX_BLOCK_LENGTH, MIN_BLOCK_LENGTH,
};

/// An HSMS message (always exactly one block).
pub type HsmsMessage = Message<HsmsBlock>;

/// A SECS-I message (one or more blocks).
pub type SecsIMessage = Message<SecsIBlock>;
