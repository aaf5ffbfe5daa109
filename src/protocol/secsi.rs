//! SECS-I wire format (SEMI E4).
//!
//! A block on the serial line:
//! ```text
//! ┌────────┬──────────────┬───────────┬──────────┬──────────────┬───────────┬──────────┬──────────┐
//! │ Length │ R + DeviceID │ W + Strm  │ Function │ E + Block No │ System ID │ Data     │ Checksum │
//! │ 1 byte │ 2 bytes      │ 1 byte    │ 1 byte   │ 2 bytes      │ 4 bytes   │ ≤244 B   │ 2 bytes  │
//! └────────┴──────────────┴───────────┴──────────┴──────────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The length counts header and data (10..=254). The checksum is the 16-bit
//! arithmetic sum of header and data bytes, Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use super::message::{split_payload, Block, Header};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Maximum data bytes carried by one block.
pub const MAX_BLOCK_DATA: usize = 244;

/// Smallest valid length byte (header only).
pub const MIN_BLOCK_LENGTH: u8 = HEADER_SIZE as u8;

/// Largest valid length byte.
pub const MAX_BLOCK_LENGTH: u8 = (HEADER_SIZE + MAX_BLOCK_DATA) as u8;

/// Line control characters.
pub mod control {
    /// Request to send.
    pub const ENQ: u8 = 0x05;
    /// Ready to receive.
    pub const EOT: u8 = 0x04;
    /// Correct reception.
    pub const ACK: u8 = 0x06;
    /// Incorrect reception.
    pub const NAK: u8 = 0x15;
}

const HIGH_BIT_8: u8 = 0b1000_0000;
const HIGH_BIT_16: u16 = 0b1000_0000_0000_0000;

/// Decoded SECS-I header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecsIHeader {
    /// Device id (15 bits).
    pub device_id: u16,
    /// R-bit: message sent by the equipment.
    pub from_equipment: bool,
    pub stream: u8,
    pub function: u8,
    /// W-bit.
    pub require_response: bool,
    /// Block number (15 bits), 0 or 1 for the first block.
    pub block: u16,
    /// E-bit.
    pub last_block: bool,
    pub system: u32,
}

impl SecsIHeader {
    /// Header of a single-block message.
    pub fn new(
        device_id: u16,
        from_equipment: bool,
        stream: u8,
        function: u8,
        require_response: bool,
        system: u32,
    ) -> Self {
        Self {
            device_id: device_id & !HIGH_BIT_16,
            from_equipment,
            stream: stream & !HIGH_BIT_8,
            function,
            require_response,
            block: 1,
            last_block: true,
            system,
        }
    }

    /// Copy with another block number and E-bit.
    pub fn with_block(self, block: u16, last_block: bool) -> Self {
        Self {
            block: block & !HIGH_BIT_16,
            last_block,
            ..self
        }
    }

    /// Copy with another system id.
    pub fn with_system(self, system: u32) -> Self {
        Self { system, ..self }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let device = self.device_id | if self.from_equipment { HIGH_BIT_16 } else { 0 };
        let block = self.block | if self.last_block { HIGH_BIT_16 } else { 0 };
        buf[0..2].copy_from_slice(&device.to_be_bytes());
        buf[2] = self.stream | if self.require_response { HIGH_BIT_8 } else { 0 };
        buf[3] = self.function;
        buf[4..6].copy_from_slice(&block.to_be_bytes());
        buf[6..10].copy_from_slice(&self.system.to_be_bytes());
        buf
    }

    /// Decode header from bytes. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let device = u16::from_be_bytes([buf[0], buf[1]]);
        let block = u16::from_be_bytes([buf[4], buf[5]]);
        Some(Self {
            device_id: device & !HIGH_BIT_16,
            from_equipment: device & HIGH_BIT_16 != 0,
            stream: buf[2] & !HIGH_BIT_8,
            function: buf[3],
            require_response: buf[2] & HIGH_BIT_8 != 0,
            block: block & !HIGH_BIT_16,
            last_block: block & HIGH_BIT_16 != 0,
            system: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

impl Header for SecsIHeader {
    fn session_id(&self) -> u16 {
        self.device_id
    }

    fn stream(&self) -> u8 {
        self.stream
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn require_response(&self) -> bool {
        self.require_response
    }

    fn system(&self) -> u32 {
        self.system
    }
}

/// 16-bit arithmetic sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

/// One SECS-I block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecsIBlock {
    pub header: SecsIHeader,
    pub data: Bytes,
}

impl SecsIBlock {
    pub fn new(header: SecsIHeader, data: Bytes) -> Self {
        debug_assert!(data.len() <= MAX_BLOCK_DATA);
        Self { header, data }
    }

    /// Split a message payload into blocks.
    ///
    /// Blocks are numbered from 1 and only the final one carries the E-bit.
    pub fn split(header: SecsIHeader, data: &Bytes) -> Vec<SecsIBlock> {
        let chunks = split_payload(data, MAX_BLOCK_DATA);
        let count = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let number = (index + 1) as u16;
                SecsIBlock::new(header.with_block(number, index + 1 == count), chunk)
            })
            .collect()
    }

    /// Decode a block as read from the line: length byte through checksum.
    ///
    /// Returns `None` on an invalid length byte or a checksum mismatch.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (&length, rest) = buf.split_first()?;
        if !(MIN_BLOCK_LENGTH..=MAX_BLOCK_LENGTH).contains(&length) {
            return None;
        }
        let length = length as usize;
        if rest.len() != length + 2 {
            return None;
        }
        let (body, sum) = rest.split_at(length);
        if checksum(body) != u16::from_be_bytes([sum[0], sum[1]]) {
            return None;
        }
        let header = SecsIHeader::decode(body)?;
        Some(Self {
            header,
            data: Bytes::copy_from_slice(&body[HEADER_SIZE..]),
        })
    }
}

impl Block for SecsIBlock {
    type Header = SecsIHeader;

    fn header(&self) -> &SecsIHeader {
        &self.header
    }

    fn data(&self) -> &Bytes {
        &self.data
    }

    fn is_last(&self) -> bool {
        self.header.last_block
    }

    fn encode(&self) -> Bytes {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(1 + length + 2);
        buf.put_u8(length as u8);
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.data);
        let sum = checksum(&buf[1..]);
        buf.put_u16(sum);
        buf.freeze()
    }
}
