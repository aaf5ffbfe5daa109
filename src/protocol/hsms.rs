//! HSMS wire format (SEMI E37).
//!
//! Every HSMS message is a single frame:
//! ```text
//! ┌──────────┬────────────┬───────────┬──────────┬────────┬────────┬───────────┬─────────┐
//! │ Length   │ Session ID │ W + Strm  │ Function │ P-Type │ S-Type │ System ID │ Data    │
//! │ 4 bytes  │ 2 bytes    │ 1 byte    │ 1 byte   │ 1 byte │ 1 byte │ 4 bytes   │ N bytes │
//! └──────────┴────────────┴───────────┴──────────┴────────┴────────┴───────────┴─────────┘
//! ```
//!
//! The length counts header and data, never itself. All multi-byte integers are
//! Big Endian. Control messages reuse the stream/function bytes for status and
//! reason codes.

use bytes::{BufMut, Bytes, BytesMut};

use super::message::{Block, Header};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for an inbound frame (header + data).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Session id used by Select/Deselect/Linktest/Separate.
pub const CONTROL_SESSION_ID: u16 = 0xFFFF;

/// W-bit in header byte 2.
const REQUIRE_RESPONSE_BIT: u8 = 0b1000_0000;

/// Session type (s-type) of an HSMS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SType {
    /// Data message (stream/function payload).
    Data = 0,
    /// Select.req
    SelectReq = 1,
    /// Select.rsp
    SelectRsp = 2,
    /// Deselect.req
    DeselectReq = 3,
    /// Deselect.rsp
    DeselectRsp = 4,
    /// Linktest.req
    LinktestReq = 5,
    /// Linktest.rsp
    LinktestRsp = 6,
    /// Reject.req
    RejectReq = 7,
    /// Separate.req
    SeparateReq = 9,
}

impl SType {
    /// Map a raw s-type byte onto the control catalog.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SType::Data),
            1 => Some(SType::SelectReq),
            2 => Some(SType::SelectRsp),
            3 => Some(SType::DeselectReq),
            4 => Some(SType::DeselectRsp),
            5 => Some(SType::LinktestReq),
            6 => Some(SType::LinktestRsp),
            7 => Some(SType::RejectReq),
            9 => Some(SType::SeparateReq),
            _ => None,
        }
    }

    /// Responses (and Reject.req) resolve a pending request by system id.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            SType::SelectRsp | SType::DeselectRsp | SType::LinktestRsp | SType::RejectReq
        )
    }
}

/// Select.rsp status codes.
pub mod select_status {
    /// Communication established.
    pub const SUCCESS: u8 = 0;
    /// Communication already active.
    pub const ALREADY_ACTIVE: u8 = 1;
    /// Connection not ready.
    pub const NOT_READY: u8 = 2;
    /// Connection exhausted.
    pub const EXHAUSTED: u8 = 3;
}

/// Deselect.rsp status codes.
pub mod deselect_status {
    /// Communication ended.
    pub const SUCCESS: u8 = 0;
    /// Communication was not established.
    pub const NOT_ESTABLISHED: u8 = 1;
    /// Communication busy.
    pub const BUSY: u8 = 2;
}

/// Reject.req reason codes.
pub mod reject_reason {
    /// S-type not supported.
    pub const STYPE_NOT_SUPPORTED: u8 = 1;
    /// P-type not supported.
    pub const PTYPE_NOT_SUPPORTED: u8 = 2;
    /// Transaction not open (unexpected response).
    pub const TRANSACTION_NOT_OPEN: u8 = 3;
    /// Entity not selected.
    pub const ENTITY_NOT_SELECTED: u8 = 4;
}

/// Decoded HSMS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsmsHeader {
    /// Session (device) id, 0xFFFF for most control messages.
    pub session_id: u16,
    /// Stream (7 bits); status carrier for Reject.req.
    pub stream: u8,
    /// Function; status or reason code for control messages.
    pub function: u8,
    /// W-bit.
    pub require_response: bool,
    /// Presentation type, 0 for SECS-II.
    pub p_type: u8,
    /// Raw session type, see [`SType`].
    pub s_type: u8,
    /// Correlation id.
    pub system: u32,
}

impl HsmsHeader {
    /// Header of a data message.
    pub fn data(
        session_id: u16,
        stream: u8,
        function: u8,
        require_response: bool,
        system: u32,
    ) -> Self {
        Self {
            session_id,
            stream: stream & !REQUIRE_RESPONSE_BIT,
            function,
            require_response,
            p_type: 0,
            s_type: SType::Data as u8,
            system,
        }
    }

    /// Header of a control message carrying no status.
    pub fn control(s_type: SType, system: u32) -> Self {
        Self {
            session_id: CONTROL_SESSION_ID,
            stream: 0,
            function: 0,
            require_response: false,
            p_type: 0,
            s_type: s_type as u8,
            system,
        }
    }

    pub fn select_req(system: u32) -> Self {
        Self::control(SType::SelectReq, system)
    }

    pub fn select_rsp(system: u32, status: u8) -> Self {
        Self {
            function: status,
            ..Self::control(SType::SelectRsp, system)
        }
    }

    pub fn deselect_req(system: u32) -> Self {
        Self::control(SType::DeselectReq, system)
    }

    pub fn deselect_rsp(system: u32, status: u8) -> Self {
        Self {
            function: status,
            ..Self::control(SType::DeselectRsp, system)
        }
    }

    pub fn linktest_req(system: u32) -> Self {
        Self::control(SType::LinktestReq, system)
    }

    pub fn linktest_rsp(system: u32) -> Self {
        Self::control(SType::LinktestRsp, system)
    }

    pub fn separate_req(system: u32) -> Self {
        Self::control(SType::SeparateReq, system)
    }

    /// Reject.req answering `rejected`.
    ///
    /// Byte 2 carries the rejected p-type for reason 2 and the rejected s-type
    /// otherwise; byte 3 carries the reason.
    pub fn reject_req(rejected: &HsmsHeader, reason: u8) -> Self {
        let byte2 = if reason == reject_reason::PTYPE_NOT_SUPPORTED {
            rejected.p_type
        } else {
            rejected.s_type
        };
        Self {
            session_id: rejected.session_id,
            stream: byte2 & !REQUIRE_RESPONSE_BIT,
            function: reason,
            require_response: byte2 & REQUIRE_RESPONSE_BIT != 0,
            p_type: 0,
            s_type: SType::RejectReq as u8,
            system: rejected.system,
        }
    }

    /// Copy of this header with another system id.
    pub fn with_system(self, system: u32) -> Self {
        Self { system, ..self }
    }

    /// Session type, `None` when outside the catalog.
    #[inline]
    pub fn kind(&self) -> Option<SType> {
        SType::from_u8(self.s_type)
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.s_type != SType::Data as u8
    }

    /// Status byte of Select.rsp / Deselect.rsp.
    #[inline]
    pub fn status(&self) -> u8 {
        self.function
    }

    /// Reason code of Reject.req.
    #[inline]
    pub fn reject_reason(&self) -> u8 {
        self.function
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use secs_transport::protocol::HsmsHeader;
    ///
    /// let header = HsmsHeader::data(1, 1, 1, true, 42);
    /// let bytes = header.encode();
    /// assert_eq!(bytes[2], 0x81);
    /// assert_eq!(HsmsHeader::decode(&bytes), Some(header));
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.session_id.to_be_bytes());
        buf[2] = self.stream
            | if self.require_response {
                REQUIRE_RESPONSE_BIT
            } else {
                0
            };
        buf[3] = self.function;
        buf[4] = self.p_type;
        buf[5] = self.s_type;
        buf[6..10].copy_from_slice(&self.system.to_be_bytes());
        buf
    }

    /// Decode header from bytes. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            session_id: u16::from_be_bytes([buf[0], buf[1]]),
            stream: buf[2] & !REQUIRE_RESPONSE_BIT,
            function: buf[3],
            require_response: buf[2] & REQUIRE_RESPONSE_BIT != 0,
            p_type: buf[4],
            s_type: buf[5],
            system: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

impl Header for HsmsHeader {
    fn session_id(&self) -> u16 {
        self.session_id
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

/// A complete HSMS frame. HSMS never splits messages, so one block is one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmsBlock {
    pub header: HsmsHeader,
    pub data: Bytes,
}

impl HsmsBlock {
    pub fn new(header: HsmsHeader, data: Bytes) -> Self {
        Self { header, data }
    }

    /// Control frames never carry data.
    pub fn control(header: HsmsHeader) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Decode a frame body (header + data, length prefix already stripped).
    pub fn decode_body(body: &[u8]) -> Option<Self> {
        let header = HsmsHeader::decode(body)?;
        Some(Self::new(
            header,
            Bytes::copy_from_slice(&body[HEADER_SIZE..]),
        ))
    }

    /// Decode a full frame including the length prefix.
    ///
    /// Returns `None` when the length field disagrees with the buffer.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < LENGTH_PREFIX_SIZE + HEADER_SIZE {
            return None;
        }
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if length != frame.len() - LENGTH_PREFIX_SIZE {
            return None;
        }
        Self::decode_body(&frame[LENGTH_PREFIX_SIZE..])
    }
}

impl Block for HsmsBlock {
    type Header = HsmsHeader;

    fn header(&self) -> &HsmsHeader {
        &self.header
    }

    fn data(&self) -> &Bytes {
        &self.data
    }

    fn is_last(&self) -> bool {
        true
    }

    fn encode(&self) -> Bytes {
        let length = (HEADER_SIZE + self.data.len()) as u32;
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + length as usize);
        buf.put_u32(length);
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = HsmsHeader::data(0x0102, 0x03, 0x04, true, 0x05060708);
        let bytes = header.encode();

        assert_eq!(bytes, [0x01, 0x02, 0x83, 0x04, 0x00, 0x00, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn test_control_headers_roundtrip() {
        let headers = [
            HsmsHeader::select_req(1),
            HsmsHeader::select_rsp(1, select_status::ALREADY_ACTIVE),
            HsmsHeader::deselect_req(2),
            HsmsHeader::deselect_rsp(2, deselect_status::SUCCESS),
            HsmsHeader::linktest_req(3),
            HsmsHeader::linktest_rsp(3),
            HsmsHeader::separate_req(4),
            HsmsHeader::reject_req(
                &HsmsHeader::data(7, 1, 1, true, 5),
                reject_reason::ENTITY_NOT_SELECTED,
            ),
        ];

        for header in headers {
            assert_eq!(HsmsHeader::decode(&header.encode()), Some(header));
            assert!(header.is_control());
        }
    }

    #[test]
    fn test_select_req_layout() {
        let bytes = HsmsHeader::select_req(0xDEADBEEF).encode();
        assert_eq!(bytes, [0xFF, 0xFF, 0, 0, 0, 1, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_reject_carries_rejected_fields() {
        let rejected = HsmsHeader::data(7, 1, 1, true, 99);
        let reject = HsmsHeader::reject_req(&rejected, reject_reason::ENTITY_NOT_SELECTED);

        assert_eq!(reject.session_id, 7);
        assert_eq!(reject.system, 99);
        assert_eq!(reject.stream, SType::Data as u8);
        assert_eq!(reject.reject_reason(), 4);
        assert_eq!(reject.kind(), Some(SType::RejectReq));
    }

    #[test]
    fn test_reject_ptype_is_lossless() {
        let rejected = HsmsHeader {
            p_type: 0xF0,
            ..HsmsHeader::select_req(3)
        };
        let reject = HsmsHeader::reject_req(&rejected, reject_reason::PTYPE_NOT_SUPPORTED);
        assert_eq!(reject.encode()[2], 0xF0);
    }

    #[test]
    fn test_unknown_stype_still_decodes() {
        let mut bytes = HsmsHeader::linktest_req(1).encode();
        bytes[5] = 8;
        let header = HsmsHeader::decode(&bytes).unwrap();
        assert_eq!(header.s_type, 8);
        assert_eq!(header.kind(), None);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(HsmsHeader::decode(&[0u8; 9]).is_none());
    }

    #[test]
    fn test_block_roundtrip_payload_sizes() {
        for size in [0usize, 1, 1000] {
            let data = Bytes::from(vec![0x5A; size]);
            let block = HsmsBlock::new(HsmsHeader::data(1, 6, 11, false, 12), data);
            let encoded = block.encode();

            assert_eq!(encoded.len(), LENGTH_PREFIX_SIZE + HEADER_SIZE + size);
            assert_eq!(HsmsBlock::decode(&encoded), Some(block));
        }
    }

    #[test]
    fn test_block_decode_rejects_bad_length() {
        let block = HsmsBlock::new(HsmsHeader::data(1, 1, 1, true, 1), Bytes::from_static(b"ab"));
        let mut encoded = block.encode().to_vec();
        encoded[3] += 1;
        assert!(HsmsBlock::decode(&encoded).is_none());
        assert!(HsmsBlock::decode(&encoded[..8]).is_none());
    }
}
