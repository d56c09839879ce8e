// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Messages and the frame header codec.
//!
//! A frame starts with a type byte. Bit 7 set means a 4-byte little-endian
//! payload length follows, then the payload with interleaved status bytes
//! (see [`crate::status`]). Bit 7 clear means exactly one payload byte
//! follows and there is no status byte.

use crate::error::{FrameError, LinkError};
use crate::protocol::*;
use crate::status::PayloadTransfer;

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
}

/// One complete protocol message. Never exposed half-received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: Kind,
    message_type: u8,
    payload: Vec<u8>,
}

impl Message {
    pub fn request(message_type: u8, payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        if message_type > TYPE_MASK {
            return Err(FrameError::InvalidType(message_type));
        }
        if message_type == REQUEST_SYNC
            || message_type == REQUEST_PRESENCE
            || RESERVED_REQUESTS.contains(&message_type)
        {
            return Err(FrameError::ReservedType(message_type));
        }
        Self::checked(Kind::Request, message_type, payload.into())
    }

    pub fn response(message_type: u8, payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        if message_type > TYPE_MASK {
            return Err(FrameError::InvalidType(message_type));
        }
        if message_type == 0 {
            return Err(FrameError::ReservedType(message_type));
        }
        Self::checked(Kind::Response, message_type, payload.into())
    }

    /// Error response: `[0x00][code][text...][0x00]`.
    pub fn error(code: u8, text: &str) -> Self {
        let mut payload = Vec::with_capacity(text.len() + 3);
        payload.push(0);
        payload.push(code);
        payload.extend(text.bytes().filter(|&b| b != 0));
        payload.push(0);
        Self::from_parts(Kind::Response, RESPONSE_ERROR, payload)
    }

    fn checked(kind: Kind, message_type: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if u32::try_from(payload.len()).is_err() {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self::from_parts(kind, message_type, payload))
    }

    /// Build a message from parts already known to be good, e.g. decoded
    /// off the wire.
    pub(crate) fn from_parts(kind: Kind, message_type: u8, payload: Vec<u8>) -> Self {
        Message { kind, message_type: message_type & TYPE_MASK, payload }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.kind == Kind::Request && is_fire_and_forget(self.message_type)
    }

    pub fn is_error(&self) -> bool {
        self.kind == Kind::Response && self.message_type == RESPONSE_ERROR
    }

    /// Code and text of an error response.
    pub fn error_parts(&self) -> Option<(u8, String)> {
        if !self.is_error() || self.payload.len() < 2 {
            return None;
        }
        let text = &self.payload[2..];
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        Some((self.payload[1], String::from_utf8_lossy(&text[..end]).into_owned()))
    }

    pub fn header(&self) -> Header {
        Header::for_payload(self.message_type, &self.payload)
    }
}

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPayload {
    /// Compact form: the single payload byte rides in the header.
    Inline(u8),
    /// General form: this many payload bytes follow.
    Sized(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: u8,
    pub payload: HeaderPayload,
}

impl Header {
    /// Compact form iff the payload is exactly one byte. An empty payload
    /// uses the general form with a zero length.
    pub fn for_payload(message_type: u8, payload: &[u8]) -> Self {
        let payload = match payload {
            [byte] => HeaderPayload::Inline(*byte),
            _ => HeaderPayload::Sized(payload.len() as u32),
        };
        Header { message_type: message_type & TYPE_MASK, payload }
    }

    pub fn is_compact(&self) -> bool {
        matches!(self.payload, HeaderPayload::Inline(_))
    }

    pub fn payload_len(&self) -> u32 {
        match self.payload {
            HeaderPayload::Inline(_) => 1,
            HeaderPayload::Sized(len) => len,
        }
    }

    /// Header bytes; for the compact form this includes the payload byte.
    pub fn encode(&self) -> Vec<u8> {
        match self.payload {
            HeaderPayload::Inline(byte) => vec![self.message_type, byte],
            HeaderPayload::Sized(len) => {
                let mut bytes = Vec::with_capacity(5);
                bytes.push(VARIABLE_LENGTH | self.message_type);
                bytes.extend_from_slice(&len.to_le_bytes());
                bytes
            }
        }
    }
}

// ============================================================================
// Header Decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    NeedMore,
    Complete(Header),
    /// Request byte 0x00/0x80 where a header was expected.
    SyncTrigger(u8),
    /// Request presence probe. Nothing follows it.
    PresenceProbe,
}

/// Byte-fed header decoder for one direction.
#[derive(Debug)]
pub struct HeaderDecoder {
    kind: Kind,
    type_byte: Option<u8>,
    length: [u8; 4],
    have: usize,
}

impl HeaderDecoder {
    pub fn new(kind: Kind) -> Self {
        HeaderDecoder { kind, type_byte: None, length: [0; 4], have: 0 }
    }

    pub fn push(&mut self, byte: u8) -> Result<Decoded, LinkError> {
        let Some(type_byte) = self.type_byte else {
            return self.push_type(byte);
        };

        let message_type = type_byte & TYPE_MASK;
        if type_byte & VARIABLE_LENGTH == 0 {
            self.reset();
            return Ok(Decoded::Complete(Header {
                message_type,
                payload: HeaderPayload::Inline(byte),
            }));
        }

        self.length[self.have] = byte;
        self.have += 1;
        if self.have < self.length.len() {
            return Ok(Decoded::NeedMore);
        }

        let len = u32::from_le_bytes(self.length);
        self.reset();
        Ok(Decoded::Complete(Header { message_type, payload: HeaderPayload::Sized(len) }))
    }

    fn push_type(&mut self, byte: u8) -> Result<Decoded, LinkError> {
        match self.kind {
            Kind::Request if is_sync_trigger(byte) => return Ok(Decoded::SyncTrigger(byte)),
            Kind::Request if is_presence_probe(byte) => return Ok(Decoded::PresenceProbe),
            Kind::Response if byte & TYPE_MASK == 0 => {
                return Err(LinkError::MalformedHeader("response type 0x00 is reserved"));
            }
            _ => {}
        }
        self.type_byte = Some(byte);
        Ok(Decoded::NeedMore)
    }

    fn reset(&mut self) {
        self.type_byte = None;
        self.have = 0;
    }
}

// ============================================================================
// Whole frames
// ============================================================================

/// Complete wire image of a message: header, then payload with a status
/// byte at every checkpoint. `final_status` goes after the last byte.
pub fn encode_frame(message: &Message, final_status: u8) -> Vec<u8> {
    let header = message.header();
    let mut bytes = header.encode();
    if header.is_compact() {
        return bytes;
    }

    let payload = message.payload();
    bytes.reserve(payload.len() + payload.len() / 256 + 1);
    let mut transfer = PayloadTransfer::new(header.payload_len());
    for &byte in payload {
        bytes.push(byte);
        if transfer.advance() {
            bytes.push(if transfer.is_complete() { final_status } else { STATUS_CONTINUE });
        }
    }
    bytes
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(kind: Kind, bytes: &[u8]) -> Result<Decoded, LinkError> {
        let mut decoder = HeaderDecoder::new(kind);
        let mut last = Decoded::NeedMore;
        for &byte in bytes {
            last = decoder.push(byte)?;
        }
        Ok(last)
    }

    #[test]
    fn test_header_roundtrip_lengths() {
        for len in [0usize, 1, 2, 254, 255, 256, 65536, 16 * 1024 * 1024] {
            let payload = vec![0x5Au8; len];
            let header = Header::for_payload(0x23, &payload);
            assert_eq!(header.is_compact(), len == 1, "length {}", len);

            match decode(Kind::Request, &header.encode()).unwrap() {
                Decoded::Complete(decoded) => {
                    assert_eq!(decoded, header);
                    assert_eq!(decoded.message_type, 0x23);
                    assert_eq!(decoded.payload_len() as usize, len);
                }
                other => panic!("length {}: {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_empty_payload_uses_general_form() {
        let header = Header::for_payload(0x10, &[]);
        assert_eq!(header.encode(), vec![0x90, 0, 0, 0, 0]);
    }

    #[test]
    fn test_compact_form_bytes() {
        let message = Message::request(0x10, vec![0xAA]).unwrap();
        assert_eq!(encode_frame(&message, STATUS_CONTINUE), vec![0x10, 0xAA]);
    }

    #[test]
    fn test_general_form_bytes() {
        let message = Message::response(0x01, vec![0x00, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(
            encode_frame(&message, STATUS_CONTINUE),
            vec![0x81, 0x04, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x01]
        );
    }

    #[test]
    fn test_sync_trigger_short_circuits() {
        assert_eq!(decode(Kind::Request, &[0x00]).unwrap(), Decoded::SyncTrigger(0x00));
        assert_eq!(decode(Kind::Request, &[0x80]).unwrap(), Decoded::SyncTrigger(0x80));
    }

    #[test]
    fn test_presence_probe() {
        assert_eq!(decode(Kind::Request, &[0x7F]).unwrap(), Decoded::PresenceProbe);
        assert_eq!(decode(Kind::Request, &[0xFF]).unwrap(), Decoded::PresenceProbe);

        // Probe leaves the decoder ready for a real header
        let mut decoder = HeaderDecoder::new(Kind::Request);
        assert_eq!(decoder.push(0xFF).unwrap(), Decoded::PresenceProbe);
        assert_eq!(decoder.push(0x10).unwrap(), Decoded::NeedMore);
        assert!(matches!(decoder.push(0xAA).unwrap(), Decoded::Complete(_)));
    }

    #[test]
    fn test_zero_in_length_field_is_data() {
        let decoded = decode(Kind::Request, &[0x85, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(
            decoded,
            Decoded::Complete(Header { message_type: 0x05, payload: HeaderPayload::Sized(0) })
        );
    }

    #[test]
    fn test_response_type_zero_rejected() {
        assert!(matches!(
            decode(Kind::Response, &[0x80]),
            Err(LinkError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_message_type_validation() {
        assert_eq!(Message::request(0x00, vec![]), Err(FrameError::ReservedType(0x00)));
        assert_eq!(Message::request(0x7F, vec![]), Err(FrameError::ReservedType(0x7F)));
        assert_eq!(Message::request(0x70, vec![]), Err(FrameError::ReservedType(0x70)));
        assert_eq!(Message::request(0x80, vec![]), Err(FrameError::InvalidType(0x80)));
        assert!(Message::request(REQUEST_LINK, vec![LINK_READY]).is_ok());
        assert!(Message::request(0x65, vec![]).unwrap().is_fire_and_forget());
        assert_eq!(Message::response(0x00, vec![]), Err(FrameError::ReservedType(0x00)));
    }

    #[test]
    fn test_error_response_layout() {
        let message = Message::error(214, "File not found");
        assert_eq!(message.message_type(), RESPONSE_ERROR);
        assert_eq!(&message.payload()[..2], &[0x00, 214]);
        assert_eq!(*message.payload().last().unwrap(), 0x00);
        assert_eq!(message.error_parts(), Some((214, "File not found".to_string())));
    }
}
