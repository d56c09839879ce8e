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

//! Payload transfer with interleaved status bytes.
//!
//! A status byte follows every payload byte after which the remaining count
//! is a multiple of 256, so the last byte always gets one and no more than
//! 256 payload bytes ever go by without a checkpoint.

use crate::error::LinkError;
use crate::frame::Kind;
use crate::protocol::*;

// ============================================================================
// Payload Transfer State
// ============================================================================

/// Negated remaining byte count. Counts up towards zero; the low 8 bits
/// hitting zero marks a checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct PayloadTransfer {
    neg_remaining: u32,
}

impl PayloadTransfer {
    pub fn new(len: u32) -> Self {
        PayloadTransfer { neg_remaining: len.wrapping_neg() }
    }

    /// Account for one payload byte. Returns true if a status byte follows it.
    pub fn advance(&mut self) -> bool {
        self.neg_remaining = self.neg_remaining.wrapping_add(1);
        self.neg_remaining & 0xFF == 0
    }

    pub fn is_complete(&self) -> bool {
        self.neg_remaining == 0
    }

    #[cfg(test)]
    pub fn remaining(&self) -> u32 {
        self.neg_remaining.wrapping_neg()
    }
}

/// Number of status bytes a general-form payload of `len` bytes carries.
#[cfg(test)]
pub fn status_byte_count(len: u32) -> u32 {
    len.div_ceil(256)
}

// ============================================================================
// Byte Source / Sink
// ============================================================================

/// Where payload bytes go. The link implements this for the wire.
pub trait ByteSink {
    fn put(&mut self, byte: u8) -> Result<(), LinkError>;

    /// Emit the status byte for a checkpoint. A sender that has been asked
    /// to cancel replaces it with a cancel status and fails.
    fn put_status(&mut self, status: u8) -> Result<(), LinkError> {
        self.put(status)
    }
}

/// Where payload bytes come from.
pub trait ByteSource {
    fn take(&mut self) -> Result<u8, LinkError>;
}

impl ByteSink for Vec<u8> {
    fn put(&mut self, byte: u8) -> Result<(), LinkError> {
        self.push(byte);
        Ok(())
    }
}

/// Reads a byte slice; running off the end looks like the line going quiet.
#[cfg(test)]
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

#[cfg(test)]
impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceSource { bytes, pos: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
impl ByteSource for SliceSource<'_> {
    fn take(&mut self) -> Result<u8, LinkError> {
        let byte = *self.bytes.get(self.pos).ok_or(LinkError::LinkTimeout)?;
        self.pos += 1;
        Ok(byte)
    }
}

// ============================================================================
// Interleaver
// ============================================================================

/// Send `payload` with status bytes. Every checkpoint carries
/// STATUS_CONTINUE except the last, which carries `final_status`.
pub fn send_payload<K: ByteSink + ?Sized>(
    sink: &mut K,
    payload: &[u8],
    final_status: u8,
) -> Result<(), LinkError> {
    let len = payload.len() as u32;
    let mut transfer = PayloadTransfer::new(len);
    let mut dump = PayloadDump::new("send", len);

    for (i, &byte) in payload.iter().enumerate() {
        dump.byte(i as u32, byte);
        sink.put(byte)?;
        if transfer.advance() {
            let status = if transfer.is_complete() { final_status } else { STATUS_CONTINUE };
            sink.put_status(status)?;
        }
    }

    Ok(())
}

/// Receive `len` payload bytes sent by the `direction` side, validating each
/// status byte. Returns the payload and the final status byte (None for an
/// empty payload).
///
/// A cancel status in a request fails with `SyncRequested`, which the server
/// treats as a recovery trigger.
pub fn recv_payload<S: ByteSource + ?Sized>(
    source: &mut S,
    len: u32,
    direction: Kind,
) -> Result<(Vec<u8>, Option<u8>), LinkError> {
    // Don't trust the length field with a huge allocation up front
    let mut payload = Vec::with_capacity(len.min(64 * 1024) as usize);
    let mut transfer = PayloadTransfer::new(len);
    let mut dump = PayloadDump::new("recv", len);
    let mut final_status = None;

    for i in 0..len {
        let byte = source.take()?;
        dump.byte(i, byte);
        payload.push(byte);

        if transfer.advance() {
            let status = source.take()?;
            check_status(direction, status, transfer.is_complete())?;
            final_status = Some(status);
        }
    }

    Ok((payload, final_status))
}

fn check_status(direction: Kind, status: u8, is_final: bool) -> Result<(), LinkError> {
    match (direction, status) {
        (_, STATUS_CONTINUE) => Ok(()),
        (Kind::Request, STATUS_CANCEL | STATUS_CANCEL_ALT) => Err(LinkError::SyncRequested(status)),
        (Kind::Response, STATUS_SPECULATIVE) if is_final => Ok(()),
        (Kind::Request, got) => Err(LinkError::ProtocolError { expected: "request status byte", got }),
        (Kind::Response, got) => Err(LinkError::ProtocolError { expected: "response status byte", got }),
    }
}

// ============================================================================
// Payload dumps
// ============================================================================

/// Trace-level per-byte log of the head and tail of a payload.
struct PayloadDump {
    what: &'static str,
    len: u32,
    enabled: bool,
}

impl PayloadDump {
    fn new(what: &'static str, len: u32) -> Self {
        let enabled = tracing::enabled!(tracing::Level::TRACE);
        if enabled {
            tracing::trace!("-- {} p_size={}", what, len);
        }
        PayloadDump { what, len, enabled }
    }

    fn byte(&mut self, i: u32, byte: u8) {
        if !self.enabled {
            return;
        }

        let half = MAX_NUM_DUMP_BYTES / 2;
        if self.len > MAX_NUM_DUMP_BYTES {
            if i == half {
                tracing::trace!("-- (eliding transfer)");
            }
            if i >= half && i < self.len - half {
                return;
            }
        }

        if byte.is_ascii_graphic() || byte == b' ' {
            tracing::trace!("-- {}/{}; {} {:02X} '{}'", i, self.len, self.what, byte, byte as char);
        } else {
            tracing::trace!("-- {}/{}; {} {:02X}", i, self.len, self.what, byte);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, Message};
    use proptest::prelude::*;

    fn checkpoints(len: u32) -> Vec<u32> {
        let mut transfer = PayloadTransfer::new(len);
        (0..len).filter(|_| transfer.advance()).collect()
    }

    fn longest_zero_run(bytes: &[u8]) -> usize {
        let mut longest = 0;
        let mut run = 0;
        for &byte in bytes {
            run = if byte == 0 { run + 1 } else { 0 };
            longest = longest.max(run);
        }
        longest
    }

    #[test]
    fn test_status_count_is_ceil_len_over_256() {
        for len in [0u32, 1, 2, 4, 255, 256, 257, 511, 512, 513, 65536, 70000] {
            assert_eq!(checkpoints(len).len() as u32, status_byte_count(len), "length {}", len);
            assert_eq!(status_byte_count(len), len.div_ceil(256));
        }
    }

    #[test]
    fn test_status_offsets() {
        // First group is the len % 256 leftover, then whole groups
        assert_eq!(checkpoints(4), vec![3]);
        assert_eq!(checkpoints(256), vec![255]);
        assert_eq!(checkpoints(257), vec![0, 256]);
        assert_eq!(checkpoints(600), vec![87, 343, 599]);
    }

    #[test]
    fn test_remaining_counts_down() {
        let mut transfer = PayloadTransfer::new(3);
        assert_eq!(transfer.remaining(), 3);
        transfer.advance();
        assert_eq!(transfer.remaining(), 2);
        transfer.advance();
        transfer.advance();
        assert!(transfer.is_complete());
    }

    #[test]
    fn test_send_payload_places_status() {
        let mut wire = Vec::new();
        let payload: Vec<u8> = (0..257u32).map(|i| i as u8).collect();
        send_payload(&mut wire, &payload, STATUS_SPECULATIVE).unwrap();

        assert_eq!(wire.len(), 259);
        assert_eq!(wire[1], STATUS_CONTINUE);
        assert_eq!(wire[0], 0);
        assert_eq!(wire[2], 1);
        assert_eq!(*wire.last().unwrap(), STATUS_SPECULATIVE);
    }

    #[test]
    fn test_recv_payload_strips_status() {
        let wire = [0x00, 0x01, 0x02, 0x03, STATUS_CONTINUE];
        let mut source = SliceSource::new(&wire);
        let (payload, status) = recv_payload(&mut source, 4, Kind::Response).unwrap();
        assert_eq!(payload, vec![0, 1, 2, 3]);
        assert_eq!(status, Some(STATUS_CONTINUE));
        assert_eq!(source.consumed(), wire.len());
    }

    #[test]
    fn test_recv_empty_payload() {
        let mut source = SliceSource::new(&[]);
        let (payload, status) = recv_payload(&mut source, 0, Kind::Request).unwrap();
        assert!(payload.is_empty());
        assert_eq!(status, None);
    }

    #[test]
    fn test_request_cancel_status_triggers_sync() {
        for cancel in [STATUS_CANCEL, STATUS_CANCEL_ALT] {
            let mut wire = vec![0xAA; 256];
            wire.push(cancel);
            wire.extend_from_slice(&[0xBB; 256]);
            let mut source = SliceSource::new(&wire);
            let err = recv_payload(&mut source, 512, Kind::Request).unwrap_err();
            assert!(matches!(err, LinkError::SyncRequested(b) if b == cancel));
            assert_eq!(source.consumed(), 257);
        }
    }

    #[test]
    fn test_server_cannot_cancel_response() {
        let wire = [0x11, STATUS_CANCEL];
        let err = recv_payload(&mut SliceSource::new(&wire), 1, Kind::Response).unwrap_err();
        assert!(matches!(err, LinkError::ProtocolError { got: 0x00, .. }));
    }

    #[test]
    fn test_speculative_only_on_final_status() {
        let mut wire = vec![0u8; 256];
        wire.push(STATUS_SPECULATIVE);
        wire.extend_from_slice(&[0u8; 256]);
        wire.push(STATUS_CONTINUE);
        let err = recv_payload(&mut SliceSource::new(&wire), 512, Kind::Response).unwrap_err();
        assert!(matches!(err, LinkError::ProtocolError { got: STATUS_SPECULATIVE, .. }));

        let wire = [0x42, STATUS_SPECULATIVE];
        let (_, status) = recv_payload(&mut SliceSource::new(&wire), 1, Kind::Response).unwrap();
        assert_eq!(status, Some(STATUS_SPECULATIVE));
    }

    #[test]
    fn test_truncated_payload_times_out() {
        let wire = [0x01, 0x02];
        let err = recv_payload(&mut SliceSource::new(&wire), 10, Kind::Request).unwrap_err();
        assert!(matches!(err, LinkError::LinkTimeout));
    }

    #[test]
    fn test_worst_case_zero_run_is_258() {
        let message = Message::request(0x05, vec![0u8; 255]).unwrap();
        let wire = encode_frame(&message, STATUS_CONTINUE);
        assert_eq!(longest_zero_run(&wire), MAX_LEGIT_ZERO_RUN);
        assert!(MAX_LEGIT_ZERO_RUN < NUM_SYNC_ZEROS);
    }

    #[test]
    fn test_zero_runs_around_group_boundaries() {
        for len in [254usize, 255, 256, 257, 511, 512, 513, 65535, 65536, 65537] {
            let message = Message::response(RESPONSE_DATA, vec![0u8; len]).unwrap();
            let wire = encode_frame(&message, STATUS_CONTINUE);
            assert!(longest_zero_run(&wire) <= MAX_LEGIT_ZERO_RUN, "length {}", len);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn zero_runs_stay_below_sync_threshold(
            message_type in 0x02u8..0x60,
            len in 0usize..2048,
            nonzero in prop::collection::vec((0usize..2048, 1u8..=255), 0..4),
        ) {
            // Mostly zero payloads are the adversarial case
            let mut payload = vec![0u8; len];
            for (at, value) in nonzero {
                if at < len {
                    payload[at] = value;
                }
            }

            // Back-to-back frames, as a client sending requests would
            let request = Message::request(message_type, payload).unwrap();
            let mut wire = encode_frame(&request, STATUS_CONTINUE);
            wire.extend(encode_frame(&request, STATUS_CONTINUE));

            let run = longest_zero_run(&wire);
            prop_assert!(run <= MAX_LEGIT_ZERO_RUN, "run of {} zeros", run);
            prop_assert!(run < NUM_SYNC_ZEROS);
        }

        #[test]
        fn status_bytes_match_checkpoints(len in 0u32..5000) {
            let payload = vec![0x33u8; len as usize];
            let mut wire = Vec::new();
            send_payload(&mut wire, &payload, STATUS_CONTINUE).unwrap();
            prop_assert_eq!(wire.len() as u32, len + status_byte_count(len));

            let (received, _) = recv_payload(&mut SliceSource::new(&wire), len, Kind::Request).unwrap();
            prop_assert_eq!(received, payload);
        }
    }
}
