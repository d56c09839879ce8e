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

//! BeebLink serial link protocol constants

use std::ops::RangeInclusive;

// ============================================================================
// Header
// ============================================================================

/// Bit 7 of the header type byte: payload length follows as 4 bytes LE
pub const VARIABLE_LENGTH: u8 = 0x80;

/// Bits 6-0 of the header type byte
pub const TYPE_MASK: u8 = 0x7F;

// ============================================================================
// Request types
// ============================================================================

/// Never a real request - raw 0x00 or 0x80 in a header means "sync now"
pub const REQUEST_SYNC: u8 = 0x00;

/// Link-control request, answered by the link endpoint itself
pub const REQUEST_LINK: u8 = 0x01;

/// Diagnostic: respond with RESPONSE_DATA carrying the request payload
pub const REQUEST_ECHO_DATA: u8 = 0x04;

/// Diagnostic fire-and-forget: payload is logged by the server
pub const REQUEST_NOTE: u8 = 0x60;

/// Presence probe. One byte, no payload, no response, ignored at any time
pub const REQUEST_PRESENCE: u8 = 0x7F;

/// Requests in this range never get a response
pub const FIRE_AND_FORGET: RangeInclusive<u8> = 0x60..=0x6F;

/// Reserved request types
pub const RESERVED_REQUESTS: RangeInclusive<u8> = 0x70..=0x7E;

// ============================================================================
// Link-control request payloads
// ============================================================================

/// Is the link endpoint ready? Answered with RESPONSE_YES + protocol version
pub const LINK_READY: u8 = 0x00;

/// Ask the link endpoint to produce an error response
pub const LINK_ERROR: u8 = 0x01;

/// Reported in the RESPONSE_YES answer to LINK_READY
pub const LINK_PROTOCOL_VERSION: u8 = 0x01;

// ============================================================================
// Response types
// ============================================================================

pub const RESPONSE_NO: u8 = 0x01;

pub const RESPONSE_YES: u8 = 0x02;

pub const RESPONSE_DATA: u8 = 0x03;

/// Payload is [0x00][code][text...][0x00]
pub const RESPONSE_ERROR: u8 = 0x04;

/// Speculative responses; the client may drop these unseen
pub const SPECULATIVE_RESPONSES: RangeInclusive<u8> = 0x70..=0x7F;

/// Error code used for errors raised by the link endpoint
pub const LINK_ERROR_CODE: u8 = 255;

// ============================================================================
// Status bytes
// ============================================================================

/// Continue - not cancelled
pub const STATUS_CONTINUE: u8 = 0x01;

/// Request cancelled (client to server only)
pub const STATUS_CANCEL: u8 = 0x00;

/// Request cancelled, alternate value (client to server only)
pub const STATUS_CANCEL_ALT: u8 = 0x80;

/// Final response status: a speculative response follows
pub const STATUS_SPECULATIVE: u8 = 0x02;

// ============================================================================
// Sync
// ============================================================================

/// Initiator's first byte, gets a peer stuck in a send out of it
pub const SYNC_KICKOFF: u8 = 0x80;

pub const SYNC_ZERO: u8 = 0x00;

/// Ends a reply burst (responder) or confirms sync (initiator)
pub const SYNC_ACK: u8 = 0x01;

/// Consecutive zero bytes that mean "sync". Must exceed MAX_LEGIT_ZERO_RUN
pub const NUM_SYNC_ZEROS: usize = 300;

/// Longest zero run any legitimate frame can put on the wire: length field
/// high bytes of a 255-byte frame plus its all-zero payload
pub const MAX_LEGIT_ZERO_RUN: usize = 258;

const _: () = assert!(NUM_SYNC_ZEROS > MAX_LEGIT_ZERO_RUN);

// ============================================================================
// Logging
// ============================================================================

/// Payloads longer than this only have their head and tail dumped
pub const MAX_NUM_DUMP_BYTES: u32 = 50;

pub fn is_fire_and_forget(request_type: u8) -> bool {
    FIRE_AND_FORGET.contains(&request_type)
}

pub fn is_sync_trigger(byte: u8) -> bool {
    byte & TYPE_MASK == REQUEST_SYNC
}

pub fn is_presence_probe(byte: u8) -> bool {
    byte & TYPE_MASK == REQUEST_PRESENCE
}
