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

use thiserror::Error;

// ============================================================================
// Transport Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer did not take the byte within the handshake window.
    #[error("transport timeout")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl TransportError {
    /// Whether a resync can bring the link back, as opposed to the device
    /// having gone away.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            TransportError::Serial(_) => false,
        }
    }
}

// ============================================================================
// Link Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link timeout")]
    LinkTimeout,
    #[error("cancelled")]
    Cancelled,
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),
    #[error("protocol error: expected {expected}, got 0x{got:02X}")]
    ProtocolError { expected: &'static str, got: u8 },
    /// The peer sent something while we were transmitting.
    #[error("peer interrupted transmission")]
    PeerInterrupted,
    /// A sync trigger (0x00/0x80 header byte or cancel status) arrived.
    #[error("peer requested sync (0x{0:02X})")]
    SyncRequested(u8),
    #[error("sync failed: unexpected byte 0x{0:02X}")]
    SyncFatal(u8),
    #[error("link down after {attempts} sync attempts")]
    LinkDown { attempts: u32 },
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => LinkError::LinkTimeout,
            e => LinkError::Transport(e),
        }
    }
}

impl LinkError {
    /// Whether the session has to run recovery before the link can be used
    /// again.
    pub fn needs_resync(&self) -> bool {
        match self {
            LinkError::LinkTimeout
            | LinkError::Cancelled
            | LinkError::MalformedHeader(_)
            | LinkError::ProtocolError { .. }
            | LinkError::PeerInterrupted
            | LinkError::SyncRequested(_)
            | LinkError::SyncFatal(_) => true,
            LinkError::Transport(e) => e.is_recoverable(),
            LinkError::LinkDown { .. } => false,
        }
    }
}

// ============================================================================
// Frame Errors
// ============================================================================

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid message type 0x{0:02X}")]
    InvalidType(u8),
    #[error("reserved message type 0x{0:02X}")]
    ReservedType(u8),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

// ============================================================================
// Request Errors
// ============================================================================

/// Result of a filesystem-level request: either the link failed, or the
/// server answered with an error response.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("remote error {code}: {text}")]
    Remote { code: u8, text: String },
    #[error("no response to request 0x{0:02X}")]
    NoResponse(u8),
}
