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

use crate::frame::{Kind, Message};
use crate::protocol::*;
use crate::server::Dispatch;

pub const ERROR_BAD_REQUEST: u8 = 255;

/// Link test service: echoes data back and logs notes.
#[derive(Debug, Default)]
pub struct DiagnosticDispatcher {
    pub echoes: u64,
    pub notes: u64,
}

impl Dispatch for DiagnosticDispatcher {
    fn dispatch(&mut self, request: &Message) -> Message {
        match request.message_type() {
            REQUEST_ECHO_DATA => {
                self.echoes += 1;
                Message::from_parts(Kind::Response, RESPONSE_DATA, request.payload().to_vec())
            }
            other => {
                tracing::warn!("unsupported request 0x{:02X}", other);
                Message::error(ERROR_BAD_REQUEST, "Bad request")
            }
        }
    }

    fn notify(&mut self, request: &Message) {
        if request.message_type() == REQUEST_NOTE {
            self.notes += 1;
            tracing::info!("note: {}", String::from_utf8_lossy(request.payload()));
        } else {
            tracing::debug!("ignoring fire-and-forget request 0x{:02X}", request.message_type());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo() {
        let mut diag = DiagnosticDispatcher::default();
        let request = Message::request(REQUEST_ECHO_DATA, vec![1, 2, 3]).unwrap();
        let response = diag.dispatch(&request);
        assert_eq!(response.kind(), Kind::Response);
        assert_eq!(response.message_type(), RESPONSE_DATA);
        assert_eq!(response.payload(), &[1, 2, 3]);
        assert_eq!(diag.echoes, 1);
    }

    #[test]
    fn test_unknown_request() {
        let mut diag = DiagnosticDispatcher::default();
        let response = diag.dispatch(&Message::request(0x10, vec![]).unwrap());
        assert_eq!(response.error_parts(), Some((ERROR_BAD_REQUEST, "Bad request".to_string())));
    }

    #[test]
    fn test_note() {
        let mut diag = DiagnosticDispatcher::default();
        diag.notify(&Message::request(REQUEST_NOTE, b"hello".to_vec()).unwrap());
        diag.notify(&Message::request(0x61, vec![]).unwrap());
        assert_eq!(diag.notes, 1);
    }
}
