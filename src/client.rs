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

//! Requesting end of the link. The client always initiates recovery.

use crate::config::LinkConfig;
use crate::error::{LinkError, RequestError};
use crate::frame::{Decoded, Header, HeaderDecoder, HeaderPayload, Kind, Message};
use crate::initiator;
use crate::link::{CancelFlag, Link, Role};
use crate::protocol::*;
use crate::serial::Transport;
use crate::status::{recv_payload, send_payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SendingRequest,
    AwaitingResponseHeader,
    ReceivingResponsePayload,
    Syncing,
}

pub struct Client {
    link: Link,
    phase: Phase,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Client { link: Link::new(transport, Role::Client, config), phase: Phase::Idle }
    }

    /// Client whose BREAK flag is `cancel`.
    pub fn with_cancel_flag(transport: Box<dyn Transport>, config: LinkConfig, cancel: CancelFlag) -> Self {
        Client {
            link: Link::with_cancel_flag(transport, Role::Client, config, cancel),
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Raising this flag is the BREAK key: the exchange in progress is
    /// abandoned and the link resynchronized.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.link.cancel_flag()
    }

    pub fn config(&self) -> &LinkConfig {
        self.link.config()
    }

    /// Send `request` and, unless it is fire-and-forget, wait for the
    /// response.
    ///
    /// On a recoverable failure the link is resynchronized before returning.
    /// A failure while the request was still going out is reported as
    /// `Cancelled`; one while receiving the response keeps its own kind. If
    /// recovery fails the result is `LinkDown`.
    pub fn perform_exchange(&mut self, request: &Message) -> Result<Option<Message>, LinkError> {
        let result = self.exchange(request);
        self.finish(result)
    }

    /// Send a presence probe. Nothing comes back.
    pub fn probe_presence(&mut self) -> Result<(), LinkError> {
        self.phase = Phase::SendingRequest;
        let result = self.link.send_unit(&[REQUEST_PRESENCE]);
        self.finish(result)
    }

    /// Run link recovery now. Safe on a link that is already synchronized.
    pub fn resync(&mut self) -> Result<u32, LinkError> {
        self.phase = Phase::Syncing;
        self.link.cancel_flag().clear();
        let config = self.link.config().clone();
        let result = initiator::initiate(self.link.transport(), &config);
        self.phase = Phase::Idle;
        result
    }

    /// Request/response for the layer above: an error response comes back
    /// as `RequestError::Remote`.
    pub fn request(&mut self, message_type: u8, payload: impl Into<Vec<u8>>) -> Result<Message, RequestError> {
        let request = Message::request(message_type, payload)?;
        if request.is_fire_and_forget() {
            return Err(RequestError::NoResponse(message_type));
        }

        let response = self
            .perform_exchange(&request)?
            .ok_or(RequestError::NoResponse(message_type))?;

        if let Some((code, text)) = response.error_parts() {
            return Err(RequestError::Remote { code, text });
        }
        Ok(response)
    }

    /// Send a fire-and-forget request.
    pub fn notify(&mut self, message_type: u8, payload: impl Into<Vec<u8>>) -> Result<(), RequestError> {
        let request = Message::request(message_type, payload)?;
        if !request.is_fire_and_forget() {
            return Err(RequestError::NoResponse(message_type));
        }
        self.perform_exchange(&request)?;
        Ok(())
    }

    /// Ask the server whether its end of the link is ready. Returns the
    /// server's link protocol version.
    pub fn check_ready(&mut self) -> Result<u8, RequestError> {
        let response = self.request(REQUEST_LINK, vec![LINK_READY])?;
        match (response.message_type(), response.payload()) {
            (RESPONSE_YES, &[version]) => Ok(version),
            (got, _) => Err(LinkError::ProtocolError { expected: "link ready response", got }.into()),
        }
    }

    fn finish<T>(&mut self, result: Result<T, LinkError>) -> Result<T, LinkError> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) if err.needs_resync() => err,
            Err(err) => return Err(err),
        };

        tracing::warn!(?phase, "exchange failed: {}", err);
        self.resync()?;

        if phase == Phase::SendingRequest {
            Err(LinkError::Cancelled)
        } else {
            Err(err)
        }
    }

    fn exchange(&mut self, request: &Message) -> Result<Option<Message>, LinkError> {
        self.phase = Phase::SendingRequest;
        self.send_request(request)?;
        if request.is_fire_and_forget() {
            return Ok(None);
        }

        self.phase = Phase::AwaitingResponseHeader;
        let header = self.recv_header()?;

        self.phase = Phase::ReceivingResponsePayload;
        let (payload, final_status) = self.recv_body(&header)?;
        let response = Message::from_parts(Kind::Response, header.message_type, payload);
        tracing::debug!(
            "response 0x{:02X}, {} bytes",
            response.message_type(),
            response.payload().len()
        );

        if final_status == Some(STATUS_SPECULATIVE) {
            self.discard_speculative()?;
        }

        Ok(Some(response))
    }

    fn send_request(&mut self, request: &Message) -> Result<(), LinkError> {
        let header = request.header();
        tracing::debug!(
            "request 0x{:02X}, {} bytes",
            request.message_type(),
            request.payload().len()
        );

        if header.is_compact() {
            return self.link.send_unit(&header.encode());
        }
        self.link.send_bytes(&header.encode())?;
        send_payload(&mut self.link, request.payload(), STATUS_CONTINUE)
    }

    fn recv_header(&mut self) -> Result<Header, LinkError> {
        let mut decoder = HeaderDecoder::new(Kind::Response);

        let first = self.link.recv_byte(self.link.config().response_timeout)?;
        let mut decoded = decoder.push(first)?;
        loop {
            match decoded {
                Decoded::Complete(header) => return Ok(header),
                Decoded::NeedMore => {}
                _ => return Err(LinkError::MalformedHeader("unexpected response header")),
            }

            let byte_timeout = self.link.config().byte_timeout;
            let byte = match self.link.recv_byte(Some(byte_timeout)) {
                Err(LinkError::LinkTimeout) => return Err(LinkError::MalformedHeader("truncated header")),
                other => other?,
            };
            decoded = decoder.push(byte)?;
        }
    }

    fn recv_body(&mut self, header: &Header) -> Result<(Vec<u8>, Option<u8>), LinkError> {
        match header.payload {
            HeaderPayload::Inline(byte) => Ok((vec![byte], None)),
            HeaderPayload::Sized(len) => recv_payload(&mut self.link, len, Kind::Response),
        }
    }

    fn discard_speculative(&mut self) -> Result<(), LinkError> {
        let header = self.recv_header()?;
        if !SPECULATIVE_RESPONSES.contains(&header.message_type) {
            return Err(LinkError::ProtocolError {
                expected: "speculative response type",
                got: header.message_type,
            });
        }

        let (payload, final_status) = self.recv_body(&header)?;
        if let Some(status @ STATUS_SPECULATIVE) = final_status {
            return Err(LinkError::ProtocolError { expected: "final status after speculative response", got: status });
        }
        tracing::debug!(
            "discarded speculative response 0x{:02X}, {} bytes",
            header.message_type,
            payload.len()
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagnosticDispatcher;
    use crate::error::TransportError;
    use crate::frame::encode_frame;
    use crate::responder;
    use crate::serial::{loopback_pair, LoopbackPort, MockTransport};
    use crate::server::{Server, ServerStats};
    use std::thread::JoinHandle;
    use std::time::Duration;

    fn config() -> LinkConfig {
        LinkConfig {
            byte_timeout: Duration::from_millis(200),
            response_timeout: Some(Duration::from_secs(5)),
            sync_timeout: Duration::from_secs(2),
            max_sync_attempts: 3,
            poll_interval: Duration::from_millis(1),
            idle_poll: Duration::from_millis(10),
        }
    }

    fn mock_client(responses: &[u8], expected_writes: Vec<u8>) -> Client {
        let mock = MockTransport::new(MockTransport::bytes(responses), expected_writes);
        Client::new(Box::new(mock), config())
    }

    #[test]
    fn test_compact_request_general_response() {
        let mut client = mock_client(
            &[0x81, 0x04, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x01],
            vec![0x10, 0xAA],
        );

        let request = Message::request(0x10, vec![0xAA]).unwrap();
        let response = client.perform_exchange(&request).unwrap().unwrap();

        assert_eq!(response.kind(), Kind::Response);
        assert_eq!(response.message_type(), 0x01);
        assert_eq!(response.payload(), &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(client.phase(), Phase::Idle);
    }

    #[test]
    fn test_fire_and_forget_skips_response() {
        let mut client = mock_client(&[], vec![0xE0, 0x02, 0x00, 0x00, 0x00, b'h', b'i', STATUS_CONTINUE]);
        client.notify(REQUEST_NOTE, b"hi".to_vec()).unwrap();
    }

    #[test]
    fn test_error_response_becomes_remote_error() {
        let error = encode_frame(&Message::error(214, "File not found"), STATUS_CONTINUE);
        let mut client = mock_client(&error, vec![0x10, 0xAA]);

        match client.request(0x10, vec![0xAA]) {
            Err(RequestError::Remote { code, text }) => {
                assert_eq!(code, 214);
                assert_eq!(text, "File not found");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_speculative_response_is_discarded() {
        let primary = Message::response(RESPONSE_DATA, vec![5, 6]).unwrap();
        let speculative = Message::response(0x70, vec![7, 8, 9]).unwrap();
        let mut responses = encode_frame(&primary, STATUS_SPECULATIVE);
        responses.extend(encode_frame(&speculative, STATUS_CONTINUE));

        let mut client = mock_client(&responses, vec![0x10, 0xAA]);
        let response = client.request(0x10, vec![0xAA]).unwrap();
        assert_eq!(response.payload(), &[5, 6]);
    }

    #[test]
    fn test_check_ready_returns_version() {
        let mut client = mock_client(&[RESPONSE_YES, LINK_PROTOCOL_VERSION], vec![REQUEST_LINK, LINK_READY]);
        assert_eq!(client.check_ready().unwrap(), LINK_PROTOCOL_VERSION);
    }

    #[test]
    fn test_request_rejects_reserved_type() {
        let mut client = mock_client(&[], vec![]);
        assert!(matches!(client.request(0x75, vec![]), Err(RequestError::Frame(_))));
    }

    #[test]
    fn test_truncated_response_length_is_malformed() {
        let (client_port, mut peer) = loopback_pair(4096, Duration::from_millis(200));

        let server = std::thread::spawn(move || {
            let mut request = Vec::new();
            while request.len() < 2 {
                if let Some(byte) = peer.recv_timeout(Duration::from_secs(2)).unwrap() {
                    request.push(byte);
                }
            }
            // Length field cut off after its first byte
            peer.send_all(&[0x81, 0x04]).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            responder::respond(&mut peer, &config(), &CancelFlag::new()).map(|_| request)
        });

        let mut client = Client::new(Box::new(client_port), config());
        let request = Message::request(0x10, vec![0xAA]).unwrap();
        let err = client.perform_exchange(&request).unwrap_err();
        assert!(matches!(err, LinkError::MalformedHeader(_)));
        assert_eq!(client.phase(), Phase::Idle);

        assert_eq!(server.join().unwrap().unwrap(), vec![0x10, 0xAA]);
    }

    #[test]
    fn test_link_down_without_peer() {
        let (port, _peer) = loopback_pair(4096, Duration::from_millis(1));
        let config = LinkConfig {
            byte_timeout: Duration::from_millis(10),
            response_timeout: Some(Duration::from_millis(20)),
            sync_timeout: Duration::from_millis(30),
            max_sync_attempts: 2,
            ..config()
        };
        let mut client = Client::new(Box::new(port), config);

        let request = Message::request(REQUEST_ECHO_DATA, vec![1, 2, 3]).unwrap();
        let err = client.perform_exchange(&request).unwrap_err();
        assert!(matches!(err, LinkError::LinkDown { attempts: 2 }));
        assert_eq!(client.phase(), Phase::Idle);
    }

    // ------------------------------------------------------------------------
    // Against a real server over a loopback
    // ------------------------------------------------------------------------

    /// Raises the cancel flag once `count` bytes have gone out, as if BREAK
    /// had been pressed at that point.
    struct BreakAfter {
        inner: LoopbackPort,
        count: Option<usize>,
        cancel: CancelFlag,
    }

    impl Transport for BreakAfter {
        fn try_send(&mut self, byte: u8) -> Result<(), TransportError> {
            self.inner.try_send(byte)?;
            if let Some(count) = self.count.as_mut() {
                *count -= 1;
                if *count == 0 {
                    self.count = None;
                    self.cancel.raise();
                }
            }
            Ok(())
        }

        fn try_recv(&mut self) -> Result<Option<u8>, TransportError> {
            self.inner.try_recv()
        }

        fn flush_buffers(&mut self) {
            self.inner.flush_buffers();
        }

        fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
            self.inner.recv_timeout(timeout)
        }
    }

    fn spawn_server(port: LoopbackPort) -> (CancelFlag, JoinHandle<Result<ServerStats, LinkError>>) {
        let shutdown = CancelFlag::new();
        let mut server = Server::new(Box::new(port), config(), DiagnosticDispatcher::default());
        let flag = shutdown.clone();
        let handle = std::thread::spawn(move || server.serve(flag));
        (shutdown, handle)
    }

    fn echo(client: &mut Client, len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        let response = client.request(REQUEST_ECHO_DATA, payload.clone()).unwrap();
        assert_eq!(response.message_type(), RESPONSE_DATA);
        assert_eq!(response.payload(), payload.as_slice());
    }

    #[test]
    fn test_echo_against_server() {
        let (client_port, server_port) = loopback_pair(4096, Duration::from_millis(200));
        let (shutdown, server) = spawn_server(server_port);

        let mut client = Client::new(Box::new(client_port), config());
        client.probe_presence().unwrap();
        assert_eq!(client.check_ready().unwrap(), LINK_PROTOCOL_VERSION);
        for len in [0, 1, 2, 255, 256, 1000] {
            echo(&mut client, len);
        }
        client.notify(REQUEST_NOTE, b"done".to_vec()).unwrap();
        echo(&mut client, 3);

        shutdown.raise();
        let stats = server.join().unwrap().unwrap();
        assert_eq!(stats.probes, 1);
        assert_eq!(stats.fire_and_forget, 1);
        assert_eq!(stats.resyncs, 0);
    }

    #[test]
    fn test_break_at_checkpoint_then_next_exchange_succeeds() {
        let (client_port, server_port) = loopback_pair(4096, Duration::from_millis(200));
        let (shutdown, server) = spawn_server(server_port);

        // 5 header bytes then 88 payload bytes reaches the first checkpoint
        // of a 600 byte payload
        let cancel = CancelFlag::new();
        let transport = BreakAfter { inner: client_port, count: Some(5 + 88), cancel: cancel.clone() };
        let mut client = Client::with_cancel_flag(Box::new(transport), config(), cancel);

        let request = Message::request(REQUEST_ECHO_DATA, vec![0x55; 600]).unwrap();
        let err = client.perform_exchange(&request).unwrap_err();
        assert!(matches!(err, LinkError::Cancelled));
        assert!(!client.cancel_flag().is_raised());

        echo(&mut client, 600);

        shutdown.raise();
        let stats = server.join().unwrap().unwrap();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.resyncs, 1);
    }

    #[test]
    fn test_break_mid_payload_then_next_exchange_succeeds() {
        let (client_port, server_port) = loopback_pair(4096, Duration::from_millis(200));
        let (shutdown, server) = spawn_server(server_port);

        let cancel = CancelFlag::new();
        let transport = BreakAfter { inner: client_port, count: Some(40), cancel: cancel.clone() };
        let mut client = Client::with_cancel_flag(Box::new(transport), config(), cancel);

        let request = Message::request(REQUEST_ECHO_DATA, vec![0x55; 600]).unwrap();
        assert!(matches!(client.perform_exchange(&request), Err(LinkError::Cancelled)));
        echo(&mut client, 100);

        shutdown.raise();
        let stats = server.join().unwrap().unwrap();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.resyncs, 1);
    }

    #[test]
    fn test_resync_is_idempotent() {
        let (client_port, server_port) = loopback_pair(4096, Duration::from_millis(200));
        let (shutdown, server) = spawn_server(server_port);

        let mut client = Client::new(Box::new(client_port), config());
        assert_eq!(client.resync().unwrap(), 1);
        assert_eq!(client.resync().unwrap(), 1);
        echo(&mut client, 300);

        shutdown.raise();
        let stats = server.join().unwrap().unwrap();
        assert_eq!(stats.resyncs, 2);
        assert_eq!(stats.requests, 1);
    }
}
