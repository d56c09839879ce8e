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

//! Serving end of the link. Waits for requests, hands them to a
//! [`Dispatch`] implementation and sends back what it returns. The server
//! is always the recovery responder.

use std::sync::{Arc, Mutex};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::frame::{Decoded, Header, HeaderDecoder, HeaderPayload, Kind, Message};
use crate::link::{CancelFlag, Link, Role};
use crate::protocol::*;
use crate::responder;
use crate::serial::Transport;
use crate::status::{recv_payload, send_payload};

// ============================================================================
// Dispatch
// ============================================================================

/// The layer above the link: turns requests into responses.
pub trait Dispatch: Send {
    /// Answer a request that expects a response.
    fn dispatch(&mut self, request: &Message) -> Message;

    /// Handle a fire-and-forget request.
    fn notify(&mut self, request: &Message) {
        tracing::debug!("ignoring fire-and-forget request 0x{:02X}", request.message_type());
    }

    /// Optional follow-on response (type 0x70..=0x7F) to send straight after
    /// `response`. Only used when `response` ends with a status byte.
    fn speculative(&mut self, _request: &Message, _response: &Message) -> Option<Message> {
        None
    }
}

impl<D: Dispatch> Dispatch for Arc<Mutex<D>> {
    fn dispatch(&mut self, request: &Message) -> Message {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).dispatch(request)
    }

    fn notify(&mut self, request: &Message) {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).notify(request)
    }

    fn speculative(&mut self, request: &Message, response: &Message) -> Option<Message> {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .speculative(request, response)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCause {
    /// Sync trigger header byte or cancel status byte.
    Requested(u8),
    /// The client sent something while a response was going out.
    PeerInterrupted,
    Timeout,
    Anomaly,
}

impl From<&LinkError> for SyncCause {
    fn from(err: &LinkError) -> Self {
        match err {
            LinkError::SyncRequested(byte) => SyncCause::Requested(*byte),
            LinkError::PeerInterrupted => SyncCause::PeerInterrupted,
            LinkError::LinkTimeout => SyncCause::Timeout,
            _ => SyncCause::Anomaly,
        }
    }
}

/// What one call to [`Server::serve_one`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Idle,
    Presence,
    FireAndForget(u8),
    Exchange { request: u8, response: u8 },
    Resynced(SyncCause),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub requests: u64,
    pub fire_and_forget: u64,
    pub probes: u64,
    pub resyncs: u64,
    /// Recoveries that gave up. The server keeps listening afterwards.
    pub links_down: u64,
}

enum Incoming {
    Idle,
    Presence,
    Header(Header),
}

// ============================================================================
// Server
// ============================================================================

pub struct Server<D> {
    link: Link,
    dispatcher: D,
    stats: ServerStats,
    shutdown: CancelFlag,
}

impl<D: Dispatch> Server<D> {
    pub fn new(transport: Box<dyn Transport>, config: LinkConfig, dispatcher: D) -> Self {
        Server {
            link: Link::new(transport, Role::Server, config),
            dispatcher,
            stats: ServerStats::default(),
            shutdown: CancelFlag::new(),
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Serve until `shutdown` is raised. A client that stops answering
    /// during recovery leaves the link down until it syncs again; only a
    /// transport that has gone away ends serving early.
    pub fn serve(&mut self, shutdown: CancelFlag) -> Result<ServerStats, LinkError> {
        self.shutdown = shutdown;
        tracing::info!("serving");

        while !self.shutdown.is_raised() {
            match self.serve_one() {
                Ok(Served::Idle) => {}
                Ok(served) => tracing::trace!(?served, "served"),
                Err(LinkError::Cancelled) if self.shutdown.is_raised() => break,
                Err(LinkError::LinkDown { attempts }) => {
                    tracing::warn!(attempts, "link down, waiting for the client to resync");
                    self.stats.links_down += 1;
                }
                Err(e) => {
                    tracing::warn!(stats = ?self.stats, "server failed: {}", e);
                    return Err(e);
                }
            }
        }

        tracing::info!(stats = ?self.stats, "server stopped");
        Ok(self.stats)
    }

    /// Wait up to the idle poll time for a request and deal with it,
    /// recovering the link if anything goes wrong.
    pub fn serve_one(&mut self) -> Result<Served, LinkError> {
        match self.handle_request() {
            Ok(served) => Ok(served),
            Err(e) if e.needs_resync() => {
                let cause = SyncCause::from(&e);
                tracing::info!(?cause, "link recovery: {}", e);
                self.stats.resyncs += 1;

                let config = self.link.config().clone();
                let abort = self.shutdown.clone();
                responder::respond(self.link.transport(), &config, &abort)?;
                Ok(Served::Resynced(cause))
            }
            Err(e) => Err(e),
        }
    }

    fn handle_request(&mut self) -> Result<Served, LinkError> {
        let header = match self.recv_header()? {
            Incoming::Idle => return Ok(Served::Idle),
            Incoming::Presence => {
                tracing::trace!("presence probe");
                self.stats.probes += 1;
                return Ok(Served::Presence);
            }
            Incoming::Header(header) => header,
        };

        let payload = match header.payload {
            HeaderPayload::Inline(byte) => vec![byte],
            HeaderPayload::Sized(len) => recv_payload(&mut self.link, len, Kind::Request)?.0,
        };
        let request = Message::from_parts(Kind::Request, header.message_type, payload);
        tracing::debug!(
            "request 0x{:02X}, {} bytes",
            request.message_type(),
            request.payload().len()
        );

        if request.is_fire_and_forget() {
            self.dispatcher.notify(&request);
            self.stats.fire_and_forget += 1;
            return Ok(Served::FireAndForget(request.message_type()));
        }

        let response = if request.message_type() == REQUEST_LINK {
            link_control(&request)
        } else {
            self.dispatcher.dispatch(&request)
        };
        let speculative = self.speculative_for(&request, &response);

        self.send_response(&response, speculative.is_some())?;
        if let Some(speculative) = speculative {
            self.send_response(&speculative, false)?;
        }

        self.stats.requests += 1;
        Ok(Served::Exchange { request: request.message_type(), response: response.message_type() })
    }

    fn recv_header(&mut self) -> Result<Incoming, LinkError> {
        let mut decoder = HeaderDecoder::new(Kind::Request);

        let idle_poll = self.link.config().idle_poll;
        let first = match self.link.recv_byte(Some(idle_poll)) {
            Err(LinkError::LinkTimeout) => return Ok(Incoming::Idle),
            other => other?,
        };

        let mut decoded = decoder.push(first)?;
        loop {
            match decoded {
                Decoded::Complete(header) => return Ok(Incoming::Header(header)),
                Decoded::PresenceProbe => return Ok(Incoming::Presence),
                Decoded::SyncTrigger(byte) => return Err(LinkError::SyncRequested(byte)),
                Decoded::NeedMore => {}
            }

            let byte_timeout = self.link.config().byte_timeout;
            let byte = match self.link.recv_byte(Some(byte_timeout)) {
                Err(LinkError::LinkTimeout) => return Err(LinkError::MalformedHeader("truncated header")),
                other => other?,
            };
            decoded = decoder.push(byte)?;
        }
    }

    fn speculative_for(&mut self, request: &Message, response: &Message) -> Option<Message> {
        let speculative = self.dispatcher.speculative(request, response)?;

        // Only a general-form response with a payload has a status byte to
        // announce it
        if response.header().is_compact() || response.payload().is_empty() {
            tracing::debug!("dropping speculative response: no status byte to announce it");
            return None;
        }
        if !SPECULATIVE_RESPONSES.contains(&speculative.message_type()) {
            tracing::warn!(
                "dropping speculative response with type 0x{:02X}",
                speculative.message_type()
            );
            return None;
        }
        Some(speculative)
    }

    fn send_response(&mut self, response: &Message, speculative_follows: bool) -> Result<(), LinkError> {
        let header = response.header();
        tracing::debug!(
            "response 0x{:02X}, {} bytes",
            response.message_type(),
            response.payload().len()
        );

        if header.is_compact() {
            return self.link.send_unit(&header.encode());
        }

        let final_status = if speculative_follows { STATUS_SPECULATIVE } else { STATUS_CONTINUE };
        self.link.send_bytes(&header.encode())?;
        send_payload(&mut self.link, response.payload(), final_status)
    }
}

/// Serve each named transport on its own thread, all sharing `dispatcher`,
/// until `shutdown` is raised. The links are independent: one failing does
/// not stop the others. Returns each link's outcome in the order given.
pub fn serve_ports<D>(
    links: Vec<(String, Box<dyn Transport>)>,
    config: &LinkConfig,
    dispatcher: D,
    shutdown: &CancelFlag,
) -> Vec<(String, Result<ServerStats, LinkError>)>
where
    D: Dispatch + Clone + 'static,
{
    let handles: Vec<_> = links
        .into_iter()
        .map(|(name, transport)| {
            let mut server = Server::new(transport, config.clone(), dispatcher.clone());
            let shutdown = shutdown.clone();
            (name, std::thread::spawn(move || server.serve(shutdown)))
        })
        .collect();

    handles
        .into_iter()
        .filter_map(|(name, handle)| match handle.join() {
            Ok(result) => Some((name, result)),
            Err(_) => {
                tracing::error!(port = %name, "server thread panicked");
                None
            }
        })
        .collect()
}

/// Answer a link-control request on behalf of the link itself.
fn link_control(request: &Message) -> Message {
    match request.payload() {
        [LINK_READY] => Message::from_parts(Kind::Response, RESPONSE_YES, vec![LINK_PROTOCOL_VERSION]),
        [LINK_ERROR] => Message::error(LINK_ERROR_CODE, "As requested"),
        [other] => {
            tracing::warn!("bad link request 0x{:02X}", other);
            Message::error(LINK_ERROR_CODE, "Bad link request payload")
        }
        _ => Message::error(LINK_ERROR_CODE, "Bad link request payload size"),
    }
}

// ============================================================================
// Tests
// ============================================================================
