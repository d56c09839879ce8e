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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::protocol::STATUS_CANCEL;
use crate::serial::Transport;
use crate::status::{ByteSink, ByteSource};

// ============================================================================
// Cancel Flag
// ============================================================================

/// Asynchronous cancel request: BREAK on the client, shutdown on the server.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Link
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends requests. Observes the cancel flag between bytes.
    Client,
    /// Sends responses. Any byte arriving mid-transmission aborts it.
    Server,
}

/// Byte-level access to the transport for one session.
pub struct Link {
    transport: Box<dyn Transport>,
    role: Role,
    config: LinkConfig,
    cancel: CancelFlag,
}

impl Link {
    pub fn new(transport: Box<dyn Transport>, role: Role, config: LinkConfig) -> Self {
        Self::with_cancel_flag(transport, role, config, CancelFlag::new())
    }

    /// Use an existing cancel flag, e.g. one shared with a signal handler.
    pub fn with_cancel_flag(transport: Box<dyn Transport>, role: Role, config: LinkConfig, cancel: CancelFlag) -> Self {
        Link { transport, role, config, cancel }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Raw transport, for the sync state machines.
    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    fn check_interrupt(&mut self) -> Result<(), LinkError> {
        match self.role {
            Role::Client => {
                if self.cancel.is_raised() {
                    return Err(LinkError::Cancelled);
                }
            }
            Role::Server => {
                if let Some(byte) = self.transport.try_recv()? {
                    tracing::debug!("received 0x{:02X} while sending", byte);
                    return Err(LinkError::PeerInterrupted);
                }
            }
        }
        Ok(())
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        self.check_interrupt()?;
        self.transport.try_send(byte)?;
        Ok(())
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        for &byte in bytes {
            self.send_byte(byte)?;
        }
        Ok(())
    }

    /// Send bytes that must not be split by a cancel, e.g. a compact frame.
    pub fn send_unit(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.check_interrupt()?;
        self.transport.send_all(bytes)?;
        Ok(())
    }

    /// Wait for one byte. `None` waits until cancelled.
    pub fn recv_byte(&mut self, timeout: Option<Duration>) -> Result<u8, LinkError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll = self.config.poll_interval;

        loop {
            if self.role == Role::Client && self.cancel.is_raised() {
                return Err(LinkError::Cancelled);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LinkError::LinkTimeout);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };

            if let Some(byte) = self.transport.recv_timeout(wait)? {
                return Ok(byte);
            }
        }
    }
}

impl ByteSink for Link {
    fn put(&mut self, byte: u8) -> Result<(), LinkError> {
        self.send_byte(byte)
    }

    fn put_status(&mut self, status: u8) -> Result<(), LinkError> {
        if self.role == Role::Client && self.cancel.is_raised() {
            // Best effort: recovery follows whether or not this gets through
            if let Err(e) = self.transport.try_send(STATUS_CANCEL) {
                tracing::debug!("cancel status not sent: {}", e);
            }
            return Err(LinkError::Cancelled);
        }
        self.send_byte(status)
    }
}

impl ByteSource for Link {
    fn take(&mut self) -> Result<u8, LinkError> {
        let timeout = self.config.byte_timeout;
        self.recv_byte(Some(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockTransport;

    fn config() -> LinkConfig {
        LinkConfig {
            byte_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_client_send_observes_cancel() {
        let mock = MockTransport::new(vec![], vec![0x42]);
        let mut link = Link::new(Box::new(mock), Role::Client, config());
        link.send_byte(0x42).unwrap();

        link.cancel_flag().raise();
        assert!(matches!(link.send_byte(0x43), Err(LinkError::Cancelled)));
        assert!(matches!(link.recv_byte(None), Err(LinkError::Cancelled)));
    }

    #[test]
    fn test_cancel_at_checkpoint_sends_cancel_status() {
        let mock = MockTransport::new(vec![], vec![STATUS_CANCEL]);
        let mut link = Link::new(Box::new(mock), Role::Client, config());
        link.cancel_flag().raise();
        assert!(matches!(link.put_status(0x01), Err(LinkError::Cancelled)));
    }

    #[test]
    fn test_server_send_detects_peer_input() {
        let mock = MockTransport::new(vec![None, Some(0x80)], vec![0x10]);
        let mut link = Link::new(Box::new(mock), Role::Server, config());
        link.send_byte(0x10).unwrap();
        assert!(matches!(link.send_byte(0x11), Err(LinkError::PeerInterrupted)));
    }

    #[test]
    fn test_recv_times_out() {
        let mock = MockTransport::new(vec![None, Some(0x55)], vec![]);
        let mut link = Link::new(Box::new(mock), Role::Server, config());
        assert_eq!(link.recv_byte(Some(Duration::from_millis(50))).unwrap(), 0x55);
        assert!(matches!(link.take(), Err(LinkError::LinkTimeout)));
    }
}
