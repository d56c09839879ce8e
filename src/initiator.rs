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

//! Sync initiator: the side that decided the link needs resynchronizing.
//!
//! Kickoff sends 0x80, then zeros are sent until NUM_SYNC_ZEROS consecutive
//! zeros come back, then the 0x01 that ends the peer's reply is awaited and
//! confirmed with a 0x01 of our own.

use std::marker::PhantomData;
use std::time::Instant;
use crate::config::LinkConfig;
use crate::error::{LinkError, TransportError};
use crate::protocol::*;
use crate::serial::Transport;

/// Most bytes drained from the transport in one step.
const DRAIN_LIMIT: usize = 1024;

// ============================================================================
// States
// ============================================================================

pub struct Kickoff;
pub struct FloodZeros;
pub struct AwaitAck;
pub struct Confirm;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct InitiatorFsm<'a, State> {
    state: PhantomData<State>,
    transport: &'a mut dyn Transport,
    zero_run: usize,
    zeros_sent: usize,
}

pub enum InitiatorStep<'a> {
    Next(Box<dyn InitiatorState<'a> + 'a>),
    Synchronized,
}

// ============================================================================
// Trait
// ============================================================================

pub trait InitiatorState<'a> {
    fn step(self: Box<Self>) -> Result<InitiatorStep<'a>, LinkError>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<'a, S: 'a> InitiatorFsm<'a, S>
where
    InitiatorFsm<'a, S>: InitiatorState<'a>,
{
    fn stay(self) -> Result<InitiatorStep<'a>, LinkError> {
        Ok(InitiatorStep::Next(Box::new(self)))
    }
}

impl<'a, S> InitiatorFsm<'a, S> {
    fn transition<T>(self) -> Box<InitiatorFsm<'a, T>> {
        Box::new(InitiatorFsm {
            state: PhantomData,
            transport: self.transport,
            zero_run: self.zero_run,
            zeros_sent: self.zeros_sent,
        })
    }

    fn state_name() -> &'static str {
        let type_name = std::any::type_name::<S>();
        type_name.rsplit("::").next().unwrap_or(type_name)
    }

    /// Send one byte; a full peer buffer is not an error while syncing.
    fn send_tolerant(&mut self, byte: u8) -> Result<bool, LinkError> {
        match self.transport.try_send(byte) {
            Ok(()) => Ok(true),
            Err(TransportError::Timeout) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn send_zero(&mut self) -> Result<(), LinkError> {
        if self.send_tolerant(SYNC_ZERO)? {
            self.zeros_sent += 1;
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> InitiatorState<'a> for InitiatorFsm<'a, Kickoff> {
    fn step(self: Box<Self>) -> Result<InitiatorStep<'a>, LinkError> {
        let mut fsm = *self;
        if !fsm.send_tolerant(SYNC_KICKOFF)? {
            return fsm.stay();
        }
        tracing::trace!("sync: sent kickoff");
        fsm.zero_run = 0;
        Ok(InitiatorStep::Next(fsm.transition::<FloodZeros>()))
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

impl<'a> InitiatorState<'a> for InitiatorFsm<'a, FloodZeros> {
    fn step(self: Box<Self>) -> Result<InitiatorStep<'a>, LinkError> {
        let mut fsm = *self;

        for _ in 0..DRAIN_LIMIT {
            match fsm.transport.try_recv()? {
                Some(SYNC_ZERO) => {
                    fsm.zero_run += 1;
                    if fsm.zero_run >= NUM_SYNC_ZEROS {
                        tracing::debug!("sync: saw {} zeros after sending {}", fsm.zero_run, fsm.zeros_sent);
                        return Ok(InitiatorStep::Next(fsm.transition::<AwaitAck>()));
                    }
                }
                Some(_) => fsm.zero_run = 0,
                None => break,
            }
        }

        fsm.send_zero()?;
        fsm.stay()
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

impl<'a> InitiatorState<'a> for InitiatorFsm<'a, AwaitAck> {
    fn step(self: Box<Self>) -> Result<InitiatorStep<'a>, LinkError> {
        let mut fsm = *self;

        for _ in 0..DRAIN_LIMIT {
            match fsm.transport.try_recv()? {
                Some(SYNC_ZERO) => {}
                Some(SYNC_ACK) => {
                    tracing::trace!("sync: peer synchronized");
                    return Ok(InitiatorStep::Next(fsm.transition::<Confirm>()));
                }
                Some(other) => return Err(LinkError::SyncFatal(other)),
                None => break,
            }
        }

        fsm.send_zero()?;
        fsm.stay()
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

impl<'a> InitiatorState<'a> for InitiatorFsm<'a, Confirm> {
    fn step(self: Box<Self>) -> Result<InitiatorStep<'a>, LinkError> {
        let mut fsm = *self;
        if !fsm.send_tolerant(SYNC_ACK)? {
            return fsm.stay();
        }
        tracing::trace!("sync: sent confirm");
        Ok(InitiatorStep::Synchronized)
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> InitiatorFsm<'a, Kickoff> {
    pub fn new(transport: &'a mut dyn Transport) -> Box<dyn InitiatorState<'a> + 'a> {
        Box::new(InitiatorFsm {
            state: PhantomData::<Kickoff>,
            transport,
            zero_run: 0,
            zeros_sent: 0,
        })
    }
}

/// Run the initiator until both ends are synchronized. Each attempt is
/// bounded by `sync_timeout`; after `max_sync_attempts` failures the link is
/// reported down. Returns the number of attempts used.
pub fn initiate(transport: &mut dyn Transport, config: &LinkConfig) -> Result<u32, LinkError> {
    for attempt in 1..=config.max_sync_attempts {
        tracing::info!(attempt, "resyncing link");
        match run_attempt(&mut *transport, config) {
            Ok(()) => {
                tracing::info!(attempt, "link synchronized");
                return Ok(attempt);
            }
            Err(e) if e.needs_resync() => {
                tracing::warn!(attempt, "sync attempt failed: {}", e);
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(attempts = config.max_sync_attempts, "giving up on sync, link down");
    Err(LinkError::LinkDown { attempts: config.max_sync_attempts })
}

fn run_attempt(transport: &mut dyn Transport, config: &LinkConfig) -> Result<(), LinkError> {
    let deadline = Instant::now() + config.sync_timeout;
    let mut state = InitiatorFsm::<Kickoff>::new(transport);

    loop {
        if Instant::now() >= deadline {
            tracing::debug!("sync timed out in state {}", state.name());
            return Err(LinkError::LinkTimeout);
        }
        state = match state.step()? {
            InitiatorStep::Next(next) => next,
            InitiatorStep::Synchronized => return Ok(()),
        };
    }
}

// ============================================================================
// Tests
// ============================================================================
