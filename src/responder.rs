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

//! Sync responder: the server's side of link recovery.
//!
//! Stale buffers are flushed, then NUM_SYNC_ZEROS consecutive zeros are
//! counted before the same number of zeros and a 0x01 go back. The
//! initiator's own 0x01 finishes it. A byte other than 0x00/0x01 while
//! waiting for that means the initiator has not synchronized yet, and the
//! whole thing starts again.

use std::marker::PhantomData;
use std::time::{Duration, Instant};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::link::CancelFlag;
use crate::protocol::*;
use crate::serial::Transport;

const DRAIN_LIMIT: usize = 1024;

// ============================================================================
// States
// ============================================================================

pub struct Flush;
pub struct CountZeros;
pub struct Reply;
pub struct AwaitConfirm;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ResponderFsm<'a, State> {
    state: PhantomData<State>,
    transport: &'a mut dyn Transport,
    poll: Duration,
    zero_run: usize,
}

pub enum ResponderStep<'a> {
    Next(Box<dyn ResponderState<'a> + 'a>),
    Synchronized,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ResponderState<'a> {
    fn step(self: Box<Self>) -> Result<ResponderStep<'a>, LinkError>;

    fn name(&self) -> &'static str;

    /// Still waiting for the initiator to show up. Not subject to the sync
    /// timeout.
    fn waiting_for_peer(&self) -> bool {
        false
    }
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<'a, S: 'a> ResponderFsm<'a, S>
where
    ResponderFsm<'a, S>: ResponderState<'a>,
{
    fn stay(self) -> Result<ResponderStep<'a>, LinkError> {
        Ok(ResponderStep::Next(Box::new(self)))
    }
}

impl<'a, S> ResponderFsm<'a, S> {
    fn transition<T>(self) -> Box<ResponderFsm<'a, T>> {
        Box::new(ResponderFsm {
            state: PhantomData,
            transport: self.transport,
            poll: self.poll,
            zero_run: self.zero_run,
        })
    }

    fn state_name() -> &'static str {
        let type_name = std::any::type_name::<S>();
        type_name.rsplit("::").next().unwrap_or(type_name)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> ResponderState<'a> for ResponderFsm<'a, Flush> {
    fn step(self: Box<Self>) -> Result<ResponderStep<'a>, LinkError> {
        let mut fsm = *self;
        fsm.transport.flush_buffers();
        fsm.zero_run = 0;
        Ok(ResponderStep::Next(fsm.transition::<CountZeros>()))
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }

    fn waiting_for_peer(&self) -> bool {
        true
    }
}

impl<'a> ResponderState<'a> for ResponderFsm<'a, CountZeros> {
    fn step(self: Box<Self>) -> Result<ResponderStep<'a>, LinkError> {
        let mut fsm = *self;

        let mut next = fsm.transport.recv_timeout(fsm.poll)?;
        let mut drained = 0;
        while let Some(byte) = next {
            if byte == SYNC_ZERO {
                fsm.zero_run += 1;
                if fsm.zero_run >= NUM_SYNC_ZEROS {
                    tracing::debug!("sync: counted {} zeros", fsm.zero_run);
                    return Ok(ResponderStep::Next(fsm.transition::<Reply>()));
                }
            } else {
                fsm.zero_run = 0;
            }

            drained += 1;
            if drained >= DRAIN_LIMIT {
                break;
            }
            next = fsm.transport.try_recv()?;
        }

        fsm.stay()
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }

    fn waiting_for_peer(&self) -> bool {
        true
    }
}

impl<'a> ResponderState<'a> for ResponderFsm<'a, Reply> {
    fn step(self: Box<Self>) -> Result<ResponderStep<'a>, LinkError> {
        let fsm = *self;

        let mut reply = vec![SYNC_ZERO; NUM_SYNC_ZEROS];
        reply.push(SYNC_ACK);
        fsm.transport.send_all(&reply)?;
        tracing::trace!("sync: sent reply");

        Ok(ResponderStep::Next(fsm.transition::<AwaitConfirm>()))
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

impl<'a> ResponderState<'a> for ResponderFsm<'a, AwaitConfirm> {
    fn step(self: Box<Self>) -> Result<ResponderStep<'a>, LinkError> {
        let fsm = *self;

        let mut next = fsm.transport.recv_timeout(fsm.poll)?;
        let mut drained = 0;
        while let Some(byte) = next {
            match byte {
                SYNC_ZERO => {}
                SYNC_ACK => {
                    tracing::trace!("sync: initiator confirmed");
                    return Ok(ResponderStep::Synchronized);
                }
                other => {
                    tracing::warn!("sync: got 0x{:02X} waiting for confirm, starting over", other);
                    return Ok(ResponderStep::Next(fsm.transition::<Flush>()));
                }
            }

            drained += 1;
            if drained >= DRAIN_LIMIT {
                break;
            }
            next = fsm.transport.try_recv()?;
        }

        fsm.stay()
    }

    fn name(&self) -> &'static str {
        Self::state_name()
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> ResponderFsm<'a, Flush> {
    pub fn new(transport: &'a mut dyn Transport, poll: Duration) -> Box<dyn ResponderState<'a> + 'a> {
        Box::new(ResponderFsm {
            state: PhantomData::<Flush>,
            transport,
            poll,
            zero_run: 0,
        })
    }
}

/// Run the responder until both ends are synchronized.
///
/// Waiting for the initiator's zeros is unbounded (it is the same as waiting
/// for a request) but stops when `abort` is raised. Once the reply has gone
/// out the attempt must finish within `sync_timeout`. Returns the number of
/// attempts used.
pub fn respond(transport: &mut dyn Transport, config: &LinkConfig, abort: &CancelFlag) -> Result<u32, LinkError> {
    for attempt in 1..=config.max_sync_attempts {
        tracing::info!(attempt, "responding to link resync");
        match run_attempt(&mut *transport, config, abort) {
            Ok(()) => {
                tracing::info!(attempt, "link synchronized");
                return Ok(attempt);
            }
            Err(LinkError::Cancelled) => return Err(LinkError::Cancelled),
            Err(e) if e.needs_resync() => {
                tracing::warn!(attempt, "sync attempt failed: {}", e);
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(attempts = config.max_sync_attempts, "giving up on sync, link down");
    Err(LinkError::LinkDown { attempts: config.max_sync_attempts })
}

fn run_attempt(transport: &mut dyn Transport, config: &LinkConfig, abort: &CancelFlag) -> Result<(), LinkError> {
    let mut state = ResponderFsm::<Flush>::new(transport, config.poll_interval);
    let mut deadline = None;

    loop {
        if abort.is_raised() {
            return Err(LinkError::Cancelled);
        }

        if state.waiting_for_peer() {
            deadline = None;
        } else {
            let limit = *deadline.get_or_insert_with(|| Instant::now() + config.sync_timeout);
            if Instant::now() >= limit {
                tracing::debug!("sync timed out in state {}", state.name());
                return Err(LinkError::LinkTimeout);
            }
        }

        state = match state.step()? {
            ResponderStep::Next(next) => next,
            ResponderStep::Synchronized => return Ok(()),
        };
    }
}

// ============================================================================
// Tests
// ============================================================================
