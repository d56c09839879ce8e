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

//! BeebLink serial link protocol: framed request/response messages over a
//! half-duplex byte channel, with zero-flood resynchronization.

pub mod client;
pub mod config;
pub mod diag;
pub mod error;
pub mod frame;
pub mod initiator;
pub mod link;
pub mod protocol;
pub mod responder;
pub mod serial;
pub mod server;
pub mod status;

pub use client::{Client, Phase};
pub use config::LinkConfig;
pub use error::{FrameError, LinkError, RequestError, TransportError};
pub use frame::{Kind, Message};
pub use link::CancelFlag;
pub use serial::{RealSerialPort, Transport};
pub use server::{serve_ports, Dispatch, Served, Server, ServerStats};
