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

use std::time::Duration;

/// Timing and retry settings for one link.
///
/// Wire constants (sync zero count, status values) are not configurable and
/// live in [`crate::protocol`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long one byte may take once a frame is under way.
    pub byte_timeout: Duration,
    /// How long the client waits for the first byte of a response. `None`
    /// waits until BREAK.
    pub response_timeout: Option<Duration>,
    /// Upper bound on one recovery attempt.
    pub sync_timeout: Duration,
    /// Recovery attempts before the link is reported down.
    pub max_sync_attempts: u32,
    /// Granularity of waits on the transport.
    pub poll_interval: Duration,
    /// How long the server waits for a request header before reporting idle.
    pub idle_poll: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            byte_timeout: Duration::from_secs(1),
            response_timeout: Some(Duration::from_secs(30)),
            sync_timeout: Duration::from_secs(5),
            max_sync_attempts: 3,
            poll_interval: Duration::from_millis(10),
            idle_poll: Duration::from_millis(500),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_sync_attempts == 0 {
            return Err("sync retries must be at least 1".to_string());
        }
        if self.byte_timeout.is_zero() {
            return Err("byte timeout must be non-zero".to_string());
        }
        if self.sync_timeout < self.byte_timeout {
            return Err("sync timeout must not be shorter than the byte timeout".to_string());
        }
        Ok(())
    }
}
