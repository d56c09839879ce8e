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

use std::io::{Read, Write};
use std::time::{Duration, Instant};
use serialport::{SerialPort as SerialPortTrait, ClearBuffer, DataBits, Parity, StopBits};
use crate::error::TransportError;

// ============================================================================
// Transport Trait
// ============================================================================

/// Byte-at-a-time half-duplex channel used by the link protocol.
pub trait Transport: Send {
    /// Bounded-time attempt to transmit one byte. `Timeout` if the peer
    /// does not take it within the handshake window.
    fn try_send(&mut self, byte: u8) -> Result<(), TransportError>;

    /// Non-blocking poll for one received byte.
    fn try_recv(&mut self) -> Result<Option<u8>, TransportError>;

    /// Best-effort discard of undelivered bytes in both directions.
    fn flush_buffers(&mut self);

    /// Wait up to `timeout` for one byte. This is the yield point: transports
    /// that need servicing while idle do it here.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(byte) = self.try_recv()? {
                return Ok(Some(byte));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::yield_now();
        }
    }

    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        for &byte in bytes {
            self.try_send(byte)?;
        }
        Ok(())
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
    timeout: Duration,
    write_timeout: Duration,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
        write_timeout: Duration,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(write_timeout)
            .open()?;

        Ok(RealSerialPort { port, timeout: write_timeout, write_timeout })
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.timeout != timeout {
            self.port.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        Ok(())
    }
}

impl Transport for RealSerialPort {
    fn try_send(&mut self, byte: u8) -> Result<(), TransportError> {
        self.set_timeout(self.write_timeout)?;
        match self.port.write(&[byte]) {
            Ok(1) => Ok(()),
            Ok(_) => Err(TransportError::Timeout),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn try_recv(&mut self) -> Result<Option<u8>, TransportError> {
        if self.port.bytes_to_read()? == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn flush_buffers(&mut self) {
        if let Err(e) = self.port.clear(ClearBuffer::All) {
            tracing::debug!("clear buffers failed: {}", e);
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        // serialport treats a zero timeout as "block forever" on some platforms
        if timeout.is_zero() {
            return self.try_recv();
        }
        self.set_timeout(timeout)?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.set_timeout(self.write_timeout)?;
        match self.port.write_all(bytes).and_then(|_| self.port.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Mock Transport for Testing
// ============================================================================

#[cfg(test)]
pub struct MockTransport {
    // Data to return on reads (None = nothing available on that poll)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    flushes: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockTransport {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
            flushes: Default::default(),
        }
    }

    /// Script a run of bytes that are all available immediately.
    pub fn bytes(bytes: &[u8]) -> Vec<Option<u8>> {
        bytes.iter().map(|&b| Some(b)).collect()
    }

    pub fn flush_count(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.flushes.clone()
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn try_send(&mut self, byte: u8) -> Result<(), TransportError> {
        self.write_log.push(byte);
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<u8>, TransportError> {
        // Out of responses = line idle
        if self.read_pos >= self.read_buffer.len() {
            return Ok(None);
        }

        let byte = self.read_buffer[self.read_pos];
        self.read_pos += 1;
        Ok(byte)
    }

    fn flush_buffers(&mut self) {
        self.flushes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn recv_timeout(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
        self.try_recv()
    }
}

#[cfg(test)]
impl Drop for MockTransport {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockTransport dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockTransport write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// Loopback Pair for Testing
// ============================================================================

#[cfg(test)]
struct Pipe {
    bytes: std::sync::Mutex<std::collections::VecDeque<u8>>,
    changed: std::sync::Condvar,
    capacity: usize,
}

/// One end of an in-memory bounded duplex channel. Sends block for up to
/// `send_timeout` while the peer's receive buffer is full.
#[cfg(test)]
pub struct LoopbackPort {
    tx: std::sync::Arc<Pipe>,
    rx: std::sync::Arc<Pipe>,
    send_timeout: Duration,
}

#[cfg(test)]
pub fn loopback_pair(capacity: usize, send_timeout: Duration) -> (LoopbackPort, LoopbackPort) {
    use std::sync::Arc;

    let pipe = || Arc::new(Pipe {
        bytes: Default::default(),
        changed: Default::default(),
        capacity,
    });
    let a_to_b = pipe();
    let b_to_a = pipe();

    (
        LoopbackPort { tx: a_to_b.clone(), rx: b_to_a.clone(), send_timeout },
        LoopbackPort { tx: b_to_a, rx: a_to_b, send_timeout },
    )
}

#[cfg(test)]
impl LoopbackPort {
    /// Put stale bytes on the wire towards the peer, ignoring capacity.
    pub fn inject(&self, bytes: &[u8]) {
        self.tx.bytes.lock().unwrap().extend(bytes.iter().copied());
        self.tx.changed.notify_all();
    }

    /// Bytes sent by the peer that this end has not read yet.
    pub fn pending(&self) -> usize {
        self.rx.bytes.lock().unwrap().len()
    }
}

#[cfg(test)]
impl Transport for LoopbackPort {
    fn try_send(&mut self, byte: u8) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.send_timeout;
        let mut bytes = self.tx.bytes.lock().unwrap();
        while bytes.len() >= self.tx.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            bytes = self.tx.changed.wait_timeout(bytes, deadline - now).unwrap().0;
        }
        bytes.push_back(byte);
        self.tx.changed.notify_all();
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<u8>, TransportError> {
        let byte = self.rx.bytes.lock().unwrap().pop_front();
        if byte.is_some() {
            self.rx.changed.notify_all();
        }
        Ok(byte)
    }

    fn flush_buffers(&mut self) {
        self.rx.bytes.lock().unwrap().clear();
        self.tx.bytes.lock().unwrap().clear();
        self.rx.changed.notify_all();
        self.tx.changed.notify_all();
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut bytes = self.rx.bytes.lock().unwrap();
        loop {
            if let Some(byte) = bytes.pop_front() {
                self.rx.changed.notify_all();
                return Ok(Some(byte));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            bytes = self.rx.changed.wait_timeout(bytes, deadline - now).unwrap().0;
        }
    }
}
