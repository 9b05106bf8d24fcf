//! Byte-serial I/O control plane.
//!
//! Sixty-four ports, each a pair of bounded byte rings (input toward the
//! guest, output toward the outside world) under per-ring spin locks.
//! In-process device models and tests act as the external side through
//! [`IoPlane::push_input`]/[`IoPlane::pop_output`].
//!
//! Port 1 is the start-core command port: the I/O control thread consumes
//! its output ring and starts the core named by each byte.

use std::sync::Arc;

use spin::Mutex;

use crate::machine::StartFlags;
use crate::sleep;

/// Number of I/O ports.
pub const PORT_COUNT: usize = 64;

/// Ring storage per direction; one slot is sacrificed to distinguish a
/// full ring from an empty one.
pub const PORT_RING_SIZE: usize = 65536;

/// The start-core command port.
pub const START_CORE_PORT: u8 = 1;

struct ByteRing {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl ByteRing {
    fn new() -> Self {
        Self {
            buf: vec![0u8; PORT_RING_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        let next = (self.tail + 1) % PORT_RING_SIZE;
        if next == self.head {
            return false;
        }
        self.buf[self.tail] = byte;
        self.tail = next;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.head == self.tail {
            return None;
        }
        let b = self.buf[self.head];
        self.head = (self.head + 1) % PORT_RING_SIZE;
        Some(b)
    }
}

struct IoPort {
    input: Mutex<ByteRing>,
    output: Mutex<ByteRing>,
}

impl IoPort {
    fn new() -> Self {
        Self {
            input: Mutex::new(ByteRing::new()),
            output: Mutex::new(ByteRing::new()),
        }
    }
}

/// The process-wide I/O plane.
pub struct IoPlane {
    ports: Vec<IoPort>,
}

impl IoPlane {
    pub fn new() -> Self {
        Self {
            ports: (0..PORT_COUNT).map(|_| IoPort::new()).collect(),
        }
    }

    /// Whether a guest-supplied port number names a real port.
    pub fn valid_port(port: u8) -> bool {
        (port as usize) < PORT_COUNT
    }

    /// Guest side of `in`: consume the next input byte, if any.
    pub fn read_input(&self, port: u8) -> Option<u8> {
        self.ports.get(port as usize)?.input.lock().pop()
    }

    /// Guest side of `out`: append to the output ring. A full ring drops
    /// the byte and reports `false`.
    pub fn write_output(&self, port: u8, byte: u8) -> bool {
        match self.ports.get(port as usize) {
            Some(p) => p.output.lock().push(byte),
            None => false,
        }
    }

    /// External-producer side: feed a byte toward the guest.
    pub fn push_input(&self, port: u8, byte: u8) -> bool {
        match self.ports.get(port as usize) {
            Some(p) => p.input.lock().push(byte),
            None => false,
        }
    }

    /// External-consumer side: take one byte the guest wrote.
    pub fn pop_output(&self, port: u8) -> Option<u8> {
        self.ports.get(port as usize)?.output.lock().pop()
    }

    /// External-consumer side: take everything the guest has written.
    pub fn drain_output(&self, port: u8) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = self.pop_output(port) {
            out.push(b);
        }
        out
    }
}

impl Default for IoPlane {
    fn default() -> Self {
        Self::new()
    }
}

/// Service one pass of the start-core port: each byte `k` below the core
/// count starts core `k`; anything else is consumed and ignored.
pub(crate) fn service_start_port(io: &IoPlane, start: &StartFlags) {
    while let Some(k) = io.pop_output(START_CORE_PORT) {
        if (k as usize) < start.core_count() {
            start.start(k as u64);
        }
    }
}

/// I/O control thread body. Lives as long as core 0, like the distributor.
pub fn run_io_control(io: Arc<IoPlane>, start: Arc<StartFlags>) {
    log::debug!("i/o control plane up");
    while start.is_running(0) {
        sleep::poll();
        service_start_port(&io, &start);
    }
    log::debug!("i/o control plane down");
}
