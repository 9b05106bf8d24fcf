//! Process-wide interrupt distributor.
//!
//! External producers post `(interrupt, mode)` pairs onto a single bounded
//! queue; the distributor thread drains it and fans entries out to the
//! per-core rings. `Single` picks the running core with the shortest local
//! queue, `Broadcast` hits every running core. Routing is by core index
//! only; the distributor never touches core state.

use std::sync::Arc;

use spin::Mutex;

use super::{IntQueue, Interrupt};
use crate::machine::StartFlags;
use crate::sleep;

/// Capacity of the global distributor queue.
pub const GLOBAL_QUEUE_CAPACITY: usize = 4096;

/// Delivery policy for a globally posted interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchMode {
    /// Deliver to every running core.
    Broadcast = 0,
    /// Deliver to the single running core with the shortest local queue.
    Single = 1,
}

struct PlaneRing {
    buf: Vec<(u8, u8)>,
    head: usize,
    tail: usize,
}

impl PlaneRing {
    fn new() -> Self {
        Self {
            buf: vec![(0, 0); GLOBAL_QUEUE_CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, entry: (u8, u8)) -> bool {
        let next = (self.tail + 1) % GLOBAL_QUEUE_CAPACITY;
        if next == self.head {
            return false;
        }
        self.buf[self.tail] = entry;
        self.tail = next;
        true
    }

    fn pop(&mut self) -> Option<(u8, u8)> {
        if self.head == self.tail {
            return None;
        }
        let entry = self.buf[self.head];
        self.head = (self.head + 1) % GLOBAL_QUEUE_CAPACITY;
        Some(entry)
    }
}

/// The process-wide interrupt plane: one bounded ring under one lock.
///
/// In-process device models and tests act as the external-producer side
/// through [`IntPlane::post`]; the distributor thread is the only consumer.
pub struct IntPlane {
    ring: Mutex<PlaneRing>,
}

impl IntPlane {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(PlaneRing::new()),
        }
    }

    /// Post an interrupt for distribution; `false` when the plane is full.
    pub fn post(&self, int: Interrupt, mode: DispatchMode) -> bool {
        self.ring.lock().push((int.id(), mode as u8))
    }

    fn pop(&self) -> Option<(Interrupt, DispatchMode)> {
        let (id, mode) = self.ring.lock().pop()?;
        let int = Interrupt::from_id(id)?;
        let mode = if mode == DispatchMode::Single as u8 {
            DispatchMode::Single
        } else {
            DispatchMode::Broadcast
        };
        Some((int, mode))
    }
}

impl Default for IntPlane {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan one entry out to the per-core rings.
///
/// FIFO order is preserved relative to this single consumer; cores that are
/// not running are skipped, and a `Single` entry with no running core at
/// all is dropped.
pub(crate) fn route(
    queues: &[Arc<IntQueue>],
    start: &StartFlags,
    int: Interrupt,
    mode: DispatchMode,
) {
    match mode {
        DispatchMode::Broadcast => {
            for (id, q) in queues.iter().enumerate() {
                if start.is_running(id as u64) {
                    q.push(int);
                }
            }
        }
        DispatchMode::Single => {
            let target = queues
                .iter()
                .enumerate()
                .filter(|(id, _)| start.is_running(*id as u64))
                .min_by_key(|(_, q)| q.len());
            if let Some((_, q)) = target {
                q.push(int);
            }
        }
    }
}

/// Distributor thread body. Runs until core 0 stops; core 0 is the first
/// core up and the last one down.
pub fn run_distributor(plane: Arc<IntPlane>, queues: Vec<Arc<IntQueue>>, start: Arc<StartFlags>) {
    log::debug!("interrupt distributor up");
    while start.is_running(0) {
        sleep::distributor();
        while let Some((int, mode)) = plane.pop() {
            route(&queues, &start, int, mode);
        }
    }
    log::debug!("interrupt distributor down");
}
