//! Command-driven debugger: per-core breakpoint/step/continue gate plus
//! the interactive console on standard input.

mod console;

pub use console::Console;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::cpu::Core;
use crate::machine::StartFlags;
use crate::sleep;

/// Maximum breakpoints per core.
pub const MAX_BREAKPOINTS: usize = 64;

/// Debugger control block of one core. Written by the console thread,
/// read by the core's gate every loop iteration; everything is atomic so
/// neither side ever takes the core's state lock while waiting.
pub struct DebugState {
    breakpoints: Mutex<Vec<u64>>,
    /// Instructions still allowed to retire before the next pause.
    trap: AtomicU32,
    /// The console asked the core to run freely.
    continuing: AtomicBool,
    /// Pause-on-breakpoint gate is armed.
    contflg: AtomicBool,
    /// Step countdown is armed.
    trapflg: AtomicBool,
    /// The core is parked in the gate, waiting for the console.
    debugging: AtomicBool,
}

impl DebugState {
    pub fn new() -> Self {
        Self {
            breakpoints: Mutex::new(Vec::new()),
            trap: AtomicU32::new(0),
            continuing: AtomicBool::new(false),
            contflg: AtomicBool::new(false),
            trapflg: AtomicBool::new(false),
            debugging: AtomicBool::new(false),
        }
    }

    /// Add a breakpoint; duplicates and overflow are rejected.
    pub fn add_breakpoint(&self, addr: u64) -> Result<(), &'static str> {
        let mut bps = self.breakpoints.lock();
        if bps.contains(&addr) {
            return Err("breakpoint already set");
        }
        if bps.len() == MAX_BREAKPOINTS {
            return Err("breakpoint list is full");
        }
        bps.push(addr);
        Ok(())
    }

    /// Remove a breakpoint; absent addresses are a no-op.
    pub fn remove_breakpoint(&self, addr: u64) {
        self.breakpoints.lock().retain(|&a| a != addr);
    }

    pub fn breakpoints(&self) -> Vec<u64> {
        self.breakpoints.lock().clone()
    }

    /// `stp [N]`: let N more instructions retire, then park.
    pub fn request_step(&self, count: u32) {
        self.trap.store(count, Ordering::SeqCst);
        self.continuing.store(false, Ordering::SeqCst);
        self.contflg.store(false, Ordering::SeqCst);
        self.trapflg.store(true, Ordering::SeqCst);
    }

    /// `cont`: run freely until the next breakpoint.
    pub fn request_continue(&self) {
        self.continuing.store(true, Ordering::SeqCst);
        self.contflg.store(true, Ordering::SeqCst);
        self.trapflg.store(false, Ordering::SeqCst);
    }

    /// Whether the core is parked in the gate.
    pub fn is_paused(&self) -> bool {
        self.debugging.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn set_paused_for_test(&self, paused: bool) {
        self.debugging.store(paused, Ordering::SeqCst);
    }
}

impl Default for DebugState {
    fn default() -> Self {
        Self::new()
    }
}

/// Park until the console releases the core (or the VM shuts down).
fn park(d: &DebugState, core_id: u64, start: &StartFlags) {
    d.debugging.store(true, Ordering::SeqCst);
    while start.is_running(core_id)
        && !d.continuing.load(Ordering::SeqCst)
        && d.trap.load(Ordering::SeqCst) == 0
    {
        sleep::poll();
    }
    d.debugging.store(false, Ordering::SeqCst);
}

/// Per-core debugger gate, evaluated before every instruction when the
/// VM runs with `-d`.
pub(crate) fn gate(core: &Core, start: &StartFlags) {
    let d = &core.debug;
    let ip = core.state.lock().regs.ip;
    if d.breakpoints.lock().contains(&ip) {
        d.continuing.store(false, Ordering::SeqCst);
        d.contflg.store(true, Ordering::SeqCst);
        d.trapflg.store(false, Ordering::SeqCst);
    }

    if d.trapflg.load(Ordering::SeqCst) {
        let t = d.trap.load(Ordering::SeqCst);
        if t > 0 {
            d.trap.store(t - 1, Ordering::SeqCst);
        } else {
            park(d, core.id, start);
            // A wake by `cont` retires the step gate; a wake by a fresh
            // `stp` leaves it armed for the new countdown.
            if d.continuing.load(Ordering::SeqCst) {
                d.trapflg.store(false, Ordering::SeqCst);
            }
        }
    }

    if d.contflg.load(Ordering::SeqCst) && !d.continuing.load(Ordering::SeqCst) {
        park(d, core.id, start);
        d.contflg.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn breakpoint_list_rejects_duplicates_and_overflow() {
        let d = DebugState::new();
        d.add_breakpoint(0x10).unwrap();
        assert!(d.add_breakpoint(0x10).is_err());
        for i in 1..MAX_BREAKPOINTS as u64 {
            d.add_breakpoint(i << 8).unwrap();
        }
        assert!(d.add_breakpoint(0xffff).is_err());
        d.remove_breakpoint(0x10);
        assert!(!d.breakpoints().contains(&0x10));
        // Removing again is a no-op.
        d.remove_breakpoint(0x10);
    }

    #[test]
    fn step_countdown_decrements_then_parks() {
        let core = Core::new(0);
        let start = Arc::new(StartFlags::new(1));
        start.start(0);
        core.debug.request_step(2);

        // Two gate passes decrement without parking.
        gate(&core, &start);
        gate(&core, &start);
        assert!(!core.debug.is_paused());

        // The third pass parks; release it from another thread with cont.
        let waker = {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                while !core.debug.is_paused() {
                    thread::sleep(Duration::from_millis(1));
                }
                core.debug.request_continue();
            })
        };
        gate(&core, &start);
        waker.join().unwrap();
        assert!(!core.debug.is_paused());
        // The step gate retired; the continue gate is armed and open.
        gate(&core, &start);
    }

    #[test]
    fn breakpoint_parks_a_continuing_core() {
        let core = Core::new(0);
        let start = Arc::new(StartFlags::new(1));
        start.start(0);
        core.debug.request_continue();
        core.debug.add_breakpoint(0x40).unwrap();

        // Not at the breakpoint: the gate is open.
        gate(&core, &start);
        assert!(!core.debug.is_paused());

        // Move the core onto the breakpoint and gate again.
        core.state.lock().regs.ip = 0x40;
        let waker = {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                while !core.debug.is_paused() {
                    thread::sleep(Duration::from_millis(1));
                }
                core.debug.request_step(1);
            })
        };
        gate(&core, &start);
        waker.join().unwrap();
    }

    #[test]
    fn shutdown_releases_a_parked_core() {
        let core = Core::new(0);
        let start = Arc::new(StartFlags::new(1));
        start.start(0);
        core.debug.request_step(0);

        let handle = {
            let core = Arc::clone(&core);
            let start = Arc::clone(&start);
            thread::spawn(move || gate(&core, &start))
        };
        thread::sleep(Duration::from_millis(5));
        start.shutdown();
        handle.join().unwrap();
    }
}
