//! Per-core clock producer.
//!
//! One thread per core, raising `CLOCK` on the core's interrupt ring at a
//! fixed period. The producer measures the time since the previous tick
//! so queue backpressure does not stretch the period, and it holds off
//! entirely (without accumulating ticks) while the debugger has the core
//! parked.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cpu::Core;
use crate::irq::Interrupt;
use crate::machine::StartFlags;
use crate::sleep;

/// Tick period of the internal clock.
pub const TICK_PERIOD: Duration = Duration::from_micros(2000);

/// Clock thread body; exits when the owning core stops.
pub fn run_clock(core: Arc<Core>, start: Arc<StartFlags>) {
    log::debug!("clock for core#{} up", core.id);
    let mut last = Instant::now();
    while start.is_running(core.id) {
        if core.debug.is_paused() {
            sleep::poll();
            // The pause does not bank ticks; restart the period.
            last = Instant::now();
            continue;
        }
        let elapsed = last.elapsed();
        if elapsed < TICK_PERIOD {
            thread::sleep(TICK_PERIOD - elapsed);
        }
        last = Instant::now();
        core.irq.push(Interrupt::Clock);
    }
    log::debug!("clock for core#{} down", core.id);
}
