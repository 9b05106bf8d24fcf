//! Short-sleep primitives backing every polling loop.
//!
//! The concurrency model is deliberately condition-variable-free: blocked
//! parties poll with sleeps of at most one millisecond. Centralizing the
//! durations keeps the retry rates consistent across subsystems.

use std::thread;
use std::time::Duration;

/// Backoff for contended producers (full ring, held start gate).
pub fn briefly() {
    thread::sleep(Duration::from_micros(50));
}

/// Poll interval for consumers waiting on work (distributor, NOP wait,
/// debugger gate). The longest sleep any blocking point takes.
pub fn poll() {
    thread::sleep(Duration::from_millis(1));
}

/// Poll interval for a core awaiting its start flag.
pub fn awaiting_start() {
    thread::sleep(Duration::from_micros(500));
}

/// Poll interval for the global distributor's queue scan.
pub fn distributor() {
    thread::sleep(Duration::from_micros(700));
}
