//! Per-core architectural state.
//!
//! A [`Core`] is one hardware thread: a register file plus translation
//! caching state under a single spin lock, a bounded interrupt ring, and
//! the debugger's control block. The worker loop in [`run`] holds the
//! state lock for one iteration at a time, so the debugger can inspect a
//! core between instructions without stopping the world.

pub mod run;

use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::debug::DebugState;
use crate::io::IoPlane;
use crate::irq::{IntQueue, Interrupt};
use crate::mem::GuestMemory;
use crate::mmu::AddressCache;

/// Number of general registers.
pub const NUM_REGS: usize = 16;

bitflags! {
    /// The condition register `flg`. Bit positions are a wire contract;
    /// guest code reads and writes the raw word through `ir`/`sysc`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u64 {
        const EQUAL         = 1 << 0;
        const ABOVE         = 1 << 1;
        const BELOW         = 1 << 2;
        const ZERO          = 1 << 3;
        const SIGNAL        = 1 << 4;
        const OVERFLOW      = 1 << 5;
        const INT_ENABLE    = 1 << 6;
        const PAGING        = 1 << 7;
        /// Privilege level: clear is kernel, set is user.
        const USER          = 1 << 8;
        const SIGNED_HIGHER = 1 << 9;
        const SIGNED_LOWER  = 1 << 10;
    }
}

/// Index order of the special-register bank addressed by `lsrg`/`ssrg`.
/// The order is stable wire contract: usb, ust, ksb, kst, kpt, upt, ivt,
/// scp.
pub const SPECIAL_REG_NAMES: [&str; 8] = ["usb", "ust", "ksb", "kst", "kpt", "upt", "ivt", "scp"];

/// Architectural register file of one core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    /// General registers. `x[0]` doubles as the return/resume address for
    /// `r`, `ir` and `sysc`.
    pub x: [u64; NUM_REGS],
    /// Condition register.
    pub flg: Flags,
    /// Instruction pointer (virtual when paging is enabled).
    pub ip: u64,
    /// User stack frame base/top.
    pub usb: u64,
    pub ust: u64,
    /// Kernel stack frame base/top.
    pub ksb: u64,
    pub kst: u64,
    /// Physical offsets of the kernel and user level-4 page-table roots.
    pub kpt: u64,
    pub upt: u64,
    /// Interrupt vector table base (physical).
    pub ivt: u64,
    /// System-call entry point.
    pub scp: u64,
}

impl Registers {
    /// Boot state: everything zero; paging and interrupts disabled,
    /// kernel mode.
    pub fn new() -> Self {
        Self {
            x: [0; NUM_REGS],
            flg: Flags::empty(),
            ip: 0,
            usb: 0,
            ust: 0,
            ksb: 0,
            kst: 0,
            kpt: 0,
            upt: 0,
            ivt: 0,
            scp: 0,
        }
    }

    /// Read the special-register bank by index; `None` outside the bank.
    pub fn special(&self, index: usize) -> Option<u64> {
        Some(match index {
            0 => self.usb,
            1 => self.ust,
            2 => self.ksb,
            3 => self.kst,
            4 => self.kpt,
            5 => self.upt,
            6 => self.ivt,
            7 => self.scp,
            _ => return None,
        })
    }

    /// Write the special-register bank by index. Returns whether a
    /// page-table root (`kpt`/`upt`) was written, which obligates the
    /// caller to invalidate the address cache and the IP buffer.
    pub fn set_special(&mut self, index: usize, value: u64) -> Option<bool> {
        let slot = match index {
            0 => &mut self.usb,
            1 => &mut self.ust,
            2 => &mut self.ksb,
            3 => &mut self.kst,
            4 => &mut self.kpt,
            5 => &mut self.upt,
            6 => &mut self.ivt,
            7 => &mut self.scp,
            _ => return None,
        };
        *slot = value;
        Some(index == 4 || index == 5)
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable execution state of one core, everything the instruction
/// semantics touch. Lives under the core's state lock.
pub struct CoreState {
    pub regs: Registers,
    /// Interrupt currently latched for service, at most one at a time.
    pub triggered: Option<Interrupt>,
    /// Physical translation of `ip`.
    pub ipbuff: u64,
    /// `ip` and `ipbuff` have diverged; re-translate before the next fetch.
    pub ipbuff_need_flush: bool,
    /// A page-table root changed; drop the address cache before use.
    pub am_need_flush: bool,
    /// Software TLB for instruction-pointer translations.
    pub cache: AddressCache,
    /// Byte length of the instruction just retired.
    pub incr: u64,
}

impl CoreState {
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            triggered: None,
            ipbuff: 0,
            ipbuff_need_flush: true,
            am_need_flush: false,
            cache: AddressCache::new(),
            incr: 0,
        }
    }
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new()
    }
}

/// One hardware thread of the VM.
pub struct Core {
    /// Stable core index used by the distributor and the debugger.
    pub id: u64,
    /// Architectural state, locked per loop iteration.
    pub state: Mutex<CoreState>,
    /// Pending-interrupt ring; shared with the clock and the distributor.
    pub irq: Arc<IntQueue>,
    /// Debugger control block.
    pub debug: DebugState,
}

impl Core {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(CoreState::new()),
            irq: Arc::new(IntQueue::new()),
            debug: DebugState::new(),
        })
    }
}

/// Shared collaborators an instruction may touch while the core's state
/// lock is held: guest memory, the I/O plane and the core's own interrupt
/// ring (for raising faults).
pub struct CoreEnv<'a> {
    pub mem: &'a GuestMemory,
    pub io: &'a IoPlane,
    pub irq: &'a IntQueue,
}
