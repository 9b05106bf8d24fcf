//! The per-core worker: fetch, translate, dispatch, advance.
//!
//! Each iteration works through a fixed pipeline: refresh the cached
//! physical instruction pointer, latch a pending interrupt, evaluate the
//! debugger gate, read the opcode, enter the interrupt handler when one is
//! latched and interrupts are enabled, and otherwise dispatch through the
//! opcode table. `NOP`, `initext` and `destext` are handled here, before
//! the table is consulted.

use std::process;
use std::sync::Arc;
use std::thread;

use super::{Core, CoreEnv, CoreState, Flags};
use crate::debug;
use crate::irq::{IntQueue, Interrupt};
use crate::isa::{op, MAX_INST_LEN};
use crate::machine::VmContext;
use crate::mem::GuestMemory;
use crate::mmu::{self, WalkMode, PAGE_SHIFT};
use crate::sleep;

/// Worker body for one core. Returns when the VM shuts down or the core's
/// start flag is withdrawn.
pub fn run_core(core: Arc<Core>, ctx: Arc<VmContext>) {
    log::info!("created core#{}", core.id);
    if !ctx.start.wait_for_start(core.id) {
        return;
    }
    log::info!("core#{} running", core.id);

    let clock = if ctx.clock_enabled {
        let thread = thread::Builder::new().name(format!("clock{}", core.id)).spawn({
            let core = Arc::clone(&core);
            let start = Arc::clone(&ctx.start);
            move || crate::clock::run_clock(core, start)
        });
        match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("core#{} runs without a clock: {e}", core.id);
                None
            }
        }
    } else {
        None
    };

    while ctx.start.is_running(core.id) {
        if ctx.debug_enabled {
            debug::gate(&core, &ctx.start);
            if !ctx.start.is_running(core.id) {
                break;
            }
        }
        step(&core, &ctx);
    }

    if let Some(handle) = clock {
        let _ = handle.join();
    }
    log::info!("core#{} stopped", core.id);
}

/// One iteration of the core loop.
pub(crate) fn step(core: &Core, ctx: &VmContext) {
    let mem = ctx.mem.as_ref();
    let mut st = core.state.lock();

    // Translation cache maintenance.
    if st.am_need_flush {
        st.cache.clear();
        st.am_need_flush = false;
    }
    if st.ipbuff_need_flush {
        refresh_ipbuff(&mut st, mem, &core.irq);
    }

    // Latch the oldest pending interrupt.
    if st.triggered.is_none() {
        st.triggered = core.irq.pop();
    }

    // Fetch the opcode. A fetch past the end of RAM is itself a fault.
    let opcode = match mem.read_u8(st.ipbuff) {
        Ok(b) => Some(b),
        Err(_) => {
            raise_now(core, &mut st, Interrupt::InvalidAddress);
            // Nothing retires this iteration; an `ir` retry must land
            // back on the faulting address, not `incr` bytes before it.
            st.incr = 0;
            None
        }
    };

    match opcode {
        Some(op::NOP) => {
            if st.triggered.is_some() {
                advance(&mut st, 1);
            } else {
                drop(st);
                nop_wait(core, ctx);
            }
            return;
        }
        Some(op::INITEXT) => {
            let ext_id = mem.read_u8(st.ipbuff.wrapping_add(1)).unwrap_or(0);
            match ctx.ext.load(u64::from(ext_id), &ctx.dispatch) {
                Ok(()) => advance(&mut st, 2),
                Err(e) => {
                    // A half-installed extension leaves the dispatch
                    // table unusable; this is fatal by contract.
                    log::error!("fatal: {e}");
                    process::exit(e.exit_code());
                }
            }
            return;
        }
        Some(op::DESTEXT) => {
            ctx.ext.unload(&ctx.dispatch);
            advance(&mut st, 1);
            return;
        }
        _ => {}
    }

    let handler = opcode.and_then(|b| ctx.dispatch.get(b).handler());
    if opcode.is_some() && handler.is_none() {
        raise_now(core, &mut st, Interrupt::UnrecognizedInstruction);
        st.incr = 0;
    }

    // Interrupt entry preempts the pending instruction.
    if st.regs.flg.contains(Flags::INT_ENABLE) && st.triggered.is_some() {
        enter_interrupt(&mut st, mem, &core.irq);
        return;
    }

    if let Some(handler) = handler {
        let mut window = [0u8; MAX_INST_LEN];
        mem.read_padded(st.ipbuff, &mut window);
        let env = CoreEnv {
            mem,
            io: &ctx.io,
            irq: &core.irq,
        };
        let n = handler(&window, &mut st, &env);
        st.incr = n;
        advance(&mut st, n);
    }
}

/// Re-derive the physical instruction pointer, going through the address
/// cache when paging is on. A failed translation raises and parks the
/// buffer at 0; the fault redirects the core on the next iteration.
fn refresh_ipbuff(st: &mut CoreState, mem: &GuestMemory, irq: &IntQueue) {
    let ip = st.regs.ip;
    let paging = st.regs.flg.contains(Flags::PAGING);
    if paging {
        if let Some(phys) = st.cache.lookup(ip) {
            st.ipbuff = phys;
            st.ipbuff_need_flush = false;
            return;
        }
    }
    match mmu::virt_to_phys(&st.regs, mem, ip, WalkMode::Probe) {
        Ok(phys) => {
            if paging {
                st.cache.insert(ip, phys);
            }
            st.ipbuff = phys;
        }
        Err(int) => {
            irq.raise(int);
            st.ipbuff = 0;
        }
    }
    st.ipbuff_need_flush = false;
}

/// Raise a fault detected inside the current iteration, making it
/// eligible for entry in this same iteration while preserving queue
/// order.
fn raise_now(core: &Core, st: &mut CoreState, int: Interrupt) {
    core.irq.raise(int);
    if st.triggered.is_none() {
        st.triggered = core.irq.pop();
    }
}

/// Advance `ip` and its physical mirror together, requesting a flush when
/// the advance crosses a page boundary.
fn advance(st: &mut CoreState, n: u64) {
    let old = st.regs.ip;
    st.regs.ip = old.wrapping_add(n);
    st.ipbuff = st.ipbuff.wrapping_add(n);
    if old >> PAGE_SHIFT != st.regs.ip >> PAGE_SHIFT {
        st.ipbuff_need_flush = true;
    }
}

/// Block on a `NOP` until an interrupt is latched, then step over it.
fn nop_wait(core: &Core, ctx: &VmContext) {
    loop {
        if !ctx.start.is_running(core.id) {
            return;
        }
        let mut st = core.state.lock();
        if st.triggered.is_none() {
            st.triggered = core.irq.pop();
        }
        if st.triggered.is_some() {
            advance(&mut st, 1);
            return;
        }
        drop(st);
        sleep::poll();
    }
}

/// Vector to the latched interrupt's handler: save resume state in
/// `x[0]`/`x[1]`, drop to kernel mode with interrupts masked, and load
/// `ip` from the IVT.
fn enter_interrupt(st: &mut CoreState, mem: &GuestMemory, irq: &IntQueue) {
    let Some(int) = st.triggered.take() else {
        return;
    };
    st.regs.x[0] = st.regs.ip;
    st.regs.x[1] = st.regs.flg.bits();
    st.regs.flg.remove(Flags::INT_ENABLE | Flags::USER);
    let vector_slot = st.regs.ivt.wrapping_add(u64::from(int.id()) * 8);
    match mem.read_u64(vector_slot) {
        Ok(vector) => st.regs.ip = vector,
        Err(_) => irq.raise(Interrupt::InvalidAddress),
    }
    st.ipbuff_need_flush = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::ExtensionHost;
    use crate::io::IoPlane;
    use crate::isa::DispatchTable;
    use crate::machine::StartFlags;

    fn harness(mem_size: u64, image: &[u8]) -> (Arc<Core>, Arc<VmContext>) {
        let mem = Arc::new(GuestMemory::new(mem_size).unwrap());
        mem.write(0, image).unwrap();
        let ctx = Arc::new(VmContext {
            mem,
            io: Arc::new(IoPlane::new()),
            dispatch: Arc::new(DispatchTable::with_base()),
            start: Arc::new(StartFlags::new(1)),
            ext: Arc::new(ExtensionHost::new()),
            debug_enabled: false,
            clock_enabled: false,
        });
        ctx.start.start(0);
        (Core::new(0), ctx)
    }

    #[test]
    fn boot_step_executes_the_first_instruction() {
        // ldi x0, imm8 = 0x2a
        let (core, ctx) = harness(0x1_0000, &[op::LDI, 0x00, 0x2a]);
        step(&core, &ctx);
        let st = core.state.lock();
        assert_eq!(st.regs.x[0], 0x2a);
        assert_eq!(st.regs.ip, 3);
        assert_eq!(st.incr, 3);
        assert!(st.triggered.is_none());
        assert!(core.irq.is_empty());
    }

    #[test]
    fn ip_advances_by_the_dispatched_length() {
        let image = [
            op::LDI,
            0x31,
            0x34,
            0x12, // ldi x3, imm16
            op::INC,
            3, // inc x3
            op::CMP,
            0x33, // cmp x3, x3
        ];
        let (core, ctx) = harness(0x1000, &image);
        step(&core, &ctx);
        assert_eq!(core.state.lock().regs.ip, 4);
        step(&core, &ctx);
        assert_eq!(core.state.lock().regs.ip, 6);
        assert_eq!(core.state.lock().regs.x[3], 0x1235);
        step(&core, &ctx);
        let st = core.state.lock();
        assert_eq!(st.regs.ip, 8);
        assert!(st.regs.flg.contains(Flags::EQUAL));
    }

    #[test]
    fn unrecognized_opcode_vectors_in_the_same_step() {
        let (core, ctx) = harness(0x1_0000, &[0xff]);
        {
            let mut st = core.state.lock();
            st.regs.ivt = 0x1000;
            st.regs.flg.insert(Flags::INT_ENABLE);
        }
        let old_flg = Flags::INT_ENABLE.bits();
        ctx.mem
            .write_u64(0x1000 + u64::from(Interrupt::UnrecognizedInstruction.id()) * 8, 0x2000)
            .unwrap();

        step(&core, &ctx);
        let st = core.state.lock();
        assert_eq!(st.regs.ip, 0x2000);
        assert_eq!(st.regs.x[0], 0);
        assert_eq!(st.regs.x[1], old_flg);
        assert!(!st.regs.flg.contains(Flags::INT_ENABLE));
        assert!(!st.regs.flg.contains(Flags::USER));
        assert!(st.triggered.is_none());
    }

    #[test]
    fn privileged_fault_reenters_on_the_next_iteration() {
        let (core, ctx) = harness(0x1_0000, &[op::EI]);
        {
            let mut st = core.state.lock();
            st.regs.ivt = 0x1000;
            st.regs.flg.insert(Flags::INT_ENABLE | Flags::USER);
        }
        ctx.mem
            .write_u64(0x1000 + u64::from(Interrupt::PermissionDenied.id()) * 8, 0x3000)
            .unwrap();

        // First step: `ei` faults, no advance, no state change.
        step(&core, &ctx);
        {
            let st = core.state.lock();
            assert_eq!(st.regs.ip, 0);
            assert!(st.regs.flg.contains(Flags::USER));
        }
        // Second step: the queued fault vectors into the handler.
        step(&core, &ctx);
        let st = core.state.lock();
        assert_eq!(st.regs.ip, 0x3000);
        assert!(!st.regs.flg.contains(Flags::USER));
    }

    #[test]
    fn nop_with_latched_interrupt_steps_over() {
        let (core, ctx) = harness(0x1000, &[op::NOP, op::NOP]);
        core.irq.push(Interrupt::Device);
        step(&core, &ctx);
        let st = core.state.lock();
        // Interrupts disabled: the latched interrupt stays latched and
        // the NOP is stepped over.
        assert_eq!(st.regs.ip, 1);
        assert_eq!(st.triggered, Some(Interrupt::Device));
    }

    #[test]
    fn advancing_across_a_page_boundary_requests_flush() {
        let (core, ctx) = harness(0x10_000, &[]);
        ctx.mem.write(0x3ffe, &[op::INC, 1]).unwrap();
        {
            let mut st = core.state.lock();
            st.regs.ip = 0x3ffe;
            st.ipbuff_need_flush = true;
        }
        step(&core, &ctx);
        let st = core.state.lock();
        assert_eq!(st.regs.ip, 0x4000);
        assert!(st.ipbuff_need_flush);
    }

    #[test]
    fn fetch_beyond_ram_raises_invalid_address() {
        let (core, ctx) = harness(0x100, &[]);
        {
            let mut st = core.state.lock();
            st.regs.ip = 0x100; // translation fails, ipbuff parks at 0
        }
        // ip = 0x100 is out of range; the flush path raises.
        {
            core.state.lock().ipbuff_need_flush = true;
        }
        step(&core, &ctx);
        let st = core.state.lock();
        assert_eq!(st.triggered, Some(Interrupt::InvalidAddress));
    }

    #[test]
    fn retry_return_reexecutes_the_faulting_instruction() {
        // Layout: 0: ei; 1: ldm x1 <- [x0] with x0 pointing out of range;
        // handler at 0x200: ir mode 1 (retry).
        let image = [op::EI, op::LDM, 0x10];
        let (core, ctx) = harness(0x1_0000, &image);
        ctx.mem.write(0x200, &[op::IR, 1]).unwrap();
        ctx.mem
            .write_u64(u64::from(Interrupt::InvalidAddress.id()) * 8, 0x200)
            .unwrap();
        {
            let mut st = core.state.lock();
            st.regs.x[0] = 0xdead_0000; // bad load address
        }

        step(&core, &ctx); // ei
        step(&core, &ctx); // ldm faults, ip stays at 1
        assert_eq!(core.state.lock().regs.ip, 1);
        step(&core, &ctx); // vector to handler
        assert_eq!(core.state.lock().regs.ip, 0x200);
        // Fix the bad address from "handler context", then retry.
        core.state.lock().regs.x[0] = 0x800;
        step(&core, &ctx); // ir mode 1: ip = x[0] - incr
        let st = core.state.lock();
        // x[0] was rewritten to 0x800 and incr was 0 at fault time, so
        // the core resumes exactly at 0x800.
        assert_eq!(st.regs.ip, 0x800);
        assert!(st.ipbuff_need_flush);
    }

    #[test]
    fn retry_after_unrecognized_opcode_refetches_it() {
        // 0: inc x3 (retires with incr = 2); 2: unbound opcode. The
        // retry return must land back on offset 2, not 2 - incr.
        let (core, ctx) = harness(0x1_0000, &[op::INC, 3, 0xff]);
        ctx.mem
            .write_u64(u64::from(Interrupt::UnrecognizedInstruction.id()) * 8, 0x200)
            .unwrap();
        ctx.mem.write(0x200, &[op::IR, 1]).unwrap();
        {
            let mut st = core.state.lock();
            st.regs.flg.insert(Flags::INT_ENABLE);
        }

        step(&core, &ctx); // inc x3
        assert_eq!(core.state.lock().regs.ip, 2);
        step(&core, &ctx); // fault and vector in one iteration
        {
            let st = core.state.lock();
            assert_eq!(st.regs.ip, 0x200);
            assert_eq!(st.regs.x[0], 2);
        }
        step(&core, &ctx); // ir mode 1: ip = x[0] - 0
        assert_eq!(core.state.lock().regs.ip, 2);
    }

    #[test]
    fn clock_interrupt_services_through_the_vector() {
        // A NOP, then real code. The NOP steps over while the interrupt
        // stays latched; entry happens at the next non-NOP opcode. The
        // CLOCK vector at 0x100 increments x2 and returns with ir mode 2.
        let (core, ctx) = harness(0x1_0000, &[op::NOP, op::INC, 1]);
        ctx.mem
            .write_u64(u64::from(Interrupt::Clock.id()) * 8, 0x100)
            .unwrap();
        ctx.mem.write(0x100, &[op::INC, 2, op::IR, 2]).unwrap();
        {
            let mut st = core.state.lock();
            st.regs.flg.insert(Flags::INT_ENABLE);
        }
        core.irq.push(Interrupt::Clock);

        step(&core, &ctx); // NOP sees the interrupt, steps to ip 1
        assert_eq!(core.state.lock().regs.ip, 1);
        step(&core, &ctx); // non-NOP opcode: vector to the handler
        {
            let st = core.state.lock();
            assert_eq!(st.regs.ip, 0x100);
            assert_eq!(st.regs.x[0], 1);
        }
        step(&core, &ctx); // inc x2
        assert_eq!(core.state.lock().regs.x[2], 1);
        step(&core, &ctx); // ir mode 2: back to saved ip with flags restored
        {
            let st = core.state.lock();
            assert_eq!(st.regs.ip, 1);
            assert!(st.regs.flg.contains(Flags::INT_ENABLE));
        }
        step(&core, &ctx); // the preempted inc finally executes
        // x1 still holds the flags saved at entry, plus the increment.
        assert_eq!(core.state.lock().regs.x[1], Flags::INT_ENABLE.bits() + 1);
    }
}
