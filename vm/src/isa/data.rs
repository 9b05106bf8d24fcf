//! Data movement: immediates, memory, the general move, and the
//! special-register bank.

use super::{high, imm, load_quad, low, store_quad, user_mode_fault};
use crate::cpu::{CoreEnv, CoreState};

/// Load immediate. High nibble names the destination, low nibble the
/// width: 0 is one byte, 1 two, 2 four, anything else eight.
pub fn ldi(inst: &[u8], cpu: &mut CoreState, _env: &CoreEnv<'_>) -> u64 {
    let size = match low(inst[1]) {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 8,
    };
    cpu.regs.x[high(inst[1])] = imm(inst, 2, size);
    size as u64 + 2
}

/// Load the 8 bytes addressed by the source register into the target.
pub fn ldm(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    let addr = cpu.regs.x[low(inst[1])];
    match load_quad(cpu, env, addr) {
        Some(v) => {
            cpu.regs.x[high(inst[1])] = v;
            2
        }
        None => 0,
    }
}

/// Store the source register's 8 bytes at the address in the target
/// register. The address lives in the *target* nibble; this mirrors the
/// wire contract, not conventional RISC operand order.
pub fn stm(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    let addr = cpu.regs.x[high(inst[1])];
    let value = cpu.regs.x[low(inst[1])];
    match store_quad(cpu, env, addr, value) {
        Some(()) => 2,
        None => 0,
    }
}

/// General move. Byte 1 selects the addressing of each side (bit 0:
/// destination is memory through the target register; bit 1: source is
/// memory through the source register); byte 2 packs the registers.
/// Memory operands are 8 bytes.
pub fn mv(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    let modes = inst[1];
    let src = low(inst[2]);
    let tar = high(inst[2]);

    let value = if modes & 2 != 0 {
        match load_quad(cpu, env, cpu.regs.x[src]) {
            Some(v) => v,
            None => return 0,
        }
    } else {
        cpu.regs.x[src]
    };

    if modes & 1 != 0 {
        match store_quad(cpu, env, cpu.regs.x[tar], value) {
            Some(()) => {}
            None => return 0,
        }
    } else {
        cpu.regs.x[tar] = value;
    }
    3
}

/// Load the interrupt vector table base. Privileged.
pub fn livt(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    cpu.regs.ivt = cpu.regs.x[low(inst[1])];
    2
}

/// Load the kernel page-table root. Privileged; invalidates the address
/// cache and the IP buffer.
pub fn lkpt(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    cpu.regs.kpt = cpu.regs.x[low(inst[1])];
    cpu.am_need_flush = true;
    cpu.ipbuff_need_flush = true;
    2
}

/// Load the user page-table root. Privileged; invalidates like `lkpt`.
pub fn lupt(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    cpu.regs.upt = cpu.regs.x[low(inst[1])];
    cpu.am_need_flush = true;
    cpu.ipbuff_need_flush = true;
    2
}

/// Read a special register into a general one. Privileged. Low nibble
/// indexes the bank, high nibble names the general register; indices
/// outside the bank read nothing.
pub fn lsrg(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    if let Some(v) = cpu.regs.special(low(inst[1])) {
        cpu.regs.x[high(inst[1])] = v;
    }
    2
}

/// Write a special register from a general one. Privileged. Writing a
/// page-table root invalidates the translation caches.
pub fn ssrg(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    let value = cpu.regs.x[high(inst[1])];
    if let Some(root_written) = cpu.regs.set_special(low(inst[1]), value) {
        if root_written {
            cpu.am_need_flush = true;
            cpu.ipbuff_need_flush = true;
        }
    }
    2
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{exec, Fixture};
    use super::*;
    use crate::cpu::Flags;
    use crate::irq::Interrupt;

    #[test]
    fn ldi_widths_round_trip() {
        let mut f = Fixture::new(64);
        // 1-byte immediate into x0.
        assert_eq!(exec(&mut f, ldi, &[21, 0x00, 0x2a]), 3);
        assert_eq!(f.cpu.regs.x[0], 0x2a);
        // 2-byte into x3.
        assert_eq!(exec(&mut f, ldi, &[21, 0x31, 0xcd, 0xab]), 4);
        assert_eq!(f.cpu.regs.x[3], 0xabcd);
        // 4-byte into x5.
        assert_eq!(exec(&mut f, ldi, &[21, 0x52, 0x78, 0x56, 0x34, 0x12]), 6);
        assert_eq!(f.cpu.regs.x[5], 0x1234_5678);
        // 8-byte into x7.
        assert_eq!(
            exec(&mut f, ldi, &[21, 0x73, 1, 2, 3, 4, 5, 6, 7, 8]),
            10
        );
        assert_eq!(f.cpu.regs.x[7], 0x0807_0605_0403_0201);
    }

    #[test]
    fn stm_then_ldm_round_trips() {
        let mut f = Fixture::new(0x1000);
        f.cpu.regs.x[2] = 0x1122_3344_5566_7788; // value
        f.cpu.regs.x[3] = 0x100; // address
        // stm: value in x2 (low nibble), address in x3 (high nibble).
        assert_eq!(exec(&mut f, stm, &[23, 0x32]), 2);
        assert_eq!(f.mem.read_u64(0x100).unwrap(), 0x1122_3344_5566_7788);

        // ldm into x4: address in x3 (low), destination x4 (high).
        assert_eq!(exec(&mut f, ldm, &[22, 0x43]), 2);
        assert_eq!(f.cpu.regs.x[4], 0x1122_3344_5566_7788);
    }

    #[test]
    fn failed_translation_leaves_no_side_effects() {
        let mut f = Fixture::new(0x100);
        f.cpu.regs.x[2] = 0xbeef;
        f.cpu.regs.x[3] = 0x4000; // out of range
        assert_eq!(exec(&mut f, stm, &[23, 0x32]), 0);
        assert_eq!(f.irq.pop(), Some(Interrupt::InvalidAddress));

        f.cpu.regs.x[4] = 0x55;
        f.cpu.regs.x[1] = 0x4000;
        assert_eq!(exec(&mut f, ldm, &[22, 0x41]), 0);
        assert_eq!(f.cpu.regs.x[4], 0x55);
        assert_eq!(f.irq.pop(), Some(Interrupt::InvalidAddress));
    }

    #[test]
    fn mv_covers_all_four_addressing_modes() {
        let mut f = Fixture::new(0x1000);
        // reg -> reg
        f.cpu.regs.x[1] = 0xaa;
        assert_eq!(exec(&mut f, mv, &[28, 0, 0x21]), 3);
        assert_eq!(f.cpu.regs.x[2], 0xaa);

        // reg -> mem
        f.cpu.regs.x[3] = 0x200;
        assert_eq!(exec(&mut f, mv, &[28, 1, 0x31]), 3);
        assert_eq!(f.mem.read_u64(0x200).unwrap(), 0xaa);

        // mem -> reg
        f.mem.write_u64(0x300, 0xbb).unwrap();
        f.cpu.regs.x[4] = 0x300;
        assert_eq!(exec(&mut f, mv, &[28, 2, 0x54]), 3);
        assert_eq!(f.cpu.regs.x[5], 0xbb);

        // mem -> mem
        f.cpu.regs.x[6] = 0x400;
        assert_eq!(exec(&mut f, mv, &[28, 3, 0x64]), 3);
        assert_eq!(f.mem.read_u64(0x400).unwrap(), 0xbb);
    }

    #[test]
    fn mv_memory_fault_aborts_without_writing() {
        let mut f = Fixture::new(0x100);
        f.cpu.regs.x[1] = 0x9000; // bad source address
        assert_eq!(exec(&mut f, mv, &[28, 2, 0x21]), 0);
        assert_eq!(f.irq.pop(), Some(Interrupt::InvalidAddress));
        assert_eq!(f.cpu.regs.x[2], 0);
    }

    #[test]
    fn page_table_loads_invalidate_caches() {
        let mut f = Fixture::new(64);
        f.cpu.regs.x[1] = 0x4000;
        f.cpu.ipbuff_need_flush = false;

        assert_eq!(exec(&mut f, livt, &[29, 1]), 2);
        assert_eq!(f.cpu.regs.ivt, 0x4000);
        assert!(!f.cpu.am_need_flush);
        assert!(!f.cpu.ipbuff_need_flush);

        assert_eq!(exec(&mut f, lkpt, &[30, 1]), 2);
        assert_eq!(f.cpu.regs.kpt, 0x4000);
        assert!(f.cpu.am_need_flush);
        assert!(f.cpu.ipbuff_need_flush);

        f.cpu.am_need_flush = false;
        f.cpu.ipbuff_need_flush = false;
        assert_eq!(exec(&mut f, lupt, &[31, 1]), 2);
        assert_eq!(f.cpu.regs.upt, 0x4000);
        assert!(f.cpu.am_need_flush);
        assert!(f.cpu.ipbuff_need_flush);
    }

    #[test]
    fn special_bank_read_write() {
        let mut f = Fixture::new(64);
        f.cpu.regs.x[2] = 0x7777;
        // ssrg: write x2 into bank index 6 (ivt).
        assert_eq!(exec(&mut f, ssrg, &[33, 0x26]), 2);
        assert_eq!(f.cpu.regs.ivt, 0x7777);
        assert!(!f.cpu.am_need_flush);

        // Writing kpt through the bank flags the caches.
        assert_eq!(exec(&mut f, ssrg, &[33, 0x24]), 2);
        assert_eq!(f.cpu.regs.kpt, 0x7777);
        assert!(f.cpu.am_need_flush);

        // lsrg: read bank index 4 (kpt) into x9.
        assert_eq!(exec(&mut f, lsrg, &[32, 0x94]), 2);
        assert_eq!(f.cpu.regs.x[9], 0x7777);

        // Out-of-bank indices are no-ops.
        f.cpu.regs.x[9] = 1;
        assert_eq!(exec(&mut f, lsrg, &[32, 0x9a]), 2);
        assert_eq!(f.cpu.regs.x[9], 1);
    }

    #[test]
    fn privileged_data_moves_fault_in_user_mode() {
        let mut f = Fixture::new(64);
        f.cpu.regs.flg.insert(Flags::USER);
        f.cpu.regs.x[1] = 0x4000;
        for handler in [livt, lkpt, lupt, lsrg, ssrg] {
            let before = f.cpu.regs.clone();
            assert_eq!(exec(&mut f, handler, &[0, 0x01]), 0);
            assert_eq!(f.irq.pop(), Some(Interrupt::PermissionDenied));
            assert_eq!(f.cpu.regs, before);
        }
    }
}
