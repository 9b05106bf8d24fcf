//! Privileged system instructions: flag toggles and port I/O.

use super::{low, user_mode_fault};
use crate::cpu::{CoreEnv, CoreState, Flags};
use crate::io::IoPlane;
use crate::irq::Interrupt;

/// Enable interrupts. Privileged.
pub fn ei(_inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    cpu.regs.flg.insert(Flags::INT_ENABLE);
    1
}

/// Disable interrupts. Privileged.
pub fn di(_inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    cpu.regs.flg.remove(Flags::INT_ENABLE);
    1
}

/// Enable paging. Privileged.
pub fn ep(_inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    cpu.regs.flg.insert(Flags::PAGING);
    1
}

/// Disable paging. Privileged.
pub fn dp(_inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    cpu.regs.flg.remove(Flags::PAGING);
    1
}

/// `in`: read the next byte from a port's input ring into a register.
/// Privileged. Byte 1 is the port, byte 2's low nibble the register; an
/// empty ring reads as zero.
pub fn input(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    let port = inst[1];
    if !IoPlane::valid_port(port) {
        env.irq.raise(Interrupt::InvalidIoPort);
        return 0;
    }
    cpu.regs.x[low(inst[2])] = u64::from(env.io.read_input(port).unwrap_or(0));
    3
}

/// `out`: append a register's low byte to a port's output ring.
/// Privileged. A full ring drops the byte.
pub fn output(inst: &[u8], cpu: &mut CoreState, env: &CoreEnv<'_>) -> u64 {
    if user_mode_fault(cpu, env) {
        return 0;
    }
    let port = inst[1];
    if !IoPlane::valid_port(port) {
        env.irq.raise(Interrupt::InvalidIoPort);
        return 0;
    }
    env.io.write_output(port, cpu.regs.x[low(inst[2])] as u8);
    3
}
