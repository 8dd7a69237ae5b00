// SPDX-License-Identifier: Apache-2.0

//! Interrupt vector table and per-core delivery.
//!
//! The IVT is 256 eight-byte ISR addresses at RAM offset 0; `u64::MAX`
//! marks an uninstalled vector. Delivery happens at instruction
//! boundaries: the lowest pending vector is claimed and entered, one per
//! boundary. A core already inside an ISR never consumes pending bits, so
//! vectors raised during handling are kept for the next opportunity.

use crate::fault::Fault;
use crate::machine::{Machine, IVT_BASE, IVT_ENTRY_SIZE, IVT_SIZE, REG_COUNT};

use super::Vcpu;

/// Raised by `DIV`/`MOD` with a zero divisor, on the offending core.
pub const INT_DIVIDE_BY_ZERO: u32 = 1;
/// Raised by the disk worker on command completion, on core 0.
pub const INT_DISK_COMPLETE: u32 = 2;
/// Raised by host input when the guest enabled RX interrupts, on core 0.
pub const INT_SERIAL: u32 = 3;

/// IVT entry meaning "no handler installed".
pub const IVT_UNINSTALLED: u64 = u64::MAX;

/// The vector number is passed to the ISR in r31.
pub const ISR_ARG_REG: usize = 31;

/// Mark every vector uninstalled.
pub fn init_ivt(machine: &Machine) -> Result<(), Fault> {
    for vector in 0..IVT_SIZE {
        machine.write64(IVT_BASE + vector * IVT_ENTRY_SIZE, IVT_UNINSTALLED)?;
    }
    Ok(())
}

/// Install an ISR address for `vector`.
pub fn register_isr(machine: &Machine, vector: u32, isr_ip: u64) -> Result<(), Fault> {
    if vector >= IVT_SIZE {
        return Err(Fault::BadVector(vector));
    }
    machine.write64(IVT_BASE + vector * IVT_ENTRY_SIZE, isr_ip)
}

/// Instruction-boundary dispatch: deliver at most one pending vector.
pub fn service_pending(machine: &Machine, cpu: &mut Vcpu) -> Result<(), Fault> {
    if cpu.in_interrupt {
        return Ok(());
    }
    if let Some(vector) = machine.pending.claim(cpu.core_id) {
        // An uninstalled vector is dropped silently inside `enter`.
        enter(machine, cpu, vector)?;
    }
    Ok(())
}

/// Interrupt entry. Saves IP, flags and the whole register file on the
/// ISR stack, loads the vector into r31 and jumps to the handler. A
/// nested request or an uninstalled vector is a silent no-op.
pub fn enter(machine: &Machine, cpu: &mut Vcpu, vector: u32) -> Result<(), Fault> {
    if vector >= IVT_SIZE || cpu.in_interrupt {
        return Ok(());
    }
    let isr_ip = machine.read64(IVT_BASE + vector * IVT_ENTRY_SIZE)?;
    if isr_ip == IVT_UNINSTALLED {
        return Ok(());
    }

    cpu.regs[ISR_ARG_REG] = vector;
    cpu.isr_push(machine, cpu.ip as u64)?;
    cpu.isr_push(machine, cpu.flags as u64)?;
    for index in 0..REG_COUNT {
        cpu.isr_push(machine, cpu.regs[index] as u64)?;
    }

    cpu.ip = isr_ip as u32;
    cpu.in_interrupt = true;
    Ok(())
}

/// `IRET`: unwind the frame pushed by [`enter`]. Outside an ISR this is a
/// no-op.
pub fn iret(machine: &Machine, cpu: &mut Vcpu) -> Result<(), Fault> {
    if !cpu.in_interrupt {
        return Ok(());
    }
    for index in (0..REG_COUNT).rev() {
        cpu.regs[index] = cpu.isr_pop(machine)? as u32;
    }
    cpu.flags = cpu.isr_pop(machine)? as u32;
    cpu.ip = cpu.isr_pop(machine)? as u32;
    cpu.in_interrupt = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::ISR_STACK_SIZE;
    use crate::testutil::{bare_machine, bsp};

    #[test]
    fn fresh_ivt_is_fully_uninstalled() {
        let m = bare_machine(1);
        for vector in [0, 1, 128, 255] {
            assert_eq!(
                m.read64(IVT_BASE + vector * IVT_ENTRY_SIZE).unwrap(),
                IVT_UNINSTALLED
            );
        }
    }

    #[test]
    fn register_isr_rejects_bad_vectors() {
        let m = bare_machine(1);
        assert!(register_isr(&m, 256, 0x2100).is_err());
        register_isr(&m, 255, 0x2100).unwrap();
        assert_eq!(m.read64(IVT_BASE + 255 * 8).unwrap(), 0x2100);
    }

    #[test]
    fn entry_saves_state_and_iret_restores_it() {
        let m = bare_machine(1);
        let mut cpu = bsp(&m);
        register_isr(&m, 9, 0x4000).unwrap();

        cpu.ip = 0x2100;
        cpu.flags = 0x18;
        cpu.regs[0] = 111;
        cpu.regs[31] = 222;

        enter(&m, &mut cpu, 9).unwrap();
        assert!(cpu.in_interrupt);
        assert_eq!(cpu.ip, 0x4000);
        assert_eq!(cpu.regs[ISR_ARG_REG], 9);
        assert_eq!(cpu.isp, ISR_STACK_SIZE - 34);

        // Handler clobbers everything it can.
        cpu.regs = [0xdead_beef; REG_COUNT];
        cpu.flags = 0;

        iret(&m, &mut cpu).unwrap();
        assert!(!cpu.in_interrupt);
        assert_eq!(cpu.ip, 0x2100);
        assert_eq!(cpu.flags, 0x18);
        assert_eq!(cpu.regs[0], 111);
        // r31 is loaded with the vector before the frame is saved, so the
        // caller's r31 is gone: the frame restores the vector number.
        assert_eq!(cpu.regs[31], 9);
        assert_eq!(cpu.isp, ISR_STACK_SIZE);
    }

    #[test]
    fn uninstalled_vector_is_dropped_silently() {
        let m = bare_machine(1);
        let mut cpu = bsp(&m);
        cpu.ip = 0x2100;
        m.trigger_interrupt(7);
        service_pending(&m, &mut cpu).unwrap();
        assert!(!cpu.in_interrupt);
        assert_eq!(cpu.ip, 0x2100);
        // The bit was consumed even though nothing was entered.
        assert!(!m.pending.is_pending(0, 7));
    }

    #[test]
    fn pending_bits_survive_while_inside_an_isr() {
        let m = bare_machine(1);
        let mut cpu = bsp(&m);
        register_isr(&m, 4, 0x4000).unwrap();
        register_isr(&m, 5, 0x4800).unwrap();

        m.trigger_interrupt(4);
        service_pending(&m, &mut cpu).unwrap();
        assert!(cpu.in_interrupt);

        // A vector raised during handling stays pending.
        m.trigger_interrupt(5);
        service_pending(&m, &mut cpu).unwrap();
        assert!(m.pending.is_pending(0, 5));

        iret(&m, &mut cpu).unwrap();
        service_pending(&m, &mut cpu).unwrap();
        assert!(cpu.in_interrupt);
        assert_eq!(cpu.ip, 0x4800);
        assert!(!m.pending.is_pending(0, 5));
    }

    #[test]
    fn lowest_vector_wins_one_per_boundary() {
        let m = bare_machine(1);
        let mut cpu = bsp(&m);
        register_isr(&m, 3, 0x4000).unwrap();
        register_isr(&m, 10, 0x4800).unwrap();

        m.trigger_interrupt(10);
        m.trigger_interrupt(3);
        service_pending(&m, &mut cpu).unwrap();
        assert_eq!(cpu.ip, 0x4000);
        assert!(m.pending.is_pending(0, 10));
    }

    #[test]
    fn nested_entry_is_refused() {
        let m = bare_machine(1);
        let mut cpu = bsp(&m);
        register_isr(&m, 1, 0x4000).unwrap();
        enter(&m, &mut cpu, 1).unwrap();
        let depth = cpu.isp;
        enter(&m, &mut cpu, 1).unwrap();
        // No second frame was pushed.
        assert_eq!(cpu.isp, depth);
        assert_eq!(cpu.ip, 0x4000);
    }
}
