// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Which guest stack an overflow/underflow happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Call,
    Data,
    Isr,
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackKind::Call => write!(f, "call"),
            StackKind::Data => write!(f, "data"),
            StackKind::Isr => write!(f, "interrupt"),
        }
    }
}

/// A machine fault.
///
/// Faults are fatal to the whole VM: the offending core stops executing,
/// prints a diagnostic dump and raises the machine-wide `faulted` flag, which
/// drains every other thread. Guest-recoverable conditions (divide by zero)
/// are delivered as interrupts instead and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("{op} out of bounds: {addr:#010x}")]
    OutOfBounds { op: &'static str, addr: u32 },

    #[error("{op} unaligned address: {addr:#010x}")]
    Unaligned { op: &'static str, addr: u32 },

    #[error("{op} does not support MMIO addr: {addr:#010x}")]
    AtomicOnMmio { op: &'static str, addr: u32 },

    #[error("{0} stack overflow")]
    StackOverflow(StackKind),

    #[error("{0} stack underflow")]
    StackUnderflow(StackKind),

    #[error("IP out of bounds: {0:#010x}")]
    IpOutOfBounds(u32),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("invalid register operand r{0}")]
    BadRegister(u8),

    #[error("{op} invalid IO port {port}")]
    BadIoPort { op: &'static str, port: u32 },

    #[error("invalid interrupt vector {0}")]
    BadVector(u32),

    #[error("invalid target core {0}")]
    BadCore(u32),
}
