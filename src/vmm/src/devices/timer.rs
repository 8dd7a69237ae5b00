// SPDX-License-Identifier: Apache-2.0

//! Read-only time MMIO block.
//!
//! Seven 32-bit registers expose host realtime, host monotonic and
//! boot-relative time as 64-bit nanosecond counters split into halves.
//! Reading a low half latches the full value; the adjacent high half
//! returns the latched upper word, so `low` then `high` reads a coherent
//! 64-bit timestamp.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fault::Fault;
use crate::machine::{Power, TIME_WINDOW};
use crate::mmio::MmioDevice;

pub(crate) fn host_realtime_ns() -> u64 {
    clock_ns(libc::CLOCK_REALTIME)
}

pub(crate) fn host_monotonic_ns() -> u64 {
    clock_ns(libc::CLOCK_MONOTONIC)
}

fn clock_ns(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // Safe: `ts` is a valid out-pointer for the duration of the call.
    unsafe { libc::clock_gettime(clock, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub struct Timer {
    base: u32,
    start_monotonic_ns: u64,
    latched_realtime: AtomicU64,
    latched_monotonic: AtomicU64,
    latched_boottime: AtomicU64,
    power: Arc<Power>,
}

impl Timer {
    pub(crate) fn new(base: u32, power: Arc<Power>) -> Self {
        Timer {
            base,
            start_monotonic_ns: host_monotonic_ns(),
            latched_realtime: AtomicU64::new(0),
            latched_monotonic: AtomicU64::new(0),
            latched_boottime: AtomicU64::new(0),
            power,
        }
    }
}

impl MmioDevice for Timer {
    fn start(&self) -> u32 {
        self.base
    }

    fn end(&self) -> u32 {
        self.base + TIME_WINDOW - 1
    }

    fn read32(&self, addr: u32) -> Result<u32, Fault> {
        let value = match addr - self.base {
            // Control: presence marker.
            0x00 => 1,
            0x04 => {
                let now = host_realtime_ns();
                self.latched_realtime.store(now, Ordering::Relaxed);
                now as u32
            }
            0x08 => (self.latched_realtime.load(Ordering::Relaxed) >> 32) as u32,
            0x0c => {
                let now = host_monotonic_ns();
                self.latched_monotonic.store(now, Ordering::Relaxed);
                now as u32
            }
            0x10 => (self.latched_monotonic.load(Ordering::Relaxed) >> 32) as u32,
            0x14 => {
                let now = host_monotonic_ns() - self.start_monotonic_ns;
                self.latched_boottime.store(now, Ordering::Relaxed);
                now as u32
            }
            0x18 => (self.latched_boottime.load(Ordering::Relaxed) >> 32) as u32,
            offset => {
                log::warn!("unknown time register offset {:#04x}", offset);
                0
            }
        };
        Ok(value)
    }

    fn write32(&self, addr: u32, _value: u32) -> Result<(), Fault> {
        log::error!(
            "attempted to write to read-only time MMIO at {:#010x}",
            addr
        );
        self.power.halt();
        Ok(())
    }
}
