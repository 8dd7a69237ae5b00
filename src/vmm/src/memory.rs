// SPDX-License-Identifier: Apache-2.0

//! Guest memory accessors.
//!
//! Byte accesses service the framebuffer windows and RAM only; 32-bit
//! accesses consult the MMIO table first. 64-bit accesses are composed from
//! two 32-bit halves, so MMIO dispatch happens per half. All non-atomic
//! accessors serialize on the machine's shared lock; the atomic family
//! bypasses it and operates directly on aligned RAM cells.

use std::sync::atomic::{AtomicU32, Ordering};

use vm_memory::{Bytes, GuestAddress, GuestMemory};

use crate::fault::Fault;
use crate::machine::{Machine, FB_LEGACY_BASE, FB_SIZE};

impl Machine {
    fn in_ram(&self, addr: u32, len: u32) -> bool {
        addr as u64 + len as u64 <= self.mem_size() as u64
    }

    /// Offset into framebuffer storage when `addr` falls inside either the
    /// primary window (at `memory_size`) or the legacy alias.
    fn fb_offset(&self, addr: u32) -> Option<u32> {
        let addr = addr as u64;
        let primary = self.mem_size() as u64;
        if addr >= primary && addr < primary + FB_SIZE as u64 {
            return Some((addr - primary) as u32);
        }
        let legacy = FB_LEGACY_BASE as u64;
        if addr >= legacy && addr < legacy + FB_SIZE as u64 {
            return Some((addr - legacy) as u32);
        }
        None
    }

    pub fn read8(&self, addr: u32) -> Result<u8, Fault> {
        let _shared = self.shared.lock().unwrap();
        if let Some(offset) = self.fb_offset(addr) {
            return Ok(self.framebuffer().read8(offset));
        }
        if !self.in_ram(addr, 1) {
            return Err(Fault::OutOfBounds { op: "READ8", addr });
        }
        self.ram
            .read_obj::<u8>(GuestAddress(addr as u64))
            .map_err(|_| Fault::OutOfBounds { op: "READ8", addr })
    }

    pub fn write8(&self, addr: u32, value: u8) -> Result<(), Fault> {
        let _shared = self.shared.lock().unwrap();
        if let Some(offset) = self.fb_offset(addr) {
            self.framebuffer().write8(offset, value);
            return Ok(());
        }
        if !self.in_ram(addr, 1) {
            return Err(Fault::OutOfBounds { op: "WRITE8", addr });
        }
        self.ram
            .write_obj::<u8>(value, GuestAddress(addr as u64))
            .map_err(|_| Fault::OutOfBounds { op: "WRITE8", addr })
    }

    pub fn read32(&self, addr: u32) -> Result<u32, Fault> {
        let _shared = self.shared.lock().unwrap();
        if addr % 4 != 0 {
            return Err(Fault::Unaligned { op: "READ32", addr });
        }
        if let Some(dev) = self.mmio.find(addr) {
            return dev.read32(addr);
        }
        if !self.in_ram(addr, 4) {
            return Err(Fault::OutOfBounds { op: "READ32", addr });
        }
        self.ram
            .read_obj::<u32>(GuestAddress(addr as u64))
            .map_err(|_| Fault::OutOfBounds { op: "READ32", addr })
    }

    pub fn write32(&self, addr: u32, value: u32) -> Result<(), Fault> {
        let _shared = self.shared.lock().unwrap();
        if addr % 4 != 0 {
            return Err(Fault::Unaligned { op: "WRITE32", addr });
        }
        if let Some(dev) = self.mmio.find(addr) {
            return dev.write32(addr, value);
        }
        if !self.in_ram(addr, 4) {
            return Err(Fault::OutOfBounds { op: "WRITE32", addr });
        }
        self.ram
            .write_obj::<u32>(value, GuestAddress(addr as u64))
            .map_err(|_| Fault::OutOfBounds { op: "WRITE32", addr })
    }

    pub fn read64(&self, addr: u32) -> Result<u64, Fault> {
        if addr % 8 != 0 {
            return Err(Fault::Unaligned { op: "READ64", addr });
        }
        let lo = self.read32(addr)? as u64;
        let hi = self.read32(addr + 4)? as u64;
        Ok(lo | (hi << 32))
    }

    pub fn write64(&self, addr: u32, value: u64) -> Result<(), Fault> {
        if addr % 8 != 0 {
            return Err(Fault::Unaligned { op: "WRITE64", addr });
        }
        self.write32(addr, value as u32)?;
        self.write32(addr + 4, (value >> 32) as u32)
    }

    /// Aligned RAM cell viewed as an atomic. The cell must not be claimed
    /// by an MMIO device; hardware atomicity of the aligned 32-bit cell is
    /// what guest synchronization is built on.
    fn atomic_cell(&self, addr: u32, op: &'static str) -> Result<&AtomicU32, Fault> {
        if addr % 4 != 0 {
            return Err(Fault::Unaligned { op, addr });
        }
        if !self.in_ram(addr, 4) {
            return Err(Fault::OutOfBounds { op, addr });
        }
        if self.mmio.find(addr).is_some() {
            return Err(Fault::AtomicOnMmio { op, addr });
        }
        let host = self
            .ram
            .get_host_address(GuestAddress(addr as u64))
            .map_err(|_| Fault::OutOfBounds { op, addr })?;
        // Safe: the mapping lives as long as `self`, the address is in
        // bounds and 4-byte aligned, and all racing accesses to the cell go
        // through `AtomicU32`.
        Ok(unsafe { &*(host as *const AtomicU32) })
    }

    pub fn atomic_load32_acquire(&self, addr: u32) -> Result<u32, Fault> {
        Ok(self.atomic_cell(addr, "LDAR")?.load(Ordering::Acquire))
    }

    pub fn atomic_store32_release(&self, addr: u32, value: u32) -> Result<(), Fault> {
        self.atomic_cell(addr, "STLR")?.store(value, Ordering::Release);
        Ok(())
    }

    pub fn atomic_exchange32(&self, addr: u32, value: u32) -> Result<u32, Fault> {
        Ok(self.atomic_cell(addr, "XCHG")?.swap(value, Ordering::SeqCst))
    }

    pub fn atomic_fetch_add32(&self, addr: u32, value: u32) -> Result<u32, Fault> {
        Ok(self
            .atomic_cell(addr, "XADD")?
            .fetch_add(value, Ordering::SeqCst))
    }

    /// Returns the observed prior value and whether the swap happened.
    pub fn atomic_compare_exchange32(
        &self,
        addr: u32,
        expected: u32,
        desired: u32,
    ) -> Result<(u32, bool), Fault> {
        let cell = self.atomic_cell(addr, "CAS")?;
        match cell.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) => Ok((prev, true)),
            Err(observed) => Ok((observed, false)),
        }
    }

    /// Disk DMA into RAM. Bounds are validated by the caller; the copy
    /// holds the shared lock so it is ordered against guest accesses.
    pub(crate) fn dma_write(&self, addr: u32, buf: &[u8]) -> Result<(), Fault> {
        let _shared = self.shared.lock().unwrap();
        self.ram
            .write_slice(buf, GuestAddress(addr as u64))
            .map_err(|_| Fault::OutOfBounds { op: "DMA WRITE", addr })
    }

    /// Disk DMA out of RAM, under the shared lock.
    pub(crate) fn dma_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), Fault> {
        let _shared = self.shared.lock().unwrap();
        self.ram
            .read_slice(buf, GuestAddress(addr as u64))
            .map_err(|_| Fault::OutOfBounds { op: "DMA READ", addr })
    }

    /// Lock-free raw RAM peek for diagnostics (fault dumps, debugger
    /// windows). Never dispatches MMIO.
    pub(crate) fn peek8(&self, addr: u32) -> Option<u8> {
        if !self.in_ram(addr, 1) {
            return None;
        }
        self.ram.read_obj::<u8>(GuestAddress(addr as u64)).ok()
    }

    pub(crate) fn peek32(&self, addr: u32) -> Option<u32> {
        if !self.in_ram(addr, 4) {
            return None;
        }
        self.ram.read_obj::<u32>(GuestAddress(addr as u64)).ok()
    }

    pub(crate) fn peek64(&self, addr: u32) -> Option<u64> {
        if !self.in_ram(addr, 8) {
            return None;
        }
        self.ram.read_obj::<u64>(GuestAddress(addr as u64)).ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::fault::Fault;
    use crate::machine::{FB_LEGACY_BASE, TIME_BASE};
    use crate::testutil::bare_machine;

    #[test]
    fn ram_round_trips_little_endian() {
        let m = bare_machine(1);
        m.write32(0x3000, 0x1122_3344).unwrap();
        assert_eq!(m.read32(0x3000).unwrap(), 0x1122_3344);
        assert_eq!(m.read8(0x3000).unwrap(), 0x44);
        assert_eq!(m.read8(0x3003).unwrap(), 0x11);

        m.write64(0x3008, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(m.read64(0x3008).unwrap(), 0xdead_beef_cafe_f00d);
        assert_eq!(m.read32(0x3008).unwrap(), 0xcafe_f00d);
        assert_eq!(m.read32(0x300c).unwrap(), 0xdead_beef);
    }

    #[test]
    fn out_of_bounds_access_faults() {
        let m = bare_machine(1);
        let oob = m.mem_size() + FB_SIZE_PAD;
        assert!(matches!(
            m.read8(oob),
            Err(Fault::OutOfBounds { op: "READ8", .. })
        ));
        assert!(matches!(
            m.write32(oob, 0),
            Err(Fault::OutOfBounds { op: "WRITE32", .. })
        ));
        // The last byte and the last aligned word of RAM are reachable.
        assert!(m.read8(m.mem_size() - 1).is_ok());
        assert!(m.read32(m.mem_size() - 4).is_ok());
    }

    // Probe addresses past both framebuffer windows.
    const FB_SIZE_PAD: u32 = crate::machine::FB_SIZE + 4;

    #[test]
    fn unaligned_wide_access_faults() {
        let m = bare_machine(1);
        assert!(matches!(
            m.read32(0x3001),
            Err(Fault::Unaligned { op: "READ32", .. })
        ));
        assert!(matches!(
            m.write32(0x3002, 0),
            Err(Fault::Unaligned { op: "WRITE32", .. })
        ));
        assert!(matches!(
            m.read64(0x3004),
            Err(Fault::Unaligned { op: "READ64", .. })
        ));
    }

    #[test]
    fn framebuffer_windows_alias_the_same_storage() {
        let m = bare_machine(1);
        let primary = m.mem_size();

        m.write32(primary, 0x00ff_00ff).unwrap();
        assert_eq!(m.read32(FB_LEGACY_BASE).unwrap(), 0x00ff_00ff);

        // Byte writes through the legacy alias show up in the primary
        // window as well.
        m.write8(FB_LEGACY_BASE + 1, 0xab).unwrap();
        assert_eq!(m.read32(primary).unwrap(), 0x00ff_abff);
        assert_eq!(m.read8(primary + 1).unwrap(), 0xab);
    }

    #[test]
    fn atomics_reject_mmio_and_misalignment() {
        let m = bare_machine(1);
        assert!(matches!(
            m.atomic_fetch_add32(TIME_BASE, 1),
            Err(Fault::AtomicOnMmio { op: "XADD", .. })
        ));
        assert!(matches!(
            m.atomic_load32_acquire(0x3001),
            Err(Fault::Unaligned { op: "LDAR", .. })
        ));
        assert!(matches!(
            m.atomic_store32_release(m.mem_size(), 0),
            Err(_)
        ));
    }

    #[test]
    fn atomic_ops_observe_each_other() {
        let m = bare_machine(1);
        m.atomic_store32_release(0x5000, 7).unwrap();
        assert_eq!(m.atomic_load32_acquire(0x5000).unwrap(), 7);
        assert_eq!(m.atomic_fetch_add32(0x5000, 3).unwrap(), 7);
        assert_eq!(m.atomic_exchange32(0x5000, 100).unwrap(), 10);

        assert_eq!(
            m.atomic_compare_exchange32(0x5000, 100, 200).unwrap(),
            (100, true)
        );
        assert_eq!(
            m.atomic_compare_exchange32(0x5000, 100, 300).unwrap(),
            (200, false)
        );
        // Plain reads see the atomically stored value.
        assert_eq!(m.read32(0x5000).unwrap(), 200);
    }

    #[test]
    fn timer_window_shadows_ram_for_wide_reads() {
        let m = bare_machine(1);
        // Control register reads as 1 even though the RAM underneath is 0.
        assert_eq!(m.read32(TIME_BASE).unwrap(), 1);
        // Byte reads bypass MMIO and see the RAM underneath.
        assert_eq!(m.read8(TIME_BASE).unwrap(), 0);
    }
}
