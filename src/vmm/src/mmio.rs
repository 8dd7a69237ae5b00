// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::fault::Fault;
use crate::machine::{Framebuffer, FB_SIZE};

/// A memory-mapped device claiming an inclusive `[start, end]` address range.
///
/// Dispatch is at 32-bit granularity only; byte accesses never reach a
/// device (the framebuffer byte path is special-cased by the accessors).
/// Callbacks run with the machine's shared lock held and must not call back
/// into the memory accessors.
pub trait MmioDevice: Send + Sync {
    fn start(&self) -> u32;
    fn end(&self) -> u32;
    fn read32(&self, addr: u32) -> Result<u32, Fault>;
    fn write32(&self, addr: u32, value: u32) -> Result<(), Fault>;
}

/// Ordered device table; the first device whose range contains the address
/// wins, so earlier registrations shadow later ones.
pub(crate) struct MmioTable {
    devices: Vec<Box<dyn MmioDevice>>,
}

impl MmioTable {
    pub(crate) fn new() -> Self {
        MmioTable { devices: Vec::new() }
    }

    pub(crate) fn register(&mut self, dev: Box<dyn MmioDevice>) {
        log::info!(
            "registered MMIO device {} at {:#010x}..={:#010x}",
            self.devices.len(),
            dev.start(),
            dev.end()
        );
        self.devices.push(dev);
    }

    pub(crate) fn find(&self, addr: u32) -> Option<&dyn MmioDevice> {
        self.devices
            .iter()
            .find(|dev| addr >= dev.start() && addr <= dev.end())
            .map(|dev| dev.as_ref())
    }
}

/// One mapping of the framebuffer into the guest address space.
///
/// The framebuffer is visible both at `memory_size` and at a fixed legacy
/// base; both windows share the same pixel storage, so a write through one
/// alias is immediately visible through the other.
pub(crate) struct FbWindow {
    base: u32,
    fb: Arc<Framebuffer>,
}

impl FbWindow {
    pub(crate) fn new(base: u32, fb: Arc<Framebuffer>) -> Self {
        FbWindow { base, fb }
    }
}

impl MmioDevice for FbWindow {
    fn start(&self) -> u32 {
        self.base
    }

    fn end(&self) -> u32 {
        self.base + FB_SIZE - 1
    }

    fn read32(&self, addr: u32) -> Result<u32, Fault> {
        Ok(self.fb.read32(((addr - self.base) / 4) as usize))
    }

    fn write32(&self, addr: u32, value: u32) -> Result<(), Fault> {
        self.fb.write32(((addr - self.base) / 4) as usize, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        start: u32,
        end: u32,
        tag: u32,
    }

    impl MmioDevice for Stub {
        fn start(&self) -> u32 {
            self.start
        }
        fn end(&self) -> u32 {
            self.end
        }
        fn read32(&self, _addr: u32) -> Result<u32, Fault> {
            Ok(self.tag)
        }
        fn write32(&self, _addr: u32, _value: u32) -> Result<(), Fault> {
            Ok(())
        }
    }

    #[test]
    fn first_matching_range_wins() {
        let mut table = MmioTable::new();
        table.register(Box::new(Stub { start: 0x1000, end: 0x1fff, tag: 1 }));
        table.register(Box::new(Stub { start: 0x1800, end: 0x2fff, tag: 2 }));

        assert_eq!(table.find(0x1800).unwrap().read32(0x1800).unwrap(), 1);
        assert_eq!(table.find(0x2000).unwrap().read32(0x2000).unwrap(), 2);
        assert!(table.find(0x3000).is_none());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let mut table = MmioTable::new();
        table.register(Box::new(Stub { start: 0x100, end: 0x11b, tag: 7 }));
        assert!(table.find(0x0ff).is_none());
        assert!(table.find(0x100).is_some());
        assert!(table.find(0x11b).is_some());
        assert!(table.find(0x11c).is_none());
    }
}
