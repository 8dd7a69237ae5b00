// SPDX-License-Identifier: Apache-2.0

//! Machine-wide state shared by every core, the disk worker and the display
//! thread: guest RAM, the framebuffer, the MMIO table, the port space and
//! the interrupt plumbing.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::devices::disk::Disk;
use crate::devices::serial::Serial;
use crate::devices::timer::Timer;
use crate::image::LoadedImage;
use crate::mmio::{FbWindow, MmioTable};
use crate::Error;

pub const FB_WIDTH: usize = 640;
pub const FB_HEIGHT: usize = 480;
pub const FB_BPP: usize = 4;
pub const FB_SIZE: u32 = (FB_WIDTH * FB_HEIGHT * FB_BPP) as u32;
/// Fixed alias of the framebuffer kept for guests built against the old map.
pub const FB_LEGACY_BASE: u32 = 0x0062_0000;

pub const REG_COUNT: usize = 32;

pub const IVT_BASE: u32 = 0;
pub const IVT_SIZE: u32 = 256;
pub const IVT_ENTRY_SIZE: u32 = 8;

pub const CALL_STACK_SIZE: u32 = 256;
pub const DATA_STACK_SIZE: u32 = 256;
pub const ISR_STACK_SIZE: u32 = 256;

/// Low memory map used by single-core machines. Multi-core machines carve
/// per-core stacks from the top of RAM instead (see [`Machine::stack_bases`]).
pub const CALL_STACK_BASE: u32 = IVT_BASE + IVT_SIZE * IVT_ENTRY_SIZE;
pub const DATA_STACK_BASE: u32 = CALL_STACK_BASE + CALL_STACK_SIZE * 8;
pub const ISR_STACK_BASE: u32 = DATA_STACK_BASE + DATA_STACK_SIZE * 8;
pub const TIME_BASE: u32 = ISR_STACK_BASE + ISR_STACK_SIZE * 8;
/// The time register file is seven 32-bit registers.
pub const TIME_WINDOW: u32 = 28;
/// Default program base, rounded up past the time window so instruction
/// fetch stays 8-byte aligned.
pub const PROGRAM_BASE: u32 = (TIME_BASE + TIME_WINDOW + 7) & !7;

/// Bytes of RAM one core's three stacks occupy. Every stack gets 8-byte
/// slots; the data stack only writes 4-byte cells but keeps the same pitch.
pub const STACK_FOOTPRINT: u32 = (CALL_STACK_SIZE + DATA_STACK_SIZE + ISR_STACK_SIZE) * 8;

pub const DEFAULT_MEM_SIZE: u32 = 4 * 1024 * 1024;
pub const MAX_CORES: usize = 64;

/// 32-bit pixel store shared with the display thread.
///
/// Pixels are relaxed atomics: guest writes and display reads are not
/// ordered against each other and tearing is accepted.
pub struct Framebuffer {
    words: Vec<AtomicU32>,
}

impl Framebuffer {
    fn new() -> Self {
        let mut words = Vec::with_capacity(FB_WIDTH * FB_HEIGHT);
        words.resize_with(FB_WIDTH * FB_HEIGHT, || AtomicU32::new(0));
        Framebuffer { words }
    }

    pub fn read32(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    pub fn write32(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    pub fn read8(&self, offset: u32) -> u8 {
        let word = self.read32((offset / 4) as usize);
        (word >> ((offset % 4) * 8)) as u8
    }

    pub fn write8(&self, offset: u32, value: u8) {
        let index = (offset / 4) as usize;
        let shift = (offset % 4) * 8;
        let word = self.words[index].load(Ordering::Relaxed);
        let word = (word & !(0xff << shift)) | ((value as u32) << shift);
        self.words[index].store(word, Ordering::Relaxed);
    }

    /// Copy the current contents into a host-side pixel buffer.
    pub fn copy_into(&self, out: &mut [u32]) {
        for (dst, src) in out.iter_mut().zip(self.words.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
    }
}

/// Machine-wide shutdown flags. Halt is requested by the guest (`HALT`) or
/// the host (window close, deadline); fault is raised by a machine fault on
/// any core. Both are monotonic.
pub struct Power {
    halted: AtomicBool,
    faulted: AtomicBool,
}

impl Power {
    fn new() -> Self {
        Power { halted: AtomicBool::new(false), faulted: AtomicBool::new(false) }
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn fault(&self) {
        self.faulted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// True once any thread should wind down.
    pub fn should_stop(&self) -> bool {
        self.is_halted() || self.is_faulted()
    }
}

/// Release gate an application processor spins on until the BSP runs
/// `STARTAP`. The entry address is published before the release flag.
struct CoreGate {
    released: AtomicBool,
    entry: AtomicU32,
}

/// Per-core pending-vector bitmap. Slots are seq-cst so a claimed vector
/// (exchange to 0) happens-before the ISR body on the claiming core.
pub(crate) struct PendingInterrupts {
    cores: usize,
    slots: Vec<AtomicU32>,
}

impl PendingInterrupts {
    fn new(cores: usize) -> Self {
        let mut slots = Vec::with_capacity(cores * IVT_SIZE as usize);
        slots.resize_with(cores * IVT_SIZE as usize, || AtomicU32::new(0));
        PendingInterrupts { cores, slots }
    }

    pub(crate) fn trigger(&self, core: usize, vector: u32) {
        if core >= self.cores || vector >= IVT_SIZE {
            return;
        }
        self.slots[core * IVT_SIZE as usize + vector as usize].store(1, Ordering::SeqCst);
    }

    /// Claim the lowest pending vector for `core`, clearing its slot.
    /// Only the owning core clears slots, so a set slot cannot vanish
    /// between the load and the exchange.
    pub(crate) fn claim(&self, core: usize) -> Option<u32> {
        let base = core * IVT_SIZE as usize;
        for vector in 0..IVT_SIZE as usize {
            if self.slots[base + vector].load(Ordering::SeqCst) != 0 {
                self.slots[base + vector].swap(0, Ordering::SeqCst);
                return Some(vector as u32);
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, core: usize, vector: u32) -> bool {
        self.slots[core * IVT_SIZE as usize + vector as usize].load(Ordering::SeqCst) != 0
    }
}

/// Base addresses of one core's three stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBases {
    pub call: u32,
    pub data: u32,
    pub isr: u32,
}

/// State serialized by the machine's shared lock: the port space and the
/// serial device. Holding the lock guard is also the serialization token
/// for all non-atomic RAM and MMIO accesses.
pub(crate) struct SharedState {
    pub(crate) io: [u32; crate::devices::IO_SIZE],
    pub(crate) serial: Serial,
}

pub struct Machine {
    mem_size: u32,
    smp: usize,
    text_base: u32,
    stacks: Vec<StackBases>,
    pub(crate) ram: GuestMemoryMmap,
    fb: Arc<Framebuffer>,
    pub(crate) mmio: MmioTable,
    pub(crate) shared: Mutex<SharedState>,
    pub(crate) pending: PendingInterrupts,
    gates: Vec<CoreGate>,
    pub disk: Disk,
    pub power: Arc<Power>,
    total_retired: AtomicU64,
}

impl Machine {
    /// Build a machine and apply the loaded image: text and data are copied
    /// into RAM, bss is zeroed (RAM starts zeroed), the IVT is cleared and
    /// the fixed MMIO windows are registered.
    pub(crate) fn new(
        cores: usize,
        mem_size: u32,
        image: &LoadedImage,
        serial_out: Box<dyn Write + Send>,
    ) -> Result<Arc<Machine>, Error> {
        let ram = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), mem_size as usize)])
            .map_err(Error::Memory)?;

        let fb = Arc::new(Framebuffer::new());
        let power = Arc::new(Power::new());

        let mut mmio = MmioTable::new();
        mmio.register(Box::new(FbWindow::new(mem_size, Arc::clone(&fb))));
        mmio.register(Box::new(FbWindow::new(FB_LEGACY_BASE, Arc::clone(&fb))));
        mmio.register(Box::new(Timer::new(TIME_BASE, Arc::clone(&power))));

        let stacks = carve_stacks(cores, mem_size);
        let machine = Machine {
            mem_size,
            smp: cores,
            text_base: image.layout.text_base,
            stacks,
            ram,
            fb,
            mmio,
            shared: Mutex::new(SharedState {
                io: [0; crate::devices::IO_SIZE],
                serial: Serial::new(serial_out),
            }),
            pending: PendingInterrupts::new(cores),
            gates: (0..cores)
                .map(|core| CoreGate {
                    released: AtomicBool::new(core == 0),
                    entry: AtomicU32::new(0),
                })
                .collect(),
            disk: Disk::new(),
            power,
            total_retired: AtomicU64::new(0),
        };

        machine.apply_image(image)?;
        crate::cpu::interrupts::init_ivt(&machine).map_err(|_| {
            Error::Layout("guest memory too small for the interrupt vector table".to_string())
        })?;

        Ok(Arc::new(machine))
    }

    fn apply_image(&self, image: &LoadedImage) -> Result<(), Error> {
        let layout = &image.layout;
        self.check_segment("text", layout.text_base, image.text.len())?;
        self.check_segment("data", layout.data_base, image.data.len())?;
        self.check_segment("bss", layout.bss_base, layout.bss_size as usize)?;

        if !image.text.is_empty() {
            self.ram
                .write_slice(&image.text, GuestAddress(layout.text_base as u64))
                .map_err(|e| Error::Layout(format!("text segment: {}", e)))?;
        }
        if !image.data.is_empty() {
            self.ram
                .write_slice(&image.data, GuestAddress(layout.data_base as u64))
                .map_err(|e| Error::Layout(format!("data segment: {}", e)))?;
        }
        // bss is already zero: RAM comes from a fresh anonymous mapping.

        let image_end = [
            layout.text_base as u64 + image.text.len() as u64,
            layout.data_base as u64 + image.data.len() as u64,
            layout.bss_base as u64 + layout.bss_size as u64,
            PROGRAM_BASE as u64,
        ]
        .into_iter()
        .max()
        .unwrap_or(PROGRAM_BASE as u64);

        if let Some(pool_base) = self.stack_pool_base() {
            if (pool_base as u64) < image_end {
                return Err(Error::Layout(format!(
                    "per-core stack pool at {:#010x} overlaps the loaded image (ends {:#010x})",
                    pool_base, image_end
                )));
            }
            if self.mem_size > FB_LEGACY_BASE && pool_base < FB_LEGACY_BASE + FB_SIZE {
                return Err(Error::Layout(
                    "per-core stack pool overlaps the legacy framebuffer window".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn check_segment(&self, name: &str, base: u32, len: usize) -> Result<(), Error> {
        if base as u64 + len as u64 > self.mem_size as u64 {
            return Err(Error::Layout(format!(
                "{} segment [{:#010x}, +{:#x}) out of memory range",
                name, base, len
            )));
        }
        Ok(())
    }

    fn stack_pool_base(&self) -> Option<u32> {
        if self.smp > 1 {
            Some(self.mem_size - self.smp as u32 * STACK_FOOTPRINT)
        } else {
            None
        }
    }

    pub fn mem_size(&self) -> u32 {
        self.mem_size
    }

    pub fn smp(&self) -> usize {
        self.smp
    }

    pub fn text_base(&self) -> u32 {
        self.text_base
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.fb
    }

    pub fn stack_bases(&self, core: usize) -> StackBases {
        self.stacks[core]
    }

    pub(crate) fn count_retired(&self) {
        self.total_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_retired(&self) -> u64 {
        self.total_retired.load(Ordering::Relaxed)
    }

    /// Raise `vector` on core 0.
    pub fn trigger_interrupt(&self, vector: u32) {
        self.pending.trigger(0, vector);
    }

    /// Raise `vector` on a specific core. Out-of-range vectors and cores
    /// are ignored.
    pub fn trigger_interrupt_target(&self, core: usize, vector: u32) {
        self.pending.trigger(core, vector);
    }

    /// `STARTAP`: publish the entry address and release the target core.
    pub(crate) fn start_ap(&self, target: u32, entry: u32) -> Result<(), crate::fault::Fault> {
        let gate = self
            .gates
            .get(target as usize)
            .ok_or(crate::fault::Fault::BadCore(target))?;
        gate.entry.store(entry, Ordering::Release);
        gate.released.store(true, Ordering::Release);
        Ok(())
    }

    /// One release-gate check for an AP; returns the published entry
    /// address once the core has been released.
    pub(crate) fn ap_entry(&self, core: usize) -> Option<u32> {
        let gate = &self.gates[core];
        if gate.released.load(Ordering::Acquire) {
            Some(gate.entry.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Host input path: hand one byte to the serial device, raising the RX
    /// interrupt if the guest enabled it. The byte is dropped while a
    /// previous one is still unread.
    pub fn serial_rx_push(&self, byte: u8) {
        let mut shared = self.shared.lock().unwrap();
        if shared.serial.push_rx(byte) {
            self.pending.trigger(0, crate::cpu::interrupts::INT_SERIAL);
        }
    }

    pub(crate) fn flush_serial(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.serial.flush();
    }
}

fn carve_stacks(cores: usize, mem_size: u32) -> Vec<StackBases> {
    if cores == 1 {
        return vec![StackBases {
            call: CALL_STACK_BASE,
            data: DATA_STACK_BASE,
            isr: ISR_STACK_BASE,
        }];
    }
    let pool_base = mem_size - cores as u32 * STACK_FOOTPRINT;
    (0..cores as u32)
        .map(|core| {
            let base = pool_base + core * STACK_FOOTPRINT;
            StackBases {
                call: base,
                data: base + CALL_STACK_SIZE * 8,
                isr: base + (CALL_STACK_SIZE + DATA_STACK_SIZE) * 8,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framebuffer_byte_access_hits_the_right_lane() {
        let fb = Framebuffer::new();
        fb.write32(0, 0xaabbccdd);
        assert_eq!(fb.read8(0), 0xdd);
        assert_eq!(fb.read8(1), 0xcc);
        assert_eq!(fb.read8(2), 0xbb);
        assert_eq!(fb.read8(3), 0xaa);

        fb.write8(2, 0x11);
        assert_eq!(fb.read32(0), 0xaa11ccdd);
    }

    #[test]
    fn single_core_uses_the_low_layout() {
        let stacks = carve_stacks(1, DEFAULT_MEM_SIZE);
        assert_eq!(
            stacks,
            vec![StackBases {
                call: CALL_STACK_BASE,
                data: DATA_STACK_BASE,
                isr: ISR_STACK_BASE,
            }]
        );
    }

    #[test]
    fn smp_stacks_are_disjoint_and_top_of_ram() {
        let cores = 4;
        let stacks = carve_stacks(cores, DEFAULT_MEM_SIZE);
        assert_eq!(stacks.len(), cores);

        for (i, s) in stacks.iter().enumerate() {
            assert_eq!(s.data, s.call + CALL_STACK_SIZE * 8);
            assert_eq!(s.isr, s.data + DATA_STACK_SIZE * 8);
            // Next core starts exactly where this one's ISR stack ends.
            if let Some(next) = stacks.get(i + 1) {
                assert_eq!(next.call, s.isr + ISR_STACK_SIZE * 8);
            }
        }
        assert_eq!(
            stacks[cores - 1].isr + ISR_STACK_SIZE * 8,
            DEFAULT_MEM_SIZE
        );
        // Pool sits far above the fixed low layout.
        assert!(stacks[0].call > PROGRAM_BASE);
    }

    #[test]
    fn pending_claim_returns_lowest_vector_once() {
        let pending = PendingInterrupts::new(2);
        pending.trigger(1, 9);
        pending.trigger(1, 4);
        pending.trigger(0, 200);

        assert_eq!(pending.claim(1), Some(4));
        assert_eq!(pending.claim(1), Some(9));
        assert_eq!(pending.claim(1), None);
        assert_eq!(pending.claim(0), Some(200));
    }

    #[test]
    fn out_of_range_triggers_are_ignored() {
        let pending = PendingInterrupts::new(1);
        pending.trigger(0, 256);
        pending.trigger(5, 1);
        assert_eq!(pending.claim(0), None);
    }
}
