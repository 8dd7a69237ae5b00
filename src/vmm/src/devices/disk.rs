// SPDX-License-Identifier: Apache-2.0

//! Asynchronous sector-granular disk with DMA.
//!
//! The guest programs LBA, target address and sector count through the
//! disk ports and kicks the device by writing the command port. A
//! dedicated worker thread owns the image file, performs the transfer
//! against guest RAM under the machine's shared lock, and marks the
//! operation complete. The BSP observes completion at its next instruction
//! boundary, resets the status to FREE and raises the completion
//! interrupt on core 0.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::cpu::interrupts::INT_DISK_COMPLETE;
use crate::machine::Machine;

use super::{Error, Result};

pub const SECTOR_SIZE: u32 = 512;
/// Size a freshly created disk image is zero-filled to.
pub const DEFAULT_IMAGE_BYTES: u64 = 1024 * 1024;

pub const DISK_CMD_READ: u32 = 1;
pub const DISK_CMD_WRITE: u32 = 2;

pub const DISK_STATUS_FREE: u32 = 0;
pub const DISK_STATUS_BUSY: u32 = 1;

struct DiskState {
    lba: u32,
    mem_addr: u32,
    count: u32,
    status: u32,
    current_cmd: Option<u32>,
    op_complete: bool,
    running: bool,
}

pub struct Disk {
    state: Mutex<DiskState>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Disk {
    pub(crate) fn new() -> Self {
        Disk {
            state: Mutex::new(DiskState {
                lba: 0,
                mem_addr: 0,
                count: 0,
                status: DISK_STATUS_FREE,
                current_cmd: None,
                op_complete: false,
                running: false,
            }),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    /// Open (or create and zero-fill) the image and spawn the worker.
    pub fn start(machine: &Arc<Machine>, path: &Path, image_bytes: u64) -> Result<()> {
        let image = open_or_create(path, image_bytes)?;
        machine.disk.state.lock().unwrap().running = true;

        let worker_machine = Arc::clone(machine);
        let handle = thread::Builder::new()
            .name("disk-worker".to_string())
            .spawn(move || worker_loop(worker_machine, image))
            .map_err(Error::DiskWorker)?;
        *machine.disk.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop and join the worker. Idempotent.
    pub(crate) fn stop(&self) {
        self.state.lock().unwrap().running = false;
        self.cond.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn set_lba(&self, value: u32) {
        self.state.lock().unwrap().lba = value;
    }

    pub(crate) fn set_mem_addr(&self, value: u32) {
        self.state.lock().unwrap().mem_addr = value;
    }

    pub(crate) fn set_count(&self, value: u32) {
        self.state.lock().unwrap().count = value;
    }

    pub fn status(&self) -> u32 {
        self.state.lock().unwrap().status
    }

    /// Command-port write. Ignored while a command is in flight.
    pub(crate) fn submit(&self, cmd: u32) {
        let mut state = self.state.lock().unwrap();
        if state.status == DISK_STATUS_BUSY {
            return;
        }
        if !state.running {
            log::warn!("disk command {} submitted with no worker; dropped", cmd);
            return;
        }
        state.status = DISK_STATUS_BUSY;
        state.current_cmd = Some(cmd);
        self.cond.notify_one();
    }

    /// BSP instruction-boundary poll: retire a completed operation and
    /// raise the completion interrupt on core 0.
    pub(crate) fn tick(&self, machine: &Machine) {
        let completed = {
            let mut state = self.state.lock().unwrap();
            if state.status == DISK_STATUS_BUSY && state.op_complete {
                state.status = DISK_STATUS_FREE;
                state.op_complete = false;
                true
            } else {
                false
            }
        };
        if completed {
            machine.trigger_interrupt_target(0, INT_DISK_COMPLETE);
        }
    }
}

fn open_or_create(path: &Path, image_bytes: u64) -> Result<File> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(image) => Ok(image),
        Err(_) => {
            log::info!(
                "disk image {} not found, creating a {} byte image",
                path.display(),
                image_bytes
            );
            let image = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .map_err(|e| Error::DiskImage(path.to_path_buf(), e))?;
            image
                .set_len(image_bytes)
                .map_err(|e| Error::DiskImage(path.to_path_buf(), e))?;
            Ok(image)
        }
    }
}

fn worker_loop(machine: Arc<Machine>, mut image: File) {
    loop {
        let (cmd, lba, mem_addr, count) = {
            let mut state = machine.disk.state.lock().unwrap();
            loop {
                if !state.running {
                    return;
                }
                if state.current_cmd.is_some() && !state.op_complete {
                    break;
                }
                state = machine.disk.cond.wait(state).unwrap();
            }
            match state.current_cmd {
                Some(cmd) => (cmd, state.lba, state.mem_addr, state.count),
                None => continue,
            }
        };

        transfer(&machine, &mut image, cmd, lba, mem_addr, count);

        let mut state = machine.disk.state.lock().unwrap();
        state.current_cmd = None;
        state.op_complete = true;
    }
}

fn transfer(machine: &Machine, image: &mut File, cmd: u32, lba: u32, mem_addr: u32, count: u32) {
    let bytes = count as u64 * SECTOR_SIZE as u64;
    if bytes == 0 {
        return;
    }
    if mem_addr as u64 + bytes > machine.mem_size() as u64 {
        log::error!(
            "disk DMA [{:#010x}, +{:#x}) outside guest RAM; transfer dropped",
            mem_addr,
            bytes
        );
        return;
    }
    let offset = lba as u64 * SECTOR_SIZE as u64;
    if let Err(e) = image.seek(SeekFrom::Start(offset)) {
        log::error!("disk seek to {:#x} failed: {}", offset, e);
        return;
    }

    match cmd {
        DISK_CMD_READ => {
            let mut staging = vec![0u8; bytes as usize];
            // A short read (past end of image) leaves the tail zeroed.
            let mut filled = 0;
            while filled < staging.len() {
                match image.read(&mut staging[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("disk read failed: {}", e);
                        return;
                    }
                }
            }
            if let Err(fault) = machine.dma_write(mem_addr, &staging) {
                log::error!("disk DMA into RAM failed: {}", fault);
            }
        }
        DISK_CMD_WRITE => {
            let mut staging = vec![0u8; bytes as usize];
            if let Err(fault) = machine.dma_read(mem_addr, &mut staging) {
                log::error!("disk DMA out of RAM failed: {}", fault);
                return;
            }
            if let Err(e) = image.write_all(&staging).and_then(|_| image.flush()) {
                log::error!("disk write failed: {}", e);
                return;
            }
            if let Err(e) = image.sync_data() {
                log::error!("disk sync failed: {}", e);
            }
        }
        other => log::warn!("unknown disk command {}", other),
    }
}
