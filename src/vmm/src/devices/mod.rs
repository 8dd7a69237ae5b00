// SPDX-License-Identifier: Apache-2.0

//! Port-mapped I/O space and the devices behind it.

use std::io;
use std::path::PathBuf;

use crate::fault::Fault;
use crate::machine::Machine;

pub mod disk;
pub mod display;
pub mod serial;
pub mod timer;

/// Custom defined [`std::result::Result`]
pub type Result<T> = std::result::Result<T, Error>;

/// Error related to device setup
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot open or create disk image {0}: {1}")]
    DiskImage(PathBuf, io::Error),

    #[error("failed to spawn the disk worker: {0}")]
    DiskWorker(io::Error),
}

pub const IO_SIZE: usize = 256;

/// Serial transmit port.
pub const SCREEN: u32 = 0x01;
/// Serial status/control byte pair.
pub const SCREEN_ATTRIBUTE: u32 = 0x02;
/// Serial receive port.
pub const KEYBOARD: u32 = 0x03;

pub const DISK_CMD: u32 = 0x10;
pub const DISK_LBA: u32 = 0x11;
pub const DISK_MEM: u32 = 0x12;
pub const DISK_COUNT: u32 = 0x13;
pub const DISK_STATUS: u32 = 0x14;

impl Machine {
    /// `IN`: read a port. Reserved ports route to the serial and disk
    /// devices, everything else is a plain 32-bit latch.
    pub fn io_read(&self, port: u32) -> std::result::Result<u32, Fault> {
        if port >= IO_SIZE as u32 {
            return Err(Fault::BadIoPort { op: "IN", port });
        }
        let mut shared = self.shared.lock().unwrap();
        let value = match port {
            SCREEN => shared.serial.data(),
            SCREEN_ATTRIBUTE => shared.serial.status(),
            KEYBOARD => shared.serial.take_rx(),
            DISK_STATUS => self.disk.status(),
            _ => shared.io[port as usize],
        };
        Ok(value)
    }

    /// `OUT`: write a port. Disk register writes are mirrored into the
    /// generic latches so they read back.
    pub fn io_write(&self, port: u32, value: u32) -> std::result::Result<(), Fault> {
        if port >= IO_SIZE as u32 {
            return Err(Fault::BadIoPort { op: "OUT", port });
        }
        let mut shared = self.shared.lock().unwrap();
        match port {
            SCREEN => shared.serial.transmit(value),
            SCREEN_ATTRIBUTE => shared.serial.set_control(value),
            KEYBOARD => shared.serial.set_rx(value),
            DISK_CMD => {
                shared.io[port as usize] = value;
                self.disk.submit(value);
            }
            DISK_LBA => {
                shared.io[port as usize] = value;
                self.disk.set_lba(value);
            }
            DISK_MEM => {
                shared.io[port as usize] = value;
                self.disk.set_mem_addr(value);
            }
            DISK_COUNT => {
                shared.io[port as usize] = value;
                self.disk.set_count(value);
            }
            _ => shared.io[port as usize] = value,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::bare_machine;

    #[test]
    fn unreserved_ports_are_plain_latches() {
        let m = bare_machine(1);
        assert_eq!(m.io_read(0x40).unwrap(), 0);
        m.io_write(0x40, 0xdead).unwrap();
        assert_eq!(m.io_read(0x40).unwrap(), 0xdead);
    }

    #[test]
    fn out_of_range_ports_fault() {
        let m = bare_machine(1);
        assert!(m.io_read(256).is_err());
        assert!(m.io_write(300, 1).is_err());
    }

    #[test]
    fn disk_register_writes_read_back() {
        let m = bare_machine(1);
        m.io_write(DISK_LBA, 7).unwrap();
        m.io_write(DISK_MEM, 0x3000).unwrap();
        m.io_write(DISK_COUNT, 2).unwrap();
        assert_eq!(m.io_read(DISK_LBA).unwrap(), 7);
        assert_eq!(m.io_read(DISK_MEM).unwrap(), 0x3000);
        assert_eq!(m.io_read(DISK_COUNT).unwrap(), 2);
        assert_eq!(m.io_read(DISK_STATUS).unwrap(), disk::DISK_STATUS_FREE);
    }
}
