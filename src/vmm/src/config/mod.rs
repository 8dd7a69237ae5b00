// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use crate::machine::{DEFAULT_MEM_SIZE, MAX_CORES, PROGRAM_BASE, STACK_FOOTPRINT};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid core count {0}, expected 1..=64")]
    CoreCount(usize),

    #[error("guest memory size {0:#x} is not a multiple of 8")]
    UnalignedMemory(u32),

    #[error("guest memory size {0:#x} is too small for {1} cores")]
    MemoryTooSmall(u32, usize),
}

/// VMM configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VMMConfig {
    /// Boot image path
    pub image: PathBuf,

    /// Disk image path
    pub disk: PathBuf,

    /// Number of guest cores
    pub cores: usize,

    /// Guest memory size in bytes
    pub memory_bytes: u32,
}

impl Default for VMMConfig {
    fn default() -> Self {
        VMMConfig {
            image: PathBuf::from("boot.bin"),
            disk: PathBuf::from("disk.img"),
            cores: 1,
            memory_bytes: DEFAULT_MEM_SIZE,
        }
    }
}

impl VMMConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.cores == 0 || self.cores > MAX_CORES {
            return Err(Error::CoreCount(self.cores));
        }
        if self.memory_bytes % 8 != 0 {
            return Err(Error::UnalignedMemory(self.memory_bytes));
        }
        // Room for the fixed low layout plus the per-core stack pool.
        let floor = PROGRAM_BASE as u64 + self.cores as u64 * STACK_FOOTPRINT as u64 + 4096;
        if (self.memory_bytes as u64) < floor {
            return Err(Error::MemoryTooSmall(self.memory_bytes, self.cores));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(VMMConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_and_excessive_core_counts() {
        let mut cfg = VMMConfig { cores: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(Error::CoreCount(0)));
        cfg.cores = MAX_CORES + 1;
        assert_eq!(cfg.validate(), Err(Error::CoreCount(MAX_CORES + 1)));
        cfg.cores = MAX_CORES;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn rejects_memory_that_cannot_hold_the_stacks() {
        let cfg = VMMConfig { cores: 64, memory_bytes: 0x40000, ..Default::default() };
        assert_eq!(cfg.validate(), Err(Error::MemoryTooSmall(0x40000, 64)));
    }

    #[test]
    fn rejects_unaligned_memory_sizes() {
        let cfg = VMMConfig { memory_bytes: DEFAULT_MEM_SIZE + 4, ..Default::default() };
        assert_eq!(
            cfg.validate(),
            Err(Error::UnalignedMemory(DEFAULT_MEM_SIZE + 4))
        );
    }
}
