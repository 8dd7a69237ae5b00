// SPDX-License-Identifier: Apache-2.0

//! Built-in headless self tests (`--selftest`).
//!
//! Each scenario assembles a small guest program, boots a machine with a
//! throwaway disk image, runs it with a wall-clock deadline and checks the
//! observable side effects through guest memory or the serial sink.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vmm_sys_util::tempfile::TempFile;

use crate::config::VMMConfig;
use crate::cpu::interrupts::{self, INT_DIVIDE_BY_ZERO, INT_DISK_COMPLETE};
use crate::cpu::isa::{encode, Opcode};
use crate::devices::disk::{DISK_CMD_READ, DISK_CMD_WRITE};
use crate::devices::serial::SERIAL_STATUS_RX_READY;
use crate::devices::{DISK_CMD, DISK_COUNT, DISK_LBA, DISK_MEM, DISK_STATUS, KEYBOARD, SCREEN, SCREEN_ATTRIBUTE};
use crate::image::LoadedImage;
use crate::machine::{Machine, PROGRAM_BASE};
use crate::{Error, Result, RunOutcome, VMM};

const SCENARIOS: &[(&str, fn() -> Result<()>)] = &[
    ("smp-startap", smp_startap),
    ("smp-ipi", smp_ipi),
    ("disk-round-trip", disk_round_trip),
    ("divide-by-zero-isr", divide_by_zero_isr),
    ("serial-echo", serial_echo),
    ("atomic-fetch-add-contention", atomic_fetch_add_contention),
];

/// Run every scenario, stopping at the first failure.
pub fn run_all() -> Result<()> {
    for (name, scenario) in SCENARIOS {
        log::info!("selftest {} ...", name);
        scenario().map_err(|e| match e {
            Error::Selftest(msg) => Error::Selftest(msg),
            other => Error::Selftest(format!("{}: {:?}", name, other)),
        })?;
        log::info!("selftest {}: ok", name);
    }
    Ok(())
}

/// Guest address of instruction `index`.
const fn at(index: u32) -> i32 {
    (PROGRAM_BASE + index * 8) as i32
}

const PAD: u64 = encode(Opcode::Movi, 0, 0, 0, 0);

struct TestVm {
    vmm: VMM,
    _disk: TempFile,
}

fn boot(cores: usize, words: &[u64], sink: Option<Box<dyn Write + Send>>) -> Result<TestVm> {
    let disk =
        TempFile::new().map_err(|e| Error::Selftest(format!("temp disk image: {}", e)))?;
    let cfg = VMMConfig {
        cores,
        disk: disk.as_path().to_path_buf(),
        ..Default::default()
    };
    let mut vmm = VMM::new();
    vmm.set_serial_sink(sink.unwrap_or_else(|| Box::new(std::io::sink())));
    vmm.configure_with_image(&cfg, &LoadedImage::from_words(words))?;
    Ok(TestVm { vmm, _disk: disk })
}

fn machine(vm: &TestVm) -> Result<&Arc<Machine>> {
    vm.vmm.machine().ok_or(Error::NotConfigured)
}

fn install_isr(vm: &TestVm, vector: u32, index: u32) -> Result<()> {
    interrupts::register_isr(machine(vm)?, vector, at(index) as u32 as u64)
        .map_err(|f| Error::Selftest(format!("register_isr: {}", f)))
}

fn expect_halted(vm: &mut TestVm, deadline: Duration, name: &str) -> Result<()> {
    match vm.vmm.run_headless(Some(deadline))? {
        RunOutcome::Halted => Ok(()),
        RunOutcome::DeadlineExpired => {
            Err(Error::Selftest(format!("{}: deadline expired", name)))
        }
    }
}

fn check_eq32(vm: &TestVm, addr: u32, want: u32, name: &str) -> Result<()> {
    let got = machine(vm)?
        .read32(addr)
        .map_err(|f| Error::Selftest(format!("{}: {}", name, f)))?;
    if got != want {
        return Err(Error::Selftest(format!(
            "{}: word at {:#x} is {:#x}, want {:#x}",
            name, addr, got, want
        )));
    }
    Ok(())
}

/// The BSP starts an AP which stores its core id; the BSP spins on the
/// flag and halts once it sees it.
fn smp_startap() -> Result<()> {
    let flag = 0x3000;
    let program = [
        encode(Opcode::Movi, 1, 0, 0, 1),
        encode(Opcode::Movi, 2, 0, 0, at(11)),
        encode(Opcode::Startap, 1, 2, 0, 0),
        encode(Opcode::Movi, 4, 0, 0, flag),
        encode(Opcode::Load32, 3, 4, 0, 0),
        encode(Opcode::Cmpi, 3, 0, 0, 1),
        encode(Opcode::Jnz, 0, 0, 0, at(4)),
        encode(Opcode::Halt, 0, 0, 0, 0),
        PAD,
        PAD,
        PAD,
        // AP entry:
        encode(Opcode::Cpuid, 5, 0, 0, 0),
        encode(Opcode::Movi, 6, 0, 0, flag),
        encode(Opcode::Store32, 5, 6, 0, 0),
        encode(Opcode::Pause, 0, 0, 0, 0),
        encode(Opcode::Jmp, 0, 0, 0, at(14)),
    ];
    let mut vm = boot(2, &program, None)?;
    expect_halted(&mut vm, Duration::from_secs(2), "smp-startap")?;
    check_eq32(&vm, flag as u32, 1, "smp-startap")
}

/// An IPI from the BSP lands in an ISR on the target AP.
fn smp_ipi() -> Result<()> {
    let ready = 0x3010;
    let hit = 0x3014;
    let program = [
        encode(Opcode::Movi, 1, 0, 0, 1),
        encode(Opcode::Movi, 2, 0, 0, at(20)),
        encode(Opcode::Startap, 1, 2, 0, 0),
        encode(Opcode::Movi, 4, 0, 0, ready),
        encode(Opcode::Load32, 3, 4, 0, 0),
        encode(Opcode::Cmpi, 3, 0, 0, 1),
        encode(Opcode::Jnz, 0, 0, 0, at(4)),
        encode(Opcode::Movi, 5, 0, 0, 1), // target core
        encode(Opcode::Movi, 6, 0, 0, 5), // vector
        encode(Opcode::Ipi, 5, 6, 0, 0),
        encode(Opcode::Movi, 7, 0, 0, hit),
        encode(Opcode::Load32, 8, 7, 0, 0),
        encode(Opcode::Cmpi, 8, 0, 0, 1),
        encode(Opcode::Jnz, 0, 0, 0, at(11)),
        encode(Opcode::Halt, 0, 0, 0, 0),
        PAD,
        PAD,
        PAD,
        PAD,
        PAD,
        // AP entry: announce readiness, then idle.
        encode(Opcode::Movi, 9, 0, 0, 1),
        encode(Opcode::Movi, 10, 0, 0, ready),
        encode(Opcode::Store32, 9, 10, 0, 0),
        encode(Opcode::Pause, 0, 0, 0, 0),
        encode(Opcode::Jmp, 0, 0, 0, at(23)),
        // ISR for vector 5:
        encode(Opcode::Movi, 11, 0, 0, 1),
        encode(Opcode::Movi, 12, 0, 0, hit),
        encode(Opcode::Store32, 11, 12, 0, 0),
        encode(Opcode::Iret, 0, 0, 0, 0),
    ];
    let mut vm = boot(2, &program, None)?;
    install_isr(&vm, 5, 25)?;
    expect_halted(&mut vm, Duration::from_millis(2500), "smp-ipi")?;
    check_eq32(&vm, hit as u32, 1, "smp-ipi")
}

/// Write a sector of 0xAA through the disk, read it back into a second
/// buffer, and count completion interrupts.
fn disk_round_trip() -> Result<()> {
    let src = 0x6000;
    let dst = 0x7000;
    let hits = 0x7400;
    let program = [
        encode(Opcode::Movi, 1, 0, 0, src),
        encode(Opcode::Movi, 2, 0, 0, 0xAA),
        encode(Opcode::Memset, 1, 2, 0, 512),
        encode(Opcode::Movi, 10, 0, 0, DISK_LBA as i32),
        encode(Opcode::Movi, 11, 0, 0, 7),
        encode(Opcode::Out, 11, 10, 0, 0),
        encode(Opcode::Movi, 10, 0, 0, DISK_MEM as i32),
        encode(Opcode::Out, 1, 10, 0, 0),
        encode(Opcode::Movi, 10, 0, 0, DISK_COUNT as i32),
        encode(Opcode::Movi, 11, 0, 0, 1),
        encode(Opcode::Out, 11, 10, 0, 0),
        encode(Opcode::Movi, 10, 0, 0, DISK_CMD as i32),
        encode(Opcode::Movi, 11, 0, 0, DISK_CMD_WRITE as i32),
        encode(Opcode::Out, 11, 10, 0, 0),
        // Poll until the controller is FREE again.
        encode(Opcode::Movi, 10, 0, 0, DISK_STATUS as i32),
        encode(Opcode::In, 12, 10, 0, 0),
        encode(Opcode::Cmpi, 12, 0, 0, 0),
        encode(Opcode::Jnz, 0, 0, 0, at(15)),
        // Read LBA 7 back into the destination buffer.
        encode(Opcode::Movi, 1, 0, 0, dst),
        encode(Opcode::Movi, 10, 0, 0, DISK_MEM as i32),
        encode(Opcode::Out, 1, 10, 0, 0),
        encode(Opcode::Movi, 10, 0, 0, DISK_CMD as i32),
        encode(Opcode::Movi, 11, 0, 0, DISK_CMD_READ as i32),
        encode(Opcode::Out, 11, 10, 0, 0),
        encode(Opcode::Movi, 10, 0, 0, DISK_STATUS as i32),
        encode(Opcode::In, 12, 10, 0, 0),
        encode(Opcode::Cmpi, 12, 0, 0, 0),
        encode(Opcode::Jnz, 0, 0, 0, at(25)),
        encode(Opcode::Halt, 0, 0, 0, 0),
        // Completion ISR: bump the hit counter.
        encode(Opcode::Movi, 20, 0, 0, hits),
        encode(Opcode::Load32, 21, 20, 0, 0),
        encode(Opcode::Inc, 21, 0, 0, 0),
        encode(Opcode::Store32, 21, 20, 0, 0),
        encode(Opcode::Iret, 0, 0, 0, 0),
    ];
    let mut vm = boot(1, &program, None)?;
    install_isr(&vm, INT_DISK_COMPLETE, 29)?;
    expect_halted(&mut vm, Duration::from_secs(5), "disk-round-trip")?;

    let m = machine(&vm)?;
    for offset in 0..512 {
        let byte = m
            .read8(dst as u32 + offset)
            .map_err(|f| Error::Selftest(format!("disk-round-trip: {}", f)))?;
        if byte != 0xAA {
            return Err(Error::Selftest(format!(
                "disk-round-trip: byte {} of the read buffer is {:#x}",
                offset, byte
            )));
        }
    }
    // One completion interrupt per command.
    check_eq32(&vm, hits as u32, 2, "disk-round-trip")
}

/// `DIV` by zero vectors to the installed ISR and leaves rd untouched.
fn divide_by_zero_isr() -> Result<()> {
    let program = [
        encode(Opcode::Movi, 0, 0, 0, 0x77),
        encode(Opcode::Movi, 1, 0, 0, 10),
        encode(Opcode::Movi, 2, 0, 0, 0),
        encode(Opcode::Div, 0, 1, 2, 0),
        encode(Opcode::Movi, 3, 0, 0, 0x4004),
        encode(Opcode::Store32, 0, 3, 0, 0),
        encode(Opcode::Halt, 0, 0, 0, 0),
        // Vector-1 ISR:
        encode(Opcode::Movi, 10, 0, 0, 0xDEAD),
        encode(Opcode::Movi, 11, 0, 0, 0x4000),
        encode(Opcode::Store32, 10, 11, 0, 0),
        encode(Opcode::Iret, 0, 0, 0, 0),
    ];
    let mut vm = boot(1, &program, None)?;
    install_isr(&vm, INT_DIVIDE_BY_ZERO, 7)?;
    expect_halted(&mut vm, Duration::from_secs(2), "divide-by-zero-isr")?;
    check_eq32(&vm, 0x4000, 0xDEAD, "divide-by-zero-isr")?;
    check_eq32(&vm, 0x4004, 0x77, "divide-by-zero-isr")
}

#[derive(Clone, Default)]
struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl CaptureSink {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Host-injected bytes are echoed back out of the TX port.
fn serial_echo() -> Result<()> {
    let program = [
        encode(Opcode::Movi, 1, 0, 0, SCREEN_ATTRIBUTE as i32),
        encode(Opcode::In, 2, 1, 0, 0),
        encode(Opcode::Andi, 2, 2, 0, SERIAL_STATUS_RX_READY as i32),
        encode(Opcode::Jz, 0, 0, 0, at(1)),
        encode(Opcode::Movi, 3, 0, 0, KEYBOARD as i32),
        encode(Opcode::In, 4, 3, 0, 0),
        encode(Opcode::Movi, 5, 0, 0, SCREEN as i32),
        encode(Opcode::Out, 4, 5, 0, 0),
        encode(Opcode::Cmpi, 4, 0, 0, b'\n' as i32),
        encode(Opcode::Jnz, 0, 0, 0, at(1)),
        encode(Opcode::Halt, 0, 0, 0, 0),
    ];
    let sink = CaptureSink::default();
    let mut vm = boot(1, &program, Some(Box::new(sink.clone())))?;

    let injector = {
        let machine = Arc::clone(machine(&vm)?);
        thread::spawn(move || {
            for &byte in b"hi\n" {
                loop {
                    if machine.power.should_stop() {
                        return;
                    }
                    let status = machine.io_read(SCREEN_ATTRIBUTE).unwrap_or(0);
                    if status & SERIAL_STATUS_RX_READY == 0 {
                        machine.serial_rx_push(byte);
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    let outcome = expect_halted(&mut vm, Duration::from_secs(3), "serial-echo");
    let _ = injector.join();
    outcome?;

    let echoed = sink.contents();
    if echoed != b"hi\n" {
        return Err(Error::Selftest(format!(
            "serial-echo: host received {:?}",
            String::from_utf8_lossy(&echoed)
        )));
    }
    Ok(())
}

/// Two cores hammer one cell with `XADD`; no increment may be lost.
fn atomic_fetch_add_contention() -> Result<()> {
    let cell = 0x5000;
    let done = 0x5004;
    let iterations = 100_000;
    let program = [
        encode(Opcode::Movi, 1, 0, 0, 1),
        encode(Opcode::Movi, 2, 0, 0, at(20)),
        encode(Opcode::Startap, 1, 2, 0, 0),
        encode(Opcode::Call, 0, 0, 0, at(30)),
        encode(Opcode::Movi, 3, 0, 0, done),
        encode(Opcode::Movi, 4, 0, 0, 1),
        encode(Opcode::Xadd, 5, 3, 4, 0),
        encode(Opcode::Load32, 6, 3, 0, 0),
        encode(Opcode::Cmpi, 6, 0, 0, 2),
        encode(Opcode::Jnz, 0, 0, 0, at(7)),
        encode(Opcode::Halt, 0, 0, 0, 0),
        PAD,
        PAD,
        PAD,
        PAD,
        PAD,
        PAD,
        PAD,
        PAD,
        PAD,
        // AP entry:
        encode(Opcode::Call, 0, 0, 0, at(30)),
        encode(Opcode::Movi, 3, 0, 0, done),
        encode(Opcode::Movi, 4, 0, 0, 1),
        encode(Opcode::Xadd, 5, 3, 4, 0),
        encode(Opcode::Pause, 0, 0, 0, 0),
        encode(Opcode::Jmp, 0, 0, 0, at(24)),
        PAD,
        PAD,
        PAD,
        PAD,
        // Shared increment loop:
        encode(Opcode::Movi, 7, 0, 0, iterations),
        encode(Opcode::Movi, 8, 0, 0, cell),
        encode(Opcode::Movi, 9, 0, 0, 1),
        encode(Opcode::Xadd, 10, 8, 9, 0),
        encode(Opcode::Subi, 7, 7, 0, 1),
        encode(Opcode::Jnz, 0, 0, 0, at(33)),
        encode(Opcode::Ret, 0, 0, 0, 0),
    ];
    let mut vm = boot(2, &program, None)?;
    expect_halted(&mut vm, Duration::from_secs(30), "atomic-fetch-add-contention")?;
    check_eq32(&vm, cell as u32, 2 * iterations as u32, "atomic-fetch-add-contention")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selftest_smp_startap() {
        smp_startap().unwrap();
    }

    #[test]
    fn selftest_smp_ipi() {
        smp_ipi().unwrap();
    }

    #[test]
    fn selftest_disk_round_trip() {
        disk_round_trip().unwrap();
    }

    #[test]
    fn selftest_divide_by_zero_isr() {
        divide_by_zero_isr().unwrap();
    }

    #[test]
    fn selftest_serial_echo() {
        serial_echo().unwrap();
    }

    #[test]
    fn selftest_atomic_fetch_add_contention() {
        atomic_fetch_add_contention().unwrap();
    }
}
