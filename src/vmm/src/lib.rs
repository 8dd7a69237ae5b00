// SPDX-License-Identifier: Apache-2.0

//! User-space emulator for a fixed-width 64-bit guest ISA: an SMP of
//! 32-register cores over shared byte-addressable RAM, memory-mapped
//! framebuffer and timer, port-mapped serial I/O and an asynchronous
//! DMA-capable disk.
//!
//! One host thread runs each guest core, a worker thread owns the disk
//! image, and the caller's thread pumps the display surface. Everything is
//! torn down when any core halts the machine or faults.

use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub mod config;
pub mod cpu;
pub mod debug;
pub mod devices;
pub mod fault;
pub mod image;
pub mod machine;
mod memory;
mod mmio;
pub mod selftest;
#[cfg(test)]
pub(crate) mod testutil;

use config::VMMConfig;
use cpu::Vcpu;
use debug::Debugger;
use devices::disk::{Disk, DEFAULT_IMAGE_BYTES};
use devices::display::{DisplaySurface, HostEvent};
use image::LoadedImage;

pub use fault::Fault;
pub use machine::Machine;

/// Display cadence of the host event loop.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug)]
/// VMM errors.
pub enum Error {
    /// Failed to create guest memory.
    Memory(vm_memory::Error),
    /// Failed to read or parse the boot image.
    Image(image::Error),
    /// Invalid configuration.
    Config(config::Error),
    /// Device setup failed.
    Device(devices::Error),
    /// Program segment placement was rejected.
    Layout(String),
    /// Failed to spawn a host thread.
    Thread(std::io::Error),
    /// Run was called before configure.
    NotConfigured,
    /// A core hit a machine fault; diagnostics went to the console.
    Faulted,
    /// A built-in self test failed.
    Selftest(String),
}

/// Dedicated [`Result`](https://doc.rust-lang.org/std/result/) type.
pub type Result<T> = std::result::Result<T, Error>;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest halted (or the host asked for a halt).
    Halted,
    /// A headless run hit its wall-clock deadline and was halted by the
    /// harness.
    DeadlineExpired,
}

pub struct VMM {
    machine: Option<Arc<Machine>>,
    cpus: Vec<Vcpu>,
    serial_sink: Option<Box<dyn Write + Send>>,
}

impl Default for VMM {
    fn default() -> Self {
        VMM::new()
    }
}

impl VMM {
    /// Create a new VMM.
    pub fn new() -> Self {
        VMM { machine: None, cpus: Vec::new(), serial_sink: None }
    }

    /// Replace the serial TX sink (stdout by default). Must be called
    /// before [`VMM::configure`].
    pub fn set_serial_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.serial_sink = Some(sink);
    }

    /// Configure the VMM from a boot image on disk:
    /// * guest memory and framebuffer
    /// * the fixed MMIO windows and the port space
    /// * the disk worker
    /// * one vcpu per guest core
    pub fn configure(&mut self, cfg: &VMMConfig) -> Result<()> {
        let boot = image::load(&cfg.image).map_err(Error::Image)?;
        self.configure_with_image(cfg, &boot)
    }

    /// Same as [`VMM::configure`] with an already-loaded image.
    pub fn configure_with_image(&mut self, cfg: &VMMConfig, boot: &LoadedImage) -> Result<()> {
        cfg.validate().map_err(Error::Config)?;

        let sink = self
            .serial_sink
            .take()
            .unwrap_or_else(|| Box::new(std::io::stdout()));
        let machine = Machine::new(cfg.cores, cfg.memory_bytes, boot, sink)?;
        Disk::start(&machine, &cfg.disk, DEFAULT_IMAGE_BYTES).map_err(Error::Device)?;

        log::info!(
            "configured machine: {} cores, {} bytes of RAM, text at {:#010x}",
            cfg.cores,
            cfg.memory_bytes,
            machine.text_base()
        );

        self.cpus = (0..cfg.cores)
            .map(|core| Vcpu::new(core, machine.text_base(), machine.stack_bases(core)))
            .collect();
        self.machine = Some(machine);
        Ok(())
    }

    /// The configured machine, for host-side wiring (ISR installation,
    /// input injection, memory inspection).
    pub fn machine(&self) -> Option<&Arc<Machine>> {
        self.machine.as_ref()
    }

    fn spawn_cores(&mut self) -> Result<(Arc<Machine>, Vec<JoinHandle<()>>)> {
        let machine = Arc::clone(self.machine.as_ref().ok_or(Error::NotConfigured)?);
        let mut handles = Vec::with_capacity(self.cpus.len());
        for mut cpu in self.cpus.drain(..) {
            let core_machine = Arc::clone(&machine);
            let debugger = if cpu.is_bsp() { Debugger::from_env() } else { None };
            let handle = thread::Builder::new()
                .name(format!("vcpu{}", cpu.core_id))
                .spawn(move || cpu::run_core(&core_machine, &mut cpu, debugger))
                .map_err(Error::Thread)?;
            handles.push(handle);
        }
        Ok((machine, handles))
    }

    /// Run the VMM, pumping `display` on the calling thread at ~60 Hz
    /// until the machine halts or faults.
    pub fn run(&mut self, mut display: Box<dyn DisplaySurface>) -> Result<RunOutcome> {
        let (machine, handles) = self.spawn_cores()?;

        while !machine.power.should_stop() {
            let frame_start = Instant::now();
            for event in display.poll_events() {
                match event {
                    HostEvent::Quit => machine.power.halt(),
                    HostEvent::Byte(byte) => machine.serial_rx_push(byte),
                }
            }
            display.present(machine.framebuffer());
            if let Some(rest) = FRAME_INTERVAL.checked_sub(frame_start.elapsed()) {
                thread::sleep(rest);
            }
        }

        finish(&machine, handles, RunOutcome::Halted)
    }

    /// Run without a display. With a deadline, the machine is halted when
    /// the wall clock expires; the self tests are built on this.
    pub fn run_headless(&mut self, deadline: Option<Duration>) -> Result<RunOutcome> {
        let (machine, handles) = self.spawn_cores()?;
        let started = Instant::now();
        let mut outcome = RunOutcome::Halted;

        while !machine.power.should_stop() {
            if let Some(deadline) = deadline {
                if started.elapsed() >= deadline {
                    log::warn!("headless deadline expired after {:?}; halting", deadline);
                    machine.power.halt();
                    outcome = RunOutcome::DeadlineExpired;
                    break;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }

        finish(&machine, handles, outcome)
    }
}

fn finish(
    machine: &Arc<Machine>,
    handles: Vec<JoinHandle<()>>,
    outcome: RunOutcome,
) -> Result<RunOutcome> {
    for handle in handles {
        let _ = handle.join();
    }
    machine.disk.stop();
    machine.flush_serial();

    if machine.power.is_faulted() {
        Err(Error::Faulted)
    } else {
        log::info!(
            "machine stopped after {} retired instructions",
            machine.total_retired()
        );
        Ok(outcome)
    }
}
