// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the unit tests.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::cpu::Vcpu;
use crate::image::LoadedImage;
use crate::machine::{Machine, DEFAULT_MEM_SIZE};

/// A machine with no program loaded.
pub(crate) fn bare_machine(cores: usize) -> Arc<Machine> {
    machine_with_image(cores, &LoadedImage::from_words(&[]))
}

pub(crate) fn machine_with_image(cores: usize, image: &LoadedImage) -> Arc<Machine> {
    Machine::new(cores, DEFAULT_MEM_SIZE, image, Box::new(std::io::sink())).unwrap()
}

/// A machine with `words` assembled at the program base, plus a BSP vcpu
/// ready to step it.
pub(crate) fn machine_with_program(cores: usize, words: &[u64]) -> (Arc<Machine>, Vcpu) {
    let machine = machine_with_image(cores, &LoadedImage::from_words(words));
    let cpu = bsp(&machine);
    (machine, cpu)
}

pub(crate) fn bsp(machine: &Machine) -> Vcpu {
    Vcpu::new(0, machine.text_base(), machine.stack_bases(0))
}

/// Cloneable in-memory serial sink.
#[derive(Clone, Default)]
pub(crate) struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub(crate) fn new() -> Self {
        SharedSink::default()
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
