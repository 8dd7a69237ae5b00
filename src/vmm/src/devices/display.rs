// SPDX-License-Identifier: Apache-2.0

//! Host display contract.
//!
//! The actual window (SDL or otherwise) lives outside this crate; the VMM
//! only pumps a [`DisplaySurface`] at roughly 60 Hz from the run thread.
//! A quit event halts the machine, input bytes are injected into the
//! serial RX path.

use crate::machine::Framebuffer;

/// Host-side event drained once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Close the VM (window closed, Ctrl-C, ...).
    Quit,
    /// One byte of host input for the serial device.
    Byte(u8),
}

pub trait DisplaySurface: Send {
    /// Drain pending host events.
    fn poll_events(&mut self) -> Vec<HostEvent>;

    /// Redraw from the framebuffer. Reads race guest writes; tearing is
    /// accepted.
    fn present(&mut self, fb: &Framebuffer);
}

/// Headless backend: no input, no output.
#[derive(Debug, Default)]
pub struct NullDisplay;

impl DisplaySurface for NullDisplay {
    fn poll_events(&mut self) -> Vec<HostEvent> {
        Vec::new()
    }

    fn present(&mut self, _fb: &Framebuffer) {}
}
