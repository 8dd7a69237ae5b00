// SPDX-License-Identifier: Apache-2.0

//! Minimal three-port serial device.
//!
//! Port 1 transmits a byte to the host sink, port 3 receives a byte from
//! host input, port 2 exposes a packed `[control:8][status:8]` pair. The
//! guest owns the control byte and can only read the status byte; RX bytes
//! arrive one at a time and must be consumed before the next is accepted.

use std::io::Write;

pub const SERIAL_STATUS_TX_READY: u32 = 0x01;
pub const SERIAL_STATUS_RX_READY: u32 = 0x02;
pub const SERIAL_CTRL_RX_INT_ENABLE: u32 = 0x01;

pub struct Serial {
    out: Box<dyn Write + Send>,
    /// Last transmitted value, readable back through the TX port.
    data: u32,
    /// `[control:8][status:8]`.
    attr: u32,
    rx: u32,
}

impl Serial {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Serial {
            out,
            data: 0,
            attr: SERIAL_STATUS_TX_READY,
            rx: 0,
        }
    }

    pub fn transmit(&mut self, value: u32) {
        let byte = [value as u8];
        if self.out.write_all(&byte).and_then(|_| self.out.flush()).is_err() {
            log::warn!("serial TX sink rejected a byte");
        }
        self.data = value;
    }

    pub fn data(&self) -> u32 {
        self.data
    }

    /// Guest-visible half of the attribute pair.
    pub fn status(&self) -> u32 {
        self.attr & 0xff
    }

    fn control(&self) -> u32 {
        (self.attr >> 8) & 0xff
    }

    /// Guest write to the attribute port: replaces the control byte, never
    /// the status bits.
    pub fn set_control(&mut self, value: u32) {
        self.attr = (self.attr & 0xff) | ((value & 0xff) << 8);
    }

    /// Read and clear the pending RX byte. With nothing pending this
    /// returns 0 and the status is unchanged.
    pub fn take_rx(&mut self) -> u32 {
        let value = self.rx;
        self.rx = 0;
        self.attr &= !SERIAL_STATUS_RX_READY;
        value
    }

    /// Guest write to the RX port overwrites the buffered byte without
    /// touching the ready bit.
    pub fn set_rx(&mut self, value: u32) {
        self.rx = value;
    }

    /// Host input path. Returns true when the RX interrupt should fire.
    /// The byte is dropped if the previous one has not been read yet.
    pub fn push_rx(&mut self, byte: u8) -> bool {
        if self.attr & SERIAL_STATUS_RX_READY != 0 {
            return false;
        }
        self.rx = byte as u32;
        self.attr |= SERIAL_STATUS_RX_READY;
        self.control() & SERIAL_CTRL_RX_INT_ENABLE != 0
    }

    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SharedSink;

    #[test]
    fn fresh_device_is_ready_to_transmit() {
        let serial = Serial::new(Box::new(std::io::sink()));
        assert_eq!(serial.status(), SERIAL_STATUS_TX_READY);
    }

    #[test]
    fn transmit_reaches_the_sink_and_latches() {
        let sink = SharedSink::new();
        let mut serial = Serial::new(Box::new(sink.clone()));
        serial.transmit('h' as u32);
        serial.transmit('i' as u32);
        assert_eq!(sink.contents(), b"hi");
        assert_eq!(serial.data(), 'i' as u32);
    }

    #[test]
    fn rx_byte_sets_ready_and_read_clears_it() {
        let mut serial = Serial::new(Box::new(std::io::sink()));
        assert!(!serial.push_rx(b'x'));
        assert_eq!(serial.status() & SERIAL_STATUS_RX_READY, SERIAL_STATUS_RX_READY);
        assert_eq!(serial.take_rx(), b'x' as u32);
        assert_eq!(serial.status() & SERIAL_STATUS_RX_READY, 0);
        // Empty read: zero, status untouched.
        assert_eq!(serial.take_rx(), 0);
        assert_eq!(serial.status(), SERIAL_STATUS_TX_READY);
    }

    #[test]
    fn second_rx_byte_is_dropped_until_consumed() {
        let mut serial = Serial::new(Box::new(std::io::sink()));
        serial.push_rx(b'a');
        serial.push_rx(b'b');
        assert_eq!(serial.take_rx(), b'a' as u32);
        assert!(!serial.push_rx(b'c'));
        assert_eq!(serial.take_rx(), b'c' as u32);
    }

    #[test]
    fn rx_interrupt_follows_the_control_bit() {
        let mut serial = Serial::new(Box::new(std::io::sink()));
        assert!(!serial.push_rx(b'a'));
        serial.take_rx();

        serial.set_control(SERIAL_CTRL_RX_INT_ENABLE);
        assert!(serial.push_rx(b'b'));
        // Status byte survives control writes.
        assert_eq!(serial.status() & SERIAL_STATUS_RX_READY, SERIAL_STATUS_RX_READY);
    }

    #[test]
    fn guest_cannot_write_status_bits() {
        let mut serial = Serial::new(Box::new(std::io::sink()));
        serial.set_control(0xff);
        assert_eq!(serial.status(), SERIAL_STATUS_TX_READY);
        serial.push_rx(b'a');
        serial.set_control(0);
        assert_eq!(
            serial.status(),
            SERIAL_STATUS_TX_READY | SERIAL_STATUS_RX_READY
        );
    }
}
