// SPDX-License-Identifier: Apache-2.0

//! COM1 serial console: owns the guest-facing port window and the host side
//! of the console (stdout for output, queued raw bytes for input).

use std::io::{stdout, Error, ErrorKind, Result, Stdout};
use std::ops::Deref;

use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};
use vmm_sys_util::eventfd::EventFd;

pub const SERIAL_PORT_BASE: u16 = 0x3f8;
pub const SERIAL_PORT_LAST_REGISTER: u16 = SERIAL_PORT_BASE + 7;

pub struct EventFdTrigger(EventFd);

impl Trigger for EventFdTrigger {
    type E = Error;

    fn trigger(&self) -> Result<()> {
        self.write(1)
    }
}

impl Deref for EventFdTrigger {
    type Target = EventFd;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl EventFdTrigger {
    pub fn new(flag: i32) -> Result<Self> {
        Ok(EventFdTrigger(EventFd::new(flag)?))
    }
    pub fn try_clone(&self) -> Result<Self> {
        Ok(EventFdTrigger((**self).try_clone()?))
    }
}

pub(crate) struct SerialConsole {
    // eventfd the device uses to raise its interrupt line.
    eventfd: EventFdTrigger,

    serial: Serial<EventFdTrigger, NoEvents, Stdout>,
}

impl SerialConsole {
    pub fn new() -> Result<Self> {
        let eventfd = EventFdTrigger::new(libc::EFD_NONBLOCK)?;

        Ok(SerialConsole {
            eventfd: eventfd.try_clone()?,
            serial: Serial::new(eventfd.try_clone()?, stdout()),
        })
    }

    pub fn eventfd(&self) -> Result<EventFd> {
        Ok(self.eventfd.try_clone()?.0)
    }

    /// Whether a PIO address falls inside the COM1 register window.
    pub fn handles(port: u16) -> bool {
        (SERIAL_PORT_BASE..=SERIAL_PORT_LAST_REGISTER).contains(&port)
    }

    /// Guest write to a port inside the window.
    pub fn pio_write(&mut self, port: u16, value: u8) -> Result<()> {
        if !Self::handles(port) {
            return Ok(());
        }
        self.serial
            .write((port - SERIAL_PORT_BASE) as u8, value)
            .map_err(|e| Error::new(ErrorKind::Other, format!("{:?}", e)))
    }

    /// Guest read from a port inside the window.
    pub fn pio_read(&mut self, port: u16) -> u8 {
        if !Self::handles(port) {
            return 0;
        }
        self.serial.read((port - SERIAL_PORT_BASE) as u8)
    }

    /// Feed host console input into the guest-visible receive FIFO.
    pub fn queue_input(&mut self, bytes: &[u8]) -> Result<usize> {
        self.serial
            .enqueue_raw_bytes(bytes)
            .map_err(|e| Error::new(ErrorKind::Other, format!("{:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 16550 register offsets and LSR bits.
    const DATA: u16 = SERIAL_PORT_BASE;
    const LSR: u16 = SERIAL_PORT_BASE + 5;
    const LSR_DATA_READY: u8 = 0x01;
    const LSR_EMPTY_THR: u8 = 0x20;

    #[test]
    fn test_port_window() {
        assert!(SerialConsole::handles(SERIAL_PORT_BASE));
        assert!(SerialConsole::handles(SERIAL_PORT_LAST_REGISTER));
        assert!(!SerialConsole::handles(SERIAL_PORT_BASE - 1));
        assert!(!SerialConsole::handles(SERIAL_PORT_LAST_REGISTER + 1));
    }

    #[test]
    fn test_idle_transmitter_is_empty() {
        let mut console = SerialConsole::new().unwrap();
        assert_ne!(console.pio_read(LSR) & LSR_EMPTY_THR, 0);
        assert_eq!(console.pio_read(LSR) & LSR_DATA_READY, 0);
    }

    #[test]
    fn test_queued_input_reaches_data_register() {
        let mut console = SerialConsole::new().unwrap();
        assert_eq!(console.queue_input(b"ok").unwrap(), 2);

        assert_ne!(console.pio_read(LSR) & LSR_DATA_READY, 0);
        assert_eq!(console.pio_read(DATA), b'o');
        assert_eq!(console.pio_read(DATA), b'k');
        assert_eq!(console.pio_read(LSR) & LSR_DATA_READY, 0);
    }

    #[test]
    fn test_out_of_window_access_is_inert() {
        let mut console = SerialConsole::new().unwrap();
        assert_eq!(console.pio_read(0x2f8), 0);
        console.pio_write(0x2f8, 0xff).unwrap();
    }
}
