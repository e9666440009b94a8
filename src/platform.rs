//! Hardware-independent platform contract.
//!
//! The core never touches a register. A board support crate implements
//! [`HostIo`] plus [`crate::time::Clock`] and
//! [`crate::flash::FlashControl`]; the in-memory stand-ins live in
//! [`crate::sim`].

use crate::gpio::{IoError, Level, PinMode};

/// The whitelisted hardware surface reachable from guest bytecode.
///
/// Every operation is fallible; a platform error is reported to the VM
/// as a hardware fault and halts the guest.
pub trait HostIo {
    /// Configure a pin's mode.
    fn pin_config(&mut self, pin: u8, mode: PinMode) -> Result<(), IoError>;

    /// Drive a digital output.
    fn pin_write(&mut self, pin: u8, level: Level) -> Result<(), IoError>;

    /// Sample a digital input.
    fn pin_read(&mut self, pin: u8) -> Result<Level, IoError>;

    /// Write a PWM/DAC value.
    fn analog_write(&mut self, pin: u8, value: u16) -> Result<(), IoError>;

    /// Sample an ADC channel.
    fn analog_read(&mut self, pin: u8) -> Result<u16, IoError>;

    /// Emit guest console output (the `PRINTF` host call).
    fn console_write(&mut self, text: &str) -> Result<(), IoError>;

    /// Drive every guest-reachable peripheral to a safe state.
    ///
    /// Called on emergency shutdown; must not fail.
    fn safe_state(&mut self);
}
