//! Guest-visible GPIO types.
//!
//! The guest addresses pins by number through the host-call surface; the
//! types here are the currency between the VM, the platform traits and a
//! board support crate. [`Output`] and [`Input`] wrap a platform pin as
//! an embedded-hal digital pin for host firmware that wants to share a
//! pin with the guest.

use crate::platform::HostIo;

/// Digital input or output level.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Low
    Low,
    /// High
    High,
}

impl From<bool> for Level {
    fn from(val: bool) -> Self {
        match val {
            true => Self::High,
            false => Self::Low,
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> bool {
        match level {
            Level::Low => false,
            Level::High => true,
        }
    }
}

/// Pull setting for an input.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pull {
    /// No pull
    None,
    /// Pull up
    Up,
    /// Pull down
    Down,
}

/// Pin mode as selectable by the guest `PIN_MODE` host call.
///
/// The discriminants are the values the guest passes on its stack.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PinMode {
    Input = 0,
    Output = 1,
    InputPullUp = 2,
    InputPullDown = 3,
    Analog = 4,
}

impl PinMode {
    pub fn from_index(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Input),
            1 => Some(Self::Output),
            2 => Some(Self::InputPullUp),
            3 => Some(Self::InputPullDown),
            4 => Some(Self::Analog),
            _ => None,
        }
    }
}

/// Errors surfaced by a platform GPIO/analog implementation.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum IoError {
    /// Pin number outside the board's map.
    InvalidPin,
    /// Peripheral not configured for the requested operation.
    NotReady,
    /// Operation not available on this pin.
    Unsupported,
}

impl embedded_hal::digital::Error for IoError {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

/// Push-pull output over a numbered platform pin.
pub struct Output<'d, IO: HostIo> {
    io: &'d mut IO,
    pin: u8,
}

impl<'d, IO: HostIo> Output<'d, IO> {
    /// Configure `pin` as an output and wrap it.
    pub fn new(io: &'d mut IO, pin: u8) -> Result<Self, IoError> {
        io.pin_config(pin, PinMode::Output)?;
        Ok(Self { io, pin })
    }

    #[inline]
    pub fn set_level(&mut self, level: Level) -> Result<(), IoError> {
        self.io.pin_write(self.pin, level)
    }
}

/// Input over a numbered platform pin.
pub struct Input<'d, IO: HostIo> {
    io: &'d mut IO,
    pin: u8,
}

impl<'d, IO: HostIo> Input<'d, IO> {
    /// Configure `pin` as an input with the requested pull and wrap it.
    pub fn new(io: &'d mut IO, pin: u8, pull: Pull) -> Result<Self, IoError> {
        let mode = match pull {
            Pull::None => PinMode::Input,
            Pull::Up => PinMode::InputPullUp,
            Pull::Down => PinMode::InputPullDown,
        };
        io.pin_config(pin, mode)?;
        Ok(Self { io, pin })
    }

    #[inline]
    pub fn level(&mut self) -> Result<Level, IoError> {
        self.io.pin_read(self.pin)
    }
}

// ==========
// traits

impl<IO: HostIo> embedded_hal::digital::ErrorType for Output<'_, IO> {
    type Error = IoError;
}

impl<IO: HostIo> embedded_hal::digital::OutputPin for Output<'_, IO> {
    #[inline]
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_level(Level::Low)
    }

    #[inline]
    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_level(Level::High)
    }
}

impl<IO: HostIo> embedded_hal::digital::ErrorType for Input<'_, IO> {
    type Error = IoError;
}

impl<IO: HostIo> embedded_hal::digital::InputPin for Input<'_, IO> {
    #[inline]
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.level().map(bool::from)
    }

    #[inline]
    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.level().map(|l| l == Level::Low)
    }
}
