//! Host API surface.
//!
//! The whitelisted hardware operations reachable from guest bytecode.
//! Arguments are popped right-to-left (the last-pushed argument comes
//! off first); a return value, when the operation has one, is pushed
//! back. Platform failures halt the guest with a hardware fault.

use core::fmt::Write as _;

use heapless::String;

use crate::gpio::{Level, PinMode};
use crate::platform::HostIo;
use crate::time::Clock;

use super::instruction::{Instruction, Opcode};
use super::stack::Stack;
use super::{Error, Program};

/// Upper bound on one rendered `PRINTF` line.
const PRINTF_CAPACITY: usize = 128;

/// Maximum `PRINTF` arguments.
const PRINTF_MAX_ARGS: usize = 8;

pub(super) fn dispatch<IO: HostIo, C: Clock>(
    op: Opcode,
    instr: Instruction,
    stack: &mut Stack,
    io: &mut IO,
    clock: &mut C,
    program: &Program<'_>,
) -> Result<(), Error> {
    match op {
        Opcode::DigitalWrite => {
            let level = stack.pop()?;
            let pin = pop_pin(stack)?;
            io.pin_write(pin, Level::from(level != 0))
                .map_err(|_| Error::HardwareFault)?;
        }
        Opcode::DigitalRead => {
            let pin = pop_pin(stack)?;
            let level = io.pin_read(pin).map_err(|_| Error::HardwareFault)?;
            stack.push(bool::from(level) as i32)?;
        }
        Opcode::AnalogWrite => {
            let value = stack.pop()?;
            let pin = pop_pin(stack)?;
            let value = u16::try_from(value).map_err(|_| Error::HardwareFault)?;
            io.analog_write(pin, value).map_err(|_| Error::HardwareFault)?;
        }
        Opcode::AnalogRead => {
            let pin = pop_pin(stack)?;
            let value = io.analog_read(pin).map_err(|_| Error::HardwareFault)?;
            stack.push(value as i32)?;
        }
        Opcode::PinMode => {
            let mode = stack.pop()?;
            let pin = pop_pin(stack)?;
            let mode = u8::try_from(mode)
                .ok()
                .and_then(PinMode::from_index)
                .ok_or(Error::HardwareFault)?;
            io.pin_config(pin, mode).map_err(|_| Error::HardwareFault)?;
        }
        Opcode::Delay => {
            let ms = stack.pop()?;
            let ms = u32::try_from(ms).map_err(|_| Error::HardwareFault)?;
            clock.delay_ms(ms);
        }
        Opcode::Millis => stack.push(clock.tick_ms() as i32)?,
        Opcode::Micros => stack.push(clock.tick_us() as i32)?,
        Opcode::Printf => printf(instr, stack, io, program)?,
        _ => return Err(Error::InvalidOpcode),
    }
    Ok(())
}

fn pop_pin(stack: &mut Stack) -> Result<u8, Error> {
    let pin = stack.pop()?;
    u8::try_from(pin).map_err(|_| Error::HardwareFault)
}

fn printf<IO: HostIo>(
    instr: Instruction,
    stack: &mut Stack,
    io: &mut IO,
    program: &Program<'_>,
) -> Result<(), Error> {
    let format = program
        .string(instr.immediate)
        .ok_or(Error::PrintfError)?;

    let argc = stack.pop()?;
    let argc = usize::try_from(argc).map_err(|_| Error::PrintfError)?;
    if argc > PRINTF_MAX_ARGS {
        return Err(Error::PrintfError);
    }
    let mut args = [0i32; PRINTF_MAX_ARGS];
    // Arguments were pushed left-to-right; popping reverses them.
    for slot in args[..argc].iter_mut().rev() {
        *slot = stack.pop()?;
    }

    let mut line: String<PRINTF_CAPACITY> = String::new();
    render(&mut line, format, &args[..argc])?;
    io.console_write(&line).map_err(|_| Error::HardwareFault)
}

/// Render the supported conversions: `%d %u %x %c %%`.
fn render(out: &mut String<PRINTF_CAPACITY>, format: &str, args: &[i32]) -> Result<(), Error> {
    let mut args = args.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c).map_err(|_| Error::PrintfError)?;
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%').map_err(|_| Error::PrintfError)?,
            Some('d') => {
                let v = args.next().ok_or(Error::PrintfError)?;
                write!(out, "{}", v).map_err(|_| Error::PrintfError)?;
            }
            Some('u') => {
                let v = args.next().ok_or(Error::PrintfError)?;
                write!(out, "{}", *v as u32).map_err(|_| Error::PrintfError)?;
            }
            Some('x') => {
                let v = args.next().ok_or(Error::PrintfError)?;
                write!(out, "{:x}", *v as u32).map_err(|_| Error::PrintfError)?;
            }
            Some('c') => {
                let v = args.next().ok_or(Error::PrintfError)?;
                let ch = u32::try_from(*v)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or(Error::PrintfError)?;
                out.push(ch).map_err(|_| Error::PrintfError)?;
            }
            _ => return Err(Error::PrintfError),
        }
    }
    Ok(())
}
