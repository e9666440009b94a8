//! Bytecode fetch/dispatch engine.
//!
//! Handlers never touch the program counter. Each dispatched instruction
//! returns a [`StepResult`] naming the PC action and an optional target;
//! [`Engine::step`] applies it in one place, which keeps single-stepping
//! exact and makes jump validation uniform.

use crate::platform::HostIo;
use crate::time::Clock;

use super::host;
use super::instruction::{Instruction, Opcode};
use super::memory::Memory;
use super::stack::Stack;
use super::{Error, Program};

/// How the engine moves the PC after a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PcAction {
    Increment,
    JumpAbsolute,
    JumpRelative,
    Call,
    Return,
    Halt,
}

/// Handler outcome: PC action plus target (absolute index, or signed
/// offset for [`PcAction::JumpRelative`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub action: PcAction,
    pub target: u32,
}

impl StepResult {
    const fn next() -> Self {
        Self {
            action: PcAction::Increment,
            target: 0,
        }
    }

    const fn jump(target: u32) -> Self {
        Self {
            action: PcAction::JumpAbsolute,
            target,
        }
    }

    const fn halt() -> Self {
        Self {
            action: PcAction::Halt,
            target: 0,
        }
    }
}

/// Observable state of one retired instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StepRecord {
    /// PC before the step.
    pub pc: u32,
    pub opcode: u8,
    /// `(flags << 16) | immediate`.
    pub operand: u32,
}

pub struct Engine {
    stack: Stack,
    pc: u32,
    halted: bool,
    fault: Option<Error>,
}

impl Engine {
    pub const fn new() -> Self {
        Self {
            stack: Stack::new(),
            pc: 0,
            halted: false,
            fault: None,
        }
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn fault(&self) -> Option<Error> {
        self.fault
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn reset(&mut self) {
        self.stack.reset();
        self.pc = 0;
        self.halted = false;
        self.fault = None;
    }

    /// Latch a fault raised outside dispatch (e.g. an exhausted
    /// instruction budget) and halt.
    pub(super) fn abort(&mut self, error: Error) {
        self.fault = Some(error);
        self.halted = true;
    }

    /// Execute one instruction.
    ///
    /// A halted engine reports success without stepping. Any handler
    /// error latches the fault, halts the engine and propagates.
    pub fn step<IO: HostIo, C: Clock>(
        &mut self,
        program: &Program<'_>,
        memory: &mut Memory,
        io: &mut IO,
        clock: &mut C,
    ) -> Result<Option<StepRecord>, Error> {
        if self.halted {
            return Ok(None);
        }

        let instr = match program.fetch(self.pc) {
            Some(instr) => instr,
            None => return Err(self.trap(Error::InvalidJump)),
        };
        let record = StepRecord {
            pc: self.pc,
            opcode: instr.opcode,
            operand: instr.operand(),
        };

        let result = match self.dispatch(instr, program, memory, io, clock) {
            Ok(result) => result,
            Err(e) => return Err(self.trap(e)),
        };
        if let Err(e) = self.apply(result, program) {
            return Err(self.trap(e));
        }
        if self.halted {
            // HALT latches the flag; it is not a retired instruction.
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn trap(&mut self, error: Error) -> Error {
        debug!("vm trap {} at pc={}", error, self.pc);
        self.abort(error);
        error
    }

    fn apply(&mut self, result: StepResult, program: &Program<'_>) -> Result<(), Error> {
        let len = program.instruction_count() as u32;
        match result.action {
            PcAction::Increment => {
                self.pc += 1;
                Ok(())
            }
            PcAction::JumpAbsolute | PcAction::Call | PcAction::Return => {
                if result.target >= len {
                    return Err(Error::InvalidJump);
                }
                self.pc = result.target;
                Ok(())
            }
            PcAction::JumpRelative => {
                let target = self.pc as i64 + result.target as i32 as i64;
                if target < 0 || target >= len as i64 {
                    return Err(Error::InvalidJump);
                }
                self.pc = target as u32;
                Ok(())
            }
            PcAction::Halt => {
                self.halted = true;
                Ok(())
            }
        }
    }

    fn dispatch<IO: HostIo, C: Clock>(
        &mut self,
        instr: Instruction,
        program: &Program<'_>,
        memory: &mut Memory,
        io: &mut IO,
        clock: &mut C,
    ) -> Result<StepResult, Error> {
        let op = Opcode::from_u8(instr.opcode).ok_or(Error::InvalidOpcode)?;
        let stack = &mut self.stack;

        match op {
            Opcode::Halt => return Ok(StepResult::halt()),
            Opcode::Push => stack.push(instr.immediate_value())?,
            Opcode::Pop => {
                stack.pop()?;
            }
            Opcode::Call => {
                // Return address first so the callee sees a clean frame.
                stack.push((self.pc + 1) as i32)?;
                return Ok(StepResult {
                    action: PcAction::Call,
                    target: instr.immediate as u32,
                });
            }
            Opcode::Ret => {
                let addr = stack.pop()?;
                if addr < 0 {
                    return Err(Error::StackCorruption);
                }
                return Ok(StepResult {
                    action: PcAction::Return,
                    target: addr as u32,
                });
            }

            Opcode::Add => binary(stack, |a, b| a.wrapping_add(b))?,
            Opcode::Sub => binary(stack, |a, b| a.wrapping_sub(b))?,
            Opcode::Mul => binary(stack, |a, b| a.wrapping_mul(b))?,
            Opcode::Div => divide(stack, i32::wrapping_div)?,
            Opcode::Mod => divide(stack, i32::wrapping_rem)?,

            Opcode::Eq | Opcode::EqSigned => compare(stack, |a, b| a == b)?,
            Opcode::Ne | Opcode::NeSigned => compare(stack, |a, b| a != b)?,
            Opcode::Lt => compare(stack, |a, b| (a as u32) < b as u32)?,
            Opcode::Gt => compare(stack, |a, b| a as u32 > b as u32)?,
            Opcode::Le => compare(stack, |a, b| a as u32 <= b as u32)?,
            Opcode::Ge => compare(stack, |a, b| a as u32 >= b as u32)?,
            Opcode::LtSigned => compare(stack, |a, b| a < b)?,
            Opcode::GtSigned => compare(stack, |a, b| a > b)?,
            Opcode::LeSigned => compare(stack, |a, b| a <= b)?,
            Opcode::GeSigned => compare(stack, |a, b| a >= b)?,

            Opcode::And => compare(stack, |a, b| a != 0 && b != 0)?,
            Opcode::Or => compare(stack, |a, b| a != 0 || b != 0)?,
            Opcode::Not => {
                let a = stack.pop()?;
                stack.push((a == 0) as i32)?;
            }

            Opcode::BitAnd => binary(stack, |a, b| a & b)?,
            Opcode::BitOr => binary(stack, |a, b| a | b)?,
            Opcode::BitXor => binary(stack, |a, b| a ^ b)?,
            Opcode::BitNot => {
                let a = stack.pop()?;
                stack.push(!a)?;
            }
            Opcode::Shl => binary(stack, |a, b| ((a as u32) << (b as u32 & 0x1F)) as i32)?,
            Opcode::Shr => binary(stack, |a, b| ((a as u32) >> (b as u32 & 0x1F)) as i32)?,

            Opcode::LoadGlobal => stack.push(memory.load_global(instr.immediate)?)?,
            Opcode::StoreGlobal => {
                let value = stack.pop()?;
                memory.store_global(instr.immediate, value)?;
            }
            Opcode::LoadLocal => stack.push(memory.load_local(instr.immediate)?)?,
            Opcode::StoreLocal => {
                let value = stack.pop()?;
                memory.store_local(instr.immediate, value)?;
            }
            Opcode::LoadArray => {
                let index = stack.pop()?;
                let handle = stack.pop()?;
                let value = memory.array_load(as_handle(handle)?, as_index(index)?)?;
                stack.push(value)?;
            }
            Opcode::StoreArray => {
                let value = stack.pop()?;
                let index = stack.pop()?;
                let handle = stack.pop()?;
                memory.array_store(as_handle(handle)?, as_index(index)?, value)?;
            }
            Opcode::CreateArray => {
                let handle = memory.create_array(instr.immediate)?;
                stack.push(handle as i32)?;
            }

            Opcode::Jmp => return Ok(StepResult::jump(instr.immediate as u32)),
            Opcode::JmpTrue => {
                if stack.pop()? != 0 {
                    return Ok(StepResult::jump(instr.immediate as u32));
                }
            }
            Opcode::JmpFalse => {
                if stack.pop()? == 0 {
                    return Ok(StepResult::jump(instr.immediate as u32));
                }
            }

            Opcode::DigitalWrite
            | Opcode::DigitalRead
            | Opcode::AnalogWrite
            | Opcode::AnalogRead
            | Opcode::PinMode
            | Opcode::Delay
            | Opcode::Millis
            | Opcode::Micros
            | Opcode::Printf => host::dispatch(op, instr, stack, io, clock, program)?,
        }
        Ok(StepResult::next())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Pop two operands, push `f(a, b)`. Operand order is push order: `a`
/// was pushed before `b`. Nothing is mutated on a fault.
fn binary(stack: &mut Stack, f: impl FnOnce(i32, i32) -> i32) -> Result<(), Error> {
    let b = stack.peek(0)?;
    let a = stack.peek(1)?;
    stack.pop()?;
    stack.pop()?;
    stack.push(f(a, b))
}

/// `DIV`/`MOD` with the divisor check before any stack mutation.
fn divide(stack: &mut Stack, f: impl FnOnce(i32, i32) -> i32) -> Result<(), Error> {
    let b = stack.peek(0)?;
    let _ = stack.peek(1)?;
    if b == 0 {
        return Err(Error::DivisionByZero);
    }
    binary(stack, f)
}

fn compare(stack: &mut Stack, f: impl FnOnce(i32, i32) -> bool) -> Result<(), Error> {
    binary(stack, |a, b| f(a, b) as i32)
}

fn as_handle(value: i32) -> Result<u8, Error> {
    u8::try_from(value).map_err(|_| Error::MemoryBounds)
}

fn as_index(value: i32) -> Result<u16, Error> {
    u16::try_from(value).map_err(|_| Error::MemoryBounds)
}
