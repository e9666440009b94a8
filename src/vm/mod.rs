//! Sandboxed stack virtual machine.
//!
//! [`Vm`] owns the execution engine, the guest memory model and the host
//! IO surface; guests reach hardware only through the whitelisted host
//! calls. Observers receive a notification after every retired
//! instruction, on program completion and on reset, and must not mutate
//! VM state.

use heapless::Vec;

use crate::platform::HostIo;
use crate::time::{elapsed, Clock};

pub mod engine;
pub mod host;
pub mod image;
pub mod instruction;
pub mod memory;
pub mod stack;

pub use engine::{Engine, PcAction, StepRecord, StepResult};
pub use instruction::{Instruction, Opcode};
pub use memory::Memory;
pub use stack::Stack;

/// Maximum string literals per program.
pub const MAX_STRINGS: usize = 32;

/// Maximum registered observers.
pub const MAX_OBSERVERS: usize = 4;

/// Guest execution faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    StackOverflow,
    StackUnderflow,
    /// The stack held a value that cannot be a return address.
    StackCorruption,
    InvalidJump,
    InvalidOpcode,
    DivisionByZero,
    MemoryBounds,
    PrintfError,
    HardwareFault,
    ProgramNotLoaded,
    /// The run exceeded the configured instruction budget.
    ExecutionFailed,
}

/// A loaded guest program: packed code plus its string literal table,
/// borrowed from flash (or any byte buffer) and decoded on the fly.
#[derive(Clone)]
pub struct Program<'a> {
    code: &'a [u8],
    count: usize,
    strings: Vec<&'a str, MAX_STRINGS>,
}

impl<'a> Program<'a> {
    /// Wrap raw packed code. `code` must be a whole number of 4-byte
    /// instructions.
    pub fn new(code: &'a [u8], strings: &[&'a str]) -> Result<Self, image::Error> {
        if code.len() % Instruction::SIZE != 0 {
            return Err(image::Error::SizeMismatch);
        }
        if strings.len() > MAX_STRINGS {
            return Err(image::Error::TooManyStrings);
        }
        let mut table: Vec<&str, MAX_STRINGS> = Vec::new();
        for &s in strings {
            let _ = table.push(s);
        }
        Ok(Self::from_parts(code, table))
    }

    pub(crate) fn from_parts(code: &'a [u8], strings: Vec<&'a str, MAX_STRINGS>) -> Self {
        Self {
            code,
            count: code.len() / Instruction::SIZE,
            strings,
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.count
    }

    /// Decode the instruction at index `pc`.
    pub fn fetch(&self, pc: u32) -> Option<Instruction> {
        let at = (pc as usize).checked_mul(Instruction::SIZE)?;
        let bytes = self.code.get(at..at + Instruction::SIZE)?;
        Some(Instruction::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))
    }

    pub fn string(&self, index: u16) -> Option<&'a str> {
        self.strings.get(index as usize).copied()
    }
}

/// Execution tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Instructions one `execute_program` call may retire before the
    /// run is aborted with [`Error::ExecutionFailed`].
    pub instruction_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instruction_limit: 1_000_000,
        }
    }
}

/// Counters updated as the guest runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Metrics {
    pub instructions_retired: u32,
    pub host_calls: u32,
    pub last_elapsed_ms: u32,
}

/// Read-only VM telemetry sink.
///
/// Callbacks take `&self`; implementations that accumulate state use
/// interior mutability. Observers must not reach back into the VM.
pub trait Observer {
    fn instruction_retired(&self, _pc: u32, _opcode: u8, _operand: u32) {}
    fn program_completed(&self, _instructions: u32, _elapsed_ms: u32) {}
    fn vm_reset(&self) {}
}

/// The VM orchestrator.
pub struct Vm<'p, 'o, IO: HostIo, C: Clock> {
    engine: Engine,
    memory: Memory,
    io: IO,
    clock: C,
    config: Config,
    metrics: Metrics,
    program: Option<Program<'p>>,
    observers: Vec<&'o dyn Observer, MAX_OBSERVERS>,
}

impl<'p, 'o, IO: HostIo, C: Clock> Vm<'p, 'o, IO, C> {
    pub fn new(io: IO, clock: C) -> Self {
        Self::with_config(io, clock, Config::default())
    }

    pub fn with_config(io: IO, clock: C, config: Config) -> Self {
        Self {
            engine: Engine::new(),
            memory: Memory::new(),
            io,
            clock,
            config,
            metrics: Metrics::default(),
            program: None,
            observers: Vec::new(),
        }
    }

    /// Register an observer. Returns false when the registry is full.
    pub fn add_observer(&mut self, observer: &'o dyn Observer) -> bool {
        self.observers.push(observer).is_ok()
    }

    /// Load a program and reset all guest state.
    pub fn load_program(&mut self, program: Program<'p>) {
        self.reset_state();
        self.program = Some(program);
    }

    /// Parse and load a flash image (header, code, string table).
    pub fn load_image(&mut self, bytes: &'p [u8]) -> Result<(), image::Error> {
        let program = image::parse(bytes)?;
        self.load_program(program);
        Ok(())
    }

    /// Run until the guest halts, faults or exhausts the instruction
    /// budget. Observers are notified of completion either way.
    pub fn execute_program(&mut self) -> Result<(), Error> {
        if self.program.is_none() {
            return Err(Error::ProgramNotLoaded);
        }
        let start = self.clock.tick_ms();
        let mut executed: u32 = 0;
        let outcome = loop {
            if executed == self.config.instruction_limit {
                self.engine.abort(Error::ExecutionFailed);
                break Err(Error::ExecutionFailed);
            }
            match self.execute_single_step() {
                Ok(Some(_)) => executed += 1,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let elapsed_ms = elapsed(start, self.clock.tick_ms());
        self.metrics.last_elapsed_ms = elapsed_ms;
        for observer in &self.observers {
            observer.program_completed(executed, elapsed_ms);
        }
        outcome
    }

    /// Retire at most one instruction.
    ///
    /// Returns `Ok(None)` when the engine is halted; counters do not
    /// advance in that case.
    pub fn execute_single_step(&mut self) -> Result<Option<StepRecord>, Error> {
        let Vm {
            engine,
            memory,
            io,
            clock,
            program,
            ..
        } = self;
        let program = program.as_ref().ok_or(Error::ProgramNotLoaded)?;
        let record = engine.step(program, memory, io, clock)?;
        if let Some(record) = record {
            self.metrics.instructions_retired += 1;
            if Opcode::from_u8(record.opcode).is_some_and(Opcode::is_host_call) {
                self.metrics.host_calls += 1;
            }
            for observer in &self.observers {
                observer.instruction_retired(record.pc, record.opcode, record.operand);
            }
        }
        Ok(record)
    }

    /// Clear all guest state. The loaded program is kept.
    pub fn reset(&mut self) {
        self.reset_state();
        for observer in &self.observers {
            observer.vm_reset();
        }
    }

    fn reset_state(&mut self) {
        self.engine.reset();
        self.memory.reset();
        self.metrics = Metrics::default();
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub fn last_error(&self) -> Option<Error> {
        self.engine.fault()
    }

    pub fn is_halted(&self) -> bool {
        self.engine.is_halted()
    }

    pub fn pc(&self) -> u32 {
        self.engine.pc()
    }

    /// Guest stack, for assertions and telemetry.
    pub fn stack(&self) -> &Stack {
        self.engine.stack()
    }

    /// Guest memory, for assertions and telemetry.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn io(&self) -> &IO {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};

    use super::*;
    use crate::sim::{SimClock, SimIo};

    fn new_vm<'p, 'o>() -> Vm<'p, 'o, SimIo, SimClock> {
        Vm::new(SimIo::new(), SimClock::new())
    }

    fn assemble(instructions: &[Instruction]) -> std::vec::Vec<u8> {
        instructions
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect()
    }

    #[test]
    fn arithmetic_and_halt() {
        // (10 / 3) * 3 - 10 == -1 in integer arithmetic
        let code = assemble(&[
            Instruction::new(Opcode::Push, 10),
            Instruction::new(Opcode::Push, 3),
            Instruction::new(Opcode::Div, 0),
            Instruction::new(Opcode::Push, 3),
            Instruction::new(Opcode::Mul, 0),
            Instruction::new(Opcode::Push, 10),
            Instruction::new(Opcode::Sub, 0),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();

        assert!(vm.is_halted());
        assert_eq!(vm.stack().peek(0), Ok(-1));
        // HALT latches the flag without counting as a retirement.
        assert_eq!(vm.metrics().instructions_retired, 7);
    }

    #[test]
    fn division_by_zero_preserves_stack() {
        let code = assemble(&[
            Instruction::new(Opcode::Push, 9),
            Instruction::new(Opcode::Push, 0),
            Instruction::new(Opcode::Div, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        assert_eq!(vm.execute_program(), Err(Error::DivisionByZero));
        assert_eq!(vm.last_error(), Some(Error::DivisionByZero));
        // Operands still in place.
        assert_eq!(vm.stack().peek(0), Ok(0));
        assert_eq!(vm.stack().peek(1), Ok(9));
    }

    #[test]
    fn jump_bounds() {
        // Jump to the last instruction is fine.
        let code = assemble(&[
            Instruction::new(Opcode::Jmp, 1),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();

        // Jump to instruction_count is not.
        let code = assemble(&[
            Instruction::new(Opcode::Jmp, 2),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        assert_eq!(vm.execute_program(), Err(Error::InvalidJump));
    }

    #[test]
    fn call_and_return() {
        // main: CALL 2; HALT  sub: PUSH 7; RET
        let code = assemble(&[
            Instruction::new(Opcode::Call, 2),
            Instruction::new(Opcode::Halt, 0),
            Instruction::new(Opcode::Push, 7),
            Instruction::new(Opcode::Ret, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();
        assert_eq!(vm.stack().peek(0), Ok(7));
        assert_eq!(vm.stack().depth(), 1);
    }

    #[test]
    fn conditional_loop_counts_down() {
        // g0 = 5; while (g0 != 0) g0 -= 1;
        let code = assemble(&[
            Instruction::new(Opcode::Push, 5),
            Instruction::new(Opcode::StoreGlobal, 0),
            // loop:
            Instruction::new(Opcode::LoadGlobal, 0),
            Instruction::new(Opcode::JmpFalse, 9),
            Instruction::new(Opcode::LoadGlobal, 0),
            Instruction::new(Opcode::Push, 1),
            Instruction::new(Opcode::Sub, 0),
            Instruction::new(Opcode::StoreGlobal, 0),
            Instruction::new(Opcode::Jmp, 2),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();
        assert_eq!(vm.memory().load_global(0), Ok(0));
    }

    #[test]
    fn runaway_program_hits_instruction_budget() {
        let code = assemble(&[Instruction::new(Opcode::Jmp, 0)]);
        let mut vm = Vm::with_config(
            SimIo::new(),
            SimClock::new(),
            Config {
                instruction_limit: 1000,
            },
        );
        vm.load_program(Program::new(&code, &[]).unwrap());
        assert_eq!(vm.execute_program(), Err(Error::ExecutionFailed));
        assert_eq!(vm.metrics().instructions_retired, 1000);
    }

    #[test]
    fn halted_steps_are_no_ops() {
        let code = assemble(&[Instruction::new(Opcode::Halt, 0)]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();
        let retired = vm.metrics().instructions_retired;
        assert_eq!(vm.execute_single_step(), Ok(None));
        assert_eq!(vm.metrics().instructions_retired, retired);
    }

    #[test]
    fn reset_then_reload_restores_initial_state() {
        let code = assemble(&[
            Instruction::new(Opcode::Push, 1),
            Instruction::new(Opcode::StoreGlobal, 5),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();
        assert_eq!(vm.memory().load_global(5), Ok(1));

        vm.reset();
        assert_eq!(vm.pc(), 0);
        assert!(!vm.is_halted());
        assert_eq!(vm.memory().load_global(5), Ok(0));
        assert_eq!(vm.stack().depth(), 0);
        assert_eq!(vm.metrics(), Metrics::default());

        // The program is still loaded and runs again identically.
        vm.execute_program().unwrap();
        assert_eq!(vm.memory().load_global(5), Ok(1));
    }

    #[test]
    fn guest_drives_gpio_through_host_calls() {
        // pinMode(13, OUTPUT); digitalWrite(13, HIGH); delay(10); HALT
        let code = assemble(&[
            Instruction::new(Opcode::Push, 13),
            Instruction::new(Opcode::Push, 1), // OUTPUT
            Instruction::new(Opcode::PinMode, 0),
            Instruction::new(Opcode::Push, 13),
            Instruction::new(Opcode::Push, 1), // HIGH
            Instruction::new(Opcode::DigitalWrite, 0),
            Instruction::new(Opcode::Push, 10),
            Instruction::new(Opcode::Delay, 0),
            Instruction::new(Opcode::Millis, 0),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();

        assert_eq!(vm.io().output_level(13), crate::gpio::Level::High);
        assert_eq!(vm.stack().peek(0), Ok(10)); // millis after delay(10)
        assert_eq!(vm.metrics().host_calls, 4);
    }

    #[test]
    fn hardware_fault_halts_the_guest() {
        let code = assemble(&[
            Instruction::new(Opcode::Push, 7),
            Instruction::new(Opcode::DigitalRead, 0),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.io_mut().inject_fault(7);
        vm.load_program(Program::new(&code, &[]).unwrap());
        assert_eq!(vm.execute_program(), Err(Error::HardwareFault));
        assert!(vm.is_halted());
    }

    #[test]
    fn printf_renders_to_console() {
        let code = assemble(&[
            Instruction::new(Opcode::Push, 42),
            Instruction::new(Opcode::Push, 1), // argc
            Instruction::new(Opcode::Printf, 0),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let mut vm = new_vm();
        vm.load_program(Program::new(&code, &["value=%d\n"]).unwrap());
        vm.execute_program().unwrap();
        assert_eq!(vm.io().console(), "value=42\n");
    }

    #[derive(Default)]
    struct Recorder {
        steps: RefCell<std::vec::Vec<(u32, u8, u32)>>,
        completed: Cell<Option<(u32, u32)>>,
        resets: Cell<u32>,
    }

    impl Observer for Recorder {
        fn instruction_retired(&self, pc: u32, opcode: u8, operand: u32) {
            self.steps.borrow_mut().push((pc, opcode, operand));
        }

        fn program_completed(&self, instructions: u32, elapsed_ms: u32) {
            self.completed.set(Some((instructions, elapsed_ms)));
        }

        fn vm_reset(&self) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    #[test]
    fn observers_see_every_retirement_in_order() {
        let code = assemble(&[
            Instruction::new(Opcode::Push, 3),
            Instruction::new(Opcode::Pop, 0),
            Instruction::new(Opcode::Halt, 0),
        ]);
        let recorder = Recorder::default();
        let mut vm = new_vm();
        assert!(vm.add_observer(&recorder));
        vm.load_program(Program::new(&code, &[]).unwrap());
        vm.execute_program().unwrap();
        vm.reset();

        let steps = recorder.steps.borrow();
        assert_eq!(
            steps.as_slice(),
            &[(0, Opcode::Push as u8, 3), (1, Opcode::Pop as u8, 0)]
        );
        assert_eq!(recorder.completed.get(), Some((2, 0)));
        assert_eq!(recorder.resets.get(), 1);
    }
}
