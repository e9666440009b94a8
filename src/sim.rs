//! In-memory platform implementations.
//!
//! Stand-ins for the board support layer: a manually advanced clock, a
//! pin/ADC map with captured console output, and a NOR-semantics flash
//! array. Host-side tests and development tooling run the full stack
//! against these; they also serve as the reference semantics for real
//! implementations.

use core::cell::Cell;

use heapless::{Deque, String, Vec};

use crate::bootloader::{Transport, TransportStats};

use crate::flash::{self, FlashControl, FLASH_BASE, FLASH_SIZE, PAGE_SIZE, WRITE_SIZE};
use crate::gpio::{IoError, Level, PinMode};
use crate::platform::HostIo;
use crate::time::Clock;

// - MARK: Clock

/// Manually advanced microsecond clock.
#[derive(Default)]
pub struct SimClock {
    now_us: Cell<u64>,
}

impl SimClock {
    pub const fn new() -> Self {
        Self {
            now_us: Cell::new(0),
        }
    }

    pub fn advance_ms(&self, ms: u32) {
        self.advance_us((ms as u64) * 1000);
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.set(self.now_us.get() + us);
    }
}

impl Clock for SimClock {
    fn tick_ms(&self) -> u32 {
        (self.now_us.get() / 1000) as u32
    }

    fn tick_us(&self) -> u32 {
        self.now_us.get() as u32
    }

    fn delay_ms(&mut self, ms: u32) {
        self.advance_ms(ms);
    }

    fn delay_us(&mut self, us: u32) {
        self.advance_us(us as u64);
    }
}

// - MARK: GPIO / analog / console

/// Number of pins in the simulated map.
pub const SIM_PIN_COUNT: usize = 64;

/// Capacity of the captured console buffer.
pub const SIM_CONSOLE_CAP: usize = 1024;

/// Simulated pin map, ADC/PWM channels and console sink.
pub struct SimIo {
    modes: [Option<PinMode>; SIM_PIN_COUNT],
    levels: [Level; SIM_PIN_COUNT],
    analog: [u16; SIM_PIN_COUNT],
    console: String<SIM_CONSOLE_CAP>,
    /// Pin that reports a hardware fault on access, for failure-path
    /// tests.
    fault_pin: Option<u8>,
}

impl SimIo {
    pub fn new() -> Self {
        Self {
            modes: [None; SIM_PIN_COUNT],
            levels: [Level::Low; SIM_PIN_COUNT],
            analog: [0; SIM_PIN_COUNT],
            console: String::new(),
            fault_pin: None,
        }
    }

    fn check(&self, pin: u8) -> Result<usize, IoError> {
        if self.fault_pin == Some(pin) {
            return Err(IoError::NotReady);
        }
        let idx = pin as usize;
        if idx >= SIM_PIN_COUNT {
            return Err(IoError::InvalidPin);
        }
        Ok(idx)
    }

    /// Make `pin` fail every operation.
    pub fn inject_fault(&mut self, pin: u8) {
        self.fault_pin = Some(pin);
    }

    /// Present `level` on an input pin.
    pub fn set_input_level(&mut self, pin: u8, level: Level) {
        self.levels[pin as usize] = level;
    }

    /// Present `value` on an ADC channel.
    pub fn set_analog_input(&mut self, pin: u8, value: u16) {
        self.analog[pin as usize] = value;
    }

    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.modes[pin as usize]
    }

    pub fn output_level(&self, pin: u8) -> Level {
        self.levels[pin as usize]
    }

    pub fn analog_output(&self, pin: u8) -> u16 {
        self.analog[pin as usize]
    }

    /// Everything the guest printed so far.
    pub fn console(&self) -> &str {
        &self.console
    }

    pub fn clear_console(&mut self) {
        self.console.clear();
    }
}

impl Default for SimIo {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIo for SimIo {
    fn pin_config(&mut self, pin: u8, mode: PinMode) -> Result<(), IoError> {
        let idx = self.check(pin)?;
        self.modes[idx] = Some(mode);
        Ok(())
    }

    fn pin_write(&mut self, pin: u8, level: Level) -> Result<(), IoError> {
        let idx = self.check(pin)?;
        if self.modes[idx] != Some(PinMode::Output) {
            return Err(IoError::NotReady);
        }
        self.levels[idx] = level;
        Ok(())
    }

    fn pin_read(&mut self, pin: u8) -> Result<Level, IoError> {
        let idx = self.check(pin)?;
        Ok(self.levels[idx])
    }

    fn analog_write(&mut self, pin: u8, value: u16) -> Result<(), IoError> {
        let idx = self.check(pin)?;
        self.analog[idx] = value;
        Ok(())
    }

    fn analog_read(&mut self, pin: u8) -> Result<u16, IoError> {
        let idx = self.check(pin)?;
        Ok(self.analog[idx])
    }

    fn console_write(&mut self, text: &str) -> Result<(), IoError> {
        self.console.push_str(text).map_err(|_| IoError::NotReady)
    }

    fn safe_state(&mut self) {
        self.modes = [None; SIM_PIN_COUNT];
        self.levels = [Level::Low; SIM_PIN_COUNT];
        self.analog = [0; SIM_PIN_COUNT];
    }
}

// - MARK: Flash

const SIM_PAGE_COUNT: usize = FLASH_SIZE / PAGE_SIZE;

/// NOR-semantics flash array: erase sets a page to `0xFF`, programming
/// requires an erased, aligned doubleword and an unlocked controller.
pub struct SimFlash {
    mem: [u8; FLASH_SIZE],
    erase_counts: [u16; SIM_PAGE_COUNT],
    locked: bool,
    /// When set, `program_doubleword` reports success but leaves the
    /// cells erased; exercises the read-back verification paths.
    drop_programs: bool,
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            mem: [0xFF; FLASH_SIZE],
            erase_counts: [0; SIM_PAGE_COUNT],
            locked: true,
            drop_programs: false,
        }
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize, flash::Error> {
        let Some(rel) = addr.checked_sub(FLASH_BASE) else {
            return Err(flash::Error::OutOfBounds);
        };
        let rel = rel as usize;
        if rel + len > FLASH_SIZE {
            return Err(flash::Error::OutOfBounds);
        }
        Ok(rel)
    }

    /// Borrow `len` bytes starting at absolute address `addr`.
    pub fn region(&self, addr: u32, len: usize) -> &[u8] {
        let rel = (addr - FLASH_BASE) as usize;
        &self.mem[rel..rel + len]
    }

    /// How many times the page at `addr` has been erased.
    pub fn erase_count(&self, addr: u32) -> u16 {
        self.erase_counts[(addr - FLASH_BASE) as usize / PAGE_SIZE]
    }

    /// Silently drop subsequent programs (the cells stay erased).
    pub fn drop_programs(&mut self, drop: bool) {
        self.drop_programs = drop;
    }

    /// Overwrite flash contents directly, bypassing NOR semantics.
    /// Test scaffolding for pre-seeding images and corrupting banks.
    pub fn patch(&mut self, addr: u32, bytes: &[u8]) {
        let rel = (addr - FLASH_BASE) as usize;
        self.mem[rel..rel + bytes.len()].copy_from_slice(bytes);
    }
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashControl for SimFlash {
    fn unlock(&mut self) -> Result<(), flash::Error> {
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) {
        self.locked = true;
    }

    fn erase_page(&mut self, addr: u32) -> Result<(), flash::Error> {
        if self.locked {
            return Err(flash::Error::Locked);
        }
        if addr % PAGE_SIZE as u32 != 0 {
            return Err(flash::Error::NotAligned);
        }
        let rel = self.offset(addr, PAGE_SIZE)?;
        self.mem[rel..rel + PAGE_SIZE].fill(0xFF);
        self.erase_counts[rel / PAGE_SIZE] += 1;
        Ok(())
    }

    fn program_doubleword(&mut self, addr: u32, value: u64) -> Result<(), flash::Error> {
        if self.locked {
            return Err(flash::Error::Locked);
        }
        if addr % WRITE_SIZE as u32 != 0 {
            return Err(flash::Error::NotAligned);
        }
        let rel = self.offset(addr, WRITE_SIZE)?;
        if self.mem[rel..rel + WRITE_SIZE] != [0xFF; WRITE_SIZE] {
            return Err(flash::Error::NotErased);
        }
        if self.drop_programs {
            return Ok(());
        }
        self.mem[rel..rel + WRITE_SIZE].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn read(&self, addr: u32, out: &mut [u8]) -> Result<(), flash::Error> {
        let rel = self.offset(addr, out.len())?;
        out.copy_from_slice(&self.mem[rel..rel + out.len()]);
        Ok(())
    }
}

// ==========
// traits

impl embedded_storage::nor_flash::ErrorType for SimFlash {
    type Error = flash::Error;
}

impl embedded_storage::nor_flash::ReadNorFlash for SimFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        FlashControl::read(self, FLASH_BASE + offset, bytes)
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE
    }
}

impl embedded_storage::nor_flash::NorFlash for SimFlash {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % PAGE_SIZE as u32 != 0 || to % PAGE_SIZE as u32 != 0 || from > to {
            return Err(flash::Error::NotAligned);
        }
        let mut page = from;
        while page < to {
            self.erase_page(FLASH_BASE + page)?;
            page += PAGE_SIZE as u32;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if bytes.len() % WRITE_SIZE != 0 {
            return Err(flash::Error::NotAligned);
        }
        for (i, chunk) in bytes.chunks_exact(WRITE_SIZE).enumerate() {
            let mut dw = [0u8; WRITE_SIZE];
            dw.copy_from_slice(chunk);
            self.program_doubleword(
                FLASH_BASE + offset + (i * WRITE_SIZE) as u32,
                u64::from_le_bytes(dw),
            )?;
        }
        Ok(())
    }
}

// - MARK: Transport

/// Receive capacity of the loopback transport.
pub const SIM_TRANSPORT_RX: usize = 4096;
/// Transmit capture capacity of the loopback transport.
pub const SIM_TRANSPORT_TX: usize = 4096;

/// Loopback transport: scripted receive bytes, captured transmit bytes.
pub struct SimTransport {
    rx: Deque<u8, SIM_TRANSPORT_RX>,
    tx: Vec<u8, SIM_TRANSPORT_TX>,
    stats: TransportStats,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            rx: Deque::new(),
            tx: Vec::new(),
            stats: TransportStats::default(),
        }
    }

    /// Script bytes for the engine to receive.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            let _ = self.rx.push_back(b);
        }
    }

    /// Everything transmitted so far.
    pub fn sent(&self) -> &[u8] {
        &self.tx
    }

    pub fn clear_sent(&mut self) {
        self.tx.clear();
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    type Error = ();

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.tx.extend_from_slice(bytes)?;
        self.stats.bytes_sent += bytes.len() as u32;
        Ok(())
    }

    fn receive(&mut self) -> nb::Result<u8, Self::Error> {
        match self.rx.pop_front() {
            Some(byte) => {
                self.stats.bytes_received += 1;
                Ok(byte)
            }
            None => Err(nb::Error::WouldBlock),
        }
    }

    fn available(&mut self) -> bool {
        !self.rx.is_empty()
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_requires_unlock_and_erase() {
        let mut f = SimFlash::new();
        assert_eq!(
            f.program_doubleword(FLASH_BASE, 0),
            Err(flash::Error::Locked)
        );
        f.unlock().unwrap();
        f.program_doubleword(FLASH_BASE, 0x1122_3344_5566_7788).unwrap();
        // Programming the same cells again is rejected until re-erase.
        assert_eq!(
            f.program_doubleword(FLASH_BASE, 0),
            Err(flash::Error::NotErased)
        );
        f.erase_page(FLASH_BASE).unwrap();
        f.program_doubleword(FLASH_BASE, 0).unwrap();
    }

    #[test]
    fn pin_write_needs_output_mode() {
        let mut io = SimIo::new();
        assert_eq!(io.pin_write(5, Level::High), Err(IoError::NotReady));
        io.pin_config(5, PinMode::Output).unwrap();
        io.pin_write(5, Level::High).unwrap();
        assert_eq!(io.output_level(5), Level::High);
    }

    #[test]
    fn out_of_range_pin_rejected() {
        let mut io = SimIo::new();
        assert_eq!(
            io.pin_config(SIM_PIN_COUNT as u8, PinMode::Output),
            Err(IoError::InvalidPin)
        );
    }

    #[test]
    fn clock_advances_on_delay() {
        let mut clk = SimClock::new();
        assert_eq!(clk.tick_ms(), 0);
        clk.delay_ms(25);
        assert_eq!(clk.tick_ms(), 25);
        clk.delay_us(1500);
        assert_eq!(clk.tick_us(), 26_500);
    }
}
