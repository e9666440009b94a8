//! Flash staging and programming engine.
//!
//! The target programs flash in 64-bit doublewords on an erased page.
//! [`Staging`] absorbs arbitrary-length byte streams into an 8-byte
//! window, programs each full window, reads it back and compares, and
//! `0xFF`-pads the final partial window on flush. The page is erased
//! exactly once per programming cycle, lazily on the first staged byte.

use static_assertions::{const_assert, const_assert_eq};

/// Flash program granularity: one doubleword.
pub const WRITE_SIZE: usize = 8;
/// Flash erase granularity: one page.
pub const PAGE_SIZE: usize = 2048;

/// Base address of the on-chip flash.
pub const FLASH_BASE: u32 = 0x0800_0000;
/// Total flash size modeled by the core (128 KiB parts).
pub const FLASH_SIZE: usize = 128 * 1024;

/// Guest program bank A.
pub const BANK_A_ADDR: u32 = 0x0801_0000;
/// Guest program bank B.
pub const BANK_B_ADDR: u32 = 0x0801_8000;
/// Size of each program bank.
pub const BANK_SIZE: usize = 32 * 1024;
/// Scratch page used by on-target self tests.
pub const TEST_PAGE_ADDR: u32 = 0x0800_F800;

/// Length of the bank health probe, in bytes.
const HEALTH_PROBE_LEN: usize = 64;

const_assert_eq!(PAGE_SIZE % WRITE_SIZE, 0);
const_assert_eq!((BANK_A_ADDR - FLASH_BASE) as usize % PAGE_SIZE, 0);
const_assert_eq!((BANK_B_ADDR - FLASH_BASE) as usize % PAGE_SIZE, 0);
const_assert!(BANK_A_ADDR + (BANK_SIZE as u32) <= BANK_B_ADDR);
const_assert!(BANK_B_ADDR + (BANK_SIZE as u32) <= FLASH_BASE + FLASH_SIZE as u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Address or range outside the accessible region.
    OutOfBounds,
    /// Address not aligned to the required granularity.
    NotAligned,
    /// Controller locked against writes.
    Locked,
    /// Program attempted over a non-erased doubleword.
    NotErased,
    /// Read-back after program did not match.
    Mismatch,
    /// Controller reported a hardware failure.
    Fault,
}

impl embedded_storage::nor_flash::NorFlashError for Error {
    fn kind(&self) -> embedded_storage::nor_flash::NorFlashErrorKind {
        use embedded_storage::nor_flash::NorFlashErrorKind;
        match *self {
            Error::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Error::NotAligned => NorFlashErrorKind::NotAligned,
            _ => NorFlashErrorKind::Other,
        }
    }
}

/// Platform flash controller contract.
///
/// Addresses are absolute. Erase operates on whole pages; program
/// operates on aligned doublewords and only over erased cells.
pub trait FlashControl {
    /// Enable write/erase access.
    fn unlock(&mut self) -> Result<(), Error>;
    /// Disable write/erase access.
    fn lock(&mut self);
    /// Erase the page containing `addr` (must be page-aligned).
    fn erase_page(&mut self, addr: u32) -> Result<(), Error>;
    /// Program one doubleword at an 8-byte aligned address.
    fn program_doubleword(&mut self, addr: u32, value: u64) -> Result<(), Error>;
    /// Read `out.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, out: &mut [u8]) -> Result<(), Error>;
}

// - MARK: Dual-bank policy

/// A fixed-address program slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    A,
    B,
}

impl Bank {
    pub const fn address(self) -> u32 {
        match self {
            Bank::A => BANK_A_ADDR,
            Bank::B => BANK_B_ADDR,
        }
    }

    pub const fn other(self) -> Bank {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }
}

/// Probe the leading words of `bank`; a slot that reads all-zeros or
/// all-ones is considered corrupt.
pub fn bank_is_healthy<F: FlashControl>(flash: &F, bank: Bank) -> Result<bool, Error> {
    let mut probe = [0u8; HEALTH_PROBE_LEN];
    flash.read(bank.address(), &mut probe)?;

    let mut all_zero = true;
    let mut all_ones = true;
    for chunk in probe.chunks_exact(4) {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        all_zero &= word == 0x0000_0000;
        all_ones &= word == 0xFFFF_FFFF;
    }
    Ok(!(all_zero || all_ones))
}

/// Pick the active bank at bootloader entry: keep `preferred` unless its
/// health probe fails, in which case fall over to the other bank.
pub fn select_bank<F: FlashControl>(flash: &F, preferred: Bank) -> Bank {
    match bank_is_healthy(flash, preferred) {
        Ok(true) => preferred,
        Ok(false) => {
            warn!("bank {} failed health probe, falling over", preferred as u8);
            preferred.other()
        }
        Err(_) => preferred.other(),
    }
}

// - MARK: Staging engine

/// Per-programming-cycle staging state: an 8-byte window feeding aligned
/// doubleword programs with immediate read-back verification.
pub struct Staging {
    window: [u8; WRITE_SIZE],
    offset: usize,
    write_addr: u32,
    page_addr: u32,
    programmed: u32,
    erased: bool,
}

impl Staging {
    pub const fn new() -> Self {
        Self {
            window: [0xFF; WRITE_SIZE],
            offset: 0,
            write_addr: 0,
            page_addr: 0,
            programmed: 0,
            erased: false,
        }
    }

    /// Reset for a new cycle targeting the page at `page_addr`.
    pub fn begin(&mut self, page_addr: u32) {
        self.window = [0xFF; WRITE_SIZE];
        self.offset = 0;
        self.write_addr = page_addr;
        self.page_addr = page_addr;
        self.programmed = 0;
        self.erased = false;
    }

    /// Bytes committed to flash so far (a multiple of the doubleword).
    pub fn bytes_programmed(&self) -> u32 {
        self.programmed
    }

    pub fn page_addr(&self) -> u32 {
        self.page_addr
    }

    pub fn is_erased(&self) -> bool {
        self.erased
    }

    /// Erase the target page now. Staging normally erases lazily on the
    /// first byte; the prepare step calls this so its acknowledgement
    /// confirms an erased page.
    pub fn erase<F: FlashControl>(&mut self, flash: &mut F) -> Result<(), Error> {
        flash.unlock()?;
        let result = flash.erase_page(self.page_addr);
        flash.lock();
        result?;
        self.erased = true;
        Ok(())
    }

    /// Append `bytes`, programming a doubleword each time the window
    /// fills.
    pub fn stage<F: FlashControl>(&mut self, flash: &mut F, bytes: &[u8]) -> Result<(), Error> {
        if !self.erased {
            self.erase(flash)?;
        }
        let staged = self.programmed as usize + self.offset;
        if staged + bytes.len() > PAGE_SIZE {
            return Err(Error::OutOfBounds);
        }
        for &b in bytes {
            self.window[self.offset] = b;
            self.offset += 1;
            if self.offset == WRITE_SIZE {
                self.commit_window(flash)?;
            }
        }
        Ok(())
    }

    /// Program the final, `0xFF`-padded partial window. No-op when the
    /// window is empty.
    pub fn flush<F: FlashControl>(&mut self, flash: &mut F) -> Result<(), Error> {
        if self.offset == 0 {
            return Ok(());
        }
        for slot in self.window[self.offset..].iter_mut() {
            *slot = 0xFF;
        }
        self.offset = WRITE_SIZE;
        self.commit_window(flash)
    }

    fn commit_window<F: FlashControl>(&mut self, flash: &mut F) -> Result<(), Error> {
        debug_assert_eq!(self.write_addr % WRITE_SIZE as u32, 0);
        let value = u64::from_le_bytes(self.window);

        flash.unlock()?;
        let result = flash.program_doubleword(self.write_addr, value);
        flash.lock();
        result?;

        let mut readback = [0u8; WRITE_SIZE];
        flash.read(self.write_addr, &mut readback)?;
        if readback != self.window {
            error!("flash readback mismatch at {=u32:#x}", self.write_addr);
            return Err(Error::Mismatch);
        }

        self.write_addr += WRITE_SIZE as u32;
        self.programmed += WRITE_SIZE as u32;
        self.window = [0xFF; WRITE_SIZE];
        self.offset = 0;
        Ok(())
    }

    /// Compare `expected` against flash contents at `addr`. The range
    /// must fall inside the target page.
    pub fn verify<F: FlashControl>(
        &self,
        flash: &F,
        addr: u32,
        expected: &[u8],
    ) -> Result<(), Error> {
        let end = addr
            .checked_add(expected.len() as u32)
            .ok_or(Error::OutOfBounds)?;
        if addr < self.page_addr || end > self.page_addr + PAGE_SIZE as u32 {
            return Err(Error::OutOfBounds);
        }
        let mut chunk = [0u8; 32];
        for (i, want) in expected.chunks(chunk.len()).enumerate() {
            let at = addr + (i * chunk.len()) as u32;
            let got = &mut chunk[..want.len()];
            flash.read(at, got)?;
            if got != want {
                return Err(Error::Mismatch);
            }
        }
        Ok(())
    }

    /// Read-back integrity check over everything programmed this cycle:
    /// an all-`0xFF` doubleword inside the programmed range means a
    /// program silently failed.
    pub fn integrity_check<F: FlashControl>(&self, flash: &F) -> Result<(), Error> {
        let mut dw = [0u8; WRITE_SIZE];
        let mut addr = self.page_addr;
        while addr < self.page_addr + self.programmed {
            flash.read(addr, &mut dw)?;
            if dw == [0xFF; WRITE_SIZE] {
                return Err(Error::Mismatch);
            }
            addr += WRITE_SIZE as u32;
        }
        Ok(())
    }
}

impl Default for Staging {
    fn default() -> Self {
        Self::new()
    }
}
