//! Flash memory

use crate::regs::{KEY1, KEY2, Registers, cr, rcc_cr, sr};
use core::{hint::spin_loop, ops::Range};

/// Starting address of the flash memory.
pub const FLASH_START: u32 = 0x0800_0000;

/// Size of the programming unit in bytes.
pub const HALF_WORD: usize = 2;

/// Value of an erased byte.
pub const ERASED: u8 = 0xFF;

cfg_if::cfg_if! {
    if #[cfg(feature = "high-density")] {
        const PAGE_SIZE: usize = 2048;
        const NUM_PAGES: u16 = 256;
    } else {
        const PAGE_SIZE: usize = 1024;
        const NUM_PAGES: u16 = 128;
    }
}

/// Page address.
///
/// Pages are 1 KiB on low and medium density devices, and 2 KiB with the
/// `high-density` feature.
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Page(u16);

impl Page {
    /// Page size in bytes.
    pub const SIZE: usize = PAGE_SIZE;

    /// Number of pages on the largest device of the selected density.
    pub const NUM: u16 = NUM_PAGES;

    /// Create a page address from an index.
    ///
    /// Returns `None` if the index is not below [`Page::NUM`].
    ///
    /// # Example
    ///
    /// ```
    /// use stm32f1xx_fpec::Page;
    ///
    /// assert!(Page::from_index(8).is_some());
    /// assert!(Page::from_index(Page::NUM).is_none());
    /// ```
    pub const fn from_index(idx: u16) -> Option<Self> {
        if idx < Self::NUM { Some(Page(idx)) } else { None }
    }

    /// Create a page address from an offset from the base of the flash memory.
    ///
    /// Returns `None` if the offset is out of bounds, or not page aligned.
    ///
    /// # Example
    ///
    /// ```
    /// use stm32f1xx_fpec::Page;
    ///
    /// assert_eq!(Page::from_byte_offset(0), Page::from_index(0));
    /// assert_eq!(Page::from_byte_offset(Page::SIZE), Page::from_index(1));
    /// assert!(Page::from_byte_offset(Page::SIZE - 1).is_none());
    /// assert!(Page::from_byte_offset(usize::MAX).is_none());
    /// ```
    pub const fn from_byte_offset(offset: usize) -> Option<Self> {
        if offset % Self::SIZE != 0 {
            return None;
        }
        let idx: usize = offset / Self::SIZE;
        if idx < Self::NUM as usize {
            Some(Page(idx as u16))
        } else {
            None
        }
    }

    /// Create a page address from an absolute address.
    ///
    /// Returns `None` if the address is out of bounds, or not page aligned.
    ///
    /// # Example
    ///
    /// ```
    /// use stm32f1xx_fpec::{FLASH_START, Page};
    ///
    /// assert_eq!(Page::from_addr(FLASH_START), Page::from_index(0));
    /// assert!(Page::from_addr(0).is_none());
    /// assert!(Page::from_addr(FLASH_START + 1).is_none());
    /// ```
    pub const fn from_addr(addr: u32) -> Option<Self> {
        match addr.checked_sub(FLASH_START) {
            Some(offset) => Self::from_byte_offset(offset as usize),
            None => None,
        }
    }

    /// Get the page index.
    pub const fn to_index(self) -> u16 {
        self.0
    }

    /// Get the page address.
    ///
    /// # Example
    ///
    /// ```
    /// use stm32f1xx_fpec::{FLASH_START, Page};
    ///
    /// assert_eq!(Page::from_index(0).unwrap().addr(), FLASH_START);
    /// assert_eq!(
    ///     Page::from_index(3).unwrap().addr(),
    ///     FLASH_START + 3 * Page::SIZE as u32
    /// );
    /// ```
    pub const fn addr(&self) -> u32 {
        FLASH_START + (self.0 as u32) * (Self::SIZE as u32)
    }

    /// Get the address range of the page, end exclusive.
    pub const fn addr_range(&self) -> Range<u32> {
        Range {
            start: self.addr(),
            end: self.addr() + Self::SIZE as u32,
        }
    }
}

/// Flash errors.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Write protection error.
    ///
    /// The page to be erased or programmed is write protected by the option
    /// bytes (`WRPRTERR`).
    WriteProtected,
    /// Programming error.
    ///
    /// The controller reported `PGERR`, for example when programming a
    /// half-word that was not erased.
    OperationFailed,
    /// A bounded wait exhausted its [`Timeout`] before the hardware was ready.
    Timeout,
    /// An offset or length is not a multiple of the required unit.
    NotAligned,
    /// An offset or length is outside of the addressed region.
    OutOfBounds,
}

/// Classify the status register the way the hardware reports erase and
/// program results.
///
/// Write protection is reported even if a programming error is also flagged.
#[inline]
pub(crate) fn sr_result(bits: u32) -> Result<(), Error> {
    if bits & sr::WRPRTERR != 0 {
        Err(Error::WriteProtected)
    } else if bits & sr::PGERR != 0 {
        Err(Error::OperationFailed)
    } else {
        Ok(())
    }
}

/// Poll budget for the bounded operations.
///
/// Each individual wait on the hardware may poll its status bit at most this
/// many times before giving up with [`Error::Timeout`].
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout {
    polls: u32,
}

impl Timeout {
    /// Largest poll budget.
    pub const MAX: Timeout = Timeout { polls: u32::MAX };

    /// Create a timeout from a number of status polls.
    ///
    /// # Example
    ///
    /// ```
    /// use stm32f1xx_fpec::Timeout;
    ///
    /// assert_eq!(Timeout::from_polls(1000).polls(), 1000);
    /// ```
    pub const fn from_polls(polls: u32) -> Self {
        Timeout { polls }
    }

    /// Number of polls in this budget.
    pub const fn polls(&self) -> u32 {
        self.polls
    }
}

/// Flash program/erase controller driver.
///
/// All operations spin on the hardware until it completes; the `try_` variants
/// do the same with a [`Timeout`] on every wait.
#[derive(Debug)]
pub struct Fpec<R> {
    pub(crate) regs: R,
}

impl<R: Registers> Fpec<R> {
    /// Create a new driver.
    ///
    /// This does not touch the hardware, call [`init`](Self::init) before
    /// erasing or programming.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use stm32f1xx_fpec::{Fpec, regs::Mmio};
    ///
    /// let mut fpec: Fpec<Mmio> = Fpec::new(unsafe { Mmio::steal() });
    /// fpec.init();
    /// ```
    pub const fn new(regs: R) -> Self {
        Self { regs }
    }

    /// Release the registers.
    pub fn free(self) -> R {
        self.regs
    }

    /// Enable the HSI oscillator and unlock the controller.
    ///
    /// Erase and program operations need the HSI running. The key sequence is
    /// only written if the controller is locked; writing the keys to an
    /// unlocked controller locks it until the next reset.
    ///
    /// This blocks forever if the HSI never becomes ready.
    pub fn init(&mut self) {
        // unbounded waits cannot time out
        let _ = self.init_inner(None);
    }

    /// [`init`](Self::init) with a bound on each wait.
    pub fn try_init(&mut self, timeout: Timeout) -> Result<(), Error> {
        self.init_inner(Some(timeout))
    }

    /// Erases a page, setting all the bits to `1`.
    ///
    /// Blocks until the controller is idle, then until the erase completes.
    /// On error the contents of the page are unspecified.
    ///
    /// # Safety
    ///
    /// 1. Do not erase flash memory that is being used for your code.
    /// 2. The controller must be unlocked with [`init`](Self::init).
    pub unsafe fn page_erase(&mut self, page: Page) -> Result<(), Error> {
        unsafe { self.page_erase_inner(page, None) }
    }

    /// [`page_erase`](Self::page_erase) with a bound on each wait.
    ///
    /// # Safety
    ///
    /// Same as [`page_erase`](Self::page_erase).
    pub unsafe fn try_page_erase(&mut self, page: Page, timeout: Timeout) -> Result<(), Error> {
        unsafe { self.page_erase_inner(page, Some(timeout)) }
    }

    /// Erases the entire main flash memory, setting all the bits to `1`.
    ///
    /// # Safety
    ///
    /// 1. This code must execute from RAM.
    /// 2. The controller must be unlocked with [`init`](Self::init).
    pub unsafe fn mass_erase(&mut self) -> Result<(), Error> {
        self.wait_and_clear(None)?;
        self.regs.set_flash_sr(sr::WRPRTERR | sr::PGERR);
        self.modify_cr(|bits| bits | cr::MER);
        self.modify_cr(|bits| bits | cr::STRT);
        self.wait_and_clear(None)?;

        let ret: Result<(), Error> = sr_result(self.regs.flash_sr());
        if let Err(e) = ret {
            warn!("mass erase failed: {}", e);
        }
        ret
    }

    /// Program `data` starting at `addr`, one half-word at a time.
    ///
    /// Half-words are taken from `data` in little-endian byte order, so the
    /// flash reads back exactly `data`. Hardware errors are not reported, use
    /// [`status`](Self::status) afterwards or
    /// [`write_checked`](Self::write_checked).
    ///
    /// Programming a half-word that is not erased does not set it to the new
    /// value.
    ///
    /// # Safety
    ///
    /// 1. Do not write to flash memory that is being used for your code.
    /// 2. `addr` must be half-word aligned, and `addr..addr + data.len()` must
    ///    be within the flash memory.
    /// 3. `data.len()` must be even, a trailing odd byte is not written.
    /// 4. The controller must be unlocked with [`init`](Self::init).
    pub unsafe fn write(&mut self, data: &[u8], addr: u32) {
        // unbounded waits cannot time out
        let _ = unsafe { self.write_inner(data, addr, None) };
    }

    /// [`write`](Self::write), followed by a check of the status register.
    ///
    /// Stale error flags are cleared before programming, so the result only
    /// reflects this write.
    ///
    /// # Safety
    ///
    /// Same as [`write`](Self::write).
    pub unsafe fn write_checked(&mut self, data: &[u8], addr: u32) -> Result<(), Error> {
        self.regs.set_flash_sr(sr::WRPRTERR | sr::PGERR);
        unsafe { self.write_inner(data, addr, None)? };
        self.status()
    }

    /// [`write_checked`](Self::write_checked) with a bound on each wait.
    ///
    /// # Safety
    ///
    /// Same as [`write`](Self::write).
    pub unsafe fn try_write(
        &mut self,
        data: &[u8],
        addr: u32,
        timeout: Timeout,
    ) -> Result<(), Error> {
        self.regs.set_flash_sr(sr::WRPRTERR | sr::PGERR);
        unsafe { self.write_inner(data, addr, Some(timeout))? };
        self.status()
    }

    /// Result of the last erase or program operation, from the status register.
    pub fn status(&mut self) -> Result<(), Error> {
        sr_result(self.regs.flash_sr())
    }

    /// Returns `true` if the controller is locked.
    pub fn is_locked(&mut self) -> bool {
        self.regs.flash_cr() & cr::LOCK != 0
    }

    /// Lock the controller.
    ///
    /// It stays locked until the next [`init`](Self::init).
    pub fn lock(&mut self) {
        let _ = self.wait_and_clear(None);
        self.modify_cr(|bits| bits | cr::LOCK);
        debug!("FPEC locked");
    }

    /// Size of the main flash memory in bytes.
    pub fn flash_size(&mut self) -> usize {
        usize::from(self.regs.flash_size_kib()) * 1024
    }

    fn modify_cr(&mut self, f: impl FnOnce(u32) -> u32) {
        let bits: u32 = self.regs.flash_cr();
        self.regs.set_flash_cr(f(bits))
    }

    /// Wait for the controller to go idle, then clear the control register.
    ///
    /// Without a timeout this only returns `Ok`.
    fn wait_and_clear(&mut self, timeout: Option<Timeout>) -> Result<(), Error> {
        let mut left: Option<u32> = timeout.map(|t| t.polls());
        while self.regs.flash_sr() & sr::BSY != 0 {
            if let Some(left) = left.as_mut() {
                *left = left.checked_sub(1).ok_or(Error::Timeout)?;
            }
            spin_loop();
        }
        self.regs.set_flash_cr(0);
        Ok(())
    }

    fn wait_hsi(&mut self, timeout: Option<Timeout>) -> Result<(), Error> {
        let mut left: Option<u32> = timeout.map(|t| t.polls());
        while self.regs.rcc_cr() & rcc_cr::HSIRDY == 0 {
            if let Some(left) = left.as_mut() {
                *left = left.checked_sub(1).ok_or(Error::Timeout)?;
            }
            spin_loop();
        }
        Ok(())
    }

    fn init_inner(&mut self, timeout: Option<Timeout>) -> Result<(), Error> {
        let bits: u32 = self.regs.rcc_cr();
        self.regs.set_rcc_cr(bits | rcc_cr::HSION);
        if let Err(e) = self.wait_hsi(timeout) {
            warn!("HSI not ready");
            return Err(e);
        }

        if self.is_locked() {
            // do not reorder, a wrong sequence locks FLASH_CR until reset
            self.regs.set_flash_keyr(KEY1);
            self.regs.set_flash_keyr(KEY2);
            debug!("FPEC unlocked");
        } else {
            trace!("FPEC already unlocked");
        }

        self.wait_and_clear(timeout)
    }

    unsafe fn page_erase_inner(
        &mut self,
        page: Page,
        timeout: Option<Timeout>,
    ) -> Result<(), Error> {
        trace!("erasing page {} at {:#08X}", page.to_index(), page.addr());

        self.wait_and_clear(timeout)?;
        self.regs.set_flash_sr(sr::WRPRTERR | sr::PGERR);
        self.modify_cr(|bits| bits | cr::PER);
        self.regs.set_flash_ar(page.addr());
        self.modify_cr(|bits| bits | cr::STRT);
        self.wait_and_clear(timeout)?;

        let ret: Result<(), Error> = sr_result(self.regs.flash_sr());
        if let Err(e) = ret {
            warn!("page {} erase failed: {}", page.to_index(), e);
        }
        ret
    }

    unsafe fn write_inner(
        &mut self,
        data: &[u8],
        addr: u32,
        timeout: Option<Timeout>,
    ) -> Result<(), Error> {
        debug_assert_eq!(addr as usize % HALF_WORD, 0);
        debug_assert_eq!(data.len() % HALF_WORD, 0);
        trace!("programming {} bytes at {:#08X}", data.len(), addr);

        self.wait_and_clear(timeout)?;

        let mut dst: u32 = addr;
        for src in data.chunks_exact(HALF_WORD) {
            self.modify_cr(|bits| bits | cr::PG);
            unsafe {
                self.regs
                    .program_half_word(dst, u16::from_le_bytes([src[0], src[1]]))
            };
            dst = dst.wrapping_add(HALF_WORD as u32);
            self.wait_and_clear(timeout)?;
        }

        Ok(())
    }
}
