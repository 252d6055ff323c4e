//! Register access
//!
//! The driver only touches four FLASH registers, the RCC clock control
//! register and the flash memory itself. All of that goes through the
//! [`Registers`] trait; [`Mmio`] is the implementation for the real device.

use core::ptr::{read_volatile, write_volatile};

/// FLASH interface base address.
pub const FLASH_BASE: usize = 0x4002_2000;

/// RCC base address.
pub const RCC_BASE: usize = 0x4002_1000;

/// Flash size data register (`F_SIZE`), main flash size in KiB.
pub const F_SIZE: usize = 0x1FFF_F7E0;

/// First unlock key, written to `FLASH_KEYR`.
pub const KEY1: u32 = 0x4567_0123;

/// Second unlock key, written to `FLASH_KEYR` after [`KEY1`].
pub const KEY2: u32 = 0xCDEF_89AB;

// register offsets from the peripheral base
const KEYR: usize = 0x04;
const SR: usize = 0x0C;
const CR: usize = 0x10;
const AR: usize = 0x14;
const RCC_CR: usize = 0x00;

/// Flash status register (`FLASH_SR`) flags.
pub mod sr {
    /// Busy.
    pub const BSY: u32 = 1 << 0;
    /// Programming error, write 1 to clear.
    pub const PGERR: u32 = 1 << 2;
    /// Write protection error, write 1 to clear.
    pub const WRPRTERR: u32 = 1 << 4;
    /// End of operation, write 1 to clear.
    pub const EOP: u32 = 1 << 5;
}

/// Flash control register (`FLASH_CR`) flags.
pub mod cr {
    /// Programming.
    pub const PG: u32 = 1 << 0;
    /// Page erase.
    pub const PER: u32 = 1 << 1;
    /// Mass erase.
    pub const MER: u32 = 1 << 2;
    /// Start an erase operation.
    pub const STRT: u32 = 1 << 6;
    /// Lock, only cleared by the key sequence.
    pub const LOCK: u32 = 1 << 7;
}

/// RCC clock control register (`RCC_CR`) flags.
pub mod rcc_cr {
    /// Internal high-speed clock enable.
    pub const HSION: u32 = 1 << 0;
    /// Internal high-speed clock ready.
    pub const HSIRDY: u32 = 1 << 1;
}

/// Access to the registers used by [`Fpec`](crate::Fpec).
///
/// Every method corresponds to exactly one bus transaction.
pub trait Registers {
    /// Read `FLASH_SR`.
    fn flash_sr(&mut self) -> u32;
    /// Write `FLASH_SR`.
    fn set_flash_sr(&mut self, bits: u32);
    /// Read `FLASH_CR`.
    fn flash_cr(&mut self) -> u32;
    /// Write `FLASH_CR`.
    fn set_flash_cr(&mut self, bits: u32);
    /// Write `FLASH_AR`.
    fn set_flash_ar(&mut self, addr: u32);
    /// Write `FLASH_KEYR`.
    fn set_flash_keyr(&mut self, key: u32);
    /// Read `RCC_CR`.
    fn rcc_cr(&mut self) -> u32;
    /// Write `RCC_CR`.
    fn set_rcc_cr(&mut self, bits: u32);
    /// Main flash size in KiB.
    fn flash_size_kib(&mut self) -> u16;

    /// Store one half-word into flash memory.
    ///
    /// # Safety
    ///
    /// 1. `addr` must be half-word aligned and within the flash memory.
    /// 2. The half-word must not hold code that is currently executing.
    unsafe fn program_half_word(&mut self, addr: u32, half_word: u16);

    /// Load one byte from flash memory.
    ///
    /// # Safety
    ///
    /// `addr` must be within the flash memory.
    unsafe fn read_byte(&mut self, addr: u32) -> u8;
}

impl<T: Registers + ?Sized> Registers for &mut T {
    fn flash_sr(&mut self) -> u32 {
        T::flash_sr(self)
    }

    fn set_flash_sr(&mut self, bits: u32) {
        T::set_flash_sr(self, bits)
    }

    fn flash_cr(&mut self) -> u32 {
        T::flash_cr(self)
    }

    fn set_flash_cr(&mut self, bits: u32) {
        T::set_flash_cr(self, bits)
    }

    fn set_flash_ar(&mut self, addr: u32) {
        T::set_flash_ar(self, addr)
    }

    fn set_flash_keyr(&mut self, key: u32) {
        T::set_flash_keyr(self, key)
    }

    fn rcc_cr(&mut self) -> u32 {
        T::rcc_cr(self)
    }

    fn set_rcc_cr(&mut self, bits: u32) {
        T::set_rcc_cr(self, bits)
    }

    fn flash_size_kib(&mut self) -> u16 {
        T::flash_size_kib(self)
    }

    unsafe fn program_half_word(&mut self, addr: u32, half_word: u16) {
        unsafe { T::program_half_word(self, addr, half_word) }
    }

    unsafe fn read_byte(&mut self, addr: u32) -> u8 {
        unsafe { T::read_byte(self, addr) }
    }
}

macro_rules! mmio_reg {
    (r, $periph:ident, $reg:ident, $offset:expr) => {
        paste::paste! {
            #[inline(always)]
            fn [<$periph _ $reg>](&mut self) -> u32 {
                unsafe { read_volatile((self.$periph + $offset) as *const u32) }
            }
        }
    };
    (w, $periph:ident, $reg:ident, $offset:expr) => {
        paste::paste! {
            #[inline(always)]
            fn [<set_ $periph _ $reg>](&mut self, bits: u32) {
                unsafe { write_volatile((self.$periph + $offset) as *mut u32, bits) }
            }
        }
    };
    (rw, $periph:ident, $reg:ident, $offset:expr) => {
        mmio_reg!(r, $periph, $reg, $offset);
        mmio_reg!(w, $periph, $reg, $offset);
    };
}

/// Memory mapped FLASH and RCC registers.
#[derive(Debug)]
pub struct Mmio {
    flash: usize,
    rcc: usize,
}

impl Mmio {
    /// Create a register handle from the FLASH and RCC base addresses.
    ///
    /// # Safety
    ///
    /// 1. The addresses must be the base addresses of the FLASH interface and
    ///    the RCC peripheral.
    /// 2. Only one handle may exist at a time, and nothing else may write the
    ///    FLASH registers or the HSI bits of `RCC_CR` while it is in use.
    pub const unsafe fn new(flash: usize, rcc: usize) -> Self {
        Self { flash, rcc }
    }

    /// Create a register handle for the device base addresses.
    ///
    /// # Safety
    ///
    /// Only one handle may exist at a time, and nothing else may write the
    /// FLASH registers or the HSI bits of `RCC_CR` while it is in use.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use stm32f1xx_fpec::regs::Mmio;
    ///
    /// let mmio: Mmio = unsafe { Mmio::steal() };
    /// ```
    pub const unsafe fn steal() -> Self {
        unsafe { Self::new(FLASH_BASE, RCC_BASE) }
    }
}

impl Registers for Mmio {
    mmio_reg!(rw, flash, sr, SR);
    mmio_reg!(rw, flash, cr, CR);
    mmio_reg!(w, flash, ar, AR);
    mmio_reg!(w, flash, keyr, KEYR);

    #[inline(always)]
    fn rcc_cr(&mut self) -> u32 {
        unsafe { read_volatile((self.rcc + RCC_CR) as *const u32) }
    }

    #[inline(always)]
    fn set_rcc_cr(&mut self, bits: u32) {
        unsafe { write_volatile((self.rcc + RCC_CR) as *mut u32, bits) }
    }

    fn flash_size_kib(&mut self) -> u16 {
        unsafe { read_volatile(F_SIZE as *const u16) }
    }

    #[inline(always)]
    unsafe fn program_half_word(&mut self, addr: u32, half_word: u16) {
        unsafe { write_volatile(addr as usize as *mut u16, half_word) }
    }

    #[inline(always)]
    unsafe fn read_byte(&mut self, addr: u32) -> u8 {
        unsafe { read_volatile(addr as usize as *const u8) }
    }
}
