//! STM32F1 flash program/erase controller (FPEC) driver.
//!
//! Erases pages and programs half-words of the internal flash memory.
//!
//! # Example
//!
//! ```no_run
//! use stm32f1xx_fpec::{Fpec, Page, regs::Mmio};
//!
//! let mut fpec: Fpec<Mmio> = Fpec::new(unsafe { Mmio::steal() });
//! fpec.init();
//!
//! let page: Page = Page::from_index(63).unwrap();
//! unsafe {
//!     fpec.page_erase(page).unwrap();
//!     fpec.write(&[0xDE, 0xAD, 0xBE, 0xEF], page.addr());
//! }
//! ```
#![cfg_attr(not(test), no_std)]

mod macros;

pub mod flash;
pub mod regs;
pub mod storage;

pub use flash::{ERASED, Error, FLASH_START, Fpec, HALF_WORD, Page, Timeout};
pub use storage::Storage;
