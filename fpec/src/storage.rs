//! [`embedded-storage`] traits over a range of flash pages.
//!
//! [`embedded-storage`]: https://docs.rs/embedded-storage

use crate::{
    flash::{Error, Fpec, HALF_WORD, Page},
    regs::Registers,
};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Error::NotAligned => NorFlashErrorKind::NotAligned,
            Error::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Error::WriteProtected | Error::OperationFailed | Error::Timeout => {
                NorFlashErrorKind::Other
            }
        }
    }
}

/// Contiguous pages of flash memory, addressed by offset from the first page.
///
/// Created with [`Fpec::storage`].
#[derive(Debug)]
pub struct Storage<'a, R> {
    fpec: &'a mut Fpec<R>,
    first: Page,
    pages: u16,
}

impl<R: Registers> Fpec<R> {
    /// Use `pages` pages starting at `first` as [`NorFlash`] storage.
    ///
    /// Returns [`Error::OutOfBounds`] if the pages do not all exist on this
    /// device.
    ///
    /// # Safety
    ///
    /// 1. None of the pages may hold code that is used by your program.
    /// 2. The controller must be unlocked with [`init`](Self::init).
    ///
    /// # Example
    ///
    /// ```no_run
    /// use embedded_storage::nor_flash::NorFlash;
    /// use stm32f1xx_fpec::{Fpec, Page, regs::Mmio};
    ///
    /// let mut fpec: Fpec<Mmio> = Fpec::new(unsafe { Mmio::steal() });
    /// fpec.init();
    ///
    /// let first: Page = Page::from_index(60).unwrap();
    /// let mut storage = unsafe { fpec.storage(first, 4) }.unwrap();
    /// storage.erase(0, Page::SIZE as u32).unwrap();
    /// storage.write(0, &[0xC0, 0xFF, 0xEE, 0x00]).unwrap();
    /// ```
    pub unsafe fn storage(
        &mut self,
        first: Page,
        pages: u16,
    ) -> Result<Storage<'_, R>, Error> {
        let end: usize = usize::from(first.to_index()) + usize::from(pages);
        if end * Page::SIZE > self.flash_size() {
            return Err(Error::OutOfBounds);
        }
        Ok(Storage {
            fpec: self,
            first,
            pages,
        })
    }
}

impl<R: Registers> Storage<'_, R> {
    /// First page of the storage.
    pub fn first(&self) -> Page {
        self.first
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), Error> {
        let end: usize = (offset as usize)
            .checked_add(len)
            .ok_or(Error::OutOfBounds)?;
        if end > self.capacity() {
            Err(Error::OutOfBounds)
        } else {
            Ok(())
        }
    }

    fn addr(&self, offset: u32) -> u32 {
        self.first.addr() + offset
    }
}

impl<R: Registers> ErrorType for Storage<'_, R> {
    type Error = Error;
}

impl<R: Registers> ReadNorFlash for Storage<'_, R> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        self.check_range(offset, bytes.len())?;
        let base: u32 = self.addr(offset);
        for (addr, byte) in (base..).zip(bytes.iter_mut()) {
            // within the storage, checked above
            *byte = unsafe { self.fpec.regs.read_byte(addr) };
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        usize::from(self.pages) * Page::SIZE
    }
}

impl<R: Registers> NorFlash for Storage<'_, R> {
    const WRITE_SIZE: usize = HALF_WORD;
    const ERASE_SIZE: usize = Page::SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Error> {
        if from > to {
            return Err(Error::OutOfBounds);
        }
        self.check_range(from, (to - from) as usize)?;
        if from as usize % Page::SIZE != 0 || to as usize % Page::SIZE != 0 {
            return Err(Error::NotAligned);
        }

        for addr in (self.addr(from)..self.addr(to)).step_by(Page::SIZE) {
            let page: Page = Page::from_addr(addr).ok_or(Error::OutOfBounds)?;
            unsafe { self.fpec.page_erase(page)? };
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.check_range(offset, bytes.len())?;
        if offset as usize % HALF_WORD != 0 || bytes.len() % HALF_WORD != 0 {
            return Err(Error::NotAligned);
        }

        let addr: u32 = self.addr(offset);
        unsafe { self.fpec.write_checked(bytes, addr) }
    }
}
