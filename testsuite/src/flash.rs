#![no_std]
#![no_main]

use core::ptr::read_volatile;
use cortex_m::peripheral::DWT;
use defmt::unwrap;
use defmt_rtt as _; // global logger
use panic_probe as _;
use stm32f1xx_fpec::{ERASED, Error, Fpec, Page, Timeout, regs::Mmio};

// HSI after reset
const FREQ: u32 = 8_000_000;
const CYC_PER_MICRO: u32 = FREQ / 1000 / 1000;

// WARNING will wrap-around eventually, use this for relative timing only
defmt::timestamp!("{=u32:us}", DWT::cycle_count() / CYC_PER_MICRO);

#[cortex_m_rt::exception]
#[allow(non_snake_case)]
unsafe fn HardFault(ef: &cortex_m_rt::ExceptionFrame) -> ! {
    cortex_m::interrupt::disable();
    defmt::error!("HardFault {:#}", defmt::Debug2Format(ef));
    defmt::flush();
    loop {
        cortex_m::asm::udf()
    }
}

fn read_half_word(addr: u32) -> u16 {
    unsafe { read_volatile(addr as *const u16) }
}

#[defmt_test::tests]
mod tests {
    use super::*;

    struct TestArgs {
        fpec: Fpec<Mmio>,
        page: Page,
    }

    #[init]
    fn init() -> TestArgs {
        let mut cp: cortex_m::Peripherals = unwrap!(cortex_m::Peripherals::take());
        cp.DCB.enable_trace();
        cp.DWT.enable_cycle_counter();

        let mut fpec: Fpec<Mmio> = Fpec::new(unsafe { Mmio::steal() });
        fpec.init();

        // flash only gets 10k program cycles
        // change the location each time to prevent wearout of CI boards
        let pages: usize = fpec.flash_size() / Page::SIZE;
        let idx: usize = pages / 2 + (DWT::cycle_count() as usize % (pages / 2));
        let page: Page = unwrap!(Page::from_index(idx as u16));

        defmt::info!(
            "Testing with page {}, {:#08X}",
            page.to_index(),
            page.addr()
        );

        TestArgs { fpec, page }
    }

    #[test]
    fn flash_size(ta: &mut TestArgs) {
        let size: usize = ta.fpec.flash_size();
        defmt::debug!("flash size {} KiB", size / 1024);
        defmt::assert!(size >= 16 * 1024);
        defmt::assert_eq!(size % Page::SIZE, 0);

        // ensure previous logs are seen before we start executing code that can
        // result in difficult-to-debug situations
        defmt::flush();
    }

    #[test]
    fn page_erase(ta: &mut TestArgs) {
        defmt::debug!(
            "data at page start before erase: {:#06X}",
            read_half_word(ta.page.addr())
        );

        let start: u32 = DWT::cycle_count();
        unwrap!(unsafe { ta.fpec.page_erase(ta.page) });
        let end: u32 = DWT::cycle_count();
        let elapsed: u32 = end.wrapping_sub(start);

        defmt::info!(
            "page erase duration: {=u32:us} seconds",
            elapsed / CYC_PER_MICRO
        );

        for addr in ta.page.addr_range().step_by(2) {
            defmt::assert_eq!(read_half_word(addr), u16::from_le_bytes([ERASED; 2]));
        }
    }

    #[test]
    fn write(ta: &mut TestArgs) {
        unwrap!(unsafe { ta.fpec.page_erase(ta.page) });

        let mut data: [u8; 64] = [0; 64];
        data.iter_mut()
            .enumerate()
            .for_each(|(idx, byte)| *byte = (idx as u8).wrapping_mul(37) ^ 0xA5);

        let start: u32 = DWT::cycle_count();
        unsafe { ta.fpec.write(&data, ta.page.addr()) };
        let end: u32 = DWT::cycle_count();
        let elapsed: u32 = end.wrapping_sub(start);

        defmt::info!(
            "64B program duration: {=u32:us} seconds",
            elapsed / CYC_PER_MICRO
        );

        defmt::assert_eq!(ta.fpec.status(), Ok(()));
        for (idx, pair) in data.chunks_exact(2).enumerate() {
            let addr: u32 = ta.page.addr() + 2 * idx as u32;
            defmt::assert_eq!(read_half_word(addr), u16::from_le_bytes([pair[0], pair[1]]));
        }
    }

    #[test]
    fn write_checked_not_erased(ta: &mut TestArgs) {
        unwrap!(unsafe { ta.fpec.page_erase(ta.page) });
        let addr: u32 = ta.page.addr() + 128;

        unwrap!(unsafe { ta.fpec.write_checked(&[0x34, 0x12], addr) });
        defmt::assert_eq!(
            unsafe { ta.fpec.write_checked(&[0x21, 0x43], addr) },
            Err(Error::OperationFailed)
        );
        defmt::assert_eq!(read_half_word(addr), 0x1234);
    }

    #[test]
    fn bounded(ta: &mut TestArgs) {
        unwrap!(unsafe { ta.fpec.try_page_erase(ta.page, Timeout::MAX) });
        unwrap!(unsafe { ta.fpec.try_write(&[0xEF, 0xBE], ta.page.addr(), Timeout::MAX) });
        defmt::assert_eq!(read_half_word(ta.page.addr()), 0xBEEF);
    }

    #[test]
    fn relock(ta: &mut TestArgs) {
        ta.fpec.lock();
        defmt::assert!(ta.fpec.is_locked());
        ta.fpec.init();
        defmt::assert!(!ta.fpec.is_locked());
    }
}
