//! Register level model of the FPEC, the HSI bits of RCC_CR, and the flash
//! array behind them.
#![allow(dead_code)]

use stm32f1xx_fpec::{
    ERASED, FLASH_START, Page,
    regs::{KEY1, KEY2, Registers, cr, rcc_cr, sr},
};

/// One bus transaction performed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    RccCr(u32),
    Keyr(u32),
    Cr(u32),
    Sr(u32),
    Ar(u32),
    Program { addr: u32, half_word: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    PageErase(u32),
    MassErase,
    Program,
}

#[derive(Debug)]
pub struct Sim {
    pub mem: Vec<u8>,
    pub size_kib: u16,
    pub cr: u32,
    pub sr: u32,
    pub ar: u32,
    pub rcc_cr: u32,
    /// Status reads an operation stays busy for.
    pub op_polls: u32,
    /// RCC_CR reads before HSIRDY follows HSION.
    pub hsi_polls: u32,
    pub hsi_stuck: bool,
    pub bsy_stuck: bool,
    pub protected: Vec<Page>,
    /// Fail the next page erase with PGERR.
    pub fail_erase: bool,
    /// Set by a wrong key sequence, FLASH_CR stays locked.
    pub hard_locked: bool,
    /// Flash stores attempted without PG set, or while locked.
    pub stray_writes: u32,
    pub log: Vec<Access>,
    key_stage: u8,
    pending: Option<Op>,
    busy_left: u32,
    hsi_left: Option<u32>,
}

impl Sim {
    /// Device after reset: controller locked, HSI off, flash erased.
    pub fn new(size_kib: u16) -> Self {
        Sim {
            mem: vec![ERASED; usize::from(size_kib) * 1024],
            size_kib,
            cr: cr::LOCK,
            sr: 0,
            ar: 0,
            rcc_cr: 0,
            op_polls: 3,
            hsi_polls: 2,
            hsi_stuck: false,
            bsy_stuck: false,
            protected: Vec::new(),
            fail_erase: false,
            hard_locked: false,
            stray_writes: 0,
            log: Vec::new(),
            key_stage: 0,
            pending: None,
            busy_left: 0,
            hsi_left: None,
        }
    }

    /// Device with the HSI running and the controller unlocked.
    pub fn unlocked(size_kib: u16) -> Self {
        let mut sim: Sim = Sim::new(size_kib);
        sim.cr = 0;
        sim.rcc_cr = rcc_cr::HSION | rcc_cr::HSIRDY;
        sim
    }

    fn offset(&self, addr: u32) -> usize {
        (addr - FLASH_START) as usize
    }

    pub fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        let start: usize = self.offset(addr);
        &self.mem[start..start + len]
    }

    pub fn fill(&mut self, addr: u32, data: &[u8]) {
        let start: usize = self.offset(addr);
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    pub fn is_erased(&self, page: Page) -> bool {
        self.bytes(page.addr(), Page::SIZE)
            .iter()
            .all(|&b| b == ERASED)
    }

    pub fn keys(&self) -> Vec<u32> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Access::Keyr(key) => Some(*key),
                _ => None,
            })
            .collect()
    }

    pub fn cr_writes(&self) -> Vec<u32> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Access::Cr(bits) => Some(*bits),
                _ => None,
            })
            .collect()
    }

    pub fn programs(&self) -> Vec<(u32, u16)> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Access::Program { addr, half_word } => Some((*addr, *half_word)),
                _ => None,
            })
            .collect()
    }

    pub fn busy(&self) -> bool {
        self.pending.is_some()
    }

    fn start(&mut self, op: Op) {
        if self.op_polls == 0 {
            self.complete(op)
        } else {
            self.pending = Some(op);
            self.busy_left = self.op_polls;
        }
    }

    fn page_of(addr: u32) -> Option<Page> {
        Page::from_addr(addr & !(Page::SIZE as u32 - 1))
    }

    fn complete(&mut self, op: Op) {
        match op {
            Op::PageErase(addr) => {
                let page: Option<Page> = Self::page_of(addr);
                let in_range: bool = addr >= FLASH_START
                    && self.offset(addr) < self.mem.len();
                match page {
                    Some(page) if in_range => {
                        if self.protected.contains(&page) {
                            self.sr |= sr::WRPRTERR;
                        } else if self.fail_erase {
                            self.fail_erase = false;
                            self.sr |= sr::PGERR;
                        } else {
                            let start: usize = self.offset(page.addr());
                            self.mem[start..start + Page::SIZE].fill(ERASED);
                        }
                    }
                    _ => self.sr |= sr::PGERR,
                }
            }
            Op::MassErase => {
                if self.protected.is_empty() {
                    self.mem.fill(ERASED);
                } else {
                    self.sr |= sr::WRPRTERR;
                }
            }
            Op::Program => (),
        }
        self.sr |= sr::EOP;
    }
}

impl Registers for Sim {
    fn flash_sr(&mut self) -> u32 {
        if self.bsy_stuck {
            return self.sr | sr::BSY;
        }
        if let Some(op) = self.pending {
            self.busy_left -= 1;
            if self.busy_left == 0 {
                self.pending = None;
                self.complete(op);
            } else {
                return self.sr | sr::BSY;
            }
        }
        self.sr
    }

    fn set_flash_sr(&mut self, bits: u32) {
        self.log.push(Access::Sr(bits));
        self.sr &= !(bits & (sr::PGERR | sr::WRPRTERR | sr::EOP));
    }

    fn flash_cr(&mut self) -> u32 {
        self.cr
    }

    fn set_flash_cr(&mut self, bits: u32) {
        self.log.push(Access::Cr(bits));
        if self.cr & cr::LOCK != 0 {
            return;
        }
        let rising: u32 = bits & !self.cr;
        self.cr = bits & (cr::PG | cr::PER | cr::MER | cr::STRT | cr::LOCK);
        if rising & cr::STRT != 0 {
            if bits & cr::PER != 0 {
                self.start(Op::PageErase(self.ar));
            } else if bits & cr::MER != 0 {
                self.start(Op::MassErase);
            }
        }
    }

    fn set_flash_ar(&mut self, addr: u32) {
        self.log.push(Access::Ar(addr));
        self.ar = addr;
    }

    fn set_flash_keyr(&mut self, key: u32) {
        self.log.push(Access::Keyr(key));
        if self.hard_locked {
            return;
        }
        if self.cr & cr::LOCK == 0 {
            // keys written to an unlocked controller lock it until reset
            self.hard_locked = true;
            self.cr |= cr::LOCK;
            return;
        }
        match (self.key_stage, key) {
            (0, KEY1) => self.key_stage = 1,
            (1, KEY2) => {
                self.key_stage = 0;
                self.cr &= !cr::LOCK;
            }
            _ => self.hard_locked = true,
        }
    }

    fn rcc_cr(&mut self) -> u32 {
        if let Some(left) = self.hsi_left {
            if left == 0 {
                self.rcc_cr |= rcc_cr::HSIRDY;
                self.hsi_left = None;
            } else {
                self.hsi_left = Some(left - 1);
            }
        }
        self.rcc_cr
    }

    fn set_rcc_cr(&mut self, bits: u32) {
        self.log.push(Access::RccCr(bits));
        let ready: u32 = self.rcc_cr & rcc_cr::HSIRDY;
        self.rcc_cr = (bits & !rcc_cr::HSIRDY) | ready;
        if bits & rcc_cr::HSION == 0 {
            self.rcc_cr &= !rcc_cr::HSIRDY;
            self.hsi_left = None;
        } else if ready == 0 && self.hsi_left.is_none() && !self.hsi_stuck {
            self.hsi_left = Some(self.hsi_polls);
        }
    }

    fn flash_size_kib(&mut self) -> u16 {
        self.size_kib
    }

    unsafe fn program_half_word(&mut self, addr: u32, half_word: u16) {
        self.log.push(Access::Program { addr, half_word });
        if self.cr & cr::LOCK != 0 || self.cr & cr::PG == 0 {
            self.stray_writes += 1;
            return;
        }
        let protected: bool = Self::page_of(addr)
            .map(|page| self.protected.contains(&page))
            .unwrap_or(false);
        if protected {
            self.sr |= sr::WRPRTERR;
        } else {
            let off: usize = self.offset(addr);
            let old: u16 = u16::from_le_bytes([self.mem[off], self.mem[off + 1]]);
            if old != u16::MAX {
                self.sr |= sr::PGERR;
            }
            // programming only ever clears bits
            let new: u16 = old & half_word;
            self.mem[off..off + 2].copy_from_slice(&new.to_le_bytes());
        }
        self.start(Op::Program);
    }

    unsafe fn read_byte(&mut self, addr: u32) -> u8 {
        let off: usize = self.offset(addr);
        self.mem[off]
    }
}
