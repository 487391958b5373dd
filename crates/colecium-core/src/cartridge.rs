//! Cartridge and BIOS images.
//!
//! A ColecoVision ROM announces itself with a magic word in its first two
//! bytes: `AA 55` boots through the BIOS title screen, `55 AA` jumps straight
//! to the game's code vector. Images up to 32 KiB map as up to four 8 KiB
//! pages from `$8000`. Larger images are Mega Carts: the final 16 KiB is
//! permanently visible at `$8000-$BFFF` and reads from `$FFC0-$FFFF` select
//! which 16 KiB bank appears at `$C000-$FFFF`.

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::Error;
use crate::memory::cpu::{
    BIOS_SIZE, CART_PAGE_COUNT, CART_PAGE_MASK, CART_PAGE_SIZE, CART_PLAIN_MAX,
    CART_WINDOW_START, MEGA_BANK_SELECT, MEGA_BANK_SIZE,
};

/// Backing storage for ROM images.
///
/// Desktop hosts typically hand over heap-owned bytes; embedded callers can
/// borrow from a static `include_bytes!` blob without copying.
pub type RomBytes = Cow<'static, [u8]>;

/// The console BIOS, 8 KiB mapped at `$0000-$1FFF`.
pub struct Bios {
    data: RomBytes,
}

impl Bios {
    /// Wrap an in-memory BIOS image. The image must be exactly 8 KiB.
    pub fn from_bytes(data: impl Into<RomBytes>) -> Result<Self, Error> {
        let data = data.into();
        if data.len() != BIOS_SIZE {
            return Err(Error::InvalidBios { actual: data.len() });
        }
        info!(len = data.len(), "BIOS image loaded");
        Ok(Self { data })
    }

    /// Read a BIOS image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = fs::read(path)?;
        Self::from_bytes(data)
    }

    #[inline]
    pub fn read(&self, addr: u16) -> u8 {
        self.data[usize::from(addr)]
    }
}

/// A validated cartridge with its four-page window mapping.
pub struct Cartridge {
    rom: RomBytes,
    /// Byte offsets into `rom` for the four 8 KiB windows at `$8000`,
    /// `$A000`, `$C000` and `$E000`.
    pages: [u32; CART_PAGE_COUNT],
    /// Number of 8 KiB pages in the image, rounding a partial page up.
    page_count: u8,
    mega: bool,
}

impl Cartridge {
    /// Validate a ROM image and build its initial page mapping.
    pub fn load(data: impl Into<RomBytes>) -> Result<Self, Error> {
        let rom: RomBytes = data.into();
        let size = rom.len();

        if size > CART_PLAIN_MAX {
            // Mega Cart: the magic word lives at the start of the final
            // 16 KiB bank, which is the part mapped at $8000 on boot.
            let base = size - MEGA_BANK_SIZE;
            let hword = u16::from(rom[base]) | (u16::from(rom[base + 1]) << 8);
            if hword != 0xAA55 && hword != 0x55AA {
                return Err(Error::InvalidRom);
            }

            let page_count = size.div_ceil(CART_PAGE_SIZE) as u8;
            let pages = [
                (size - MEGA_BANK_SIZE) as u32,
                (size - CART_PAGE_SIZE) as u32,
                0,
                CART_PAGE_SIZE as u32,
            ];
            info!(size, pages = page_count, "Mega Cart image loaded");
            return Ok(Self { rom, pages, page_count, mega: true });
        }

        if size < 2 {
            return Err(Error::InvalidRom);
        }
        let hword = u16::from(rom[1]) | (u16::from(rom[0]) << 8);
        if hword != 0xAA55 && hword != 0x55AA {
            return Err(Error::InvalidRom);
        }

        let page_count = size.div_ceil(CART_PAGE_SIZE) as u8;
        let mut pages = [0u32; CART_PAGE_COUNT];
        for (i, page) in pages.iter_mut().enumerate().take(usize::from(page_count)) {
            *page = (i * CART_PAGE_SIZE) as u32;
        }
        info!(size, pages = page_count, "cartridge image loaded");
        Ok(Self { rom, pages, page_count, mega: false })
    }

    /// Read from the cartridge window. `addr` is the full CPU address
    /// (`$8000-$FFFF`). Mega Cart bank-select reads retarget the upper
    /// window as a side effect, hence `&mut self`.
    pub fn read(&mut self, addr: u16) -> u8 {
        if self.mega && addr >= MEGA_BANK_SELECT {
            // 16 KiB banks, so halve the page count; the subtraction makes a
            // power-of-two mask out of it.
            let bank_mask = u16::from(self.page_count >> 1).wrapping_sub(1);
            self.pages[2] = u32::from(addr & bank_mask) << 14;
            self.pages[3] = self.pages[2] + CART_PAGE_SIZE as u32;
        }

        // Reads beyond the true image size hit unpopulated bus.
        if usize::from(addr) >= self.rom.len() + usize::from(CART_WINDOW_START) {
            return 0xFF;
        }

        let page = usize::from((addr >> 13) - 4);
        let offset = self.pages[page] as usize + usize::from(addr & CART_PAGE_MASK);
        self.rom.get(offset).copied().unwrap_or(0xFF)
    }

    /// True when the boot word requests the BIOS title screen (`AA 55`).
    pub fn boots_through_bios(&self) -> bool {
        let base = if self.mega { self.rom.len() - MEGA_BANK_SIZE } else { 0 };
        self.rom[base] == 0xAA
    }

    pub fn is_mega(&self) -> bool {
        self.mega
    }

    pub fn page_count(&self) -> u8 {
        self.page_count
    }

    pub(crate) fn pages(&self) -> [u32; CART_PAGE_COUNT] {
        self.pages
    }

    pub(crate) fn set_pages(&mut self, pages: [u32; CART_PAGE_COUNT]) {
        self.pages = pages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_rom(len: usize) -> Vec<u8> {
        let mut rom = vec![0u8; len];
        rom[0] = 0xAA;
        rom[1] = 0x55;
        rom
    }

    fn mega_rom(banks: usize) -> Vec<u8> {
        let len = banks * MEGA_BANK_SIZE;
        let mut rom = vec![0u8; len];
        // Tag every 16 KiB bank with its index so reads identify the bank.
        for bank in 0..banks {
            rom[bank * MEGA_BANK_SIZE..(bank + 1) * MEGA_BANK_SIZE].fill(bank as u8);
        }
        rom[len - MEGA_BANK_SIZE] = 0x55;
        rom[len - MEGA_BANK_SIZE + 1] = 0xAA;
        rom
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(Cartridge::load(vec![0u8; 0x2000]), Err(Error::InvalidRom)));
        assert!(matches!(Cartridge::load(vec![0xAA; 1]), Err(Error::InvalidRom)));
    }

    #[test]
    fn accepts_both_boot_words() {
        let rom = plain_rom(0x2000);
        let cart = Cartridge::load(rom).expect("AA55");
        assert!(cart.boots_through_bios());

        let mut rom = plain_rom(0x2000);
        rom[0] = 0x55;
        rom[1] = 0xAA;
        let cart = Cartridge::load(rom).expect("55AA");
        assert!(!cart.boots_through_bios());
    }

    #[test]
    fn small_rom_reads_pad_with_ff() {
        let mut rom = plain_rom(0x2000);
        rom[0x100] = 0x77;
        let mut cart = Cartridge::load(rom).expect("valid");
        assert_eq!(cart.page_count(), 1);
        assert_eq!(cart.read(0x8000), 0xAA);
        assert_eq!(cart.read(0x8100), 0x77);
        // Everything past the 8 KiB image is unpopulated.
        assert_eq!(cart.read(0xA000), 0xFF);
        assert_eq!(cart.read(0xFFFF), 0xFF);
    }

    #[test]
    fn plain_rom_maps_sequential_pages() {
        let mut rom = plain_rom(0x8000);
        rom[0x2000] = 1;
        rom[0x4000] = 2;
        rom[0x6000] = 3;
        let mut cart = Cartridge::load(rom).expect("valid");
        assert!(!cart.is_mega());
        assert_eq!(cart.read(0xA000), 1);
        assert_eq!(cart.read(0xC000), 2);
        assert_eq!(cart.read(0xE000), 3);
    }

    #[test]
    fn mega_cart_maps_last_bank_low_and_first_bank_high() {
        let mut cart = Cartridge::load(mega_rom(8)).expect("valid"); // 128 KiB
        assert!(cart.is_mega());
        assert_eq!(cart.page_count(), 16);
        // $8000 window: final bank (magic word bytes, then bank tag 7).
        assert_eq!(cart.read(0x8000), 0x55);
        assert_eq!(cart.read(0x8002), 7);
        // $C000 window boots on bank 0.
        assert_eq!(cart.read(0xC000), 0);
        assert_eq!(cart.read(0xE000), 0);
    }

    #[test]
    fn mega_cart_bank_select_on_high_reads() {
        let mut cart = Cartridge::load(mega_rom(8)).expect("valid");
        cart.read(0xFFC0 | 3); // select bank 3
        assert_eq!(cart.read(0xC000), 3);
        assert_eq!(cart.read(0xD123), 3);
        assert_eq!(cart.read(0xE000), 3);
        // Fixed window is unaffected.
        assert_eq!(cart.read(0x8002), 7);

        // The mask wraps selections past the bank count.
        cart.read(0xFFC0 | 9); // 9 & 7 = 1
        assert_eq!(cart.read(0xC000), 1);
    }

    #[test]
    fn mega_cart_magic_checked_in_last_bank() {
        let mut rom = vec![0u8; 0x10000];
        rom[0] = 0xAA;
        rom[1] = 0x55;
        // Magic at offset 0 does not count for a 64 KiB image.
        assert!(matches!(Cartridge::load(rom), Err(Error::InvalidRom)));
    }
}
