//! Shared definitions for the ColecoVision memory and port maps.
//!
//! Centralizing address-related constants keeps the hardware layout in one
//! location and makes it easier to reference the console documentation while
//! reading the rest of the code base.

/// CPU-visible memory map details.
pub mod cpu {
    /// BIOS ROM size (8 KiB at `$0000-$1FFF`).
    pub const BIOS_SIZE: usize = 0x2000;
    /// Last address (inclusive) of the BIOS window.
    pub const BIOS_END: u16 = 0x1FFF;

    /// First address of the expansion window (`$2000`), open bus on a stock
    /// console, SGM RAM when the upper overlay is enabled.
    pub const EXPANSION_START: u16 = 0x2000;

    /// System RAM window start (`$6000`).
    pub const RAM_WINDOW_START: u16 = 0x6000;
    /// System RAM window end (inclusive).
    pub const RAM_WINDOW_END: u16 = 0x7FFF;
    /// Physical system RAM size (1 KiB, mirrored through the whole window).
    pub const RAM_SIZE: usize = 0x400;
    /// Mask applied to mirror RAM accesses within `$6000-$7FFF`.
    pub const RAM_MASK: u16 = (RAM_SIZE as u16) - 1;

    /// Super Game Module RAM size (32 KiB overlaying `$0000-$7FFF`).
    pub const SGM_RAM_SIZE: usize = 0x8000;

    /// Cartridge window start (`$8000`).
    pub const CART_WINDOW_START: u16 = 0x8000;
    /// Size of one cartridge ROM page (8 KiB).
    pub const CART_PAGE_SIZE: usize = 0x2000;
    /// Offset mask within a cartridge page.
    pub const CART_PAGE_MASK: u16 = (CART_PAGE_SIZE as u16) - 1;
    /// Number of 8 KiB pages visible in the cartridge window.
    pub const CART_PAGE_COUNT: usize = 4;
    /// Mega Cart bank-select region (`$FFC0-$FFFF`); any read here retargets
    /// the upper 16 KiB window.
    pub const MEGA_BANK_SELECT: u16 = 0xFFC0;
    /// Largest image that still fits the plain 32 KiB cartridge window.
    pub const CART_PLAIN_MAX: usize = 0x8000;
    /// Size of one Mega Cart bank (16 KiB).
    pub const MEGA_BANK_SIZE: usize = 0x4000;
}

/// IO port map details. Decode is on `port & 0xE0` with a handful of exact
/// SGM ports below `$80`.
pub mod io {
    /// Decode mask for the four main port groups.
    pub const GROUP_MASK: u8 = 0xE0;
    /// Writes here select the keypad/right-fire strobe segment.
    pub const GROUP_STROBE_KEYPAD: u8 = 0x80;
    /// VDP access group (odd ports: control/status, even ports: data).
    pub const GROUP_VDP: u8 = 0xA0;
    /// Writes here select the joystick/left-fire strobe segment.
    pub const GROUP_STROBE_JOYSTICK: u8 = 0xC0;
    /// PSG writes and controller reads.
    pub const GROUP_PSG_INPUT: u8 = 0xE0;

    /// SGM PSG register select.
    pub const SGM_PSG_SELECT: u8 = 0x50;
    /// SGM PSG register write.
    pub const SGM_PSG_WRITE: u8 = 0x51;
    /// SGM PSG register read.
    pub const SGM_PSG_READ: u8 = 0x52;
    /// Enables the upper SGM RAM overlay.
    pub const SGM_UPPER_ENABLE: u8 = 0x53;
    /// Bit 1 of the written value controls the lower SGM RAM overlay
    /// (clear = overlay on, replacing the BIOS mapping).
    pub const SGM_LOWER_CONTROL: u8 = 0x7F;
}

/// VDP raster geometry.
pub mod vdp {
    /// Active display width in pixels.
    pub const WIDTH: usize = 256;
    /// Active display height in pixels.
    pub const HEIGHT: usize = 192;
    /// Painted border width on each side.
    pub const OVERSCAN: usize = 8;
    /// Framebuffer width including borders.
    pub const WIDTH_OVERSCAN: usize = WIDTH + 2 * OVERSCAN;
    /// Framebuffer height including borders.
    pub const HEIGHT_OVERSCAN: usize = HEIGHT + 2 * OVERSCAN;
    /// Framebuffer size in pixels.
    pub const FRAME_PIXELS: usize = WIDTH_OVERSCAN * HEIGHT_OVERSCAN;

    /// Total scanlines per NTSC frame.
    pub const SCANLINES_NTSC: u16 = 262;
    /// Total scanlines per PAL frame.
    pub const SCANLINES_PAL: u16 = 313;

    /// VRAM size (16 KiB, 14-bit address space).
    pub const VRAM_SIZE: usize = 0x4000;
    /// Mask applied after each VRAM address increment.
    pub const VRAM_MASK: u16 = (VRAM_SIZE as u16) - 1;
}
