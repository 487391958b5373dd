//! The console: per-frame scheduler, configuration surface and snapshots.
//!
//! NTSC timing, for the record:
//!
//! - Z80 cycles per frame: 89603.5 VDP cycles x 2/3 = 59735.67
//! - Z80 cycles per scanline: 59735.67 / 262 = 227.9987, budgeted as 228
//!   with the remainder carried between scanlines
//! - PSG sample per 16 Z80 cycles: 59735.67 / 16 per frame, ~224 kHz
//!
//! One [`Console::run_frame`] call runs one full frame: for every scanline
//! the CPU executes its 228-cycle budget (PSGs ticking along every 16
//! cycles), then the VDP rasters that line. After the last line the mixer
//! resamples the frame's audio and fires the audio-ready callback.

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::bus::{Bus, InputCallback};
use crate::cartridge::{Bios, Cartridge, RomBytes};
use crate::config::{PaletteKind, Region};
use crate::cpu::Z80;
use crate::error::Error;
use crate::memory::cpu as map;
use crate::mixer::{AudioCallback, Mixer};
use crate::psg::Psg;
use crate::rng::SplitMix64;
use crate::serial::{Reader, Writer};
use crate::sgm_psg::SgmPsg;
use crate::vdp::Vdp;

/// Z80 cycle budget per scanline (227.9987 on real hardware).
const CYCLES_PER_SCANLINE: u32 = 228;
/// CPU cycles per PSG tick.
const PSG_DIVIDER: u32 = 16;
/// Bytes the CPU contributes to a state snapshot: five 16-bit registers, the
/// eighteen 8-bit registers, and eight interrupt/halt bytes.
const CPU_STATE_LEN: usize = 5 * 2 + 18 + 8;

/// A complete ColecoVision.
///
/// The console owns every component; host integration happens through the
/// input and audio callbacks, the framebuffer accessor, and the loaders.
pub struct Console {
    cpu: Z80,
    bus: Bus,
    mixer: Mixer,
    region: Region,
    /// Running CPU-cycle divider for the PSG clock, carried across frames.
    psg_div: u32,
    /// Scanline cycle overshoot carried into the next frame.
    leftover: u32,
    /// Cycles consumed by the most recent frame.
    frame_cycles: u32,
    rng: SplitMix64,
}

impl Console {
    /// Size in bytes of a state snapshot blob.
    pub const STATE_SIZE: usize = map::RAM_SIZE
        + map::SGM_RAM_SIZE
        + 1 // controller strobe segment
        + 2 * 2 // two latched controller words
        + 4 * 4 // four ROM page offsets
        + Psg::STATE_LEN
        + SgmPsg::STATE_LEN
        + Vdp::STATE_LEN
        + CPU_STATE_LEN;

    pub fn new() -> Self {
        let mut rng = SplitMix64::from_entropy();
        let mut bus = Bus::new();
        bus.power_on(&mut rng);
        Self {
            cpu: Z80::new(),
            bus,
            mixer: Mixer::new(),
            region: Region::Ntsc,
            psg_div: 0,
            leftover: 0,
            frame_cycles: 0,
            rng,
        }
    }

    // Configuration surface.

    pub fn set_region(&mut self, region: Region) {
        self.region = region;
        self.bus.vdp.set_region(region);
        self.mixer.set_region(region);
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn set_palette(&mut self, palette: PaletteKind) {
        self.bus.vdp.set_palette(palette);
    }

    /// Palette by index as the original configuration surface exposes it;
    /// unknown indices are ignored.
    pub fn set_palette_index(&mut self, index: u8) {
        if let Some(palette) = PaletteKind::from_index(index) {
            self.bus.vdp.set_palette(palette);
        } else {
            tracing::debug!(index, "ignoring unknown palette index");
        }
    }

    /// Host sample rate (44100 | 48000 | 96000 | 192000, others ignored).
    pub fn set_sample_rate(&mut self, rate: u32) {
        self.mixer.set_sample_rate(rate);
    }

    /// Resampler quality, 0..=10 (others ignored).
    pub fn set_resampler_quality(&mut self, quality: u8) {
        self.mixer.set_quality(quality);
    }

    /// CPU stall applied to every PSG register write. The hardware figure is
    /// somewhere between ~32 and ~54 cycles; the default is 48.
    pub fn set_psg_write_delay(&mut self, cycles: u32) {
        self.bus.psg_write_delay = cycles;
    }

    pub fn set_input_callback(&mut self, callback: InputCallback) {
        self.bus.set_input_callback(callback);
    }

    pub fn set_audio_callback(&mut self, callback: AudioCallback) {
        self.mixer.set_callback(callback);
    }

    /// Samples the audio callback receives per frame at the current
    /// configuration.
    pub fn audio_samples_per_frame(&self) -> usize {
        self.mixer.samples_per_frame()
    }

    // Loaders.

    /// Load a BIOS image from disk (must be exactly 8 KiB).
    pub fn load_bios_file(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.bus.bios = Some(Bios::from_file(path)?);
        Ok(())
    }

    /// Load a BIOS image from memory.
    pub fn load_bios(&mut self, data: impl Into<RomBytes>) -> Result<(), Error> {
        self.bus.bios = Some(Bios::from_bytes(data)?);
        Ok(())
    }

    /// Validate and insert a cartridge image.
    pub fn load_rom(&mut self, data: impl Into<RomBytes>) -> Result<(), Error> {
        self.bus.cart = Some(Cartridge::load(data)?);
        Ok(())
    }

    /// Reset the console. The `hard` flag is accepted but currently unused.
    pub fn reset(&mut self, hard: bool) {
        let _ = hard;
        self.bus.power_on(&mut self.rng);
        self.bus.psg.reset();
        self.bus.sgm_psg.reset();
        self.bus.vdp.reset();
        self.cpu.reset();
        self.psg_div = 0;
        self.leftover = 0;
    }

    // Component views.

    pub fn frame(&self) -> &[u32] {
        self.bus.vdp.frame()
    }

    pub fn cpu(&self) -> &Z80 {
        &self.cpu
    }

    pub fn vdp(&self) -> &Vdp {
        &self.bus.vdp
    }

    pub fn psg(&self) -> &Psg {
        &self.bus.psg
    }

    pub fn sgm_psg(&self) -> &SgmPsg {
        &self.bus.sgm_psg
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    /// CPU cycles consumed by the most recent [`Console::run_frame`].
    pub fn frame_cycles(&self) -> u32 {
        self.frame_cycles
    }

    /// Run exactly one display frame.
    pub fn run_frame(&mut self) {
        self.bus.psg.clear_samples();
        self.bus.sgm_psg.clear_samples();

        let mut carry = core::mem::take(&mut self.leftover);
        let mut frame_cycles = 0u32;

        for _ in 0..self.region.scanlines() {
            let required = CYCLES_PER_SCANLINE.saturating_sub(carry);
            let mut line_cycles = 0u32;

            // The CPU's share of the scanline runs to completion before the
            // line is rasterized, so register writes made on line L are
            // visible to the render of line L.
            while line_cycles < required {
                let mut cycles = self.cpu.step(&mut self.bus);
                cycles += self.bus.take_delay();
                if self.bus.vdp.take_nmi() {
                    self.cpu.pulse_nmi();
                }
                line_cycles += cycles;

                // Catch the PSGs up to the CPU, one sample per 16 cycles.
                for _ in 0..cycles {
                    self.psg_div += 1;
                    if self.psg_div == PSG_DIVIDER {
                        self.psg_div = 0;
                        self.bus.psg.tick();
                        self.bus.sgm_psg.tick();
                    }
                }
            }

            frame_cycles += line_cycles;
            carry = carry + line_cycles - CYCLES_PER_SCANLINE;

            self.bus.vdp.run_scanline();
            if self.bus.vdp.take_nmi() {
                self.cpu.pulse_nmi();
            }
        }

        self.leftover = carry;
        self.frame_cycles = frame_cycles;
        self.mixer.mix_frame(&mut self.bus.psg, &mut self.bus.sgm_psg);
    }

    // State snapshots.

    /// Snapshot blob size; every snapshot is exactly this long.
    pub fn state_size() -> usize {
        Self::STATE_SIZE
    }

    /// Serialize the complete console state into `buf`.
    pub fn state_save(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() != Self::STATE_SIZE {
            warn!(expected = Self::STATE_SIZE, actual = buf.len(), "state buffer size mismatch");
            return Err(Error::StateSize { expected: Self::STATE_SIZE, actual: buf.len() });
        }

        let mut w = Writer::new(buf);
        w.push_block(self.bus.ram.as_slice());
        w.push_block(self.bus.sgm_ram.as_slice());
        w.push_u8(self.bus.controllers.segment);
        w.push_u16(self.bus.controllers.latched[0]);
        w.push_u16(self.bus.controllers.latched[1]);
        let pages = self.bus.cart.as_ref().map(|c| c.pages()).unwrap_or_default();
        for page in pages {
            w.push_u32(page);
        }
        self.bus.psg.state_save(&mut w);
        self.bus.sgm_psg.state_save(&mut w);
        self.bus.vdp.state_save(&mut w);
        save_cpu(&self.cpu, &mut w);
        Ok(())
    }

    /// Restore the complete console state from `buf`. Blobs of any other
    /// length than [`Console::STATE_SIZE`] are refused.
    pub fn state_load(&mut self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() != Self::STATE_SIZE {
            warn!(expected = Self::STATE_SIZE, actual = buf.len(), "refusing state blob");
            return Err(Error::StateSize { expected: Self::STATE_SIZE, actual: buf.len() });
        }

        let mut r = Reader::new(buf);
        r.pop_block(self.bus.ram.as_mut_slice());
        r.pop_block(self.bus.sgm_ram.as_mut_slice());
        self.bus.controllers.segment = r.pop_u8();
        self.bus.controllers.latched[0] = r.pop_u16();
        self.bus.controllers.latched[1] = r.pop_u16();
        let mut pages = [0u32; 4];
        for page in &mut pages {
            *page = r.pop_u32();
        }
        if let Some(cart) = self.bus.cart.as_mut() {
            cart.set_pages(pages);
        }
        self.bus.psg.state_load(&mut r);
        self.bus.sgm_psg.state_load(&mut r);
        self.bus.vdp.state_load(&mut r);
        load_cpu(&mut self.cpu, &mut r);
        Ok(())
    }

    /// Write a snapshot to disk.
    pub fn state_save_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut blob = vec![0u8; Self::STATE_SIZE];
        self.state_save(&mut blob)?;
        fs::write(path, blob)?;
        Ok(())
    }

    /// Restore a snapshot from disk.
    pub fn state_load_file(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let blob = fs::read(path)?;
        self.state_load(&blob)
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("region", &self.region)
            .field("leftover", &self.leftover)
            .field("frame_cycles", &self.frame_cycles)
            .finish()
    }
}

fn save_cpu(cpu: &Z80, w: &mut Writer<'_>) {
    w.push_u16(cpu.pc);
    w.push_u16(cpu.sp);
    w.push_u16(cpu.ix);
    w.push_u16(cpu.iy);
    w.push_u16(cpu.mem_ptr);
    for value in [
        cpu.a, cpu.f, cpu.b, cpu.c, cpu.d, cpu.e, cpu.h, cpu.l, cpu.a_, cpu.f_, cpu.b_,
        cpu.c_, cpu.d_, cpu.e_, cpu.h_, cpu.l_, cpu.i, cpu.r,
    ] {
        w.push_u8(value);
    }
    w.push_u8(cpu.iff_delay);
    w.push_u8(cpu.interrupt_mode);
    w.push_u8(cpu.irq_data);
    w.push_u8(cpu.iff1 as u8);
    w.push_u8(cpu.iff2 as u8);
    w.push_u8(cpu.halted as u8);
    w.push_u8(cpu.irq_pending as u8);
    w.push_u8(cpu.nmi_pending as u8);
}

fn load_cpu(cpu: &mut Z80, r: &mut Reader<'_>) {
    cpu.pc = r.pop_u16();
    cpu.sp = r.pop_u16();
    cpu.ix = r.pop_u16();
    cpu.iy = r.pop_u16();
    cpu.mem_ptr = r.pop_u16();
    cpu.a = r.pop_u8();
    cpu.f = r.pop_u8();
    cpu.b = r.pop_u8();
    cpu.c = r.pop_u8();
    cpu.d = r.pop_u8();
    cpu.e = r.pop_u8();
    cpu.h = r.pop_u8();
    cpu.l = r.pop_u8();
    cpu.a_ = r.pop_u8();
    cpu.f_ = r.pop_u8();
    cpu.b_ = r.pop_u8();
    cpu.c_ = r.pop_u8();
    cpu.d_ = r.pop_u8();
    cpu.e_ = r.pop_u8();
    cpu.h_ = r.pop_u8();
    cpu.l_ = r.pop_u8();
    cpu.i = r.pop_u8();
    cpu.r = r.pop_u8();
    cpu.iff_delay = r.pop_u8();
    cpu.interrupt_mode = r.pop_u8();
    cpu.irq_data = r.pop_u8();
    cpu.iff1 = r.pop_u8() != 0;
    cpu.iff2 = r.pop_u8() != 0;
    cpu.halted = r.pop_u8() != 0;
    cpu.irq_pending = r.pop_u8() != 0;
    cpu.nmi_pending = r.pop_u8() != 0;
}
