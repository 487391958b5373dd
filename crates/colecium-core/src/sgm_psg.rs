//! General Instrument AY-3-8910, the Super Game Module's second sound chip.
//!
//! Three tone channels, a shared noise generator and a shared envelope
//! generator behind a 16-register file. The register file is addressed
//! through a select port; reads return the latched register's stored value,
//! including the two parallel-IO data registers which are plain storage here.
//!
//! One [`SgmPsg::tick`] is clocked every 16 CPU cycles, in lockstep with the
//! primary PSG, and emits exactly one signed sample.

use crate::mem_block::MemBlock;
use crate::psg::SAMPLE_BUF_LEN;
use crate::serial::{Reader, Writer};

/// Register write masks; bits outside the mask are "don't care" and never
/// stored.
const REG_MASK: [u8; 16] = [
    0xFF, 0x0F, 0xFF, 0x0F, 0xFF, 0x0F, 0x1F, 0xFF,
    0x1F, 0x1F, 0x1F, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF,
];

/// Envelope shape register.
const REG_ENVELOPE_SHAPE: usize = 13;

/// Output level per amplitude/envelope step.
const VOLUME_TABLE: [i16; 16] = [
    0, 40, 60, 86, 124, 186, 264, 440,
    518, 840, 1196, 1526, 2016, 2602, 3300, 4096,
];

pub struct SgmPsg {
    reg: [u8; 16],
    /// Currently selected register.
    rlatch: u8,

    /// 12-bit tone half-periods, clamped to at least 1.
    tperiod: [u16; 3],
    tcounter: [u16; 3],
    /// Fixed 4-bit amplitude per channel.
    amplitude: [u8; 3],

    /// 5-bit noise period, clamped to at least 1.
    nperiod: u8,
    ncounter: u16,
    /// 17-bit noise shift register; feedback is bit 0 XOR bit 3 into bit 16.
    nshift: u32,

    eperiod: u16,
    ecounter: u16,
    /// Which half of the envelope cycle is running (0 or 1).
    eseg: u8,
    /// Step within the current half, 0..=15.
    estep: u8,
    /// Current envelope volume, 0..=15.
    evol: u8,

    tdisable: [u8; 3],
    ndisable: [u8; 3],
    /// Per-channel envelope-mode bit: variable level instead of `amplitude`.
    emode: [u8; 3],

    /// Per-channel waveform sign bits.
    sign: [u8; 3],

    buf: MemBlock<i16, SAMPLE_BUF_LEN>,
    pos: usize,
}

impl SgmPsg {
    /// Bytes this chip contributes to a state snapshot.
    pub(crate) const STATE_LEN: usize =
        16 + 1 + 3 * 2 + 3 * 2 + 3 + 1 + 2 + 4 + 2 + 2 + 1 + 1 + 1 + 3 + 3 + 3 + 3;

    pub fn new() -> Self {
        let mut psg = Self {
            reg: [0; 16],
            rlatch: 0,
            tperiod: [0; 3],
            tcounter: [0; 3],
            amplitude: [0; 3],
            nperiod: 0,
            ncounter: 0,
            nshift: 1,
            eperiod: 0,
            ecounter: 0,
            eseg: 0,
            estep: 0,
            evol: 0,
            tdisable: [0; 3],
            ndisable: [0; 3],
            emode: [0; 3],
            sign: [0; 3],
            buf: MemBlock::new(),
            pos: 0,
        };
        psg.reset();
        psg
    }

    pub fn reset(&mut self) {
        self.reg = [0; 16];
        self.rlatch = 0;
        self.tperiod = [0; 3];
        self.tcounter = [0; 3];
        self.amplitude = [0; 3];
        self.nperiod = 0;
        self.ncounter = 0;
        self.nshift = 1;
        self.eperiod = 0;
        self.ecounter = 0;
        self.eseg = 0;
        self.estep = 0;
        self.evol = 0;
        self.tdisable = [0; 3];
        self.ndisable = [0; 3];
        self.emode = [0; 3];
        self.sign = [0; 3];
    }

    /// Select the register that subsequent reads and writes address.
    pub fn select(&mut self, reg: u8) {
        self.rlatch = reg & 0x0F;
    }

    /// Read the currently selected register.
    pub fn read(&self) -> u8 {
        self.reg[usize::from(self.rlatch & 0x0F)]
    }

    /// Write to the currently selected register.
    pub fn write(&mut self, data: u8) {
        let r = usize::from(self.rlatch & 0x0F);
        self.reg[r] = data & REG_MASK[r];

        match r {
            // Tone periods combine 8 fine bits and 4 coarse bits; the lowest
            // usable period is 1.
            0 | 1 => self.tperiod[0] = tone_period(self.reg[0], self.reg[1]),
            2 | 3 => self.tperiod[1] = tone_period(self.reg[2], self.reg[3]),
            4 | 5 => self.tperiod[2] = tone_period(self.reg[4], self.reg[5]),
            6 => {
                self.nperiod = self.reg[6].max(1);
            }
            7 => {
                // Register 7's "enable" bits are really disable bits.
                for i in 0..3 {
                    self.tdisable[i] = (self.reg[7] >> i) & 0x01;
                    self.ndisable[i] = (self.reg[7] >> (i + 3)) & 0x01;
                }
            }
            8..=10 => {
                self.amplitude[r - 8] = data & 0x0F;
                self.emode[r - 8] = (data >> 4) & 0x01;
            }
            11 | 12 => self.eperiod = u16::from(self.reg[11]) | (u16::from(self.reg[12]) << 8),
            REG_ENVELOPE_SHAPE => {
                self.ecounter = 0;
                self.eseg = 0;
                self.envelope_restart();
            }
            // Registers 14 and 15 are IO data stores; nothing to do.
            _ => {}
        }
    }

    /// Reset the envelope step and starting volume for the current segment
    /// of the selected shape.
    fn envelope_restart(&mut self) {
        self.estep = 0;

        if self.eseg != 0 {
            self.evol = match self.reg[REG_ENVELOPE_SHAPE] {
                8 | 11 | 13 | 14 => 15,
                _ => 0,
            };
        } else {
            // Attack bit clear: start from the top and ramp down.
            self.evol = if self.reg[REG_ENVELOPE_SHAPE] & 0x04 != 0 { 0 } else { 15 };
        }
    }

    /// Advance the chip by one PSG clock and emit one sample.
    pub fn tick(&mut self) {
        for i in 0..3 {
            self.tcounter[i] = self.tcounter[i].wrapping_add(1);
            if self.tcounter[i] >= self.tperiod[i] {
                self.tcounter[i] = 0;
                self.sign[i] ^= 1;
            }
        }

        self.ncounter = self.ncounter.wrapping_add(1);
        if self.ncounter >= u16::from(self.nperiod) << 1 {
            self.ncounter = 0;
            self.nshift =
                (self.nshift >> 1) | (((self.nshift ^ (self.nshift >> 3)) & 0x01) << 16);
        }

        self.ecounter = self.ecounter.wrapping_add(1);
        if u32::from(self.ecounter) >= u32::from(self.eperiod) << 1 {
            self.ecounter = 0;
            self.clock_envelope();
        }

        let mut sample: i16 = 0;
        for i in 0..3 {
            // Disabling both tone and noise does not mute a channel, it just
            // stops the waveform from oscillating; only a zero amplitude
            // register silences it.
            let gate = (self.tdisable[i] | self.sign[i])
                & (self.ndisable[i] | (self.nshift as u8 & 0x01));
            if gate != 0 && self.reg[8 + i] != 0 {
                let level = if self.emode[i] != 0 {
                    VOLUME_TABLE[usize::from(self.evol)]
                } else {
                    VOLUME_TABLE[usize::from(self.amplitude[i])]
                };
                sample = sample.wrapping_add(level);
            }
        }

        if self.pos < SAMPLE_BUF_LEN {
            self.buf[self.pos] = sample;
            self.pos += 1;
        }
    }

    /// One envelope period elapsed: move the volume along the current shape
    /// segment and roll over to the next segment after 16 steps.
    fn clock_envelope(&mut self) {
        let shape = self.reg[REG_ENVELOPE_SHAPE];

        // The 0th step keeps the starting volume.
        if self.estep != 0 {
            if self.eseg != 0 {
                match shape {
                    10 | 12 => self.evol += 1,
                    8 | 14 => self.evol -= 1,
                    // Remaining shapes hold their level in the second half.
                    _ => {}
                }
            } else if shape & 0x04 != 0 {
                self.evol += 1;
            } else {
                self.evol -= 1;
            }
        }

        self.estep += 1;
        if self.estep >= 16 {
            // Only the continuous non-hold shapes (8 and 14 family masked by
            // CONT|HOLD) keep alternating; everything else latches segment 1.
            if shape & 0x09 == 0x08 {
                self.eseg ^= 1;
            } else {
                self.eseg = 1;
            }
            self.envelope_restart();
        }
    }

    /// Samples emitted since the last [`SgmPsg::clear_samples`].
    pub fn samples(&self) -> &[i16] {
        &self.buf[..self.pos]
    }

    /// Rewind the sample buffer for the next frame.
    pub fn clear_samples(&mut self) {
        self.pos = 0;
    }

    #[cfg(test)]
    pub(crate) fn tone_period_of(&self, chan: usize) -> u16 {
        self.tperiod[chan]
    }

    #[cfg(test)]
    pub(crate) fn envelope_volume(&self) -> u8 {
        self.evol
    }

    pub(crate) fn state_save(&self, w: &mut Writer<'_>) {
        for &r in &self.reg {
            w.push_u8(r);
        }
        w.push_u8(self.rlatch);
        for &t in &self.tperiod {
            w.push_u16(t);
        }
        for &t in &self.tcounter {
            w.push_u16(t);
        }
        for &a in &self.amplitude {
            w.push_u8(a);
        }
        w.push_u8(self.nperiod);
        w.push_u16(self.ncounter);
        w.push_u32(self.nshift);
        w.push_u16(self.eperiod);
        w.push_u16(self.ecounter);
        w.push_u8(self.eseg);
        w.push_u8(self.estep);
        w.push_u8(self.evol);
        for &t in &self.tdisable {
            w.push_u8(t);
        }
        for &n in &self.ndisable {
            w.push_u8(n);
        }
        for &e in &self.emode {
            w.push_u8(e);
        }
        for &s in &self.sign {
            w.push_u8(s);
        }
    }

    pub(crate) fn state_load(&mut self, r: &mut Reader<'_>) {
        for reg in &mut self.reg {
            *reg = r.pop_u8();
        }
        self.rlatch = r.pop_u8() & 0x0F;
        for t in &mut self.tperiod {
            *t = r.pop_u16();
        }
        for t in &mut self.tcounter {
            *t = r.pop_u16();
        }
        for a in &mut self.amplitude {
            *a = r.pop_u8() & 0x0F;
        }
        self.nperiod = r.pop_u8();
        self.ncounter = r.pop_u16();
        self.nshift = r.pop_u32();
        self.eperiod = r.pop_u16();
        self.ecounter = r.pop_u16();
        self.eseg = r.pop_u8();
        self.estep = r.pop_u8();
        self.evol = r.pop_u8() & 0x0F;
        for t in &mut self.tdisable {
            *t = r.pop_u8();
        }
        for n in &mut self.ndisable {
            *n = r.pop_u8();
        }
        for e in &mut self.emode {
            *e = r.pop_u8();
        }
        for s in &mut self.sign {
            *s = r.pop_u8();
        }
    }
}

impl Default for SgmPsg {
    fn default() -> Self {
        Self::new()
    }
}

fn tone_period(fine: u8, coarse: u8) -> u16 {
    let period = u16::from(fine) | (u16::from(coarse) << 8);
    period.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn write_reg(psg: &mut SgmPsg, reg: u8, data: u8) {
        psg.select(reg);
        psg.write(data);
    }

    #[test]
    fn tone_periods_clamp_to_one() {
        let mut psg = SgmPsg::new();
        write_reg(&mut psg, 0, 0x00);
        assert_eq!(psg.tone_period_of(0), 1);
        write_reg(&mut psg, 2, 0x34);
        write_reg(&mut psg, 3, 0x02);
        assert_eq!(psg.tone_period_of(1), 0x234);
        write_reg(&mut psg, 3, 0x00);
        write_reg(&mut psg, 2, 0x00);
        assert_eq!(psg.tone_period_of(1), 1);
    }

    #[test]
    fn coarse_tune_masks_to_four_bits() {
        let mut psg = SgmPsg::new();
        write_reg(&mut psg, 0, 0xFF);
        write_reg(&mut psg, 1, 0xFF);
        assert_eq!(psg.tone_period_of(0), 0x0FFF);
    }

    #[test]
    fn reads_return_latched_register() {
        let mut psg = SgmPsg::new();
        write_reg(&mut psg, 14, 0xA7);
        psg.select(14);
        assert_eq!(psg.read(), 0xA7);
        // Masked bits never land in the register file.
        write_reg(&mut psg, 6, 0xFF);
        psg.select(6);
        assert_eq!(psg.read(), 0x1F);
    }

    #[test]
    fn register7_sets_disable_bits() {
        let mut psg = SgmPsg::new();
        write_reg(&mut psg, 7, 0b0010_1001);
        assert_eq!(psg.tdisable, [1, 0, 0]);
        assert_eq!(psg.ndisable, [1, 0, 1]);
    }

    #[test]
    fn envelope_shape_write_restarts() {
        let mut psg = SgmPsg::new();
        // Attack clear: start at the top.
        write_reg(&mut psg, 13, 0x00);
        assert_eq!(psg.envelope_volume(), 15);
        // Attack set: start at the bottom.
        write_reg(&mut psg, 13, 0x04);
        assert_eq!(psg.envelope_volume(), 0);
    }

    #[test]
    fn envelope_decay_shape_ramps_down_and_holds() {
        let mut psg = SgmPsg::new();
        write_reg(&mut psg, 11, 0x01); // eperiod = 1, so a step every 2 ticks
        write_reg(&mut psg, 13, 0x00); // single decay, then hold at 0
        let mut volumes = Vec::new();
        for _ in 0..40 {
            psg.tick();
            volumes.push(psg.envelope_volume());
        }
        // Ramps from 15 down to 0 and stays there.
        assert_eq!(volumes[1], 15);
        assert!(volumes.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*volumes.last().expect("non-empty"), 0);
    }

    #[test]
    fn envelope_triangle_shape_alternates() {
        let mut psg = SgmPsg::new();
        write_reg(&mut psg, 11, 0x01);
        write_reg(&mut psg, 13, 0x08); // continuous down/up sawtooth pairs
        let mut seen_high_after_low = false;
        let mut prev = psg.envelope_volume();
        let mut hit_zero = false;
        for _ in 0..200 {
            psg.tick();
            let v = psg.envelope_volume();
            if v == 0 {
                hit_zero = true;
            }
            if hit_zero && v > prev {
                seen_high_after_low = true;
            }
            prev = v;
        }
        assert!(seen_high_after_low, "shape 8 must keep cycling");
    }

    #[test]
    fn snapshot_round_trip() {
        let mut psg = SgmPsg::new();
        write_reg(&mut psg, 0, 0x55);
        write_reg(&mut psg, 7, 0x07);
        write_reg(&mut psg, 8, 0x1A);
        write_reg(&mut psg, 13, 0x0E);
        for _ in 0..100 {
            psg.tick();
        }

        let mut blob = vec![0u8; SgmPsg::STATE_LEN];
        let mut w = Writer::new(&mut blob);
        psg.state_save(&mut w);
        assert_eq!(w.position(), SgmPsg::STATE_LEN);

        let mut other = SgmPsg::new();
        other.state_load(&mut Reader::new(&blob));
        let mut blob2 = vec![0u8; SgmPsg::STATE_LEN];
        let mut w2 = Writer::new(&mut blob2);
        other.state_save(&mut w2);
        assert_eq!(blob, blob2);
    }

    proptest! {
        /// The 17-bit LFSR never locks up and never grows past 17 bits.
        #[test]
        fn noise_shift_register_stays_in_range(steps in 1usize..5000) {
            let mut shift: u32 = 1;
            for _ in 0..steps {
                shift = (shift >> 1) | (((shift ^ (shift >> 3)) & 0x01) << 16);
                prop_assert_ne!(shift, 0);
                prop_assert_eq!(shift & !0x1_FFFF, 0);
            }
        }

        /// Envelope volume stays within 0..=15 for every shape over a long
        /// run, so the unchecked +1/-1 arithmetic can never wrap.
        #[test]
        fn envelope_volume_stays_bounded(shape in 0u8..16, ticks in 1usize..2000) {
            let mut psg = SgmPsg::new();
            psg.select(11);
            psg.write(0x01);
            psg.select(13);
            psg.write(shape);
            for _ in 0..ticks {
                psg.tick();
                prop_assert!(psg.envelope_volume() <= 15);
            }
        }
    }
}
