//! Frame-granular audio mixing and resampling.
//!
//! Both PSGs emit raw samples at the same chip rate (one sample per 16 CPU
//! cycles, roughly 224 kHz). At the end of every frame the mixer sums the SGM
//! chip into the primary buffer, resamples the result to the host rate and
//! hands the converted block to the audio-ready callback.

use colecium_resample::Resampler;
use tracing::debug;

use crate::config::{
    DEFAULT_RESAMPLER_QUALITY, DEFAULT_SAMPLE_RATE, Region, SUPPORTED_SAMPLE_RATES,
};
use crate::psg::Psg;
use crate::sgm_psg::SgmPsg;

/// Native rate of the PSG sample stream in Hz.
pub const PSG_SAMPLE_RATE: u32 = 224_010;

/// Called once per frame with the frame's resampled audio.
pub type AudioCallback = Box<dyn FnMut(&[i16])>;

pub struct Mixer {
    resampler: Resampler,
    sample_rate: u32,
    quality: u8,
    framerate: u32,
    out: Vec<i16>,
    callback: AudioCallback,
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            resampler: Resampler::new(PSG_SAMPLE_RATE, DEFAULT_SAMPLE_RATE, DEFAULT_RESAMPLER_QUALITY),
            sample_rate: DEFAULT_SAMPLE_RATE,
            quality: DEFAULT_RESAMPLER_QUALITY,
            framerate: Region::Ntsc.framerate(),
            out: vec![0; out_len(DEFAULT_SAMPLE_RATE, Region::Ntsc.framerate())],
            callback: Box::new(|_| {}),
        }
    }

    pub fn set_callback(&mut self, callback: AudioCallback) {
        self.callback = callback;
    }

    /// Select the host sample rate. Unsupported rates are ignored.
    pub fn set_sample_rate(&mut self, rate: u32) {
        if !SUPPORTED_SAMPLE_RATES.contains(&rate) {
            debug!(rate, "ignoring unsupported sample rate");
            return;
        }
        self.sample_rate = rate;
        self.rebuild();
    }

    /// Select the resampler quality (0..=10). Out-of-range values are
    /// ignored.
    pub fn set_quality(&mut self, quality: u8) {
        if quality > colecium_resample::MAX_QUALITY {
            debug!(quality, "ignoring out-of-range resampler quality");
            return;
        }
        self.quality = quality;
        self.rebuild();
    }

    pub fn set_region(&mut self, region: Region) {
        self.framerate = region.framerate();
        self.rebuild();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples delivered per frame at the current rate and region.
    pub fn samples_per_frame(&self) -> usize {
        out_len(self.sample_rate, self.framerate)
    }

    fn rebuild(&mut self) {
        self.resampler = Resampler::new(PSG_SAMPLE_RATE, self.sample_rate, self.quality);
        self.out = vec![0; out_len(self.sample_rate, self.framerate)];
    }

    /// Mix and resample one frame's worth of chip output, then fire the
    /// audio-ready callback. The chip buffers are left intact; the scheduler
    /// rewinds them when the next frame starts.
    pub fn mix_frame(&mut self, psg: &mut Psg, sgm: &mut SgmPsg) {
        let produced = {
            let sgm_samples = sgm.samples();
            let primary = psg.samples_mut();

            for (mixed, &extra) in primary.iter_mut().zip(sgm_samples) {
                *mixed = mixed.wrapping_add(extra);
            }

            self.resampler.process(primary, &mut self.out)
        };

        (self.callback)(&self.out[..produced]);
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

fn out_len(rate: u32, framerate: u32) -> usize {
    (rate / framerate) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fill(psg: &mut Psg, ticks: usize) {
        for _ in 0..ticks {
            psg.tick();
        }
    }

    fn fill_sgm(psg: &mut SgmPsg, ticks: usize) {
        for _ in 0..ticks {
            psg.tick();
        }
    }

    #[test]
    fn delivers_one_block_per_frame() {
        let mut mixer = Mixer::new();
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&delivered);
        mixer.set_callback(Box::new(move |samples| {
            sink.borrow_mut().push(samples.len());
        }));

        let mut psg = Psg::new();
        let mut sgm = SgmPsg::new();
        fill(&mut psg, 3734);
        fill_sgm(&mut sgm, 3734);
        mixer.mix_frame(&mut psg, &mut sgm);

        let lens = delivered.borrow();
        assert_eq!(lens.len(), 1);
        // 48000 / 60 = 800 samples, give or take the resampler's phase.
        assert!((798..=800).contains(&lens[0]), "got {}", lens[0]);
        // Raw chip samples stay readable until the next frame rewinds them.
        assert_eq!(psg.samples().len(), 3734);
    }

    #[test]
    fn rejects_unsupported_rates_silently() {
        let mut mixer = Mixer::new();
        mixer.set_sample_rate(22_050);
        assert_eq!(mixer.sample_rate(), 48_000);
        mixer.set_sample_rate(96_000);
        assert_eq!(mixer.sample_rate(), 96_000);
        mixer.set_quality(11); // ignored
        mixer.set_quality(10);
    }

    #[test]
    fn pal_framerate_changes_block_size() {
        let mut mixer = Mixer::new();
        assert_eq!(mixer.samples_per_frame(), 800);
        mixer.set_region(Region::Pal);
        assert_eq!(mixer.samples_per_frame(), 960);
    }
}
