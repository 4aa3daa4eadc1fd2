use std::f64::consts::PI;

use anyhow::{anyhow, Result};

use crate::channel::Generator;
use crate::mixer::{mix, Overflow};

const TONE_AMPLITUDE: f64 = 5000.0;

/// Generate a single-frequency sine wave of `duration` ms at `rate` Hz.
pub fn get_wave(rate: u32, duration: usize, freq: usize) -> Vec<i16> {
    let samples = (rate / 1000) as usize * duration;
    let mut phase = 0f64;
    let frequency_radian = freq as f64 * 2.0 * PI / rate as f64;
    let mut pcm = Vec::new();

    for _ in 0..samples {
        phase += frequency_radian;
        let value = phase.sin();
        pcm.push((value * TONE_AMPLITUDE) as i16);
    }

    pcm
}

/// Create a dual-tone PCM buffer with `on`/`off` cadence and two
/// frequencies.
pub fn tone_pcm(rate: u32, on: usize, off: usize, freq1: usize, freq2: usize) -> Vec<i16> {
    let pcm1 = get_wave(rate, on, freq1);
    let pcm2 = get_wave(rate, on, freq2);

    let mut pcm = mix(&pcm1, &pcm2, Overflow::Saturate);
    for _ in 0..(rate / 1000) as usize * off {
        pcm.push(0);
    }
    pcm
}

/// Short single-frequency attention beep, played to a listener when a
/// spy session opens.
pub fn beep(rate: u32) -> Vec<i16> {
    get_wave(rate, 60, 1400)
}

/// Plain-tone generator capability: loops a rendered cadence cycle into
/// the channel it is installed on.
pub struct ToneGenerator {
    rate: u32,
    on: usize,
    off: usize,
    freq1: usize,
    freq2: usize,
    pcm: Vec<i16>,
    pos: usize,
}

impl ToneGenerator {
    pub fn new(rate: u32, on: usize, off: usize, freq1: usize, freq2: usize) -> ToneGenerator {
        ToneGenerator {
            rate,
            on,
            off,
            freq1,
            freq2,
            pcm: Vec::new(),
            pos: 0,
        }
    }
}

impl Generator for ToneGenerator {
    fn alloc(&mut self) -> Result<()> {
        if self.on == 0 {
            return Err(anyhow!("tone with no on time"));
        }
        self.pcm = tone_pcm(self.rate, self.on, self.off, self.freq1, self.freq2);
        self.pos = 0;
        Ok(())
    }

    fn generate(&mut self, samples: usize) -> Result<Option<Vec<i16>>> {
        if self.pcm.is_empty() {
            return Err(anyhow!("tone generator not allocated"));
        }
        let mut out = Vec::with_capacity(samples);
        while out.len() < samples {
            let end = (self.pos + samples - out.len()).min(self.pcm.len());
            out.extend_from_slice(&self.pcm[self.pos..end]);
            self.pos = if end == self.pcm.len() { 0 } else { end };
        }
        Ok(Some(out))
    }

    fn release(&mut self) {
        self.pcm.clear();
        self.pos = 0;
    }
}
