use crate::factory::PcmBuffer;
use crate::frame::AudioFrame;
use crate::queue::{Direction, FrameQueue, DIRECTIONS};

/// Volume factors live in [-4, 4]; the effective multiplier is
/// `2^|factor|`, multiplying for positive factors and dividing for
/// negative ones.
pub const VOLUME_RANGE: i8 = 4;

/// What to do when 16-bit arithmetic overflows.
///
/// `Wrap` reproduces the raw wraparound of plain i16 math bit-exactly
/// and is the default. `Saturate` clamps to the i16 range and must be
/// selected explicitly per session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Overflow {
    #[default]
    Wrap,
    Saturate,
}

pub fn clamp_volume(factor: i32) -> i8 {
    factor.clamp(-VOLUME_RANGE as i32, VOLUME_RANGE as i32) as i8
}

/// Step a volume factor by `delta`, wrapping around the [-4, 4] range.
pub fn cycle_volume(factor: i8, delta: i8) -> i8 {
    let stepped = factor as i32 + delta as i32;
    if stepped > VOLUME_RANGE as i32 {
        -VOLUME_RANGE
    } else if stepped < -(VOLUME_RANGE as i32) {
        VOLUME_RANGE
    } else {
        stepped as i8
    }
}

/// Scale samples in place by `2^|factor|`.
pub fn apply_volume(pcm: &mut [i16], factor: i8, overflow: Overflow) {
    if factor == 0 {
        return;
    }
    let factor = clamp_volume(factor as i32);
    let multiplier = 1i16 << factor.unsigned_abs();
    if factor > 0 {
        match overflow {
            Overflow::Wrap => {
                for v in pcm.iter_mut() {
                    *v = v.wrapping_mul(multiplier);
                }
            }
            Overflow::Saturate => {
                for v in pcm.iter_mut() {
                    *v = v.saturating_mul(multiplier);
                }
            }
        }
    } else {
        for v in pcm.iter_mut() {
            *v /= multiplier;
        }
    }
}

/// Sum two PCM windows element-wise. The output covers the longer
/// side; indices past the shorter side pass through unchanged.
pub fn mix(a: &[i16], b: &[i16], overflow: Overflow) -> Vec<i16> {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = Vec::with_capacity(long.len());
    for (i, v) in long.iter().enumerate() {
        match short.get(i) {
            Some(w) => out.push(match overflow {
                Overflow::Wrap => v.wrapping_add(*w),
                Overflow::Saturate => v.saturating_add(*w),
            }),
            None => out.push(*v),
        }
    }
    out
}

/// Whole-tick mixing state shared by spy and recorder sessions: one
/// reassembly buffer per direction plus per-side volume factors.
pub struct Mixer {
    buffers: [PcmBuffer; 2],
    volume: [i8; 2],
    overflow: Overflow,
}

impl Mixer {
    pub fn new(overflow: Overflow) -> Mixer {
        Mixer {
            buffers: [PcmBuffer::new(), PcmBuffer::new()],
            volume: [0, 0],
            overflow,
        }
    }

    pub fn set_volume(&mut self, direction: Direction, factor: i8) {
        self.volume[direction as usize] = clamp_volume(factor as i32);
    }

    pub fn set_volume_all(&mut self, factor: i8) {
        for direction in DIRECTIONS {
            self.set_volume(direction, factor);
        }
    }

    pub fn volume(&self, direction: Direction) -> i8 {
        self.volume[direction as usize]
    }

    pub fn available(&self, direction: Direction) -> usize {
        self.buffers[direction as usize].available()
    }

    pub fn feed(&mut self, direction: Direction, frame: &AudioFrame) {
        self.buffers[direction as usize].feed(frame);
    }

    /// Move everything queued on both directions into the buffers.
    pub fn drain_queue(&mut self, queue: &FrameQueue) {
        for direction in DIRECTIONS {
            for frame in queue.drain(direction) {
                self.feed(direction, &frame);
            }
        }
    }

    /// One mixing tick: pull a full window from each side, scale, sum.
    ///
    /// All-or-nothing: `None` means "not ready, try again next tick"
    /// and never blocks. Both sides must have a full window buffered.
    pub fn tick(&mut self, samples: usize) -> Option<Vec<i16>> {
        if self.buffers[0].available() < samples || self.buffers[1].available() < samples {
            return None;
        }
        let mut read = self.buffers[0].pull(samples)?;
        let mut write = self.buffers[1].pull(samples)?;
        apply_volume(&mut read, self.volume[0], self.overflow);
        apply_volume(&mut write, self.volume[1], self.overflow);
        Some(mix(&read, &write, self.overflow))
    }
}
