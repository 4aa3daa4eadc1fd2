use std::collections::VecDeque;

use codec::Codec;
use tracing::warn;

use crate::frame::{AudioFrame, Format};

/// Initial capacity of the hold remainder, in samples.
pub const HOLD_SAMPLES: usize = 1280;

// Decode scratch buffer, in samples.
const DECODE_SAMPLES: usize = 5000;

/// Format-normalizing reassembly buffer.
///
/// Accepts frames of any supported format, transcodes them to signed
/// linear PCM, and serves exact-length windows on demand. A pull is
/// all-or-nothing: when fewer samples are buffered than requested,
/// nothing is handed out and nothing changes, so mixing ticks stay
/// sample-aligned.
pub struct PcmBuffer {
    pending: VecDeque<Vec<i16>>,
    hold: Vec<i16>,
    size: usize,
    decoder: Option<(Format, Box<dyn Codec>)>,
}

impl Default for PcmBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmBuffer {
    pub fn new() -> PcmBuffer {
        PcmBuffer {
            pending: VecDeque::new(),
            hold: Vec::with_capacity(HOLD_SAMPLES),
            size: 0,
            decoder: None,
        }
    }

    /// Samples currently available to `pull`.
    pub fn available(&self) -> usize {
        self.size
    }

    /// Accept one frame. The caller keeps ownership; the buffer
    /// transcodes into its own storage.
    ///
    /// A frame whose format has no decoder is logged and dropped; the
    /// buffer keeps operating on whatever arrives next.
    pub fn feed(&mut self, frame: &AudioFrame) {
        let pcm = match frame.format {
            Format::Slin => frame.pcm(),
            _ => match self.decode(frame) {
                Some(pcm) => pcm,
                None => return,
            },
        };
        if pcm.is_empty() {
            return;
        }
        self.size += pcm.len();
        self.pending.push_back(pcm);
    }

    fn decode(&mut self, frame: &AudioFrame) -> Option<Vec<i16>> {
        let current = self.decoder.as_ref().map(|(format, _)| *format);
        if current != Some(frame.format) {
            // lazily build the pipeline, or rebuild it on a format change
            match frame.format.get_codec() {
                Some(codec) => self.decoder = Some((frame.format, codec)),
                None => {
                    self.decoder = None;
                    warn!(format = %frame.format, "no decoder for frame format, frame dropped");
                    return None;
                }
            }
        }
        let (_, decoder) = self.decoder.as_mut()?;

        let mut buf = [0i16; DECODE_SAMPLES];
        match decoder.decode(&frame.payload, &mut buf) {
            Ok(n) => Some(buf[..n].to_vec()),
            Err(e) => {
                warn!(format = %frame.format, "frame decode failed, frame dropped: {e}");
                None
            }
        }
    }

    /// Serve exactly `samples` samples in arrival order, or `None` when
    /// not enough is buffered. Leftover from a split frame is held for
    /// the next pull.
    pub fn pull(&mut self, samples: usize) -> Option<Vec<i16>> {
        if self.size < samples {
            return None;
        }

        let mut out = Vec::with_capacity(samples);
        if !self.hold.is_empty() {
            let take = self.hold.len().min(samples);
            out.extend_from_slice(&self.hold[..take]);
            self.hold.drain(..take);
        }
        while out.len() < samples {
            let Some(mut pcm) = self.pending.pop_front() else {
                break;
            };
            let need = samples - out.len();
            if pcm.len() <= need {
                out.append(&mut pcm);
            } else {
                out.extend_from_slice(&pcm[..need]);
                self.hold.extend_from_slice(&pcm[need..]);
            }
        }

        self.size -= out.len();
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: i16, len: usize) -> Vec<i16> {
        (0..len as i16).map(|i| start + i).collect()
    }

    #[test]
    fn test_exact_pull_order() {
        // frames of 160, 80, and 240 samples, pulled across the seams
        let mut buffer = PcmBuffer::new();
        buffer.feed(&AudioFrame::slin(&ramp(0, 160)));
        buffer.feed(&AudioFrame::slin(&ramp(1000, 80)));
        buffer.feed(&AudioFrame::slin(&ramp(2000, 240)));
        assert_eq!(buffer.available(), 480);

        let first = buffer.pull(160).unwrap();
        assert_eq!(first, ramp(0, 160));
        assert_eq!(buffer.available(), 320);

        // all-or-nothing: 350 > 320 produces nothing and changes nothing
        assert!(buffer.pull(350).is_none());
        assert_eq!(buffer.available(), 320);

        let rest = buffer.pull(320).unwrap();
        let mut expected = ramp(1000, 80);
        expected.extend(ramp(2000, 240));
        assert_eq!(rest, expected);
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_split_frame_hold() {
        let mut buffer = PcmBuffer::new();
        buffer.feed(&AudioFrame::slin(&ramp(0, 300)));

        assert_eq!(buffer.pull(100).unwrap(), ramp(0, 100));
        assert_eq!(buffer.pull(100).unwrap(), ramp(100, 100));
        assert_eq!(buffer.pull(100).unwrap(), ramp(200, 100));
        assert!(buffer.pull(1).is_none());
    }

    #[test]
    fn test_sample_conservation() {
        let mut buffer = PcmBuffer::new();
        let mut fed = 0;
        for len in [160, 80, 240, 7, 493] {
            buffer.feed(&AudioFrame::slin(&vec![1i16; len]));
            fed += len;
        }
        let mut pulled = 0;
        for request in [100, 100, 300, 250] {
            if let Some(pcm) = buffer.pull(request) {
                pulled += pcm.len();
            }
        }
        assert_eq!(pulled + buffer.available(), fed);
    }

    #[test]
    fn test_varying_pulls_match_single_pull() {
        let data = ramp(0, 480);
        let mut one = PcmBuffer::new();
        let mut many = PcmBuffer::new();
        for chunk in data.chunks(120) {
            one.feed(&AudioFrame::slin(chunk));
            many.feed(&AudioFrame::slin(chunk));
        }

        let whole = one.pull(480).unwrap();
        let mut pieces = Vec::new();
        for request in [37, 203, 160, 80] {
            pieces.extend(many.pull(request).unwrap());
        }
        assert_eq!(whole, pieces);
        assert_eq!(whole, data);
    }

    #[test]
    fn test_transcoded_feed() {
        // ulaw silence decodes to linear silence and counts in samples
        let mut buffer = PcmBuffer::new();
        let frame = AudioFrame::encoded(Format::Ulaw, 160, vec![0xff; 160]);
        buffer.feed(&frame);
        assert_eq!(buffer.available(), 160);
        assert_eq!(buffer.pull(160).unwrap(), vec![0i16; 160]);
    }

    #[test]
    fn test_format_change_rebuilds_decoder() {
        let mut buffer = PcmBuffer::new();
        buffer.feed(&AudioFrame::encoded(Format::Ulaw, 160, vec![0xff; 160]));
        buffer.feed(&AudioFrame::encoded(Format::Alaw, 160, vec![0x55; 160]));
        buffer.feed(&AudioFrame::slin(&[3i16; 160]));
        assert_eq!(buffer.available(), 480);
    }

    #[test]
    fn test_zero_request() {
        let mut buffer = PcmBuffer::new();
        buffer.feed(&AudioFrame::slin(&[1i16; 10]));
        assert_eq!(buffer.pull(0).unwrap(), Vec::<i16>::new());
        assert_eq!(buffer.available(), 10);
    }
}
