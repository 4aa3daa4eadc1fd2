use byteorder::{ByteOrder, LittleEndian};
use codec::{Codec, PCMA, PCMU};
use strum_macros::{Display, EnumString};

/// Bytes per canonical PCM sample (signed linear 16-bit mono).
pub const SAMPLE_BYTES: usize = 2;

/// Voice payload formats accepted at the frame intake.
///
/// `Slin` is the canonical interchange format; everything else is
/// transcoded on arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum Format {
    #[strum(serialize = "slin")]
    Slin,
    #[strum(serialize = "ulaw")]
    Ulaw,
    #[strum(serialize = "alaw")]
    Alaw,
}

impl Format {
    /// Decoder for this format, `None` for the canonical pass-through.
    pub fn get_codec(&self) -> Option<Box<dyn Codec>> {
        match self {
            Format::Slin => None,
            Format::Ulaw => Some(Box::new(PCMU::new())),
            Format::Alaw => Some(Box::new(PCMA::new())),
        }
    }
}

/// One unit of audio moving through a frame queue.
///
/// A frame has a single owner; fanning out to several queues clones the
/// payload so chains never share storage.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub format: Format,
    pub samples: usize,
    pub payload: Vec<u8>,
}

impl AudioFrame {
    /// Canonical-format frame from PCM samples.
    pub fn slin(pcm: &[i16]) -> AudioFrame {
        AudioFrame {
            format: Format::Slin,
            samples: pcm.len(),
            payload: pcm_to_bytes(pcm),
        }
    }

    /// Frame carrying an encoded payload of `samples` worth of audio.
    pub fn encoded(format: Format, samples: usize, payload: Vec<u8>) -> AudioFrame {
        AudioFrame {
            format,
            samples,
            payload,
        }
    }

    pub fn byte_length(&self) -> usize {
        self.payload.len()
    }

    /// PCM view of a canonical-format payload.
    pub fn pcm(&self) -> Vec<i16> {
        bytes_to_pcm(&self.payload)
    }
}

pub fn pcm_to_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0; pcm.len() * SAMPLE_BYTES];
    for (i, v) in pcm.iter().enumerate() {
        LittleEndian::write_i16(&mut bytes[SAMPLE_BYTES * i..SAMPLE_BYTES * (i + 1)], *v);
    }
    bytes
}

pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    let mut pcm = vec![0; bytes.len() / SAMPLE_BYTES];
    for (i, v) in pcm.iter_mut().enumerate() {
        *v = LittleEndian::read_i16(&bytes[SAMPLE_BYTES * i..SAMPLE_BYTES * (i + 1)]);
    }
    pcm
}
