use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

use crate::frame::pcm_to_bytes;

/// RIFF/fmt/data header for 16-bit mono PCM.
pub const HEADER_LEN: usize = 44;
/// Offset of the RIFF chunk size, patched on finalize.
pub const RIFF_SIZE_OFFSET: u64 = 4;
/// Offset of the data chunk size, patched on finalize.
pub const DATA_SIZE_OFFSET: u64 = 40;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("invalid file")]
    InvalidFile,
}

#[derive(Debug, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub data_len: u32,
}

/// Build a 44-byte header declaring `data_len` bytes of 16-bit mono
/// PCM. Recorders write it with `data_len` 0 and patch the sizes when
/// they finish.
pub fn header(sample_rate: u32, data_len: u32) -> Result<Vec<u8>> {
    let mut wav = Vec::with_capacity(HEADER_LEN);
    wav.extend_from_slice(b"RIFF");
    wav.write_u32::<LittleEndian>(data_len + 36)?;
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.write_u32::<LittleEndian>(16)?;
    wav.write_u16::<LittleEndian>(1)?;
    wav.write_u16::<LittleEndian>(1)?;
    wav.write_u32::<LittleEndian>(sample_rate)?;
    wav.write_u32::<LittleEndian>(sample_rate * 16 / 8)?;
    wav.write_u16::<LittleEndian>(16 / 8)?;
    wav.write_u16::<LittleEndian>(16)?;

    wav.extend_from_slice(b"data");
    wav.write_u32::<LittleEndian>(data_len)?;
    Ok(wav)
}

/// Convert 16-bit mono PCM samples to a complete WAV byte vector.
pub fn pcm_to_wav(sample_rate: u32, pcm: &[i16]) -> Result<Vec<u8>> {
    let mut wav = header(sample_rate, (pcm.len() * 2) as u32)?;
    wav.extend_from_slice(&pcm_to_bytes(pcm));
    Ok(wav)
}

/// Read the fixed fields out of a 44-byte header.
pub fn parse_header(buf: &[u8]) -> Result<WavInfo, WavError> {
    if buf.len() < HEADER_LEN || &buf[..4] != b"RIFF" {
        return Err(WavError::InvalidFile);
    }
    Ok(WavInfo {
        channels: LittleEndian::read_u16(&buf[22..24]),
        sample_rate: LittleEndian::read_u32(&buf[24..28]),
        bits_per_sample: LittleEndian::read_u16(&buf[34..36]),
        data_len: LittleEndian::read_u32(&buf[40..44]),
    })
}
