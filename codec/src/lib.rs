//! # Codec Module
//!
//! Audio codec implementations for the lyrebird monitoring modules.
//! Every codec converts between its wire payload and signed linear
//! 16-bit mono PCM, the canonical interchange format used by the
//! mixing pipeline.
//!
//! ## Supported Codecs
//!
//! - **pcmu**: G.711 μ-law, 64 kbps, 8 kHz
//! - **pcma**: G.711 A-law, 64 kbps, 8 kHz
//!
//! Callers never depend on a concrete codec type; they hold a
//! `Box<dyn Codec>` built for the source format and treat
//! transcoding as a black box.

use anyhow::Result;

pub mod pcma;
pub mod pcmu;

pub use pcma::PCMA;
pub use pcmu::PCMU;

/// Common interface over all audio codecs.
///
/// Both directions write into a caller-supplied scratch buffer and
/// report how much of it they filled, so hot paths reuse their buffers
/// across frames.
pub trait Codec: Send {
    /// Compress PCM samples into `dst`. Returns the payload byte count.
    fn encode(&mut self, src: &[i16], dst: &mut [u8]) -> Result<usize>;

    /// Expand a payload into PCM samples in `dst`. Returns the sample
    /// count.
    fn decode(&mut self, src: &[u8], dst: &mut [i16]) -> Result<usize>;
}
