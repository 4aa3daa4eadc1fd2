//! # Channel Monitoring Module
//!
//! Bridged multi-party audio mixing and spying for a PBX media engine.
//! Everything here is a client of the engine's channel layer: frames are
//! pushed in by the channel's own I/O, mixed down to canonical linear
//! PCM, and handed to a live listener or a recording file.
//!
//! ## Core Components
//!
//! - **queue**: per-session two-direction frame intake with an atomic
//!   done flag
//! - **factory**: format-normalizing PCM reassembly buffer with
//!   byte-exact pulls
//! - **mixer**: volume scaling and two-way PCM summation, shared by all
//!   session kinds
//! - **channel**: the engine channel stand-in — observer list, audio
//!   sink, generator capability
//! - **spy**: live spy sessions driven by the spying channel's
//!   generator callback
//! - **recorder**: file-sink sessions driven by an owned worker task
//! - **registry**: process-wide recorder registry and the
//!   administrative start/stop surface
//!
//! ## Audio Pipeline
//!
//! 1. **Intake**: the target channel fans frames out to attached queues
//! 2. **Normalize**: each direction is transcoded to signed linear PCM
//! 3. **Mix**: fixed-size windows are pulled, scaled, and summed
//! 4. **Emit**: the mixed frame goes to the listener's channel or a file

pub mod channel;
pub mod factory;
pub mod frame;
pub mod mixer;
pub mod options;
pub mod queue;
pub mod recorder;
pub mod registry;
pub mod service;
pub mod session;
pub mod spy;
pub mod tone;
pub mod wav;
