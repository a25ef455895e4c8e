//! # Audio Module
//!
//! Everything that touches audio on the client side of a voice session.
//!
//! ## Key Components:
//! - **Capture Pipeline**: Cuts microphone audio into fixed-interval chunks (`capture`)
//! - **Audio Sources**: The microphone seam and a WAV file backed implementation (`source`)
//! - **Playback Queue**: Plays synthesized speech chunks in order with format fallback (`playback`)
//! - **Audio Outputs**: The speaker seam, a paced WAV player and the priming decorator (`output`)
//! - **Media Handles**: Revocable per-candidate handles to decoded chunk bytes (`media`)
//!
//! ## Audio Format Notes:
//! The file-backed source produces 16-bit little-endian PCM, either raw (`audio/pcm`)
//! or wrapped in a WAV header per chunk (`audio/wav`). Inbound speech is opaque bytes
//! tried against several container labels until one plays.

pub mod capture;  // Fixed-interval chunking of the active source
pub mod format;   // Encoding labels and negotiation
pub mod media;    // Object-URL style handles
pub mod output;   // Speaker seam and implementations
pub mod playback; // Ordered playback queue
pub mod source;   // Microphone seam and implementations
