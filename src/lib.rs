//! `flicker` — a streaming movie playback pipeline for game engines.
//!
//! This crate provides:
//! - Bounded-memory streaming decode of container-packaged video+audio
//! - A per-tick consumer API (`update` / `image` / `copy_audio_samples`)
//! - Random-access seeking driven by the game's playback position
//! - RGBA or engine column-posted output
//!
//! Decoding runs on a background worker per movie; the game loop stays in
//! charge of pacing, drawing and mixing. The codec stack sits behind a
//! narrow facade so engines can ship the FFmpeg backend while tests run on
//! a deterministic scripted one.

// Fixed-capacity rings backing every pool and queue.
pub mod ring;

// Conversions between stream PTS, output samples and wall-clock ms.
pub mod clock;

// Archive lookup and the in-memory byte source behind the demuxer.
pub mod lump;

// Master palette and the truecolor -> palette-index table.
pub mod palette;

// Run-length column image encoding for the engine's drawers.
pub mod posted;

// Frame objects and their pre-allocated payloads.
pub mod frame;

// The codec facade and its backends.
pub mod codec;

// The movie handle and consumer-side API.
pub mod movie;

// Logging configuration and control.
pub mod logging;

mod error;
mod worker;

pub use error::{Error, Result};
pub use movie::{BufferStats, Movie, MovieStats};

#[cfg(feature = "ffmpeg")]
pub use movie::play;
