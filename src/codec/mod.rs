//! Narrow facade over the demuxing/decoding library.
//!
//! The pipeline only ever touches the codec stack through these traits:
//! a [`Demuxer`] driven from the consumer thread and the [`StreamDecoders`]
//! driven from the worker thread, produced together by a [`CodecBackend`].
//! Keeping the seam this small lets tests substitute the deterministic
//! [`scripted`] backend for the FFmpeg one.
//!
//! Packets are opaque pooled handles: the backend allocates their real
//! representation once and reuses it for every read, so the steady state
//! stays allocation-free.

use std::any::Any;

use crate::clock::Rational;
use crate::error::Result;
use crate::frame::RgbaImage;
use crate::lump::LumpSource;

pub mod scripted;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

/// Which elementary stream an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Descriptor of the selected video stream.
#[derive(Debug, Clone, Copy)]
pub struct VideoStreamInfo {
    pub time_base: Rational,
    pub width: u32,
    pub height: u32,
    /// Average frame rate, used to size the frame buffer.
    pub frame_rate: Rational,
}

/// Descriptor of the selected audio stream, if any.
#[derive(Debug, Clone, Copy)]
pub struct AudioStreamInfo {
    pub time_base: Rational,
    pub sample_rate: u32,
    pub channels: u16,
}

/// A pooled, backend-owned compressed packet.
///
/// `stream` is `None` until a read fills the packet, and also for packets
/// belonging to streams the pipeline does not decode (those stay in the
/// pool and their storage is reused by the next read).
pub struct Packet {
    stream: Option<StreamKind>,
    inner: Box<dyn Any + Send>,
}

impl Packet {
    pub fn new(inner: Box<dyn Any + Send>) -> Self {
        Self {
            stream: None,
            inner,
        }
    }

    pub fn stream(&self) -> Option<StreamKind> {
        self.stream
    }

    pub fn set_stream(&mut self, stream: Option<StreamKind>) {
        self.stream = stream;
    }

    /// Borrow the backend representation.
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.inner.downcast_mut::<T>()
    }
}

/// Outcome of a demuxer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The packet slot was filled (possibly for an undecoded stream).
    Packet,
    /// The container is exhausted.
    Eof,
}

/// Outcome of asking a decoder for its next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A video frame is held by the backend; scale it out with
    /// [`StreamDecoders::scale_video_into`].
    VideoFrame { pts: i64, duration: i64 },
    /// An audio frame is held by the backend; drain it with
    /// [`StreamDecoders::resample_audio_into`].
    AudioFrame {
        pts: i64,
        samples: usize,
        sample_rate: u32,
    },
    /// The decoder needs more input.
    Hungry,
    /// The decoder is fully drained after a flush.
    Eof,
}

/// Container-side half of the codec stack, driven from the consumer thread.
pub trait Demuxer: Send {
    fn video(&self) -> VideoStreamInfo;

    fn audio(&self) -> Option<AudioStreamInfo>;

    /// Whole-container duration in container time base
    /// ([`crate::clock::CONTAINER_BASE`]).
    fn duration(&self) -> i64;

    /// Allocate a reusable packet handle for the pool.
    fn new_packet(&self) -> Packet;

    /// Read the next packet into `packet`, tagging its stream.
    fn read_packet(&mut self, packet: &mut Packet) -> Result<ReadStatus>;

    /// Seek the video stream near `target_pts`.
    ///
    /// The widened `[min_pts, max_pts]` window tells the container a
    /// keyframe anywhere back at `min_pts` is acceptable.
    fn seek(&mut self, min_pts: i64, target_pts: i64, max_pts: i64) -> Result<()>;
}

/// Codec-side half of the stack, owned by the decode worker thread.
pub trait StreamDecoders: Send {
    fn has_audio(&self) -> bool;

    /// Output channel count (after resampling; layout is preserved).
    fn audio_channels(&self) -> u16;

    /// Feed one compressed packet to the decoder for `kind`.
    ///
    /// The packet's storage is released back to its pooled state.
    fn send_packet(&mut self, kind: StreamKind, packet: &mut Packet) -> Result<()>;

    /// Enter draining mode for `kind` (the null-packet flush signal).
    fn send_flush(&mut self, kind: StreamKind) -> Result<()>;

    /// Ask the decoder for `kind` for its next frame.
    fn receive_frame(&mut self, kind: StreamKind) -> Result<Received>;

    /// Reset decoder state after a drain, ready for post-seek input.
    fn flush_buffers(&mut self, kind: StreamKind);

    /// Convert the held video frame to RGBA in `dst`.
    fn scale_video_into(&mut self, dst: &mut RgbaImage) -> Result<()>;

    /// Resample the held audio frame into `dst` as packed signed-16 at
    /// [`crate::clock::SAMPLE_RATE`]; returns per-channel samples written.
    fn resample_audio_into(&mut self, dst: &mut [i16], max_samples: usize) -> Result<usize>;
}

/// Factory tying the two halves together over one movie lump.
pub trait CodecBackend {
    fn open(&self, lump: LumpSource) -> Result<OpenedMovie>;
}

/// The demuxer/decoder pair for one opened movie.
pub struct OpenedMovie {
    pub demuxer: Box<dyn Demuxer>,
    pub decoders: Box<dyn StreamDecoders>,
}
