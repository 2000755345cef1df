//! Decoded frame objects and their pre-allocated payload storage.
//!
//! Frames are allocated once when a movie opens (video) or when the first
//! audio frame reveals the decoder's frame size (audio), then cycle
//! pool → worker queue → consumer buffer → pool for the life of the movie.
//! Nothing on the steady-state path allocates.

use crate::posted;

/// A tightly packed 32-bit RGBA surface.
pub struct RgbaImage {
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: usize,
    pub data: Vec<u8>,
}

impl RgbaImage {
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize * 4;
        Self {
            width,
            height,
            stride,
            data: vec![0; stride * height as usize],
        }
    }
}

/// A video frame's pixel storage: truecolor, or the engine's posted format.
pub enum ImagePayload {
    Rgba(RgbaImage),
    Posted(Vec<u8>),
}

impl ImagePayload {
    /// Allocate payload storage for the requested output format.
    pub fn allocate(width: u32, height: u32, use_posted: bool) -> Self {
        if use_posted {
            Self::Posted(vec![0; posted::posted_size(width as usize, height as usize)])
        } else {
            Self::Rgba(RgbaImage::new(width, height))
        }
    }

    /// The raw bytes handed to the engine's drawers.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Rgba(image) => &image.data,
            Self::Posted(data) => data,
        }
    }
}

/// One decoded, converted video frame.
pub struct VideoFrame {
    /// Monotonic id, never reused for the life of the worker.
    pub id: u64,
    /// Presentation timestamp in the video stream's time base.
    pub pts: i64,
    /// Display duration in the video stream's time base.
    pub duration: i64,
    pub image: ImagePayload,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, use_posted: bool) -> Self {
        Self {
            id: 0,
            pts: 0,
            duration: 0,
            image: ImagePayload::allocate(width, height, use_posted),
        }
    }

    pub fn end_pts(&self) -> i64 {
        self.pts + self.duration
    }
}

/// One resampled audio frame: packed signed-16 at the output rate.
pub struct AudioFrame {
    /// Presentation timestamp in the audio stream's time base.
    pub pts: i64,
    /// Valid per-channel samples in `samples`.
    pub num_samples: usize,
    /// Absolute output-sample index of the first sample, assigned when the
    /// frame enters the consumer buffer.
    pub first_sample_position: i64,
    /// Interleaved storage, `capacity_samples * channels` long.
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(capacity_samples: usize, channels: u16) -> Self {
        Self {
            pts: 0,
            num_samples: 0,
            first_sample_position: 0,
            samples: vec![0; capacity_samples * channels as usize],
        }
    }

    pub fn end_sample(&self) -> i64 {
        self.first_sample_position + self.num_samples as i64
    }
}
