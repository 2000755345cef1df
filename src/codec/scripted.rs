//! Deterministic scripted codec backend.
//!
//! Emits a fully synthetic movie with exact, reproducible timing and pixel
//! content, so the pipeline's buffering, seeking and conversion logic can be
//! exercised without native codec libraries. Every integration test runs on
//! this backend.
//!
//! Content rules:
//! - video frame `i` is a grayscale gradient, `pixel(x, y) = (i + x + y) % 256`
//! - audio sample `j` (global, per channel) has value `j % 32768`
//! - audio PTS can carry alternating jitter to mimic sloppy containers;
//!   sample content stays gapless regardless

use std::collections::VecDeque;

use crate::clock::{Rational, SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::frame::RgbaImage;
use crate::lump::LumpSource;

use super::{
    AudioStreamInfo, CodecBackend, Demuxer, OpenedMovie, Packet, ReadStatus, Received,
    StreamDecoders, StreamKind, VideoStreamInfo,
};

/// Video time base of scripted movies (MPEG-style 90 kHz).
pub const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);

/// Description of the synthetic movie a [`ScriptedBackend`] produces.
#[derive(Debug, Clone)]
pub struct ScriptedMovie {
    pub width: u32,
    pub height: u32,
    /// Frames per second.
    pub fps: Rational,
    /// Total video frames in the movie.
    pub frames: u64,
    /// Video frames between seekable keyframes.
    pub keyframe_interval: u64,
    /// Packets buffered inside a decoder before the first frame comes out.
    pub decode_delay: usize,
    pub audio: Option<ScriptedAudio>,
    /// Emit a packet for an undecoded stream every `n` reads.
    pub stray_packet_interval: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ScriptedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Decoded samples per audio frame, before resampling.
    pub frame_samples: usize,
    /// Alternating PTS offset applied to reported audio timestamps.
    pub pts_jitter: i64,
}

impl Default for ScriptedMovie {
    fn default() -> Self {
        Self {
            width: 320,
            height: 200,
            fps: Rational::new(30, 1),
            frames: 60,
            keyframe_interval: 10,
            decode_delay: 0,
            audio: Some(ScriptedAudio {
                sample_rate: SAMPLE_RATE,
                channels: 1,
                frame_samples: 1024,
                pts_jitter: 0,
            }),
            stray_packet_interval: None,
        }
    }
}

impl ScriptedMovie {
    /// PTS ticks per video frame.
    fn pts_step(&self) -> i64 {
        i64::from(VIDEO_TIME_BASE.den) * i64::from(self.fps.den) / i64::from(self.fps.num)
    }

    fn duration_us(&self) -> i64 {
        (self.frames as i128 * 1_000_000 * i128::from(self.fps.den) / i128::from(self.fps.num))
            as i64
    }

    /// Total audio frames covering the video duration.
    fn audio_frames(&self) -> u64 {
        let Some(audio) = &self.audio else { return 0 };
        let total_samples = self.frames as u128 * u128::from(self.fps.den as u32)
            * u128::from(audio.sample_rate)
            / u128::from(self.fps.num as u32);
        total_samples.div_ceil(audio.frame_samples as u128) as u64
    }

    /// Expected pixel value for frame `index` at `(x, y)`.
    pub fn pixel_level(index: u64, x: u32, y: u32) -> u8 {
        ((index + u64::from(x) + u64::from(y)) % 256) as u8
    }
}

/// Codec backend producing the scripted movie regardless of lump content.
pub struct ScriptedBackend {
    movie: ScriptedMovie,
}

impl ScriptedBackend {
    pub fn new(movie: ScriptedMovie) -> Self {
        Self { movie }
    }
}

impl CodecBackend for ScriptedBackend {
    fn open(&self, _lump: LumpSource) -> Result<OpenedMovie> {
        let movie = self.movie.clone();
        Ok(OpenedMovie {
            demuxer: Box::new(ScriptedDemuxer {
                audio_frames: movie.audio_frames(),
                movie: movie.clone(),
                next_video: 0,
                next_audio: 0,
                reads: 0,
            }),
            decoders: Box::new(ScriptedDecoders {
                movie,
                video: DecoderState::default(),
                audio: DecoderState::default(),
                held_video: None,
                held_audio: None,
            }),
        })
    }
}

enum ScriptedPacket {
    Empty,
    Frame { kind: StreamKind, index: u64 },
}

struct ScriptedDemuxer {
    movie: ScriptedMovie,
    audio_frames: u64,
    next_video: u64,
    next_audio: u64,
    reads: u64,
}

impl ScriptedDemuxer {
    // Is the next audio frame due before the next video frame?
    fn audio_is_due(&self) -> bool {
        let Some(audio) = &self.movie.audio else {
            return false;
        };
        if self.next_audio >= self.audio_frames {
            return false;
        }
        if self.next_video >= self.movie.frames {
            return true;
        }
        // Compare v/fps against a*frame_samples/rate without floats.
        let video = self.next_video as i128
            * i128::from(self.movie.fps.den)
            * i128::from(audio.sample_rate);
        let audio_t = self.next_audio as i128
            * audio.frame_samples as i128
            * i128::from(self.movie.fps.num);
        audio_t < video
    }

    fn fill(&self, packet: &mut Packet, kind: StreamKind, index: u64) {
        match packet.downcast_mut::<ScriptedPacket>() {
            Some(slot) => *slot = ScriptedPacket::Frame { kind, index },
            None => crate::error::fatal("FFmpeg: foreign packet in scripted demuxer"),
        }
        packet.set_stream(Some(kind));
    }
}

impl Demuxer for ScriptedDemuxer {
    fn video(&self) -> VideoStreamInfo {
        VideoStreamInfo {
            time_base: VIDEO_TIME_BASE,
            width: self.movie.width,
            height: self.movie.height,
            frame_rate: self.movie.fps,
        }
    }

    fn audio(&self) -> Option<AudioStreamInfo> {
        self.movie.audio.as_ref().map(|audio| AudioStreamInfo {
            time_base: Rational::new(1, audio.sample_rate as i32),
            sample_rate: audio.sample_rate,
            channels: audio.channels,
        })
    }

    fn duration(&self) -> i64 {
        self.movie.duration_us()
    }

    fn new_packet(&self) -> Packet {
        Packet::new(Box::new(ScriptedPacket::Empty))
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<ReadStatus> {
        self.reads += 1;
        if let Some(interval) = self.movie.stray_packet_interval {
            if self.reads % interval == 0 {
                packet.set_stream(None);
                return Ok(ReadStatus::Packet);
            }
        }

        if self.audio_is_due() {
            self.fill(packet, StreamKind::Audio, self.next_audio);
            self.next_audio += 1;
            return Ok(ReadStatus::Packet);
        }

        if self.next_video < self.movie.frames {
            self.fill(packet, StreamKind::Video, self.next_video);
            self.next_video += 1;
            return Ok(ReadStatus::Packet);
        }

        Ok(ReadStatus::Eof)
    }

    fn seek(&mut self, min_pts: i64, target_pts: i64, _max_pts: i64) -> Result<()> {
        let step = self.movie.pts_step();
        let interval = self.movie.keyframe_interval.max(1);

        let frame = (target_pts.max(0) / step) as u64;
        let mut keyframe = frame - frame % interval;
        // Honor the lower bound of the search window where possible.
        while ((keyframe + interval) as i64) * step <= target_pts
            && (keyframe as i64) * step < min_pts
        {
            keyframe += interval;
        }
        self.next_video = keyframe.min(self.movie.frames);

        if let Some(audio) = &self.movie.audio {
            self.next_audio = (self.next_video as i128
                * i128::from(self.movie.fps.den)
                * i128::from(audio.sample_rate)
                / (i128::from(self.movie.fps.num) * audio.frame_samples as i128))
                as u64;
        }
        Ok(())
    }
}

#[derive(Default)]
struct DecoderState {
    pending: VecDeque<u64>,
    draining: bool,
}

impl DecoderState {
    fn receive(&mut self, delay: usize) -> Option<u64> {
        if self.draining || self.pending.len() > delay {
            self.pending.pop_front()
        } else {
            None
        }
    }
}

struct ScriptedDecoders {
    movie: ScriptedMovie,
    video: DecoderState,
    audio: DecoderState,
    held_video: Option<u64>,
    held_audio: Option<u64>,
}

impl ScriptedDecoders {
    fn state(&mut self, kind: StreamKind) -> &mut DecoderState {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    fn audio_info(&self) -> &ScriptedAudio {
        match &self.movie.audio {
            Some(audio) => audio,
            None => crate::error::fatal("FFmpeg: audio decoder without audio stream"),
        }
    }

    fn out_samples(&self, in_samples: usize) -> usize {
        let rate = self.audio_info().sample_rate;
        (in_samples as u64 * u64::from(SAMPLE_RATE) / u64::from(rate)) as usize
    }
}

impl StreamDecoders for ScriptedDecoders {
    fn has_audio(&self) -> bool {
        self.movie.audio.is_some()
    }

    fn audio_channels(&self) -> u16 {
        self.movie.audio.as_ref().map_or(0, |audio| audio.channels)
    }

    fn send_packet(&mut self, kind: StreamKind, packet: &mut Packet) -> Result<()> {
        let slot = packet
            .downcast_mut::<ScriptedPacket>()
            .ok_or_else(|| Error::codec("foreign packet in scripted decoder"))?;
        match std::mem::replace(slot, ScriptedPacket::Empty) {
            ScriptedPacket::Frame { kind: got, index } if got == kind => {
                self.state(kind).pending.push_back(index);
            }
            _ => return Err(Error::codec("cannot send packet to the decoder")),
        }
        packet.set_stream(None);
        Ok(())
    }

    fn send_flush(&mut self, kind: StreamKind) -> Result<()> {
        self.state(kind).draining = true;
        Ok(())
    }

    fn receive_frame(&mut self, kind: StreamKind) -> Result<Received> {
        let delay = self.movie.decode_delay;
        let state = self.state(kind);
        let Some(index) = state.receive(delay) else {
            return Ok(if state.draining {
                Received::Eof
            } else {
                Received::Hungry
            });
        };

        Ok(match kind {
            StreamKind::Video => {
                self.held_video = Some(index);
                let step = self.movie.pts_step();
                Received::VideoFrame {
                    pts: index as i64 * step,
                    duration: step,
                }
            }
            StreamKind::Audio => {
                self.held_audio = Some(index);
                let audio = self.audio_info();
                let mut pts = index as i64 * audio.frame_samples as i64;
                if index > 0 && audio.pts_jitter != 0 {
                    pts += if index % 2 == 1 {
                        audio.pts_jitter
                    } else {
                        -audio.pts_jitter
                    };
                }
                Received::AudioFrame {
                    pts,
                    samples: audio.frame_samples,
                    sample_rate: audio.sample_rate,
                }
            }
        })
    }

    fn flush_buffers(&mut self, kind: StreamKind) {
        let state = self.state(kind);
        state.pending.clear();
        state.draining = false;
    }

    fn scale_video_into(&mut self, dst: &mut RgbaImage) -> Result<()> {
        let index = self
            .held_video
            .ok_or_else(|| Error::codec("no video frame held"))?;
        for y in 0..dst.height {
            for x in 0..dst.width {
                let level = ScriptedMovie::pixel_level(index, x, y);
                let p = y as usize * dst.stride + x as usize * 4;
                dst.data[p..p + 4].copy_from_slice(&[level, level, level, 255]);
            }
        }
        Ok(())
    }

    fn resample_audio_into(&mut self, dst: &mut [i16], max_samples: usize) -> Result<usize> {
        let index = self
            .held_audio
            .ok_or_else(|| Error::codec("no audio frame held"))?;
        let audio = self.audio_info();
        let channels = usize::from(audio.channels);
        let produced = self
            .out_samples(audio.frame_samples)
            .min(max_samples)
            .min(dst.len() / channels);

        let base = index as i64 * self.out_samples(audio.frame_samples) as i64;
        for i in 0..produced {
            let value = ((base + i as i64) % 32_768) as i16;
            for c in 0..channels {
                dst[i * channels + c] = value;
            }
        }
        Ok(produced)
    }
}
