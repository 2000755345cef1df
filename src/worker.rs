//! The background decode worker.
//!
//! One worker thread per movie pulls compressed packets from the packet
//! queue, drives the codec decoders, converts output into pooled frames and
//! hands them to the consumer through the per-stream frame queues. All
//! shared state sits behind a single mutex that doubles as the condition
//! variable's mutex; the worker parks there when every pool is starved or
//! the decoders are hungry with nothing queued.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::clock::SAMPLE_RATE;
use crate::codec::{Packet, Received, StreamDecoders, StreamKind};
use crate::error::fatal;
use crate::frame::{AudioFrame, ImagePayload, RgbaImage, VideoFrame};
use crate::movie::STREAM_BUFFER_TIME;
use crate::palette::ColorLut;
use crate::posted;
use crate::ring::{RingBuffer, move_all, move_one};

/// Audio-side rings, created lazily once the decoder reveals its frame size.
pub(crate) struct AudioRings {
    pub queue: RingBuffer<AudioFrame>,
    pub pool: RingBuffer<AudioFrame>,
    /// Worst-case output samples per decoded frame (the pool allocation).
    pub samples_per_frame: usize,
    pub channels: u16,
}

/// Everything shared between the consumer thread and the worker.
pub(crate) struct WorkerState {
    pub video_queue: RingBuffer<VideoFrame>,
    pub video_pool: RingBuffer<VideoFrame>,
    pub audio: Option<AudioRings>,
    pub packet_queue: RingBuffer<Packet>,
    pub packet_pool: RingBuffer<Packet>,
    pub stopping: bool,
    pub flushing: bool,
    pub next_frame_id: u64,
}

pub(crate) struct WorkerShared {
    pub state: Mutex<WorkerState>,
    pub cond: Condvar,
}

impl WorkerShared {
    /// Wake the worker after queue or pool contents changed.
    pub fn wake(&self) {
        self.cond.notify_one();
    }
}

/// Worker-owned resources, moved into the thread and recovered on join so
/// the movie can respawn the worker after an image-format switch.
pub(crate) struct WorkerContext {
    pub decoders: Box<dyn StreamDecoders>,
    pub lut: Arc<ColorLut>,
    pub use_posted: bool,
    /// Scale target when posting; the posted buffer is built from this.
    pub staging: Option<RgbaImage>,
    pub width: u32,
    pub height: u32,
}

impl WorkerContext {
    /// Swap every pooled video frame to the other image format.
    ///
    /// Only valid while the worker is stopped and all video frames are back
    /// in the pool.
    pub fn reallocate_images(&mut self, pool: &mut RingBuffer<VideoFrame>, use_posted: bool) {
        let (width, height) = (self.width, self.height);
        self.use_posted = use_posted;
        self.staging = use_posted.then(|| RgbaImage::new(width, height));
        for frame in pool.iter_mut() {
            frame.image = ImagePayload::allocate(width, height, use_posted);
        }
    }
}

/// Worst-case resampled output for one decoded frame.
pub(crate) fn samples_per_frame(in_samples: usize, in_rate: u32) -> usize {
    in_samples * SAMPLE_RATE as usize / in_rate as usize + 1
}

pub(crate) fn spawn(
    shared: Arc<WorkerShared>,
    context: WorkerContext,
) -> JoinHandle<WorkerContext> {
    thread::Builder::new()
        .name("movie-decode".into())
        .spawn(move || run(context, shared))
        .unwrap_or_else(|err| fatal(format!("FFmpeg: cannot spawn decode worker: {err}")))
}

fn run(mut ctx: WorkerContext, shared: Arc<WorkerShared>) -> WorkerContext {
    debug!(target: "flicker", use_posted = ctx.use_posted, "decode worker started");

    let mut state = shared.state.lock();
    loop {
        if state.stopping {
            break;
        }
        if state.flushing {
            flush_decoding(&mut ctx, &mut state);
            continue;
        }

        let starved = state.video_pool.is_empty()
            || state
                .audio
                .as_ref()
                .is_some_and(|audio| audio.pool.is_empty());
        if starved {
            shared.cond.wait(&mut state);
            continue;
        }

        match receive(&mut ctx, StreamKind::Video) {
            Received::VideoFrame { pts, duration } => {
                parse_video_frame(&mut ctx, &mut state, pts, duration);
                continue;
            }
            Received::Hungry | Received::Eof => {}
            Received::AudioFrame { .. } => fatal("FFmpeg: audio frame from video decoder"),
        }

        if ctx.decoders.has_audio() {
            if let Received::AudioFrame {
                pts,
                samples,
                sample_rate,
            } = receive(&mut ctx, StreamKind::Audio)
            {
                parse_audio_frame(&mut ctx, &mut state, pts, samples, sample_rate);
                continue;
            }
        }

        // Both decoders are hungry: feed one packet or park.
        if state.packet_queue.is_empty() {
            shared.cond.wait(&mut state);
        } else {
            send_packet(&mut ctx, &mut state);
        }
    }

    state.stopping = false;
    drop(state);

    debug!(target: "flicker", "decode worker stopped");
    ctx
}

fn receive(ctx: &mut WorkerContext, kind: StreamKind) -> Received {
    ctx.decoders
        .receive_frame(kind)
        .unwrap_or_else(|err| fatal(err))
}

/// Feed the oldest queued packet to the decoder it belongs to.
fn send_packet(ctx: &mut WorkerContext, state: &mut WorkerState) {
    let mut packet = state.packet_queue.dequeue();

    // The consumer already filters out foreign streams, so anything else
    // reaching this point is a bookkeeping bug.
    let kind = match packet.stream() {
        Some(kind) => kind,
        None => fatal("FFmpeg: unexpected packet"),
    };
    if let Err(err) = ctx.decoders.send_packet(kind, &mut packet) {
        fatal(err);
    }

    state.packet_pool.enqueue(packet);
}

fn parse_video_frame(ctx: &mut WorkerContext, state: &mut WorkerState, pts: i64, duration: i64) {
    let frame = state.video_pool.peek_mut(0);
    frame.id = state.next_frame_id;
    state.next_frame_id += 1;
    frame.pts = pts;
    frame.duration = duration;

    let result = match &mut frame.image {
        ImagePayload::Rgba(image) => ctx.decoders.scale_video_into(image),
        ImagePayload::Posted(data) => {
            let staging = match ctx.staging.as_mut() {
                Some(staging) => staging,
                None => fatal("FFmpeg: posting without a staging image"),
            };
            ctx.decoders.scale_video_into(staging).map(|()| {
                posted::convert_rgba(staging, &ctx.lut, data);
            })
        }
    };
    if let Err(err) = result {
        fatal(err);
    }

    move_one(&mut state.video_queue, &mut state.video_pool);
}

fn parse_audio_frame(
    ctx: &mut WorkerContext,
    state: &mut WorkerState,
    pts: i64,
    in_samples: usize,
    in_rate: u32,
) {
    if state.audio.is_none() {
        state.audio = Some(allocate_audio_rings(ctx, in_samples, in_rate));
    }
    let audio = state
        .audio
        .as_mut()
        .unwrap_or_else(|| fatal("FFmpeg: audio rings missing"));

    let frame = audio.pool.peek_mut(0);
    let max_samples = samples_per_frame(in_samples, in_rate).min(audio.samples_per_frame);
    let produced = ctx
        .decoders
        .resample_audio_into(&mut frame.samples, max_samples)
        .unwrap_or_else(|err| fatal(err));

    frame.pts = pts;
    frame.num_samples = produced;

    move_one(&mut audio.queue, &mut audio.pool);
}

/// Size and allocate the audio rings from the first decoded frame.
///
/// The codec does not advertise its frame size up front, so this cannot
/// happen until the worker has a frame in hand.
fn allocate_audio_rings(ctx: &WorkerContext, in_samples: usize, in_rate: u32) -> AudioRings {
    let samples = samples_per_frame(in_samples, in_rate);
    let capacity =
        ((STREAM_BUFFER_TIME / 1000) as usize * in_rate as usize / samples.max(1)).max(1);
    let channels = ctx.decoders.audio_channels();

    debug!(
        target: "flicker",
        capacity,
        samples_per_frame = samples,
        channels,
        "audio buffer initialised"
    );

    let frames = (0..capacity)
        .map(|_| AudioFrame::new(samples, channels))
        .collect();
    AudioRings {
        queue: RingBuffer::with_capacity(capacity),
        pool: RingBuffer::full_from(frames),
        samples_per_frame: samples,
        channels,
    }
}

/// Drain both decoders after a seek and recycle every queued frame.
fn flush_decoding(ctx: &mut WorkerContext, state: &mut WorkerState) {
    debug!(target: "flicker", "flushing decoders");

    flush_stream(ctx, StreamKind::Video);
    move_all(&mut state.video_pool, &mut state.video_queue);

    if ctx.decoders.has_audio() {
        flush_stream(ctx, StreamKind::Audio);
        if let Some(audio) = state.audio.as_mut() {
            move_all(&mut audio.pool, &mut audio.queue);
        }
    }

    state.flushing = false;
}

fn flush_stream(ctx: &mut WorkerContext, kind: StreamKind) {
    if let Err(err) = ctx.decoders.send_flush(kind) {
        fatal(err);
    }
    loop {
        match receive(ctx, kind) {
            Received::VideoFrame { .. } | Received::AudioFrame { .. } => continue,
            Received::Eof => break,
            Received::Hungry => fatal("FFmpeg: cannot receive frame"),
        }
    }
    ctx.decoders.flush_buffers(kind);
}
