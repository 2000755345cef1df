//! The movie handle and its per-tick consumer API.
//!
//! The game loop owns a [`Movie`] and calls [`Movie::update`] once per tick;
//! everything else (drawing, audio mixing, scrubbing) reads out of the
//! consumer-side frame buffers `update` maintains. The decode worker runs
//! behind the shared mutex and is woken whenever `update` queues packets or
//! frees pool slots.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::clock::Timing;
use crate::codec::{
    AudioStreamInfo, CodecBackend, Demuxer, ReadStatus, VideoStreamInfo,
};
use crate::error::{Result, fatal};
use crate::frame::{AudioFrame, VideoFrame};
use crate::lump::{LumpSource, ResourceArchive, cache_movie_lump};
use crate::palette::{ColorLut, Palette};
use crate::posted;
use crate::ring::{RingBuffer, move_all, move_one};
use crate::worker::{self, WorkerContext, WorkerShared, WorkerState};

/// Span of the frame retention window, in milliseconds. The consumer keeps
/// frames within half this distance of the playback position.
pub(crate) const STREAM_BUFFER_TIME: i64 = 4000;

/// Capacity of the demuxed packet queue.
const NUM_PACKETS: usize = 32;

/// Audio drift tolerated before the sample clock is reseated (ms).
const MAX_AUDIO_DESYNC: i64 = 200;

/// A pending seek further than this behind the target is considered failed
/// and abandoned (ms).
const MAX_SEEK_DISTANCE: i64 = 10_000;

/// How far past the position a pending seek must decode before it counts as
/// landed (ms).
const SEEK_TARGET_LEAD: i64 = 250;

/// Lower bound of the widened demuxer seek window (ms before the target).
const SEEK_REWIND: i64 = 5000;

/// Slot occupancy of one ring set. `buffered + queued + pooled` always
/// equals `capacity` once the rings exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub buffered: usize,
    pub queued: usize,
    pub pooled: usize,
    pub capacity: usize,
}

/// Occupancy snapshot across all of a movie's rings.
#[derive(Debug, Clone, Copy)]
pub struct MovieStats {
    pub video: BufferStats,
    /// Absent until the first audio frame has been decoded.
    pub audio: Option<BufferStats>,
    pub packets: BufferStats,
}

/// A playing movie.
///
/// Dropping the handle stops the worker and releases every buffer; calling
/// [`Movie::stop`] does the same a tick earlier and reads better at call
/// sites.
pub struct Movie {
    demuxer: Box<dyn Demuxer>,
    shared: Arc<WorkerShared>,
    worker: Option<JoinHandle<WorkerContext>>,

    timing: Timing,
    video_info: VideoStreamInfo,
    audio_info: Option<AudioStreamInfo>,
    /// Container duration, in container time base.
    duration: i64,

    video_buffer: RingBuffer<VideoFrame>,
    audio_buffer: Option<RingBuffer<AudioFrame>>,

    /// Playback position in ms, driven by the caller.
    position: i64,
    /// Output-sample read cursor; `None` while waiting to be reseated.
    audio_position: Option<i64>,
    use_posted: bool,
    last_frame_id: Option<u64>,
    seeking: bool,

    stop_hook: Option<Box<dyn FnOnce() + Send>>,
}

/// Open and start decoding a movie through the FFmpeg backend.
///
/// Fatal conditions (absent lump, unsupported container) surface as errors
/// here; once playback is running, codec failures abort.
#[cfg(feature = "ffmpeg")]
pub fn play(
    archive: &dyn ResourceArchive,
    name: &str,
    palette: &Palette,
    use_posted: bool,
) -> Result<Movie> {
    Movie::play_with_backend(
        &crate::codec::ffmpeg::FfmpegBackend,
        archive,
        name,
        palette,
        use_posted,
    )
}

impl Movie {
    /// Open and start decoding a movie through a specific codec backend.
    pub fn play_with_backend(
        backend: &dyn CodecBackend,
        archive: &dyn ResourceArchive,
        name: &str,
        palette: &Palette,
        use_posted: bool,
    ) -> Result<Self> {
        let lump = cache_movie_lump(archive, name)?;
        let opened = backend.open(LumpSource::new(lump))?;
        let demuxer = opened.demuxer;

        let video_info = demuxer.video();
        let audio_info = demuxer.audio();
        let timing = Timing::new(
            video_info.time_base,
            audio_info.map(|info| info.time_base),
        );
        let duration = demuxer.duration();

        // Size the video rings to span the retention window at the stream's
        // average frame rate.
        let fps = video_info.frame_rate;
        let capacity = ((STREAM_BUFFER_TIME / 1000) * i64::from(fps.num) / i64::from(fps.den))
            .max(1) as usize;
        let frames = (0..capacity)
            .map(|_| VideoFrame::new(video_info.width, video_info.height, use_posted))
            .collect();

        let packets = (0..NUM_PACKETS).map(|_| demuxer.new_packet()).collect();

        let shared = Arc::new(WorkerShared {
            state: parking_lot::Mutex::new(WorkerState {
                video_queue: RingBuffer::with_capacity(capacity),
                video_pool: RingBuffer::full_from(frames),
                audio: None,
                packet_queue: RingBuffer::with_capacity(NUM_PACKETS),
                packet_pool: RingBuffer::full_from(packets),
                stopping: false,
                flushing: false,
                next_frame_id: 0,
            }),
            cond: parking_lot::Condvar::new(),
        });

        let context = WorkerContext {
            decoders: opened.decoders,
            lut: Arc::new(ColorLut::new(palette)),
            use_posted,
            staging: use_posted
                .then(|| crate::frame::RgbaImage::new(video_info.width, video_info.height)),
            width: video_info.width,
            height: video_info.height,
        };
        let handle = worker::spawn(Arc::clone(&shared), context);

        debug!(
            target: "flicker",
            name,
            width = video_info.width,
            height = video_info.height,
            has_audio = audio_info.is_some(),
            use_posted,
            "movie started"
        );

        Ok(Self {
            demuxer,
            shared,
            worker: Some(handle),
            timing,
            video_info,
            audio_info,
            duration,
            video_buffer: RingBuffer::with_capacity(capacity),
            audio_buffer: None,
            position: 0,
            audio_position: Some(0),
            use_posted,
            last_frame_id: None,
            seeking: false,
            stop_hook: None,
        })
    }

    /// Register a hook run once during shutdown (the original pipeline used
    /// this to silence movie-mode music).
    pub fn set_stop_hook(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.stop_hook = Some(Box::new(hook));
    }

    /// Per-tick pump: feed the demuxer, collect decoded frames, steer
    /// seeking, and evict frames that left the retention window.
    pub fn update(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();

        while !state.packet_pool.is_empty() {
            if !self.read_packet(&mut state) {
                break;
            }
        }

        if !state.flushing {
            self.poll_video_queue(&mut state);
            self.poll_audio_queue(&mut state);
        }

        self.update_seeking(&mut state);

        if !self.video_buffer.is_empty() {
            self.clear_old_video_frames(&mut state);
            self.clear_old_audio_frames(&mut state);
        }
    }

    /// Set the playback position, reseating the audio clock if it was
    /// knocked loose by drift.
    pub fn set_position(&mut self, ms: i64) {
        self.position = ms;
        if self.audio_position.is_none() {
            self.audio_position = Some(Timing::ms_to_samples(ms));
        }
    }

    /// Synonym of [`Movie::set_position`], kept for engine call sites that
    /// phrase scrubbing as an explicit seek.
    pub fn seek(&mut self, ms: i64) {
        self.set_position(ms);
    }

    /// Latest frame at or before the playback position, or `None` if the
    /// caller already drew it (or nothing is buffered yet).
    pub fn image(&mut self) -> Option<&[u8]> {
        let target = self.timing.ms_to_video_pts(self.position);

        let index = (0..self.video_buffer.len())
            .rev()
            .find(|&i| self.video_buffer.peek(i).pts <= target)?;
        let frame = self.video_buffer.peek(index);

        if self.last_frame_id == Some(frame.id) {
            return None;
        }
        self.last_frame_id = Some(frame.id);
        Some(frame.image.bytes())
    }

    /// Copy mixer samples starting at the audio read cursor.
    ///
    /// Always advances the cursor by the full request so an underrun stays
    /// silent instead of slowing playback down. No-op while the cursor is
    /// unseated or the movie has no audio stream.
    pub fn copy_audio_samples(&mut self, out: &mut [u8]) {
        let Some(info) = self.audio_info else { return };
        let Some(start) = self.audio_position else { return };

        // Packed signed-16: one sample spans every channel.
        let sample_size = size_of::<i16>() * usize::from(info.channels);
        let num_samples = (out.len() / sample_size) as i64;
        let end = start + num_samples;

        if let Some(buffer) = self.audio_buffer.as_ref() {
            let channels = usize::from(info.channels);
            let mut cursor = start;

            for i in 0..buffer.len() {
                let frame = buffer.peek(i);
                if frame.end_sample() <= cursor {
                    continue;
                }
                if frame.first_sample_position > cursor {
                    break; // cursor not buffered; leave the rest silent
                }

                let local = (cursor - frame.first_sample_position) as usize;
                let n = (frame.end_sample().min(end) - cursor) as usize;
                let src = &frame.samples[local * channels..(local + n) * channels];
                let at = (cursor - start) as usize * sample_size;
                for (bytes, sample) in out[at..at + n * sample_size]
                    .chunks_exact_mut(2)
                    .zip(src)
                {
                    bytes.copy_from_slice(&sample.to_ne_bytes());
                }

                cursor += n as i64;
                if cursor >= end {
                    break;
                }
            }
        }

        self.audio_position = Some(end);
    }

    /// Switch between RGBA and posted output.
    ///
    /// Expensive: stops the worker, reallocates every pooled image and
    /// starts decoding again at the current position.
    pub fn set_image_format(&mut self, use_posted: bool) {
        if use_posted == self.use_posted {
            return;
        }
        debug!(target: "flicker", use_posted, "switching image format");

        let mut context = self.stop_worker();
        {
            let shared = Arc::clone(&self.shared);
            let mut state = shared.state.lock();

            move_all(&mut state.video_pool, &mut self.video_buffer);
            let WorkerState {
                video_pool,
                video_queue,
                ..
            } = &mut *state;
            move_all(video_pool, video_queue);
            if let (Some(audio), Some(buffer)) =
                (state.audio.as_mut(), self.audio_buffer.as_mut())
            {
                move_all(&mut audio.pool, buffer);
            }

            context.reallocate_images(&mut state.video_pool, use_posted);
        }

        self.use_posted = use_posted;
        self.worker = Some(worker::spawn(Arc::clone(&self.shared), context));
    }

    /// Stop playback and release everything. Equivalent to dropping the
    /// handle.
    pub fn stop(self) {}

    /// Whole-movie duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        Timing::container_to_ms(self.duration)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.video_info.width, self.video_info.height)
    }

    /// Size in bytes of a posted image for this movie's dimensions.
    pub fn patch_bytes(&self) -> usize {
        posted::posted_size(self.video_info.width as usize, self.video_info.height as usize)
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// Current output-sample read cursor, if seated.
    pub fn audio_position(&self) -> Option<i64> {
        self.audio_position
    }

    pub fn uses_posted(&self) -> bool {
        self.use_posted
    }

    /// Ring occupancy snapshot, for diagnostics and invariant checks.
    pub fn buffer_stats(&self) -> MovieStats {
        let state = self.shared.state.lock();
        MovieStats {
            video: BufferStats {
                buffered: self.video_buffer.len(),
                queued: state.video_queue.len(),
                pooled: state.video_pool.len(),
                capacity: self.video_buffer.capacity(),
            },
            audio: state.audio.as_ref().map(|audio| BufferStats {
                buffered: self.audio_buffer.as_ref().map_or(0, RingBuffer::len),
                queued: audio.queue.len(),
                pooled: audio.pool.len(),
                capacity: audio.queue.capacity(),
            }),
            packets: BufferStats {
                buffered: 0,
                queued: state.packet_queue.len(),
                pooled: state.packet_pool.len(),
                capacity: NUM_PACKETS,
            },
        }
    }

    // Read one packet from the demuxer into the pool head. Packets for the
    // decoded streams move to the worker queue; anything else stays in the
    // pool for the next read to reuse. Returns false at container EOF.
    fn read_packet(&mut self, state: &mut WorkerState) -> bool {
        let status = self.demuxer.read_packet(state.packet_pool.peek_mut(0));
        match status {
            Ok(ReadStatus::Eof) => false,
            Ok(ReadStatus::Packet) => {
                if state.packet_pool.peek(0).stream().is_some() {
                    move_one(&mut state.packet_queue, &mut state.packet_pool);
                    self.shared.wake();
                }
                true
            }
            Err(err) => fatal(err),
        }
    }

    fn poll_video_queue(&mut self, state: &mut WorkerState) {
        if state.video_queue.is_empty() {
            return;
        }
        move_all(&mut self.video_buffer, &mut state.video_queue);
        self.shared.wake();
    }

    // Drain completed audio frames, assigning each its absolute sample
    // position. Chaining from the previous frame keeps the sample clock
    // monotone even when the container reports jittery PTS.
    fn poll_audio_queue(&mut self, state: &mut WorkerState) {
        let Some(audio) = state.audio.as_mut() else {
            return;
        };
        if self.audio_buffer.is_none() {
            self.audio_buffer = Some(RingBuffer::with_capacity(audio.queue.capacity()));
        }
        if audio.queue.is_empty() {
            return;
        }

        let buffer = self
            .audio_buffer
            .as_mut()
            .unwrap_or_else(|| fatal("FFmpeg: audio buffer missing"));
        while !audio.queue.is_empty() {
            move_one(buffer, &mut audio.queue);
            let last = buffer.len() - 1;
            if last > 0 {
                let prev_end = buffer.peek(last - 1).end_sample();
                buffer.peek_mut(last).first_sample_position = prev_end;
            } else {
                let frame = buffer.peek_mut(0);
                frame.first_sample_position = self.timing.audio_pts_to_samples(frame.pts);
            }
        }
        self.shared.wake();
    }

    fn update_seeking(&mut self, state: &mut WorkerState) {
        if self.seeking {
            if let Some(last) = self.video_buffer.back() {
                let target = self.position + SEEK_TARGET_LEAD;
                let distance = target - self.timing.video_pts_to_ms(last.end_pts());
                // Landed, or overshot so far the seek failed outright.
                if distance <= 0 || distance > MAX_SEEK_DISTANCE {
                    self.seeking = false;
                }
            }
        }

        let in_buffer = self.pts_in_video_buffer(self.timing.ms_to_video_pts(self.position));
        if !(in_buffer || self.seeking || state.flushing || self.video_buffer.is_empty()) {
            self.start_seek(state);
        }

        if let Some(samples) = self.audio_position {
            let desync = (Timing::samples_to_ms(samples) - self.position).abs();
            if desync > MAX_AUDIO_DESYNC {
                self.audio_position = None;
            }
        }
    }

    fn pts_in_video_buffer(&self, pts: i64) -> bool {
        match (self.video_buffer.front(), self.video_buffer.back()) {
            (Some(first), Some(last)) => first.pts <= pts && pts < last.end_pts(),
            _ => false,
        }
    }

    // Out-of-buffer position: recycle everything, reposition the demuxer
    // with a widened window, and tell the worker to flush its decoders.
    fn start_seek(&mut self, state: &mut WorkerState) {
        debug!(target: "flicker", position = self.position, "seeking");
        self.seeking = true;

        move_all(&mut state.video_pool, &mut self.video_buffer);
        if let (Some(audio), Some(buffer)) = (state.audio.as_mut(), self.audio_buffer.as_mut()) {
            move_all(&mut audio.pool, buffer);
        }

        let target = self.timing.ms_to_video_pts(self.position);
        let min = self.timing.ms_to_video_pts((self.position - SEEK_REWIND).max(0));
        if let Err(err) = self.demuxer.seek(min, target, target) {
            fatal(err);
        }

        state.flushing = true;
        move_all(&mut state.packet_pool, &mut state.packet_queue);
        self.shared.wake();
    }

    fn clear_old_video_frames(&mut self, state: &mut WorkerState) {
        let limit = self
            .timing
            .ms_to_video_pts(self.position - STREAM_BUFFER_TIME / 2);
        while self
            .video_buffer
            .front()
            .is_some_and(|frame| frame.pts < limit)
        {
            move_one(&mut state.video_pool, &mut self.video_buffer);
            self.shared.wake();
        }
    }

    fn clear_old_audio_frames(&mut self, state: &mut WorkerState) {
        let Some(audio) = state.audio.as_mut() else {
            return;
        };
        let Some(buffer) = self.audio_buffer.as_mut() else {
            return;
        };

        let limit = self
            .timing
            .ms_to_audio_pts(self.position - STREAM_BUFFER_TIME / 2)
            .max(0);
        loop {
            let evict = match buffer.front() {
                Some(frame) => {
                    let end_pts = frame.pts
                        + self.timing.samples_to_audio_pts(frame.num_samples as i64);
                    end_pts < limit
                }
                None => false,
            };
            if !evict {
                break;
            }
            move_one(&mut audio.pool, buffer);
            self.shared.wake();
        }
    }

    fn stop_worker(&mut self) -> WorkerContext {
        let handle = match self.worker.take() {
            Some(handle) => handle,
            None => fatal("FFmpeg: decode worker already stopped"),
        };
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
        }
        self.shared.wake();
        handle
            .join()
            .unwrap_or_else(|_| fatal("FFmpeg: decode worker panicked"))
    }

    fn shutdown(&mut self) {
        if self.worker.is_some() {
            let context = self.stop_worker();
            drop(context);
            debug!(target: "flicker", "movie stopped");
        }
        if let Some(hook) = self.stop_hook.take() {
            hook();
        }
    }
}

impl Drop for Movie {
    fn drop(&mut self) {
        self.shutdown();
    }
}
