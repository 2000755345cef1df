//! FFmpeg-backed implementation of the codec facade.
//!
//! Demuxing reads straight out of the cached lump through a custom AVIO
//! context; decoding, scaling and resampling go through the `ffmpeg-next`
//! safe wrappers, dropping to `ffmpeg-sys-next` only where the wrappers
//! have no equivalent (custom I/O, stream-bound seeking, direct-slice
//! scale/resample targets).

use std::ffi::{c_int, c_void};
use std::ptr;

use ffmpeg_next as ffm;
use ffmpeg_sys_next as sys;

use crate::clock::{Rational, SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::frame::RgbaImage;
use crate::lump::{LumpSource, Whence};

use super::{
    AudioStreamInfo, CodecBackend, Demuxer, OpenedMovie, Packet, ReadStatus, Received,
    StreamDecoders, StreamKind, VideoStreamInfo,
};

const IO_BUFFER_SIZE: usize = 8 * 1024;

/// Movie decoding through FFmpeg.
pub struct FfmpegBackend;

impl CodecBackend for FfmpegBackend {
    fn open(&self, lump: LumpSource) -> Result<OpenedMovie> {
        ffm::init().map_err(|err| Error::codec(format!("cannot initialise FFmpeg: {err}")))?;

        let demuxer = FfmpegDemuxer::open(lump)?;
        let decoders = FfmpegDecoders::open(&demuxer)?;

        Ok(OpenedMovie {
            demuxer: Box::new(demuxer),
            decoders: Box::new(decoders),
        })
    }
}

// A pooled AVPacket handle. FFmpeg reuses the packet's internal buffer
// across reads, so the pool stays allocation-free after warmup.
struct AvPacket(ffm::Packet);

unsafe impl Send for AvPacket {}

unsafe extern "C" fn read_cb(opaque: *mut c_void, buf: *mut u8, len: c_int) -> c_int {
    let lump = unsafe { &mut *(opaque as *mut LumpSource) };
    let slice = unsafe { std::slice::from_raw_parts_mut(buf, len.max(0) as usize) };
    let n = lump.read(slice);
    if n == 0 { sys::AVERROR_EOF } else { n as c_int }
}

unsafe extern "C" fn seek_cb(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let lump = unsafe { &mut *(opaque as *mut LumpSource) };
    let mode = whence & !sys::AVSEEK_FORCE;
    if mode == sys::AVSEEK_SIZE {
        return lump.seek(0, Whence::Size);
    }
    let whence = match mode {
        0 => Whence::Set,
        1 => Whence::Cur,
        2 => Whence::End,
        _ => return -1,
    };
    lump.seek(offset, whence)
}

struct FfmpegDemuxer {
    input: Option<ffm::format::context::Input>,
    avio: *mut sys::AVIOContext,
    lump: *mut LumpSource,
    video_index: usize,
    audio_index: Option<usize>,
    video_info: VideoStreamInfo,
    audio_info: Option<AudioStreamInfo>,
    video_parameters: ffm::codec::Parameters,
    audio_parameters: Option<ffm::codec::Parameters>,
}

// All raw pointers are exclusively owned by this demuxer.
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    fn open(lump: LumpSource) -> Result<Self> {
        let lump = Box::into_raw(Box::new(lump));

        let (input, avio) = unsafe {
            let buffer = sys::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(lump));
                return Err(Error::codec("cannot allocate stream buffer"));
            }

            let avio = sys::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                0,
                lump as *mut c_void,
                Some(read_cb),
                None,
                Some(seek_cb),
            );
            if avio.is_null() {
                sys::av_free(buffer as *mut c_void);
                drop(Box::from_raw(lump));
                return Err(Error::codec("cannot allocate I/O context"));
            }

            let mut ctx = sys::avformat_alloc_context();
            if ctx.is_null() {
                free_avio(avio);
                drop(Box::from_raw(lump));
                return Err(Error::codec("cannot allocate format context"));
            }
            (*ctx).pb = avio;

            if sys::avformat_open_input(
                &mut ctx,
                ptr::null(),
                ptr::null(),
                ptr::null_mut(),
            ) != 0
            {
                // avformat_open_input frees the context on failure.
                free_avio(avio);
                drop(Box::from_raw(lump));
                return Err(Error::codec("cannot open format context"));
            }

            if sys::avformat_find_stream_info(ctx, ptr::null_mut()) < 0 {
                sys::avformat_close_input(&mut ctx);
                free_avio(avio);
                drop(Box::from_raw(lump));
                return Err(Error::codec("cannot find stream information"));
            }

            (ffm::format::context::Input::wrap(ctx), avio)
        };

        // From here on any error path drops `demuxer`, which releases the
        // container, the AVIO context and the lump in order.
        let mut demuxer = Self::bare(input, avio, lump);

        let (video, audio) = {
            let input = demuxer.input_ref();
            let video = input.streams().best(ffm::media::Type::Video).map(|s| {
                (
                    s.index(),
                    s.parameters(),
                    rational(s.time_base()),
                    rational(s.avg_frame_rate()),
                )
            });
            let audio = input
                .streams()
                .best(ffm::media::Type::Audio)
                .map(|s| (s.index(), s.parameters(), rational(s.time_base())));
            (video, audio)
        };

        let Some((video_index, video_parameters, video_time_base, frame_rate)) = video else {
            return Err(Error::codec("cannot find video stream"));
        };
        let (width, height) = video_dimensions(&video_parameters)?;

        demuxer.video_index = video_index;
        demuxer.video_info = VideoStreamInfo {
            time_base: video_time_base,
            width,
            height,
            frame_rate,
        };
        demuxer.video_parameters = video_parameters;

        if let Some((audio_index, audio_parameters, audio_time_base)) = audio {
            let decoder = ffm::codec::Context::from_parameters(audio_parameters.clone())
                .and_then(|ctx| ctx.decoder().audio())
                .map_err(|err| Error::codec(format!("cannot open codec: {err}")))?;
            demuxer.audio_index = Some(audio_index);
            demuxer.audio_info = Some(AudioStreamInfo {
                time_base: audio_time_base,
                sample_rate: decoder.rate(),
                channels: decoder.channels() as u16,
            });
            demuxer.audio_parameters = Some(audio_parameters);
        }

        Ok(demuxer)
    }

    fn bare(
        input: ffm::format::context::Input,
        avio: *mut sys::AVIOContext,
        lump: *mut LumpSource,
    ) -> Self {
        Self {
            input: Some(input),
            avio,
            lump,
            video_index: 0,
            audio_index: None,
            video_info: VideoStreamInfo {
                time_base: Rational::new(1, 1000),
                width: 0,
                height: 0,
                frame_rate: Rational::new(30, 1),
            },
            audio_info: None,
            video_parameters: ffm::codec::Parameters::new(),
            audio_parameters: None,
        }
    }

    fn input_ref(&self) -> &ffm::format::context::Input {
        match self.input.as_ref() {
            Some(input) => input,
            None => crate::error::fatal("FFmpeg: demuxer already closed"),
        }
    }

    fn input_mut(&mut self) -> &mut ffm::format::context::Input {
        match self.input.as_mut() {
            Some(input) => input,
            None => crate::error::fatal("FFmpeg: demuxer already closed"),
        }
    }

    fn kind_for(&self, index: usize) -> Option<StreamKind> {
        if index == self.video_index {
            Some(StreamKind::Video)
        } else if Some(index) == self.audio_index {
            Some(StreamKind::Audio)
        } else {
            None
        }
    }

    fn close(&mut self) {
        // Close the container first; the custom AVIO context and lump are
        // ours to free afterwards.
        self.input = None;
        unsafe {
            if !self.avio.is_null() {
                free_avio(self.avio);
                self.avio = ptr::null_mut();
            }
            if !self.lump.is_null() {
                drop(Box::from_raw(self.lump));
                self.lump = ptr::null_mut();
            }
        }
    }
}

impl Drop for FfmpegDemuxer {
    fn drop(&mut self) {
        self.close();
    }
}

unsafe fn free_avio(avio: *mut sys::AVIOContext) {
    unsafe {
        let mut avio = avio;
        sys::av_freep(ptr::addr_of_mut!((*avio).buffer) as *mut c_void);
        sys::avio_context_free(&mut avio);
    }
}

fn rational(r: ffm::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn video_dimensions(parameters: &ffm::codec::Parameters) -> Result<(u32, u32)> {
    let decoder = ffm::codec::Context::from_parameters(parameters.clone())
        .and_then(|ctx| ctx.decoder().video())
        .map_err(|err| Error::codec(format!("cannot open codec: {err}")))?;
    Ok((decoder.width(), decoder.height()))
}

impl Demuxer for FfmpegDemuxer {
    fn video(&self) -> VideoStreamInfo {
        self.video_info
    }

    fn audio(&self) -> Option<AudioStreamInfo> {
        self.audio_info
    }

    fn duration(&self) -> i64 {
        self.input.as_ref().map_or(0, |input| input.duration())
    }

    fn new_packet(&self) -> Packet {
        Packet::new(Box::new(AvPacket(ffm::Packet::empty())))
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<ReadStatus> {
        let stream_index = {
            let slot = downcast(packet)?;
            match {
                let input = self.input_mut();
                slot.0.read(input)
            } {
                Ok(()) => slot.0.stream(),
                Err(ffm::Error::Eof) => return Ok(ReadStatus::Eof),
                Err(err) => return Err(Error::codec(format!("cannot read packet: {err}"))),
            }
        };

        let kind = self.kind_for(stream_index);
        if kind.is_none() {
            // Not ours; release the payload and leave the slot pooled.
            let slot = downcast(packet)?;
            unsafe { sys::av_packet_unref(slot.0.as_mut_ptr()) };
        }
        packet.set_stream(kind);
        Ok(ReadStatus::Packet)
    }

    fn seek(&mut self, min_pts: i64, target_pts: i64, max_pts: i64) -> Result<()> {
        let video_index = self.video_index as c_int;
        let input = self.input_mut();
        let ret = unsafe {
            sys::avformat_seek_file(
                input.as_mut_ptr(),
                video_index,
                min_pts,
                target_pts,
                max_pts,
                0,
            )
        };
        if ret < 0 {
            return Err(Error::codec("cannot seek"));
        }
        Ok(())
    }
}

fn downcast(packet: &mut Packet) -> Result<&mut AvPacket> {
    packet
        .downcast_mut::<AvPacket>()
        .ok_or_else(|| Error::codec("foreign packet in FFmpeg backend"))
}

struct FfmpegDecoders {
    video: ffm::decoder::Video,
    audio: Option<ffm::decoder::Audio>,
    scaler: ffm::software::scaling::Context,
    resampler: Option<ffm::software::resampling::Context>,
    video_frame: ffm::frame::Video,
    audio_frame: ffm::frame::Audio,
    channels: u16,
}

// The scaling context carries a raw pointer without Send; ownership is
// exclusive to the worker thread.
unsafe impl Send for FfmpegDecoders {}

impl FfmpegDecoders {
    fn open(demuxer: &FfmpegDemuxer) -> Result<Self> {
        let video = ffm::codec::Context::from_parameters(demuxer.video_parameters.clone())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|err| Error::codec(format!("cannot open codec: {err}")))?;

        let scaler = ffm::software::scaling::Context::get(
            video.format(),
            video.width(),
            video.height(),
            ffm::format::Pixel::RGBA,
            video.width(),
            video.height(),
            ffm::software::scaling::Flags::BILINEAR,
        )
        .map_err(|err| Error::codec(format!("cannot create scaling context: {err}")))?;

        let (audio, resampler, channels) = match &demuxer.audio_parameters {
            Some(parameters) => {
                let audio = ffm::codec::Context::from_parameters(parameters.clone())
                    .and_then(|ctx| ctx.decoder().audio())
                    .map_err(|err| Error::codec(format!("cannot open codec: {err}")))?;
                let resampler = ffm::software::resampling::Context::get(
                    audio.format(),
                    audio.channel_layout(),
                    audio.rate(),
                    ffm::format::Sample::I16(ffm::format::sample::Type::Packed),
                    audio.channel_layout(),
                    SAMPLE_RATE,
                )
                .map_err(|err| {
                    Error::codec(format!("cannot allocate resampling context: {err}"))
                })?;
                let channels = audio.channels() as u16;
                (Some(audio), Some(resampler), channels)
            }
            None => (None, None, 0),
        };

        Ok(Self {
            video,
            audio,
            scaler,
            resampler,
            video_frame: ffm::frame::Video::empty(),
            audio_frame: ffm::frame::Audio::empty(),
            channels,
        })
    }

    fn audio_decoder(&mut self) -> Result<&mut ffm::decoder::Audio> {
        self.audio
            .as_mut()
            .ok_or_else(|| Error::codec("no audio stream"))
    }
}

fn map_receive(err: ffm::Error) -> Result<Received> {
    match err {
        ffm::Error::Eof => Ok(Received::Eof),
        ffm::Error::Other {
            errno: ffm::util::error::EAGAIN,
        } => Ok(Received::Hungry),
        err => Err(Error::codec(format!("cannot receive frame: {err}"))),
    }
}

impl StreamDecoders for FfmpegDecoders {
    fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    fn audio_channels(&self) -> u16 {
        self.channels
    }

    fn send_packet(&mut self, kind: StreamKind, packet: &mut Packet) -> Result<()> {
        let result = {
            let slot = downcast(packet)?;
            let result = match kind {
                StreamKind::Video => self.video.send_packet(&slot.0),
                StreamKind::Audio => self.audio_decoder()?.send_packet(&slot.0),
            };
            unsafe { sys::av_packet_unref(slot.0.as_mut_ptr()) };
            result
        };
        packet.set_stream(None);
        result.map_err(|err| Error::codec(format!("cannot send packet to the decoder: {err}")))
    }

    fn send_flush(&mut self, kind: StreamKind) -> Result<()> {
        let result = match kind {
            StreamKind::Video => self.video.send_eof(),
            StreamKind::Audio => self.audio_decoder()?.send_eof(),
        };
        result.map_err(|err| Error::codec(format!("cannot flush decoder: {err}")))
    }

    fn receive_frame(&mut self, kind: StreamKind) -> Result<Received> {
        match kind {
            StreamKind::Video => {
                match self.video.receive_frame(&mut self.video_frame) {
                    Ok(()) => Ok(Received::VideoFrame {
                        pts: self.video_frame.pts().unwrap_or(0),
                        duration: unsafe { (*self.video_frame.as_ptr()).duration },
                    }),
                    Err(err) => map_receive(err),
                }
            }
            StreamKind::Audio => {
                let audio = self
                    .audio
                    .as_mut()
                    .ok_or_else(|| Error::codec("no audio stream"))?;
                match audio.receive_frame(&mut self.audio_frame) {
                    Ok(()) => Ok(Received::AudioFrame {
                        pts: self.audio_frame.pts().unwrap_or(0),
                        samples: self.audio_frame.samples(),
                        sample_rate: self.audio_frame.rate(),
                    }),
                    Err(err) => map_receive(err),
                }
            }
        }
    }

    fn flush_buffers(&mut self, kind: StreamKind) {
        match kind {
            StreamKind::Video => self.video.flush(),
            StreamKind::Audio => {
                if let Some(audio) = self.audio.as_mut() {
                    audio.flush();
                }
            }
        }
    }

    fn scale_video_into(&mut self, dst: &mut RgbaImage) -> Result<()> {
        let height = unsafe { (*self.video_frame.as_ptr()).height };
        let dst_data: [*mut u8; 4] = [
            dst.data.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
        ];
        let dst_linesize: [c_int; 4] = [dst.stride as c_int, 0, 0, 0];

        let ret = unsafe {
            let src = self.video_frame.as_ptr();
            sys::sws_scale(
                self.scaler.as_mut_ptr(),
                (*src).data.as_ptr() as *const *const u8,
                (*src).linesize.as_ptr(),
                0,
                height,
                dst_data.as_ptr(),
                dst_linesize.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(Error::codec("cannot scale video frame"));
        }
        Ok(())
    }

    fn resample_audio_into(&mut self, dst: &mut [i16], max_samples: usize) -> Result<usize> {
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| Error::codec("no resampling context"))?;

        let produced = unsafe {
            let src = self.audio_frame.as_ptr();
            let mut out = dst.as_mut_ptr() as *mut u8;
            sys::swr_convert(
                resampler.as_mut_ptr(),
                &mut out,
                max_samples as c_int,
                (*src).extended_data as *const *const u8,
                (*src).nb_samples,
            )
        };
        if produced < 0 {
            return Err(Error::codec("cannot convert audio frame"));
        }
        Ok(produced as usize)
    }
}
