use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use flicker::Movie;
use flicker::clock::{Rational, SAMPLE_RATE, Timing};
use flicker::codec::scripted::{ScriptedAudio, ScriptedBackend, ScriptedMovie};
use flicker::lump::ResourceArchive;
use flicker::palette::{ColorLut, Palette};
use flicker::posted;

struct DemoArchive;

impl ResourceArchive for DemoArchive {
    fn lookup(&self, name: &str) -> Option<Vec<u8>> {
        (name == "Movies/DEMO").then(|| vec![0u8; 16])
    }
}

fn play(script: ScriptedMovie, use_posted: bool) -> Movie {
    Movie::play_with_backend(
        &ScriptedBackend::new(script),
        &DemoArchive,
        "DEMO",
        &Palette::grayscale(),
        use_posted,
    )
    .expect("scripted movie opens")
}

/// A 2 s, 25 fps movie: every frame lasts exactly 40 ms, so stepping the
/// position by 40 walks the movie frame by frame.
fn two_second_movie(audio: Option<ScriptedAudio>) -> ScriptedMovie {
    ScriptedMovie {
        width: 16,
        height: 12,
        fps: Rational::new(25, 1),
        frames: 50,
        keyframe_interval: 5,
        decode_delay: 0,
        audio,
        stray_packet_interval: None,
    }
}

fn mono_audio() -> ScriptedAudio {
    ScriptedAudio {
        sample_rate: SAMPLE_RATE,
        channels: 1,
        frame_samples: 1024,
        pts_jitter: 0,
    }
}

/// Pump `update` until `pred` holds or the timeout hits.
fn pump_until(movie: &mut Movie, mut pred: impl FnMut(&mut Movie) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        movie.update();
        assert_rings_conserved(movie);
        if pred(movie) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

fn assert_rings_conserved(movie: &Movie) {
    let stats = movie.buffer_stats();
    assert_eq!(
        stats.video.buffered + stats.video.queued + stats.video.pooled,
        stats.video.capacity,
        "video slots leaked"
    );
    if let Some(audio) = stats.audio {
        assert_eq!(
            audio.buffered + audio.queued + audio.pooled,
            audio.capacity,
            "audio slots leaked"
        );
    }
    assert_eq!(
        stats.packets.queued + stats.packets.pooled,
        stats.packets.capacity,
        "packet slots leaked"
    );
}

/// Frame index encoded in the top-left pixel of an RGBA frame.
fn rgba_level(movie: &mut Movie) -> Option<u8> {
    movie.image().map(|bytes| bytes[0])
}

#[test]
fn playback_delivers_every_frame_once_in_order() -> anyhow::Result<()> {
    let mut movie = play(two_second_movie(None), false);
    assert!(
        pump_until(&mut movie, |m| m.buffer_stats().video.buffered >= 50),
        "worker never filled the buffer"
    );

    let mut levels = Vec::new();
    for tick in 0..50i64 {
        movie.set_position(tick * 40);
        movie.update();
        assert_rings_conserved(&movie);
        if let Some(level) = rgba_level(&mut movie) {
            levels.push(level);
        }
        // A second query for the same position returns nothing new.
        assert_eq!(rgba_level(&mut movie), None);
    }

    let expected: Vec<u8> = (0..50).collect();
    assert_eq!(levels, expected);
    Ok(())
}

#[test]
fn posted_output_matches_rgba_through_the_palette() -> anyhow::Result<()> {
    let script = two_second_movie(None);
    let (width, height) = (script.width as usize, script.height as usize);

    let mut rgba_movie = play(script.clone(), false);
    let mut posted_movie = play(script, true);

    assert!(pump_until(&mut rgba_movie, |m| m.buffer_stats().video.buffered > 0));
    assert!(pump_until(&mut posted_movie, |m| m.buffer_stats().video.buffered > 0));

    let rgba = rgba_movie.image().expect("rgba frame").to_vec();
    let encoded = posted_movie.image().expect("posted frame").to_vec();
    assert_eq!(encoded.len(), posted_movie.patch_bytes());

    let lut = ColorLut::new(&Palette::grayscale());
    let decoded = posted::decode(&encoded, width, height);
    for y in 0..height {
        for x in 0..width {
            let p = (y * width + x) * 4;
            let direct = lut.nearest(rgba[p], rgba[p + 1], rgba[p + 2]) as u8;
            assert_eq!(decoded[y * width + x], direct, "pixel ({x},{y})");
        }
    }
    Ok(())
}

#[test]
fn seeking_lands_near_the_target() -> anyhow::Result<()> {
    // 20 s of video against a 4 s buffer, so a jump to 15 s cannot be
    // satisfied from buffered frames and must go through the demuxer.
    let mut movie = play(
        ScriptedMovie {
            frames: 500,
            keyframe_interval: 25,
            ..two_second_movie(None)
        },
        false,
    );

    movie.set_position(15_000);
    // Until the seek lands, older frames may still be delivered. Frame 375
    // sits exactly at 15 s and is a keyframe, so the seek stops there; its
    // pixel level (375 % 256) cannot come from any pre-seek frame.
    assert!(pump_until(&mut movie, |m| rgba_level(m) == Some(119)));

    // Playback continues normally from the landing point.
    movie.set_position(15_040);
    assert!(pump_until(&mut movie, |m| rgba_level(m) == Some(120)));
    Ok(())
}

#[test]
fn seek_to_zero_right_after_play_does_not_wedge() -> anyhow::Result<()> {
    let mut movie = play(two_second_movie(Some(mono_audio())), false);
    movie.seek(0);
    assert!(pump_until(&mut movie, |m| rgba_level(m) == Some(0)));
    Ok(())
}

#[test]
fn audio_clock_stays_locked_to_position() -> anyhow::Result<()> {
    let mut movie = play(
        two_second_movie(Some(ScriptedAudio {
            pts_jitter: 30,
            ..mono_audio()
        })),
        false,
    );
    // Buffer well past the 200 ms the ticks below will consume.
    assert!(
        pump_until(&mut movie, |m| m
            .buffer_stats()
            .audio
            .is_some_and(|audio| audio.buffered >= 32)),
        "audio never buffered"
    );

    // 10 ms of mono packed s16 per tick.
    let mut out = vec![0u8; 441 * 2];
    let mut position = 0i64;
    let mut expected_sample = 0i64;

    for _ in 0..20 {
        movie.copy_audio_samples(&mut out);

        for half in out.chunks_exact(2) {
            let value = i16::from_ne_bytes([half[0], half[1]]);
            assert_eq!(value, (expected_sample % 32_768) as i16);
            expected_sample += 1;
        }

        position += 10;
        movie.set_position(position);
        movie.update();
        assert_rings_conserved(&movie);

        let audio_position = movie.audio_position().expect("audio clock seated");
        assert!((Timing::samples_to_ms(audio_position) - position).abs() <= 1);
    }
    Ok(())
}

#[test]
fn audio_underrun_is_silent_but_still_advances() -> anyhow::Result<()> {
    let mut movie = play(two_second_movie(Some(mono_audio())), false);
    assert!(pump_until(&mut movie, |m| m.buffer_stats().audio.is_some()));

    // Ask for far more than 4 s of audio; the tail is untouched silence.
    let mut out = vec![0x55u8; SAMPLE_RATE as usize * 10 * 2];
    movie.copy_audio_samples(&mut out);
    assert_eq!(movie.audio_position(), Some(i64::from(SAMPLE_RATE) * 10));
    assert!(out[out.len() - 2..] == [0x55, 0x55]);
    Ok(())
}

#[test]
fn movie_without_audio_never_blocks() -> anyhow::Result<()> {
    let mut movie = play(two_second_movie(None), false);
    assert!(pump_until(&mut movie, |m| m.buffer_stats().video.buffered >= 50));

    assert!(movie.buffer_stats().audio.is_none());

    // Copying is a no-op: nothing buffered, cursor untouched.
    let mut out = vec![0u8; 64];
    let before = movie.audio_position();
    movie.copy_audio_samples(&mut out);
    assert_eq!(movie.audio_position(), before);
    Ok(())
}

#[test]
fn stray_packets_are_filtered_before_the_worker() -> anyhow::Result<()> {
    let mut movie = play(
        ScriptedMovie {
            stray_packet_interval: Some(3),
            ..two_second_movie(None)
        },
        false,
    );
    assert!(pump_until(&mut movie, |m| m.buffer_stats().video.buffered >= 50));
    Ok(())
}

#[test]
fn image_format_toggle_keeps_buffers_consistent() -> anyhow::Result<()> {
    // Long enough that plenty of the container is still undemuxed when the
    // format flips.
    let script = ScriptedMovie {
        frames: 250,
        keyframe_interval: 25,
        ..two_second_movie(Some(mono_audio()))
    };
    let (width, height) = (script.width as usize, script.height as usize);
    let mut movie = play(script, false);

    assert!(pump_until(&mut movie, |m| rgba_level(m).is_some()));

    movie.set_image_format(true);
    assert!(movie.uses_posted());
    assert_rings_conserved(&movie);

    // Decoding resumes and produces posted frames for the same position.
    let mut encoded = None;
    assert!(pump_until(&mut movie, |m| {
        if let Some(bytes) = m.image() {
            encoded = Some(bytes.to_vec());
            return true;
        }
        false
    }));
    let encoded = encoded.unwrap();
    assert_eq!(encoded.len(), movie.patch_bytes());
    posted::decode(&encoded, width, height);

    // And back again.
    movie.set_image_format(false);
    assert!(pump_until(&mut movie, |m| m.image().is_some()));
    Ok(())
}

#[test]
fn eviction_keeps_the_window_bounded_on_long_movies() -> anyhow::Result<()> {
    let mut movie = play(
        ScriptedMovie {
            frames: 250, // 10 s
            keyframe_interval: 25,
            ..two_second_movie(None)
        },
        false,
    );

    let mut position = 0i64;
    while position < 9000 {
        movie.set_position(position);
        movie.update();
        assert_rings_conserved(&movie);
        rgba_level(&mut movie);
        position += 40;
        std::thread::sleep(Duration::from_millis(1));
    }

    // The buffer spans at most the retention window, not the whole movie.
    let stats = movie.buffer_stats();
    assert!(stats.video.buffered <= stats.video.capacity);

    // Late frames still decode and deliver after the early ones left.
    movie.set_position(9000);
    assert!(pump_until(&mut movie, |m| rgba_level(m) == Some(225)));
    Ok(())
}

#[test]
fn stop_runs_the_hook_and_joins_the_worker() -> anyhow::Result<()> {
    let stopped = Arc::new(AtomicBool::new(false));

    let mut movie = play(two_second_movie(Some(mono_audio())), false);
    let flag = Arc::clone(&stopped);
    movie.set_stop_hook(move || flag.store(true, Ordering::SeqCst));

    assert!(pump_until(&mut movie, |m| m.buffer_stats().video.buffered > 0));
    movie.stop();

    assert!(stopped.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn duration_and_dimensions_come_from_the_container() -> anyhow::Result<()> {
    let movie = play(two_second_movie(None), false);
    assert_eq!(movie.duration_ms(), 2000);
    assert_eq!(movie.dimensions(), (16, 12));
    assert_eq!(movie.patch_bytes(), posted::posted_size(16, 12));
    Ok(())
}
