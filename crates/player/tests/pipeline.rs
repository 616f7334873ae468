// End-to-end playback through the real decoder, with a clocked null device

use spool_player::{
    AudioError, AudioPlayer, AudioSpec, CacheStore, NullRenderer, Player, PlayerConfig,
    PlayerState, TrackSource,
};
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const RATE: u32 = 8000;

fn wav_bytes(seconds: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut out, spec).unwrap();
        for i in 0..RATE * seconds {
            let t = i as f32 / RATE as f32;
            let sample = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
            writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    out.into_inner()
}

/// Player over a temp cache and a device pulling 80 frames every 2 ms
fn player(dir: &TempDir) -> Player {
    spool_player::init_logging();
    let mut config = PlayerConfig::default();
    config.engine.tick_ms = 5;
    config.engine.ring_ms = 200;

    let renderer = NullRenderer::new(AudioSpec {
        sample_rate: RATE,
        channels: 1,
        buffer_size: 80,
    })
    .with_clock(Duration::from_millis(2));

    Player::builder()
        .config(config)
        .cache(Arc::new(CacheStore::open_dir(dir.path()).unwrap()))
        .renderer(Box::new(renderer))
        .build()
        .unwrap()
}

fn wait_for(player: &Player, what: &str, mut done: impl FnMut(&Player) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done(player) {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_memory_source_plays_to_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut player = player(&dir);

    player
        .play_source(TrackSource::memory("tone.wav", wav_bytes(3)))
        .unwrap();
    wait_for(&player, "finish", |p| p.get_state() == PlayerState::Finished);

    let status = player.get_status();
    assert_eq!(status.duration_ms, 3000);
    assert_eq!(status.position_ms, 3000);
    assert_eq!(status.buffering_ratio, 1.0);
    player.release().unwrap();
}

#[test]
fn test_seek_while_paused_then_finish() {
    let dir = tempfile::tempdir().unwrap();
    let mut player = player(&dir);

    player
        .play_source(TrackSource::memory("tone.wav", wav_bytes(3)))
        .unwrap();
    wait_for(&player, "playing", |p| p.get_state() == PlayerState::Playing);

    player.pause().unwrap();
    player.seek(2000).unwrap();
    wait_for(&player, "seek", |p| p.get_state() == PlayerState::Paused);
    let position = player.get_status().position_ms;
    assert!((1900..=2000).contains(&position), "position {}", position);

    player.resume().unwrap();
    wait_for(&player, "finish", |p| p.get_state() == PlayerState::Finished);
    assert_eq!(player.get_status().position_ms, 3000);
}

#[test]
fn test_file_source_by_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tone.wav");
    std::fs::write(&path, wav_bytes(1)).unwrap();

    let cache_dir = tempfile::tempdir().unwrap();
    let mut player = player(&cache_dir);
    player.play(path.to_str().unwrap()).unwrap();
    wait_for(&player, "finish", |p| p.get_state() == PlayerState::Finished);

    let id = TrackSource::parse(path.to_str().unwrap()).unwrap().track_id();
    assert!(player.cache().contains(&id));
}

#[test]
fn test_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut player = player(&dir);
    player.play("/nonexistent/spool/track.mp3").unwrap();
    wait_for(&player, "failure", |p| p.get_state() == PlayerState::Failed);
}

#[test]
fn test_volume_out_of_range_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut player = player(&dir);
    assert!(matches!(
        player.set_volume(1.5),
        Err(AudioError::InvalidState(_))
    ));
    player.set_volume(0.25).unwrap();
    assert_eq!(player.get_status().volume, 0.25);
}
