#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use camera_http_server::{ProcessSpec, ServerConfig, ServerContext, ShutdownToken};
use common::{looping_decoder, wait_until, write_file};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(20);

fn solid_jpeg(color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(320, 240, Rgb(color));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode_image(&img)
        .unwrap();
    out
}

fn recordings(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

#[test]
fn alternating_frames_start_a_recording() {
    let dir = tempfile::tempdir().unwrap();
    let black = write_file(dir.path(), "black.jpg", &solid_jpeg([0, 0, 0]));
    let white = write_file(dir.path(), "white.jpg", &solid_jpeg([255, 255, 255]));
    let decoder = looping_decoder(&dir.path().join("launches.log"), &[black, white]);
    let out_dir = dir.path().join("recordings");

    let raw = json!({
        "Feeds": [{
            "Name": "porch",
            "InputProcessName": decoder.command,
            "InputProcessArguments": decoder.arguments,
            "MotionDetectionPercentage": 5,
            "MotionDetectionFrameCount": 2,
            "MotionSecondsLinger": 30,
            "MotionProcessName": "cat",
            "MotionRecordingFileName": format!("{}/[name]-[yyyyMMddHHmmss].mjpeg", out_dir.display()),
        }]
    });
    let config = ServerConfig::from_json(&raw.to_string()).unwrap();
    let shutdown = ShutdownToken::new();
    let ctx = ServerContext::new(config, shutdown.clone());
    ctx.start_captures();
    let feed = ctx.feed("porch").unwrap().clone();

    assert!(wait_until(TIMEOUT, || feed.is_recording()), "no recording started");
    let grew = wait_until(TIMEOUT, || {
        recordings(&out_dir)
            .iter()
            .any(|path| std::fs::metadata(path).map_or(false, |m| m.len() > 0))
    });
    assert!(grew, "recording file stayed empty");

    let files = recordings(&out_dir);
    assert!(files.iter().all(|path| {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        name.starts_with("porch-") && name.ends_with(".mjpeg")
    }));

    shutdown.trigger();
    ctx.close_recordings();
    assert!(!feed.is_recording());
    assert!(wait_until(TIMEOUT, || !ctx.registry.is_active(&feed.config.input)));
}

#[test]
fn static_scene_never_records() {
    let dir = tempfile::tempdir().unwrap();
    let grey = write_file(dir.path(), "grey.jpg", &solid_jpeg([90, 90, 90]));
    let decoder = looping_decoder(&dir.path().join("launches.log"), &[grey]);
    let out_dir = dir.path().join("recordings");

    let raw = json!({
        "Feeds": [{
            "Name": "yard",
            "InputProcessName": decoder.command,
            "InputProcessArguments": decoder.arguments,
            "MotionDetectionPercentage": 5,
            "MotionDetectionFrameCount": 1,
            "MotionProcessName": "cat",
            "MotionRecordingFileName": format!("{}/[name].mjpeg", out_dir.display()),
            "SnapshotSecondsInterval": 0.1,
        }]
    });
    let config = ServerConfig::from_json(&raw.to_string()).unwrap();
    let shutdown = ShutdownToken::new();
    let ctx = ServerContext::new(config, shutdown.clone());
    ctx.start_captures();
    let feed = ctx.feed("yard").unwrap().clone();

    // Once snapshots flow, the motion engine has been fed frames too.
    assert!(wait_until(TIMEOUT, || feed.latest_snapshot().is_some()));
    std::thread::sleep(Duration::from_millis(500));
    assert!(!feed.is_recording());
    assert!(recordings(&out_dir).is_empty());

    shutdown.trigger();
    ctx.close_recordings();
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |m| m.len())
}

#[test]
fn recording_stops_after_motion_lingers_out() {
    let dir = tempfile::tempdir().unwrap();
    let black = write_file(dir.path(), "black.jpg", &solid_jpeg([0, 0, 0]));
    let white = write_file(dir.path(), "white.jpg", &solid_jpeg([255, 255, 255]));
    let grey = write_file(dir.path(), "grey.jpg", &solid_jpeg([90, 90, 90]));
    let still = dir.path().join("still");
    // Alternates black and white until `still` exists, then repeats grey.
    let decoder = ProcessSpec::new(
        "sh",
        format!(
            "-c \"while true; do if [ -f '{}' ]; then cat '{}'; else cat '{}' '{}'; fi; sleep 0.05; done\"",
            still.display(),
            grey.display(),
            black.display(),
            white.display()
        ),
    );
    let out_dir = dir.path().join("recordings");

    let raw = json!({
        "Feeds": [{
            "Name": "drive",
            "InputProcessName": decoder.command,
            "InputProcessArguments": decoder.arguments,
            "MotionDetectionPercentage": 5,
            "MotionDetectionFrameCount": 2,
            "MotionSecondsLinger": 0.5,
            "MotionProcessName": "cat",
            "MotionRecordingFileName": format!("{}/[name].mjpeg", out_dir.display()),
        }]
    });
    let config = ServerConfig::from_json(&raw.to_string()).unwrap();
    let shutdown = ShutdownToken::new();
    let ctx = ServerContext::new(config, shutdown.clone());
    ctx.start_captures();
    let feed = ctx.feed("drive").unwrap().clone();
    let recording = out_dir.join("drive.mjpeg");

    assert!(wait_until(TIMEOUT, || feed.is_recording()), "no recording started");
    assert!(wait_until(TIMEOUT, || file_len(&recording) > 0));

    std::fs::write(&still, b"").unwrap();
    assert!(
        wait_until(TIMEOUT, || !feed.is_recording()),
        "recording kept running after the scene went still"
    );

    // The transcoder is gone: nothing is appended once the pipe has shut down.
    std::thread::sleep(Duration::from_millis(300));
    let settled = file_len(&recording);
    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(file_len(&recording), settled);
    assert!(settled > 0);
    assert!(ctx.registry.is_active(&feed.config.input), "capture keeps running");

    shutdown.trigger();
    ctx.close_recordings();
}
