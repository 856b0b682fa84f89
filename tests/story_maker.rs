//! Orchestrator-level tests. Tests that actually encode gate on ffmpeg /
//! ffprobe being installed and skip quietly otherwise.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use storyreel::{StoryError, StoryMaker, StoryPage, StorySettings};

fn tool_available(name: &str) -> bool {
    Command::new(name)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn write_tone_wav(path: &Path, seconds: f64, hz: f64) {
    let rate = 44_100u32;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let frames = (seconds * f64::from(rate)) as usize;
    for i in 0..frames {
        let t = i as f64 / f64::from(rate);
        let s = (t * hz * std::f64::consts::TAU).sin() * 8_000.0;
        writer.write_sample(s as i16).unwrap();
    }
    writer.finalize().unwrap();
}

fn audio_settings() -> StorySettings {
    StorySettings {
        include_video: false,
        transition_us: 500_000,
        overwrite: true,
        ..StorySettings::default()
    }
}

fn page(narration: &Path, duration_us: i64) -> StoryPage {
    StoryPage {
        narration: Some(narration.to_path_buf()),
        narration_duration_us: duration_us,
        ..StoryPage::default()
    }
}

#[test]
fn existing_output_is_not_silently_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let narration = dir.path().join("n.wav");
    write_tone_wav(&narration, 0.2, 440.0);
    let out = dir.path().join("out.m4a");
    std::fs::write(&out, b"precious").unwrap();

    let mut settings = audio_settings();
    settings.overwrite = false;
    let mut maker = StoryMaker::new(&out, settings, vec![page(&narration, 200_000)]).unwrap();
    assert!(matches!(maker.churn().unwrap_err(), StoryError::Encode(_)));
    assert_eq!(std::fs::read(&out).unwrap(), b"precious");
}

#[test]
fn a_second_production_on_the_same_maker_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let narration = dir.path().join("n.wav");
    write_tone_wav(&narration, 0.2, 440.0);
    let out = dir.path().join("out.m4a");

    let mut maker =
        StoryMaker::new(&out, audio_settings(), vec![page(&narration, 200_000)]).unwrap();
    let _ = maker.churn();
    assert!(matches!(
        maker.churn().unwrap_err(),
        StoryError::SetupRejected(_)
    ));
}

#[test]
fn cancellation_aborts_and_reports_zero_progress() {
    if !tool_available("ffmpeg") {
        eprintln!("skipping: ffmpeg not on PATH");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let narration = dir.path().join("n.wav");
    write_tone_wav(&narration, 5.0, 440.0);
    let out = dir.path().join("out.m4a");

    let mut maker =
        StoryMaker::new(&out, audio_settings(), vec![page(&narration, 5_000_000)]).unwrap();
    let progress = maker.progress_handle();
    maker.cancel_handle().cancel();

    assert!(matches!(maker.churn().unwrap_err(), StoryError::Cancelled));
    assert_eq!(progress.progress(), 0.0);
    assert!(!out.exists());
    assert!(!dir.path().join("out.s16le").exists());
}

#[test]
fn cancelling_a_live_run_stops_it_promptly() {
    if !tool_available("ffmpeg") {
        eprintln!("skipping: ffmpeg not on PATH");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.m4a");

    // A 20-minute silent page keeps the run busy well past the cancel.
    let long_page = StoryPage {
        narration_duration_us: 1_200_000_000,
        ..StoryPage::default()
    };
    let mut maker = StoryMaker::new(&out, audio_settings(), vec![long_page]).unwrap();
    let progress = maker.progress_handle();
    let cancel = maker.cancel_handle();

    let (tx, rx) = std::sync::mpsc::channel();
    let runner = std::thread::spawn(move || {
        let _ = tx.send(maker.churn());
    });

    // Wait until the run has demonstrably started writing, then cancel.
    let deadline = Instant::now() + Duration::from_secs(10);
    while progress.audio_progress() == 0.0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(progress.audio_progress() > 0.0, "run never got going");
    cancel.cancel();

    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cancelled run did not stop in time");
    assert!(matches!(result.unwrap_err(), StoryError::Cancelled));
    runner.join().unwrap();

    // A stopped run reports no progress, and keeps reporting none.
    assert_eq!(progress.progress(), 0.0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(progress.progress(), 0.0);
    assert!(!out.exists());
    assert!(!dir.path().join("out.s16le").exists());
}

#[test]
fn two_page_story_has_the_expected_duration() {
    if !tool_available("ffmpeg") || !tool_available("ffprobe") {
        eprintln!("skipping: ffmpeg/ffprobe not on PATH");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let n1 = dir.path().join("n1.wav");
    let n2 = dir.path().join("n2.wav");
    write_tone_wav(&n1, 3.0, 440.0);
    write_tone_wav(&n2, 3.0, 660.0);
    let bed = dir.path().join("bed.wav");
    write_tone_wav(&bed, 1.0, 110.0);
    let out = dir.path().join("story.m4a");

    let mut pages = vec![page(&n1, 3_000_000), page(&n2, 3_000_000)];
    pages[0].soundtrack = Some(bed);

    let mut maker = StoryMaker::new(&out, audio_settings(), pages).unwrap();
    let progress = maker.progress_handle();
    // 0.5s transition + 3s narration, twice.
    assert_eq!(maker.total_us(), 7_000_000);
    maker.churn().unwrap();
    assert_eq!(progress.progress(), 1.0);
    assert!(out.exists());

    let probe = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(&out)
        .output()
        .unwrap();
    assert!(probe.status.success());
    let duration: f64 = String::from_utf8_lossy(&probe.stdout).trim().parse().unwrap();
    // AAC priming means the container may run a hair long; a tenth of a
    // second covers every encoder build seen in practice.
    assert!(
        (duration - 7.0).abs() < 0.1,
        "unexpected duration {duration}"
    );
}
