//! Encoding and multiplexing through a system `ffmpeg` subprocess.
//!
//! The muxer drains the audio graph to a raw PCM staging file first, then
//! spawns `ffmpeg` with the staged PCM as one input and, when a video track
//! is present, raw RGBA frames streamed over stdin as the other. Using the
//! system binary avoids native FFmpeg dev header/lib requirements.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use anyhow::Context as _;
use tracing::{debug, info, warn};

use crate::error::{StoryError, StoryResult};
use crate::media::{AudioFormat, BufferInfo};
use crate::pipe::PipelineSource;

/// Output container selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerFormat {
    /// MP4 with H.264 video and AAC audio.
    Mp4,
    /// Audio-only MP4 (AAC).
    M4a,
}

/// Supplier of raw RGBA frames for the video track.
pub trait VideoFrameSource: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn fps(&self) -> u32;

    /// The next frame as tightly packed RGBA8, or `None` once the video
    /// track ends. The slice stays valid until the next call.
    fn next_frame(&mut self) -> StoryResult<Option<&[u8]>>;
}

/// Per-track progress, in microseconds of presentation time written.
///
/// Cloneable and safe to poll from any thread; values only move forward.
#[derive(Clone, Debug, Default)]
pub struct MuxProgress {
    audio_us: Arc<AtomicI64>,
    video_us: Arc<AtomicI64>,
}

impl MuxProgress {
    pub fn audio_us(&self) -> i64 {
        self.audio_us.load(Ordering::Acquire)
    }

    pub fn video_us(&self) -> i64 {
        self.video_us.load(Ordering::Acquire)
    }

    fn advance_audio(&self, pts_us: i64) {
        self.audio_us.fetch_max(pts_us, Ordering::AcqRel);
    }

    fn advance_video(&self, pts_us: i64) {
        self.video_us.fetch_max(pts_us, Ordering::AcqRel);
    }
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn ensure_parent_dir(path: &Path) -> StoryResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory '{}'", parent.display())
            })?;
        }
    }
    Ok(())
}

/// Drives one production run: audio (required) plus an optional video track
/// into a single output file. One-shot; `crunch` may be called once.
pub struct MediaMuxer {
    out_path: PathBuf,
    container: ContainerFormat,
    overwrite: bool,

    audio: Option<Box<dyn PipelineSource>>,
    video: Option<Box<dyn VideoFrameSource>>,

    progress: MuxProgress,
    cancel: Arc<AtomicBool>,
    ran: bool,
    closed: bool,
}

impl MediaMuxer {
    pub fn new(out_path: impl Into<PathBuf>, container: ContainerFormat) -> Self {
        Self {
            out_path: out_path.into(),
            container,
            overwrite: false,
            audio: None,
            video: None,
            progress: MuxProgress::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            ran: false,
            closed: false,
        }
    }

    pub fn set_overwrite(&mut self, overwrite: bool) {
        self.overwrite = overwrite;
    }

    /// Share an external cancellation flag. Setting it aborts the run at the
    /// next buffer or frame boundary.
    pub fn set_cancel_token(&mut self, token: Arc<AtomicBool>) {
        self.cancel = token;
    }

    pub fn progress(&self) -> MuxProgress {
        self.progress.clone()
    }

    /// Report progress through an externally owned handle instead of the
    /// muxer's private one.
    pub fn set_progress(&mut self, progress: MuxProgress) {
        self.progress = progress;
    }

    pub fn add_audio_source(&mut self, source: Box<dyn PipelineSource>) -> StoryResult<()> {
        if self.ran {
            return Err(StoryError::setup_rejected(
                "audio source must be attached before the run",
            ));
        }
        if self.audio.is_some() {
            return Err(StoryError::setup_rejected(
                "muxer accepts exactly one audio source",
            ));
        }
        self.audio = Some(source);
        Ok(())
    }

    pub fn set_video_source(&mut self, source: Box<dyn VideoFrameSource>) -> StoryResult<()> {
        if self.ran {
            return Err(StoryError::setup_rejected(
                "video source must be attached before the run",
            ));
        }
        if self.video.is_some() {
            return Err(StoryError::setup_rejected(
                "muxer accepts at most one video source",
            ));
        }
        if self.container == ContainerFormat::M4a {
            return Err(StoryError::setup_rejected(
                "audio-only container cannot carry a video track",
            ));
        }
        self.video = Some(source);
        Ok(())
    }

    /// Run the whole production to completion. Blocking.
    pub fn crunch(&mut self) -> StoryResult<()> {
        if self.ran || self.closed {
            return Err(StoryError::setup_rejected("muxer runs exactly once"));
        }
        self.ran = true;

        let result = self.run();
        self.close();
        result
    }

    fn run(&mut self) -> StoryResult<()> {
        if self.audio.is_none() {
            return Err(StoryError::setup_rejected("muxer has no audio source"));
        }
        if !self.overwrite && self.out_path.exists() {
            return Err(StoryError::encode(format!(
                "output file '{}' already exists",
                self.out_path.display()
            )));
        }
        ensure_parent_dir(&self.out_path)?;
        if !is_ffmpeg_on_path() {
            return Err(StoryError::encode(
                "ffmpeg is required for encoding, but was not found on PATH",
            ));
        }

        let staging = self.out_path.with_extension("s16le");
        let result = self
            .stage_audio(&staging)
            .and_then(|format| self.encode(&staging, format));
        if std::fs::remove_file(&staging).is_err() {
            debug!(path = %staging.display(), "no staging file to remove");
        }
        if result.is_err() {
            // Never leave a half-written output behind.
            let _ = std::fs::remove_file(&self.out_path);
        }
        result
    }

    /// Phase one: pull the audio graph dry into a raw PCM staging file.
    fn stage_audio(&mut self, staging: &Path) -> StoryResult<AudioFormat> {
        let audio = self
            .audio
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("muxer has no audio source"))?;
        audio.setup()?;
        let format = audio
            .output_format()
            .and_then(|f| f.as_raw_audio())
            .ok_or_else(|| StoryError::setup_rejected("muxer requires a raw audio source"))?;

        let file = File::create(staging)
            .with_context(|| format!("failed to create staging file '{}'", staging.display()))?;
        let mut writer = BufWriter::new(file);

        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(StoryError::Cancelled);
            }
            let mut info = BufferInfo::default();
            let buffer = audio.pull(&mut info)?;
            writer
                .write_all(buffer.bytes())
                .context("failed to write staged PCM")?;
            let end_pts = info.pts_us + format.samples_to_us(buffer.sample_count());
            self.progress.advance_audio(end_pts);
            let eos = info.flags.end_of_stream;
            audio.release(buffer)?;
            if eos {
                break;
            }
        }
        writer.flush().context("failed to flush staged PCM")?;
        debug!(path = %staging.display(), "audio track staged");
        Ok(format)
    }

    /// Phase two: hand everything to ffmpeg, streaming frames when a video
    /// track is present.
    fn encode(&mut self, staging: &Path, audio_format: AudioFormat) -> StoryResult<()> {
        let mut cmd = Command::new("ffmpeg");
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.arg(if self.overwrite { "-y" } else { "-n" });
        cmd.args(["-loglevel", "error"]);

        if let Some(video) = &self.video {
            cmd.stdin(Stdio::piped());
            cmd.args([
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", video.width(), video.height()),
                "-r",
                &video.fps().to_string(),
                "-i",
                "pipe:0",
            ]);
        } else {
            cmd.stdin(Stdio::null());
        }

        cmd.args([
            "-f",
            "s16le",
            "-ar",
            &audio_format.sample_rate.to_string(),
            "-ac",
            &audio_format.channels.to_string(),
            "-i",
        ])
        .arg(staging);

        if self.video.is_some() {
            cmd.args([
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-c:a",
                "aac",
                "-shortest",
                "-movflags",
                "+faststart",
            ]);
        } else {
            cmd.args(["-vn", "-c:a", "aac", "-movflags", "+faststart"]);
        }
        if self.container == ContainerFormat::M4a {
            cmd.args(["-f", "ipod"]);
        }
        cmd.arg(&self.out_path);

        let mut child = cmd
            .spawn()
            .map_err(|e| StoryError::encode(format!("failed to spawn ffmpeg: {e}")))?;

        if let Some(video) = self.video.as_mut() {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| StoryError::encode("failed to open ffmpeg stdin"))?;
            let fps = i64::from(video.fps().max(1));
            let mut frame_index: i64 = 0;
            loop {
                if self.cancel.load(Ordering::Acquire) {
                    drop(stdin);
                    kill_quietly(&mut child);
                    return Err(StoryError::Cancelled);
                }
                match video.next_frame() {
                    Ok(Some(frame)) => {
                        if let Err(e) = stdin.write_all(frame) {
                            drop(stdin);
                            return Err(finish_with_error(child, e));
                        }
                        frame_index += 1;
                        self.progress
                            .advance_video(frame_index * 1_000_000 / fps);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        drop(stdin);
                        kill_quietly(&mut child);
                        return Err(e);
                    }
                }
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .map_err(|e| StoryError::encode(format!("failed to wait for ffmpeg: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StoryError::encode(format!(
                "ffmpeg exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        info!(path = %self.out_path.display(), "production written");
        Ok(())
    }

    /// Tear down every owned stage. Idempotent; safe after a partial run.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.close();
        }
        self.closed = true;
    }
}

impl Drop for MediaMuxer {
    fn drop(&mut self) {
        self.close();
    }
}

fn kill_quietly(child: &mut Child) {
    if child.kill().is_err() {
        warn!("ffmpeg already exited before kill");
    }
    let _ = child.wait();
}

/// A broken frame write usually means ffmpeg died; prefer its stderr over
/// the pipe error.
fn finish_with_error(child: Child, write_err: std::io::Error) -> StoryError {
    match child.wait_with_output() {
        Ok(output) if !output.stderr.is_empty() => StoryError::encode(format!(
            "ffmpeg rejected the video stream: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        _ => StoryError::encode(format!("failed to write frame to ffmpeg: {write_err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_without_an_audio_source_is_rejected() {
        let mut mux = MediaMuxer::new("/tmp/storyreel-test-none.mp4", ContainerFormat::Mp4);
        mux.set_overwrite(true);
        assert!(matches!(
            mux.crunch().unwrap_err(),
            StoryError::SetupRejected(_)
        ));
    }

    #[test]
    fn second_run_is_rejected() {
        let mut mux = MediaMuxer::new("/tmp/storyreel-test-twice.mp4", ContainerFormat::Mp4);
        mux.set_overwrite(true);
        let _ = mux.crunch();
        assert!(matches!(
            mux.crunch().unwrap_err(),
            StoryError::SetupRejected(_)
        ));
    }

    #[test]
    fn audio_only_container_refuses_video() {
        struct NoFrames;
        impl VideoFrameSource for NoFrames {
            fn width(&self) -> u32 {
                2
            }
            fn height(&self) -> u32 {
                2
            }
            fn fps(&self) -> u32 {
                30
            }
            fn next_frame(&mut self) -> StoryResult<Option<&[u8]>> {
                Ok(None)
            }
        }
        let mut mux = MediaMuxer::new("/tmp/storyreel-test-m4a.m4a", ContainerFormat::M4a);
        assert!(mux.set_video_source(Box::new(NoFrames)).is_err());
    }
}
