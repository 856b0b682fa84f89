use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;
use tracing::debug;

use crate::error::{StoryError, StoryResult};
use crate::media::{BufferInfo, MediaType, StreamFormat};
use crate::pipe::pool::{BufferPool, MediaBuffer};
use crate::pipe::{PipelineSource, StageState};

/// Reads one elementary stream out of a container file.
///
/// Setup probes the container and selects the first track of the requested
/// kind; each pull returns the next access unit with its timestamp and
/// frame-type flags until the reader is exhausted. One-shot: a repeat pass
/// needs a fresh instance.
pub struct DemuxStage {
    path: PathBuf,
    kind: MediaType,
    state: StageState,

    reader: Option<Box<dyn FormatReader>>,
    track_id: u32,
    time_base: Option<TimeBase>,
    format: Option<StreamFormat>,
    done: bool,

    pool: BufferPool,
}

impl DemuxStage {
    pub fn new(path: impl Into<PathBuf>, kind: MediaType) -> Self {
        Self {
            path: path.into(),
            kind,
            state: StageState::Uninitialized,
            reader: None,
            track_id: 0,
            time_base: None,
            format: None,
            done: false,
            pool: BufferPool::new(),
        }
    }

    fn pts_us(&self, ts: u64) -> i64 {
        match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(ts);
                (t.seconds as i64) * 1_000_000 + (t.frac * 1_000_000.0).round() as i64
            }
            None => ts as i64,
        }
    }
}

impl PipelineSource for DemuxStage {
    fn media_type(&self) -> MediaType {
        self.kind
    }

    fn output_format(&self) -> Option<StreamFormat> {
        self.format.clone()
    }

    fn setup(&mut self) -> StoryResult<()> {
        if self.state != StageState::Uninitialized {
            return Err(StoryError::setup_rejected("demux stage already set up"));
        }

        let reader = open_reader(&self.path)?;

        // The media layer only decodes audio; a request for a video track
        // can therefore never be satisfied from a container.
        let track = match self.kind {
            MediaType::Audio => reader
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec != CODEC_TYPE_NULL),
            MediaType::Video => None,
        };
        let track = track.ok_or_else(|| {
            StoryError::setup_rejected(format!(
                "'{}' has no {:?} track",
                self.path.display(),
                self.kind
            ))
        })?;

        self.track_id = track.id;
        self.time_base = track.codec_params.time_base;
        self.format = Some(StreamFormat::CompressedAudio(Box::new(
            track.codec_params.clone(),
        )));
        self.reader = Some(reader);
        self.state = StageState::Setup;
        debug!(path = %self.path.display(), track = self.track_id, "demux ready");
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done || self.state == StageState::Closed
    }

    fn pull(&mut self, info: &mut BufferInfo) -> StoryResult<MediaBuffer> {
        if self.state == StageState::Closed {
            return Err(StoryError::source_closed("demux stage closed"));
        }
        if self.done {
            return Err(StoryError::source_closed("demux stage already exhausted"));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("demux stage pulled before setup"))?;

        let mut buffer = self.pool.acquire();
        loop {
            match reader.next_packet() {
                Ok(packet) => {
                    if packet.track_id() != self.track_id {
                        continue;
                    }
                    info.pts_us = self.pts_us(packet.ts());
                    info.flags.end_of_stream = false;
                    // Audio access units are independently decodable.
                    info.flags.key_frame = true;
                    buffer.write_bytes(packet.buf())?;
                    return Ok(buffer);
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.done = true;
                    *info = BufferInfo::end_of_stream(0);
                    buffer.clear();
                    return Ok(buffer);
                }
                Err(e) => {
                    self.pool.release(buffer)?;
                    return Err(StoryError::decode(format!(
                        "demux of '{}' failed: {e}",
                        self.path.display()
                    )));
                }
            }
        }
    }

    fn release(&mut self, buffer: MediaBuffer) -> StoryResult<()> {
        self.pool.release(buffer)
    }

    fn close(&mut self) {
        self.reader = None;
        self.state = StageState::Closed;
    }
}

fn open_reader(path: &Path) -> StoryResult<Box<dyn FormatReader>> {
    let file = File::open(path).map_err(|e| {
        StoryError::setup_rejected(format!("cannot open '{}': {e}", path.display()))
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| {
            StoryError::setup_rejected(format!(
                "'{}' is not a supported container: {e}",
                path.display()
            ))
        })?;
    Ok(probed.format)
}

/// Total duration of the first audio track of `path`, in microseconds.
///
/// Prefers the frame count declared in the container; falls back to walking
/// every packet when the header does not carry one (common for mp3).
pub fn audio_duration_us(path: impl AsRef<Path>) -> StoryResult<i64> {
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| {
            StoryError::setup_rejected(format!("'{}' has no audio track", path.display()))
        })?;
    let track_id = track.id;
    let time_base = track.codec_params.time_base;

    if let (Some(n_frames), Some(rate)) =
        (track.codec_params.n_frames, track.codec_params.sample_rate)
    {
        return Ok((n_frames as i64) * 1_000_000 / i64::from(rate.max(1)));
    }

    let tb = time_base.ok_or_else(|| {
        StoryError::setup_rejected(format!(
            "'{}' declares neither frame count nor time base",
            path.display()
        ))
    })?;
    let mut end_ts = 0u64;
    loop {
        match reader.next_packet() {
            Ok(packet) => {
                if packet.track_id() == track_id {
                    end_ts = end_ts.max(packet.ts() + packet.dur());
                }
            }
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                return Err(StoryError::decode(format!(
                    "duration walk of '{}' failed: {e}",
                    path.display()
                )));
            }
        }
    }
    let t = tb.calc_time(end_ts);
    Ok((t.seconds as i64) * 1_000_000 + (t.frac * 1_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_a_setup_rejection() {
        let mut demux = DemuxStage::new("/nonexistent/clip.wav", MediaType::Audio);
        let err = demux.setup().unwrap_err();
        assert!(matches!(err, StoryError::SetupRejected(_)));
    }

    #[test]
    fn second_setup_is_rejected() {
        let mut demux = DemuxStage::new("/nonexistent/clip.wav", MediaType::Audio);
        let _ = demux.setup();
        // First setup failed before transitioning, so this still reports the
        // open failure; a closed stage must reject as well.
        demux.close();
        assert!(demux.setup().is_err());
    }
}
