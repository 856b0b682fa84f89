use std::path::PathBuf;

use crate::error::{StoryError, StoryResult};
use crate::media::AudioFormat;
use crate::pipe::audio_source::AudioFileSource;
use crate::pipe::manipulator::{AudioManipulator, SampleCursor, SampleFeed};

/// Plays a list of audio segments back to back on a single timeline.
///
/// Each file segment occupies a window of its declared duration, preceded by
/// a fixed transition of silence; the declared duration wins over the file's
/// actual length (short files are padded with silence, long ones truncated).
/// Pure-silence segments and a final looping segment are supported, as is a
/// linear fade-out over the tail of the whole stream.
pub type AudioConcatenator = AudioManipulator<ConcatFeed>;

impl AudioConcatenator {
    /// The output format must be explicit; every segment is normalized to it.
    pub fn with_format(sample_rate: u32, channels: u16, transition_us: i64) -> StoryResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(StoryError::setup_rejected(
                "concatenator needs an explicit sample rate and channel count",
            ));
        }
        if transition_us < 0 {
            return Err(StoryError::setup_rejected(
                "transition duration cannot be negative",
            ));
        }
        Ok(AudioManipulator::new(ConcatFeed {
            format: AudioFormat::new(sample_rate, channels),
            transition_us,
            fade_out_us: 0,
            segments: Vec::new(),
            total_us: 0,
            seg_index: 0,
            window_start: 0,
            cursor: None,
            seg_exhausted: false,
            silent: true,
            gain: 1.0,
        }))
    }

    /// Append `path` occupying `duration_us` after the transition pad.
    pub fn add_source_path(
        &mut self,
        path: impl Into<PathBuf>,
        duration_us: i64,
    ) -> StoryResult<()> {
        self.push_segment(Some(path.into()), duration_us, false)
    }

    /// Append `path` looping for `duration_us` after the transition pad.
    pub fn add_looping_source_path(
        &mut self,
        path: impl Into<PathBuf>,
        duration_us: i64,
    ) -> StoryResult<()> {
        self.push_segment(Some(path.into()), duration_us, true)
    }

    /// Append plain silence. No transition pad is added.
    pub fn add_silence(&mut self, duration_us: i64) -> StoryResult<()> {
        self.push_segment(None, duration_us, false)
    }

    /// Fade the final `fade_us` of the whole stream linearly to silence.
    pub fn set_fade_out(&mut self, fade_us: i64) -> StoryResult<()> {
        if fade_us < 0 {
            return Err(StoryError::setup_rejected(
                "fade-out duration cannot be negative",
            ));
        }
        let feed = self
            .feed_mut()
            .ok_or_else(|| StoryError::setup_rejected("fade-out must be set before setup"))?;
        feed.fade_out_us = fade_us;
        Ok(())
    }

    fn push_segment(
        &mut self,
        path: Option<PathBuf>,
        duration_us: i64,
        looped: bool,
    ) -> StoryResult<()> {
        if duration_us < 0 {
            return Err(StoryError::setup_rejected(
                "segment duration cannot be negative",
            ));
        }
        let feed = self
            .feed_mut()
            .ok_or_else(|| StoryError::setup_rejected("segments must be added before setup"))?;
        feed.segments.push(Segment {
            path,
            duration_us,
            looped,
        });
        Ok(())
    }
}

struct Segment {
    /// `None` plays silence.
    path: Option<PathBuf>,
    duration_us: i64,
    looped: bool,
}

impl Segment {
    /// Transition pad preceding the segment's own window.
    fn lead_us(&self, transition_us: i64) -> i64 {
        if self.path.is_some() { transition_us } else { 0 }
    }
}

/// Feed backing [`AudioConcatenator`].
pub struct ConcatFeed {
    format: AudioFormat,
    transition_us: i64,
    fade_out_us: i64,
    segments: Vec<Segment>,

    total_us: i64,
    seg_index: usize,
    window_start: i64,
    cursor: Option<SampleCursor>,
    /// The current segment's file ended before its window did.
    seg_exhausted: bool,
    silent: bool,
    gain: f32,
}

impl ConcatFeed {
    fn open_cursor(&self, path: &PathBuf) -> StoryResult<SampleCursor> {
        let source =
            AudioFileSource::new(path, self.format.sample_rate, self.format.channels, 1.0)?;
        let mut cursor = SampleCursor::new(Box::new(source));
        cursor.setup()?;
        Ok(cursor)
    }
}

impl SampleFeed for ConcatFeed {
    fn prepare(&mut self) -> StoryResult<AudioFormat> {
        if self.segments.is_empty() {
            return Err(StoryError::setup_rejected("concatenator has no segments"));
        }
        // Cursors open lazily as playback reaches each segment; check the
        // files now so a bad path fails the setup, not the worker.
        for segment in &self.segments {
            if let Some(path) = &segment.path {
                if !path.is_file() {
                    return Err(StoryError::setup_rejected(format!(
                        "segment file not found: '{}'",
                        path.display()
                    )));
                }
            }
        }
        self.total_us = self
            .segments
            .iter()
            .map(|s| s.lead_us(self.transition_us) + s.duration_us)
            .sum();
        Ok(self.format)
    }

    fn load_for_time(&mut self, time_us: i64) -> StoryResult<bool> {
        if time_us >= self.total_us {
            return Ok(false);
        }

        // Step past finished segment windows.
        loop {
            let seg = &self.segments[self.seg_index];
            let window_end = self.window_start + seg.lead_us(self.transition_us) + seg.duration_us;
            if time_us < window_end {
                break;
            }
            if let Some(mut cursor) = self.cursor.take() {
                cursor.close();
            }
            self.seg_exhausted = false;
            self.window_start = window_end;
            self.seg_index += 1;
        }

        let seg = &self.segments[self.seg_index];
        let source_start = self.window_start + seg.lead_us(self.transition_us);
        self.silent = if time_us < source_start || seg.path.is_none() || self.seg_exhausted {
            true
        } else {
            if self.cursor.is_none() {
                let path = self.segments[self.seg_index].path.clone();
                if let Some(path) = path {
                    self.cursor = Some(self.open_cursor(&path)?);
                }
            }
            let mut silent = true;
            if let Some(cursor) = self.cursor.as_mut() {
                cursor.advance()?;
                silent = cursor.is_drained();
            }
            if silent {
                // Window outlives the file. Loop it or pad with silence.
                let looped = self.segments[self.seg_index].looped;
                let path = self.segments[self.seg_index].path.clone();
                if looped {
                    if let (Some(mut old), Some(path)) = (self.cursor.take(), path) {
                        old.close();
                        let mut fresh = self.open_cursor(&path)?;
                        fresh.advance()?;
                        if fresh.is_drained() {
                            self.seg_exhausted = true;
                        } else {
                            silent = false;
                        }
                        self.cursor = Some(fresh);
                    }
                } else {
                    if let Some(mut cursor) = self.cursor.take() {
                        cursor.close();
                    }
                    self.seg_exhausted = true;
                }
            }
            silent
        };

        self.gain = if self.fade_out_us > 0 && time_us >= self.total_us - self.fade_out_us {
            (self.total_us - time_us) as f32 / self.fade_out_us as f32
        } else {
            1.0
        };
        Ok(true)
    }

    fn sample_for_channel(&mut self, channel: u16) -> i16 {
        if self.silent {
            return 0;
        }
        let raw = self.cursor.as_ref().map(|c| c.sample(channel)).unwrap_or(0);
        (f32::from(raw) * self.gain).round() as i16
    }

    fn close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}
