use std::path::PathBuf;

use tracing::warn;

use crate::error::{StoryError, StoryResult};
use crate::media::AudioFormat;
use crate::pipe::audio_source::AudioFileSource;
use crate::pipe::manipulator::{AudioManipulator, SampleCursor, SampleFeed};

/// Repeats one audio file end to end until a fixed duration is reached.
pub type AudioLooper = AudioManipulator<LooperFeed>;

impl AudioLooper {
    /// Loop `path` for `duration_us`. Zero `sample_rate` / `channels` keep
    /// the file's native format.
    pub fn from_file(
        path: impl Into<PathBuf>,
        duration_us: i64,
        sample_rate: u32,
        channels: u16,
        volume: f32,
    ) -> Self {
        AudioManipulator::new(LooperFeed {
            path: path.into(),
            duration_us,
            sample_rate,
            channels,
            volume,
            cursor: None,
        })
    }
}

/// Feed backing [`AudioLooper`]: reopens the file whenever the cursor runs
/// dry and cuts off permanently at the declared duration.
pub struct LooperFeed {
    path: PathBuf,
    duration_us: i64,
    sample_rate: u32,
    channels: u16,
    volume: f32,
    cursor: Option<SampleCursor>,
}

impl LooperFeed {
    fn open_cursor(&self) -> StoryResult<SampleCursor> {
        let source =
            AudioFileSource::new(&self.path, self.sample_rate, self.channels, self.volume)?;
        let mut cursor = SampleCursor::new(Box::new(source));
        cursor.setup()?;
        Ok(cursor)
    }
}

impl SampleFeed for LooperFeed {
    fn prepare(&mut self) -> StoryResult<AudioFormat> {
        if self.duration_us <= 0 {
            return Err(StoryError::setup_rejected(
                "loop duration must be positive",
            ));
        }
        let cursor = self.open_cursor()?;
        let format = cursor
            .format()
            .ok_or_else(|| StoryError::setup_rejected("loop source reports no format"))?;
        self.cursor = Some(cursor);
        Ok(format)
    }

    fn load_for_time(&mut self, time_us: i64) -> StoryResult<bool> {
        if time_us >= self.duration_us {
            return Ok(false);
        }
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("looper fed before prepare"))?;
        cursor.advance()?;
        if !cursor.is_drained() {
            return Ok(true);
        }

        // End of the file before the end of the window: start over.
        cursor.close();
        let mut fresh = self.open_cursor()?;
        fresh.advance()?;
        if fresh.is_drained() {
            warn!(path = %self.path.display(), "loop source holds no samples");
            self.cursor = Some(fresh);
            return Ok(false);
        }
        self.cursor = Some(fresh);
        Ok(true)
    }

    fn sample_for_channel(&mut self, channel: u16) -> i16 {
        self.cursor.as_ref().map(|c| c.sample(channel)).unwrap_or(0)
    }

    fn close(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.close();
        }
    }
}
