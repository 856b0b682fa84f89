use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{StoryError, StoryResult};
use crate::mux::{ContainerFormat, MediaMuxer, MuxProgress};
use crate::pipe::{AudioConcatenator, AudioMixer, PipelineSource};
use crate::story::drawer::StoryFrameDrawer;
use crate::story::page::StoryPage;

/// Production-wide knobs. All fields have sensible defaults so a manifest
/// only needs to override what it cares about.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorySettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Silence pad before each page's narration.
    pub transition_us: i64,
    /// Visual cross-fade at the start of each page.
    pub cross_fade_us: i64,
    /// Gain applied to the soundtrack bed under the narration.
    pub soundtrack_volume: f32,
    /// Fade applied to the soundtrack tail.
    pub fade_out_us: i64,
    pub include_video: bool,
    pub include_soundtrack: bool,
    pub show_pan_zoom: bool,
    pub show_text: bool,
    /// TTF/OTF used for captions. Captions are skipped without one.
    pub caption_font: Option<PathBuf>,
    pub overwrite: bool,
}

impl Default for StorySettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            sample_rate: 44_100,
            channels: 1,
            transition_us: 500_000,
            cross_fade_us: 500_000,
            soundtrack_volume: 0.5,
            fade_out_us: 1_000_000,
            include_video: true,
            include_soundtrack: true,
            show_pan_zoom: true,
            show_text: true,
            caption_font: None,
            overwrite: false,
        }
    }
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DONE: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Flips the shared cancellation flag. Cheap to clone, safe from any thread,
/// idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    cancel: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

/// Read-only progress view for watcher threads.
#[derive(Clone)]
pub struct ProgressHandle {
    mux: MuxProgress,
    total_us: i64,
    has_video: bool,
    state: Arc<AtomicU8>,
}

impl ProgressHandle {
    fn track(&self, written_us: i64) -> f64 {
        if self.total_us <= 0 {
            return 0.0;
        }
        (written_us as f64 / self.total_us as f64).clamp(0.0, 1.0)
    }

    pub fn audio_progress(&self) -> f64 {
        self.track(self.mux.audio_us())
    }

    pub fn video_progress(&self) -> f64 {
        self.track(self.mux.video_us())
    }

    /// Overall progress: the minimum over the tracks the production
    /// actually has. 0 before the run starts and after a stop or failure,
    /// 1 only once the run has fully succeeded.
    pub fn progress(&self) -> f64 {
        match self.state.load(Ordering::Acquire) {
            STATE_DONE => 1.0,
            STATE_RUNNING => {
                let audio = self.audio_progress();
                if self.has_video {
                    audio.min(self.video_progress())
                } else {
                    audio
                }
            }
            _ => 0.0,
        }
    }
}

/// Assembles a whole story into one media file.
///
/// Builds the audio graph (narration concatenation, soundtrack bed, mix),
/// optionally the frame drawer, and drives the muxer to completion. One
/// production per instance.
#[derive(Debug)]
pub struct StoryMaker {
    out_path: PathBuf,
    settings: StorySettings,
    pages: Vec<StoryPage>,
    total_us: i64,

    progress: MuxProgress,
    cancel: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl StoryMaker {
    pub fn new(
        out_path: impl Into<PathBuf>,
        settings: StorySettings,
        pages: Vec<StoryPage>,
    ) -> StoryResult<Self> {
        if pages.is_empty() {
            return Err(StoryError::setup_rejected("story has no pages"));
        }
        if settings.sample_rate == 0 || settings.channels == 0 {
            return Err(StoryError::setup_rejected(
                "settings must carry an explicit sample rate and channel count",
            ));
        }
        let total_us = pages
            .iter()
            .map(|p| p.duration_us(settings.transition_us))
            .sum();
        Ok(Self {
            out_path: out_path.into(),
            settings,
            pages,
            total_us,
            progress: MuxProgress::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
        })
    }

    /// Expected duration of the finished production, in microseconds.
    pub fn total_us(&self) -> i64 {
        self.total_us
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancel: Arc::clone(&self.cancel),
        }
    }

    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle {
            mux: self.progress.clone(),
            total_us: self.total_us,
            has_video: self.settings.include_video,
            state: Arc::clone(&self.state),
        }
    }

    fn narration_track(&self) -> StoryResult<AudioConcatenator> {
        let mut concat = AudioConcatenator::with_format(
            self.settings.sample_rate,
            self.settings.channels,
            self.settings.transition_us,
        )?;
        for page in &self.pages {
            match &page.narration {
                Some(path) => concat.add_source_path(path, page.narration_duration_us)?,
                None => concat.add_silence(page.duration_us(self.settings.transition_us))?,
            }
        }
        Ok(concat)
    }

    /// Soundtrack bed: contiguous pages naming the same file merge into one
    /// continuous segment; a page without a soundtrack is a change point and
    /// plays silence. The final segment loops out to the end of the story
    /// when it is backed by a file.
    fn soundtrack_track(&self) -> StoryResult<Option<AudioConcatenator>> {
        if !self.settings.include_soundtrack
            || self.pages.iter().all(|p| p.soundtrack.is_none())
        {
            return Ok(None);
        }
        let mut concat =
            AudioConcatenator::with_format(self.settings.sample_rate, self.settings.channels, 0)?;

        let runs = Self::soundtrack_runs(&self.pages, self.settings.transition_us);
        let last = runs.len() - 1;
        for (index, (path, duration_us)) in runs.iter().enumerate() {
            match path {
                None => concat.add_silence(*duration_us)?,
                Some(path) if index == last => {
                    concat.add_looping_source_path(path, *duration_us)?;
                }
                Some(path) => concat.add_source_path(path, *duration_us)?,
            }
        }
        concat.set_fade_out(self.settings.fade_out_us)?;
        Ok(Some(concat))
    }

    /// Collapse pages into soundtrack segments. Only an unbroken repeat of
    /// the same file extends a segment; `None` closes it and starts silence.
    fn soundtrack_runs(pages: &[StoryPage], transition_us: i64) -> Vec<(Option<PathBuf>, i64)> {
        let mut runs: Vec<(Option<PathBuf>, i64)> = Vec::new();
        for page in pages {
            let window = page.duration_us(transition_us);
            let key = page.soundtrack.clone();
            match runs.last_mut() {
                Some((prev, dur)) if *prev == key => *dur += window,
                _ => runs.push((key, window)),
            }
        }
        runs
    }

    fn audio_graph(&self) -> StoryResult<Box<dyn PipelineSource>> {
        let narration = self.narration_track()?;
        match self.soundtrack_track()? {
            Some(soundtrack) => {
                let mut mixer =
                    AudioMixer::with_format(self.settings.sample_rate, self.settings.channels)?;
                mixer.add_source(Box::new(narration), 1.0)?;
                mixer.add_source(Box::new(soundtrack), self.settings.soundtrack_volume)?;
                Ok(Box::new(mixer))
            }
            None => Ok(Box::new(narration)),
        }
    }

    /// Run the whole production to completion. Blocking; callers poll a
    /// [`ProgressHandle`] from another thread.
    pub fn churn(&mut self) -> StoryResult<()> {
        if self
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(StoryError::setup_rejected(
                "story maker produces exactly once",
            ));
        }

        let result = self.run();
        let end_state = if result.is_ok() {
            STATE_DONE
        } else {
            STATE_STOPPED
        };
        self.state.store(end_state, Ordering::Release);
        result
    }

    fn run(&mut self) -> StoryResult<()> {
        info!(
            pages = self.pages.len(),
            total_us = self.total_us,
            out = %self.out_path.display(),
            "starting production"
        );
        let container = if self.settings.include_video {
            ContainerFormat::Mp4
        } else {
            ContainerFormat::M4a
        };
        let mut mux = MediaMuxer::new(&self.out_path, container);
        mux.set_overwrite(self.settings.overwrite);
        mux.set_cancel_token(Arc::clone(&self.cancel));
        mux.set_progress(self.progress.clone());
        mux.add_audio_source(self.audio_graph()?)?;
        if self.settings.include_video {
            let drawer = StoryFrameDrawer::new(&self.settings, &self.pages)?;
            mux.set_video_source(Box::new(drawer))?;
        }
        mux.crunch()
    }
}
