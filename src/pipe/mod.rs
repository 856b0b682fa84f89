//! Pull-based pipeline stages.
//!
//! A stage implements [`PipelineSource`] to let a downstream consumer pull
//! timestamped buffers from it, and additionally [`PipelineDest`] when it
//! consumes exactly one upstream source of its own. Graphs are wired
//! destination-first (attach sources, then `setup` the terminal stage), and
//! data flows on demand from the terminal consumer backward.

mod audio_source;
mod concat;
mod decode;
mod demux;
mod looper;
mod manipulator;
mod mixer;
mod pool;
mod queue;
mod resample;

pub use audio_source::AudioFileSource;
pub use concat::AudioConcatenator;
pub use decode::DecodeStage;
pub use demux::{DemuxStage, audio_duration_us};
pub use looper::AudioLooper;
pub use manipulator::{AudioManipulator, SampleCursor, SampleFeed};
pub use mixer::AudioMixer;
pub use pool::{BufferPool, MediaBuffer};
pub use queue::{BufferQueue, QueueConsumer, QueueProducer};
pub use resample::ResampleStage;

use crate::error::StoryResult;
use crate::media::{BufferInfo, MediaType, StreamFormat};

/// Lifecycle of a stage. Transitions are monotonic; a closed stage never
/// comes back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Uninitialized,
    Setup,
    Running,
    Closed,
}

/// Producer capability: downstream consumers pull timestamped buffers.
pub trait PipelineSource: Send {
    fn media_type(&self) -> MediaType;

    /// Output format. `None` until `setup` succeeds.
    fn output_format(&self) -> Option<StreamFormat>;

    /// Validate configuration and open underlying resources. A stage with a
    /// destination capability must have its source attached first. Calling
    /// `setup` a second time is rejected.
    fn setup(&mut self) -> StoryResult<()>;

    /// True once every buffered sample has been pulled (or the stage was
    /// closed). End-of-stream is only definitive after buffered data drains.
    fn is_done(&self) -> bool;

    /// Pull the next buffer. The caller owns the buffer until it hands it
    /// back through [`release`](Self::release). After the end-of-stream
    /// buffer, or once the stage is closed, pulling yields a
    /// `SourceClosed` error.
    fn pull(&mut self, info: &mut BufferInfo) -> StoryResult<MediaBuffer>;

    /// Return a pulled buffer to the stage that produced it.
    fn release(&mut self, buffer: MediaBuffer) -> StoryResult<()>;

    /// Tear down the stage and everything upstream it owns. Idempotent and
    /// bounded: worker threads observe the shutdown flag and are joined.
    fn close(&mut self);
}

/// Consumer capability: accepts exactly one upstream source, attached before
/// setup.
pub trait PipelineDest {
    fn add_source(&mut self, source: Box<dyn PipelineSource>) -> StoryResult<()>;
}
