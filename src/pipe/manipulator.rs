use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::error::{StoryError, StoryResult};
use crate::media::{
    AudioFormat, BYTES_PER_SAMPLE, BufferInfo, MAX_BUFFER_SIZE, MediaType, PULL_TIMEOUT,
    QUEUE_POLL, StreamFormat, time_from_index,
};
use crate::pipe::pool::MediaBuffer;
use crate::pipe::queue::{BufferQueue, DEFAULT_QUEUE_SLOTS, QueueConsumer, QueueProducer};
use crate::pipe::{PipelineSource, StageState};

/// Per-sample audio generator driven by an [`AudioManipulator`] worker.
///
/// The worker asks the feed to position itself at each successive frame time
/// and then reads one sample per channel. Implementations run entirely on
/// the worker thread, so they may hold non-`Sync` state.
pub trait SampleFeed: Send + 'static {
    /// Open underlying sources and report the output format.
    fn prepare(&mut self) -> StoryResult<AudioFormat>;

    /// Position the feed at the frame starting at `time_us`. Returns `false`
    /// when the stream is over; `sample_for_channel` must not be called for
    /// that frame.
    fn load_for_time(&mut self, time_us: i64) -> StoryResult<bool>;

    /// Sample of the current frame for `channel`. Only valid after
    /// `load_for_time` returned `true`.
    fn sample_for_channel(&mut self, channel: u16) -> i16;

    fn close(&mut self);
}

/// Runs a [`SampleFeed`] on a worker thread and exposes its output as a
/// pullable source.
///
/// The worker fills buffers from a small bounded queue ahead of the
/// consumer; timestamps are derived from the absolute output frame index.
/// `close` stops the worker cooperatively and joins it, even mid-stream.
pub struct AudioManipulator<F: SampleFeed> {
    state: StageState,
    feed: Option<F>,
    format: Option<AudioFormat>,

    consumer: Option<QueueConsumer>,
    worker: Option<JoinHandle<()>>,
    done: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    /// Set by the worker when the feed fails; surfaced on the next pull.
    fault: Arc<Mutex<Option<StoryError>>>,
}

impl<F: SampleFeed> AudioManipulator<F> {
    pub fn new(feed: F) -> Self {
        Self {
            state: StageState::Uninitialized,
            feed: Some(feed),
            format: None,
            consumer: None,
            worker: None,
            done: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// The feed, for pre-setup configuration. `None` once the worker owns it.
    pub(crate) fn feed_mut(&mut self) -> Option<&mut F> {
        self.feed.as_mut()
    }
}

impl<F: SampleFeed> PipelineSource for AudioManipulator<F> {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn output_format(&self) -> Option<StreamFormat> {
        self.format.map(StreamFormat::RawAudio)
    }

    fn setup(&mut self) -> StoryResult<()> {
        if self.state != StageState::Uninitialized {
            return Err(StoryError::setup_rejected("manipulator already set up"));
        }
        let mut feed = self
            .feed
            .take()
            .ok_or_else(|| StoryError::setup_rejected("manipulator has no feed"))?;

        let format = feed.prepare()?;
        if format.sample_rate == 0 {
            return Err(StoryError::setup_rejected("feed reports a zero sample rate"));
        }
        if format.channels != 1 && format.channels != 2 {
            return Err(StoryError::setup_rejected(format!(
                "feed output is neither mono nor stereo ({} channels)",
                format.channels
            )));
        }

        let (producer, consumer) = BufferQueue::with_slots(DEFAULT_QUEUE_SLOTS, MAX_BUFFER_SIZE);
        let done = Arc::clone(&self.done);
        let closed = Arc::clone(&self.closed);
        let fault = Arc::clone(&self.fault);
        let worker = std::thread::Builder::new()
            .name("audio-manipulator".into())
            .spawn(move || spin(feed, producer, format, done, closed, fault))
            .map_err(|e| StoryError::setup_rejected(format!("cannot spawn worker: {e}")))?;

        self.format = Some(format);
        self.consumer = Some(consumer);
        self.worker = Some(worker);
        self.state = StageState::Running;
        Ok(())
    }

    fn is_done(&self) -> bool {
        if self.state == StageState::Closed {
            return true;
        }
        let drained = self
            .consumer
            .as_ref()
            .map(QueueConsumer::is_empty)
            .unwrap_or(false);
        self.done.load(Ordering::Acquire) && drained
    }

    fn pull(&mut self, info: &mut BufferInfo) -> StoryResult<MediaBuffer> {
        if self.state == StageState::Closed {
            return Err(StoryError::source_closed("manipulator closed"));
        }
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| StoryError::setup_rejected("manipulator pulled before setup"))?;
        match consumer.get_filled_buffer(PULL_TIMEOUT) {
            Ok((buffer, buffer_info)) => {
                *info = buffer_info;
                Ok(buffer)
            }
            Err(e) => {
                // A worker that died on a feed failure looks like a plain
                // disconnect; report the real cause instead.
                let fault = self
                    .fault
                    .lock()
                    .expect("manipulator fault slot poisoned")
                    .take();
                Err(fault.unwrap_or(e))
            }
        }
    }

    fn release(&mut self, buffer: MediaBuffer) -> StoryResult<()> {
        match self.consumer.as_ref() {
            Some(consumer) => consumer.release_used_buffer(buffer),
            None => Err(StoryError::invalid_buffer(
                "buffer released to a manipulator that never produced one",
            )),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the consumer unblocks a worker stuck waiting for an
        // empty slot.
        self.consumer = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("manipulator worker panicked");
            }
        }
        self.state = StageState::Closed;
    }
}

impl<F: SampleFeed> Drop for AudioManipulator<F> {
    fn drop(&mut self) {
        if self.state != StageState::Closed {
            self.close();
        }
    }
}

/// Worker loop: pump the feed one frame at a time into queue buffers.
fn spin<F: SampleFeed>(
    mut feed: F,
    producer: QueueProducer,
    format: AudioFormat,
    done: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<StoryError>>>,
) {
    let channels = usize::from(format.channels);
    let frames_per_buffer = MAX_BUFFER_SIZE / BYTES_PER_SAMPLE / channels;
    let mut scratch: Vec<i16> = vec![0; frames_per_buffer * channels];
    let mut frame_index: u64 = 0;
    let mut eos = false;

    'produce: while !eos {
        // Poll for a writable buffer so the shutdown flag stays observable.
        let mut buffer = loop {
            if closed.load(Ordering::Acquire) {
                break 'produce;
            }
            match producer.get_empty_buffer(QUEUE_POLL) {
                Some(buffer) => break buffer,
                None => continue,
            }
        };

        let pts = time_from_index(format.sample_rate, frame_index);
        let mut filled = 0usize;
        for _ in 0..frames_per_buffer {
            let time_us = time_from_index(format.sample_rate, frame_index);
            match feed.load_for_time(time_us) {
                Ok(true) => {}
                Ok(false) => {
                    eos = true;
                    break;
                }
                Err(e) => {
                    // Hand the failure to the consumer side instead of
                    // faking a clean end of stream.
                    error!("sample feed failed at {time_us}us: {e}");
                    *fault.lock().expect("manipulator fault slot poisoned") = Some(e);
                    break 'produce;
                }
            }
            for c in 0..channels {
                scratch[filled] = feed.sample_for_channel(c as u16);
                filled += 1;
            }
            frame_index += 1;
        }

        let mut info = BufferInfo::at(pts);
        info.flags.end_of_stream = eos;
        if buffer.write_samples(&scratch[..filled]).is_err() {
            break;
        }
        if producer.send_filled_buffer(buffer, info).is_err() {
            // Consumer endpoint is gone; nothing left to deliver to.
            break;
        }
    }

    done.store(true, Ordering::Release);
    feed.close();
    debug!(frames = frame_index, "manipulator worker finished");
}

/// Frame-by-frame reader over a pipeline source, for feeds that consume
/// upstream audio.
///
/// The cursor buffers pulled samples and exposes the current frame's
/// channels; once the source is exhausted it reports drained and yields
/// silence.
pub struct SampleCursor {
    source: Box<dyn PipelineSource>,
    format: Option<AudioFormat>,
    samples: Vec<i16>,
    pos: usize,
    primed: bool,
    eos: bool,
    drained: bool,
}

impl SampleCursor {
    pub fn new(source: Box<dyn PipelineSource>) -> Self {
        Self {
            source,
            format: None,
            samples: Vec::new(),
            pos: 0,
            primed: false,
            eos: false,
            drained: false,
        }
    }

    /// Set up the wrapped source and check it produces raw audio.
    pub fn setup(&mut self) -> StoryResult<AudioFormat> {
        self.source.setup()?;
        let format = self
            .source
            .output_format()
            .and_then(|f| f.as_raw_audio())
            .ok_or_else(|| StoryError::setup_rejected("cursor requires a raw audio source"))?;
        self.format = Some(format);
        Ok(format)
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Step to the next frame. The first call lands on frame zero.
    pub fn advance(&mut self) -> StoryResult<()> {
        if self.drained {
            return Ok(());
        }
        let channels = usize::from(self.format.map(|f| f.channels).unwrap_or(1).max(1));
        if self.primed {
            self.pos += channels;
        } else {
            self.primed = true;
        }
        while self.pos >= self.samples.len() {
            if self.eos {
                self.drained = true;
                return Ok(());
            }
            self.pos -= self.samples.len();
            self.samples.clear();
            let mut info = BufferInfo::default();
            let buffer = self.source.pull(&mut info)?;
            buffer.read_samples_into(&mut self.samples);
            if info.flags.end_of_stream {
                self.eos = true;
            }
            self.source.release(buffer)?;
        }
        Ok(())
    }

    /// Current frame's sample for `channel`; silence once drained.
    pub fn sample(&self, channel: u16) -> i16 {
        if self.drained {
            return 0;
        }
        self.samples
            .get(self.pos + usize::from(channel))
            .copied()
            .unwrap_or(0)
    }

    /// True once every source sample has been stepped past.
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn close(&mut self) {
        self.source.close();
    }
}
