use crate::error::{StoryError, StoryResult};
use crate::media::AudioFormat;
use crate::pipe::manipulator::{AudioManipulator, SampleCursor, SampleFeed};
use crate::pipe::PipelineSource;

/// Sums any number of raw audio sources into one stream.
///
/// Each input carries its own gain. Samples are accumulated in floating
/// point and saturated back to i16, so simultaneous peaks clip instead of
/// wrapping. The mix ends when every input has ended; inputs that end early
/// contribute silence until then.
pub type AudioMixer = AudioManipulator<MixerFeed>;

impl AudioMixer {
    /// Every input must already produce this exact format.
    pub fn with_format(sample_rate: u32, channels: u16) -> StoryResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(StoryError::setup_rejected(
                "mixer needs an explicit sample rate and channel count",
            ));
        }
        Ok(AudioManipulator::new(MixerFeed {
            format: AudioFormat::new(sample_rate, channels),
            inputs: Vec::new(),
        }))
    }

    /// Attach an input with a gain multiplier. Inputs must be attached
    /// before setup.
    pub fn add_source(
        &mut self,
        source: Box<dyn PipelineSource>,
        volume: f32,
    ) -> StoryResult<()> {
        let feed = self
            .feed_mut()
            .ok_or_else(|| StoryError::setup_rejected("mixer inputs must be added before setup"))?;
        feed.inputs.push(MixerInput {
            cursor: SampleCursor::new(source),
            volume,
        });
        Ok(())
    }
}

struct MixerInput {
    cursor: SampleCursor,
    volume: f32,
}

/// Feed backing [`AudioMixer`].
pub struct MixerFeed {
    format: AudioFormat,
    inputs: Vec<MixerInput>,
}

impl SampleFeed for MixerFeed {
    fn prepare(&mut self) -> StoryResult<AudioFormat> {
        if self.inputs.is_empty() {
            return Err(StoryError::setup_rejected("mixer has no inputs"));
        }
        for input in &mut self.inputs {
            let format = input.cursor.setup()?;
            if format != self.format {
                return Err(StoryError::setup_rejected(format!(
                    "mixer input format {}Hz/{}ch does not match {}Hz/{}ch",
                    format.sample_rate,
                    format.channels,
                    self.format.sample_rate,
                    self.format.channels
                )));
            }
        }
        Ok(self.format)
    }

    fn load_for_time(&mut self, _time_us: i64) -> StoryResult<bool> {
        let mut any_live = false;
        for input in &mut self.inputs {
            input.cursor.advance()?;
            if !input.cursor.is_drained() {
                any_live = true;
            }
        }
        Ok(any_live)
    }

    fn sample_for_channel(&mut self, channel: u16) -> i16 {
        let mut acc = 0.0f32;
        for input in &self.inputs {
            acc += f32::from(input.cursor.sample(channel)) * input.volume;
        }
        acc.round().clamp(-32_768.0, 32_767.0) as i16
    }

    fn close(&mut self) {
        for input in &mut self.inputs {
            input.cursor.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{BufferInfo, MediaType, StreamFormat};
    use crate::pipe::pool::{BufferPool, MediaBuffer};

    /// One-buffer raw audio source over a fixed sample vector.
    struct VecSource {
        fmt: AudioFormat,
        samples: Vec<i16>,
        sent: bool,
        pool: BufferPool,
    }

    impl VecSource {
        fn new(fmt: AudioFormat, samples: Vec<i16>) -> Self {
            Self {
                fmt,
                samples,
                sent: false,
                pool: BufferPool::new(),
            }
        }
    }

    impl PipelineSource for VecSource {
        fn media_type(&self) -> MediaType {
            MediaType::Audio
        }
        fn output_format(&self) -> Option<StreamFormat> {
            Some(StreamFormat::RawAudio(self.fmt))
        }
        fn setup(&mut self) -> StoryResult<()> {
            Ok(())
        }
        fn is_done(&self) -> bool {
            self.sent
        }
        fn pull(&mut self, info: &mut BufferInfo) -> StoryResult<MediaBuffer> {
            if self.sent {
                return Err(StoryError::source_closed("vec source exhausted"));
            }
            let mut buf = self.pool.acquire();
            buf.write_samples(&self.samples)?;
            self.sent = true;
            *info = BufferInfo::end_of_stream(0);
            Ok(buf)
        }
        fn release(&mut self, buffer: MediaBuffer) -> StoryResult<()> {
            self.pool.release(buffer)
        }
        fn close(&mut self) {}
    }

    fn drain(stage: &mut AudioMixer) -> Vec<i16> {
        let mut all = Vec::new();
        loop {
            let mut info = BufferInfo::default();
            let buf = stage.pull(&mut info).unwrap();
            buf.read_samples_into(&mut all);
            let eos = info.flags.end_of_stream;
            stage.release(buf).unwrap();
            if eos {
                return all;
            }
        }
    }

    #[test]
    fn weighted_sum_of_two_inputs() {
        let fmt = AudioFormat::new(8_000, 1);
        let mut mixer = AudioMixer::with_format(8_000, 1).unwrap();
        mixer
            .add_source(Box::new(VecSource::new(fmt, vec![100, 200, 300])), 1.0)
            .unwrap();
        mixer
            .add_source(Box::new(VecSource::new(fmt, vec![10, 20, 30])), 0.5)
            .unwrap();
        mixer.setup().unwrap();
        assert_eq!(drain(&mut mixer), vec![105, 210, 315]);
        mixer.close();
    }

    #[test]
    fn short_input_pads_with_silence_until_the_longest_ends() {
        let fmt = AudioFormat::new(8_000, 1);
        let mut mixer = AudioMixer::with_format(8_000, 1).unwrap();
        mixer
            .add_source(Box::new(VecSource::new(fmt, vec![1, 1])), 1.0)
            .unwrap();
        mixer
            .add_source(Box::new(VecSource::new(fmt, vec![10, 10, 10, 10])), 1.0)
            .unwrap();
        mixer.setup().unwrap();
        assert_eq!(drain(&mut mixer), vec![11, 11, 10, 10]);
        mixer.close();
    }

    #[test]
    fn clipping_saturates_instead_of_wrapping() {
        let fmt = AudioFormat::new(8_000, 1);
        let mut mixer = AudioMixer::with_format(8_000, 1).unwrap();
        mixer
            .add_source(Box::new(VecSource::new(fmt, vec![30_000])), 1.0)
            .unwrap();
        mixer
            .add_source(Box::new(VecSource::new(fmt, vec![30_000])), 1.0)
            .unwrap();
        mixer.setup().unwrap();
        assert_eq!(drain(&mut mixer), vec![32_767]);
        mixer.close();
    }

    #[test]
    fn mismatched_input_format_is_rejected() {
        let mut mixer = AudioMixer::with_format(44_100, 2).unwrap();
        mixer
            .add_source(
                Box::new(VecSource::new(AudioFormat::new(22_050, 1), vec![0])),
                1.0,
            )
            .unwrap();
        assert!(matches!(
            mixer.setup().unwrap_err(),
            StoryError::SetupRejected(_)
        ));
    }
}
