use std::path::Path;

use crate::error::StoryResult;
use crate::media::{BufferInfo, MediaType, StreamFormat};
use crate::pipe::decode::DecodeStage;
use crate::pipe::demux::DemuxStage;
use crate::pipe::pool::MediaBuffer;
use crate::pipe::resample::ResampleStage;
use crate::pipe::{PipelineDest, PipelineSource};

/// Demux, decode and optionally resample an audio file in one source.
///
/// With a target sample rate of zero the file's native rate and layout pass
/// through untouched; a resampler is only inserted when a caller asks for a
/// specific rate, channel count or gain.
pub struct AudioFileSource {
    inner: Box<dyn PipelineSource>,
}

impl AudioFileSource {
    /// `sample_rate` / `channels` of zero keep the file's native values.
    pub fn new(
        path: impl AsRef<Path>,
        sample_rate: u32,
        channels: u16,
        volume: f32,
    ) -> StoryResult<Self> {
        let demux = DemuxStage::new(path.as_ref(), MediaType::Audio);
        let mut decode = DecodeStage::new();
        decode.add_source(Box::new(demux))?;

        let inner: Box<dyn PipelineSource> =
            if sample_rate > 0 || channels > 0 || (volume - 1.0).abs() > f32::EPSILON {
                let mut resample = ResampleStage::new(sample_rate, channels);
                resample.set_volume(volume);
                resample.add_source(Box::new(decode))?;
                Box::new(resample)
            } else {
                Box::new(decode)
            };
        Ok(Self { inner })
    }
}

impl PipelineSource for AudioFileSource {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn output_format(&self) -> Option<StreamFormat> {
        self.inner.output_format()
    }

    fn setup(&mut self) -> StoryResult<()> {
        self.inner.setup()
    }

    fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    fn pull(&mut self, info: &mut BufferInfo) -> StoryResult<MediaBuffer> {
        self.inner.pull(info)
    }

    fn release(&mut self, buffer: MediaBuffer) -> StoryResult<()> {
        self.inner.release(buffer)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoryError;

    #[test]
    fn missing_file_fails_at_setup_not_construction() {
        let mut source = AudioFileSource::new("/nonexistent/voice.wav", 44_100, 1, 1.0).unwrap();
        let err = source.setup().unwrap_err();
        assert!(matches!(err, StoryError::SetupRejected(_)));
    }
}
