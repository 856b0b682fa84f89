use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;
use tracing::warn;

use crate::error::{StoryError, StoryResult};
use crate::media::{AudioFormat, BufferInfo, MediaType, StreamFormat};
use crate::pipe::pool::{BufferPool, MediaBuffer};
use crate::pipe::{PipelineDest, PipelineSource, StageState};

/// Turns compressed access units into raw interleaved i16 samples.
///
/// The decoder is built from the upstream demux stage's codec parameters at
/// setup. Corrupt packets are skipped with a warning rather than aborting
/// the stream.
pub struct DecodeStage {
    state: StageState,
    source: Option<Box<dyn PipelineSource>>,

    decoder: Option<Box<dyn Decoder>>,
    sample_buf: Option<SampleBuffer<i16>>,
    format: Option<AudioFormat>,
    done: bool,

    pool: BufferPool,
}

impl DecodeStage {
    pub fn new() -> Self {
        Self {
            state: StageState::Uninitialized,
            source: None,
            decoder: None,
            sample_buf: None,
            format: None,
            done: false,
            pool: BufferPool::new(),
        }
    }
}

impl Default for DecodeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineDest for DecodeStage {
    fn add_source(&mut self, source: Box<dyn PipelineSource>) -> StoryResult<()> {
        if self.state != StageState::Uninitialized {
            return Err(StoryError::setup_rejected(
                "decode stage source must be attached before setup",
            ));
        }
        if self.source.is_some() {
            return Err(StoryError::setup_rejected(
                "decode stage accepts exactly one source",
            ));
        }
        self.source = Some(source);
        Ok(())
    }
}

impl PipelineSource for DecodeStage {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn output_format(&self) -> Option<StreamFormat> {
        self.format.map(StreamFormat::RawAudio)
    }

    fn setup(&mut self) -> StoryResult<()> {
        if self.state != StageState::Uninitialized {
            return Err(StoryError::setup_rejected("decode stage already set up"));
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("decode stage has no source"))?;
        source.setup()?;

        let params: Box<CodecParameters> = match source.output_format() {
            Some(StreamFormat::CompressedAudio(params)) => params,
            _ => {
                return Err(StoryError::setup_rejected(
                    "decode stage requires a compressed audio source",
                ));
            }
        };
        let sample_rate = params.sample_rate.ok_or_else(|| {
            StoryError::setup_rejected("source does not declare a sample rate")
        })?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| StoryError::setup_rejected("source does not declare channels"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| StoryError::setup_rejected(format!("unsupported codec: {e}")))?;

        self.decoder = Some(decoder);
        self.format = Some(AudioFormat::new(sample_rate, channels));
        self.state = StageState::Setup;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done || self.state == StageState::Closed
    }

    fn pull(&mut self, info: &mut BufferInfo) -> StoryResult<MediaBuffer> {
        if self.state == StageState::Closed {
            return Err(StoryError::source_closed("decode stage closed"));
        }
        if self.done {
            return Err(StoryError::source_closed("decode stage already exhausted"));
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("decode stage pulled before setup"))?;
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("decode stage pulled before setup"))?;

        let mut out = self.pool.acquire();
        loop {
            let mut upstream_info = BufferInfo::default();
            let compressed = source.pull(&mut upstream_info)?;

            if upstream_info.flags.end_of_stream && compressed.is_empty() {
                source.release(compressed)?;
                self.done = true;
                *info = BufferInfo::end_of_stream(upstream_info.pts_us);
                out.clear();
                return Ok(out);
            }

            let packet = Packet::new_from_slice(0, 0, 0, compressed.bytes());
            source.release(compressed)?;

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("skipping undecodable packet: {e}");
                    continue;
                }
            };
            if decoded.frames() == 0 {
                continue;
            }

            let needs_realloc = match &self.sample_buf {
                Some(buf) => buf.capacity() < decoded.capacity() * decoded.spec().channels.count(),
                None => true,
            };
            if needs_realloc {
                self.sample_buf = Some(SampleBuffer::new(
                    decoded.capacity() as u64,
                    *decoded.spec(),
                ));
            }
            let sample_buf = self
                .sample_buf
                .as_mut()
                .expect("sample buffer allocated above");
            sample_buf.copy_interleaved_ref(decoded);

            *info = BufferInfo::at(upstream_info.pts_us);
            info.flags.key_frame = true;
            out.write_samples(sample_buf.samples())?;
            return Ok(out);
        }
    }

    fn release(&mut self, buffer: MediaBuffer) -> StoryResult<()> {
        self.pool.release(buffer)
    }

    fn close(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.close();
        }
        self.decoder = None;
        self.state = StageState::Closed;
    }
}
