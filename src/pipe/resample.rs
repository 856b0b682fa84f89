use crate::error::{StoryError, StoryResult};
use crate::media::{AudioFormat, BufferInfo, MediaType, StreamFormat, time_from_index};
use crate::pipe::pool::{BufferPool, MediaBuffer};
use crate::pipe::{PipelineDest, PipelineSource, StageState};

/// Converts raw audio to a target sample rate and channel count and applies
/// a gain multiplier per sample.
///
/// A target of zero means "match the source". Rate conversion is linear
/// interpolation over a sliding window of source frames; when the ratio is
/// 1:1 the interpolation degenerates to an exact copy. Output timestamps are
/// derived from the output sample counter, so they are strictly monotonic,
/// and the total output frame count tracks the rate ratio within one frame
/// of rounding.
pub struct ResampleStage {
    target: AudioFormat,
    volume: f32,
    state: StageState,
    source: Option<Box<dyn PipelineSource>>,

    in_fmt: Option<AudioFormat>,
    out_fmt: Option<AudioFormat>,

    /// Source frames already converted to the output channel count.
    window: Vec<i16>,
    /// Source frame index of `window[0]`.
    window_base: u64,
    /// Source frames consumed so far.
    src_frames: u64,
    src_eos: bool,

    /// Next output frame index.
    next_out: u64,
    done: bool,

    pool: BufferPool,
}

impl ResampleStage {
    /// `sample_rate` / `channels` of zero match the source format.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            target: AudioFormat::new(sample_rate, channels),
            volume: 1.0,
            state: StageState::Uninitialized,
            source: None,
            in_fmt: None,
            out_fmt: None,
            window: Vec::new(),
            window_base: 0,
            src_frames: 0,
            src_eos: false,
            next_out: 0,
            done: false,
            pool: BufferPool::new(),
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    /// Pull one upstream buffer and fold its samples into the window,
    /// converting channel layout on the way in.
    fn fetch_source(&mut self) -> StoryResult<()> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("resample stage pulled before setup"))?;
        let in_ch = self.in_fmt.expect("set during setup").channels as usize;
        let out_ch = self.out_fmt.expect("set during setup").channels as usize;

        let mut info = BufferInfo::default();
        let buffer = source.pull(&mut info)?;

        let bytes = buffer.bytes();
        let frames = bytes.len() / (2 * in_ch);
        self.window.reserve(frames * out_ch);
        for f in 0..frames {
            let base = f * in_ch * 2;
            let sample =
                |c: usize| i16::from_le_bytes([bytes[base + c * 2], bytes[base + c * 2 + 1]]);
            match (in_ch, out_ch) {
                (a, b) if a == b => {
                    for c in 0..a {
                        self.window.push(sample(c));
                    }
                }
                (1, 2) => {
                    let v = sample(0);
                    self.window.push(v);
                    self.window.push(v);
                }
                (2, 1) => {
                    let v = (i32::from(sample(0)) + i32::from(sample(1))) / 2;
                    self.window.push(v as i16);
                }
                _ => unreachable!("channel layouts validated at setup"),
            }
        }
        self.src_frames += frames as u64;
        if info.flags.end_of_stream {
            self.src_eos = true;
        }
        source.release(buffer)?;
        Ok(())
    }

    /// Total output frames once the source length is known.
    fn total_out_frames(&self) -> u64 {
        let in_rate = u128::from(self.in_fmt.expect("set during setup").sample_rate);
        let out_rate = u128::from(self.out_fmt.expect("set during setup").sample_rate);
        let num = u128::from(self.src_frames) * out_rate + in_rate / 2;
        (num / in_rate) as u64
    }

    fn window_frames(&self) -> u64 {
        let out_ch = self.out_fmt.expect("set during setup").channels as u64;
        self.window.len() as u64 / out_ch
    }
}

impl PipelineDest for ResampleStage {
    fn add_source(&mut self, source: Box<dyn PipelineSource>) -> StoryResult<()> {
        if self.state != StageState::Uninitialized {
            return Err(StoryError::setup_rejected(
                "resample stage source must be attached before setup",
            ));
        }
        if self.source.is_some() {
            return Err(StoryError::setup_rejected(
                "resample stage accepts exactly one source",
            ));
        }
        self.source = Some(source);
        Ok(())
    }
}

impl PipelineSource for ResampleStage {
    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }

    fn output_format(&self) -> Option<StreamFormat> {
        self.out_fmt.map(StreamFormat::RawAudio)
    }

    fn setup(&mut self) -> StoryResult<()> {
        if self.state != StageState::Uninitialized {
            return Err(StoryError::setup_rejected("resample stage already set up"));
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| StoryError::setup_rejected("resample stage has no source"))?;
        source.setup()?;

        let in_fmt = source
            .output_format()
            .and_then(|f| f.as_raw_audio())
            .ok_or_else(|| {
                StoryError::setup_rejected("resample stage requires a raw audio source")
            })?;
        if in_fmt.channels != 1 && in_fmt.channels != 2 {
            return Err(StoryError::setup_rejected(format!(
                "source audio is neither mono nor stereo ({} channels)",
                in_fmt.channels
            )));
        }

        let out_rate = if self.target.sample_rate == 0 {
            in_fmt.sample_rate
        } else {
            self.target.sample_rate
        };
        let out_ch = if self.target.channels == 0 {
            in_fmt.channels
        } else {
            self.target.channels
        };
        if out_ch != 1 && out_ch != 2 {
            return Err(StoryError::setup_rejected(format!(
                "target channel count must be mono or stereo ({out_ch} requested)"
            )));
        }

        self.in_fmt = Some(in_fmt);
        self.out_fmt = Some(AudioFormat::new(out_rate, out_ch));
        self.state = StageState::Setup;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done || self.state == StageState::Closed
    }

    fn pull(&mut self, info: &mut BufferInfo) -> StoryResult<MediaBuffer> {
        if self.state == StageState::Closed {
            return Err(StoryError::source_closed("resample stage closed"));
        }
        if self.done {
            return Err(StoryError::source_closed("resample stage already exhausted"));
        }
        let out_fmt = self
            .out_fmt
            .ok_or_else(|| StoryError::setup_rejected("resample stage pulled before setup"))?;
        let in_rate = self.in_fmt.expect("set during setup").sample_rate;
        let out_ch = out_fmt.channels as usize;
        let step = f64::from(in_rate) / f64::from(out_fmt.sample_rate);

        let mut out = self.pool.acquire();
        let max_frames = out.capacity() / (2 * out_ch);
        let mut samples: Vec<i16> = Vec::with_capacity(max_frames * out_ch);
        let first_out = self.next_out;

        while samples.len() < max_frames * out_ch {
            let src_pos = self.next_out as f64 * step;
            let i0 = src_pos as u64;

            // Interpolation needs i0 and i0+1 in the window.
            while !self.src_eos && i0 + 1 >= self.window_base + self.window_frames() {
                self.fetch_source()?;
            }
            if self.src_eos && self.next_out >= self.total_out_frames() {
                self.done = true;
                break;
            }
            let last = self.window_base + self.window_frames().saturating_sub(1);
            let a = i0.clamp(self.window_base, last);
            let b = (i0 + 1).clamp(self.window_base, last);
            let frac = (src_pos - i0 as f64) as f32;

            let ai = ((a - self.window_base) as usize) * out_ch;
            let bi = ((b - self.window_base) as usize) * out_ch;
            for c in 0..out_ch {
                let va = f32::from(self.window[ai + c]);
                let vb = f32::from(self.window[bi + c]);
                let v = (va + (vb - va) * frac) * self.volume;
                samples.push(v.round().clamp(-32_768.0, 32_767.0) as i16);
            }
            self.next_out += 1;
        }

        // Drop window frames the next pull can no longer reference.
        let keep_from = (self.next_out as f64 * step) as u64;
        if keep_from > self.window_base {
            let drop_frames = (keep_from - self.window_base).min(self.window_frames());
            self.window.drain(..(drop_frames as usize) * out_ch);
            self.window_base += drop_frames;
        }

        out.write_samples(&samples)?;
        *info = BufferInfo::at(time_from_index(out_fmt.sample_rate, first_out));
        info.flags.end_of_stream = self.done;
        Ok(out)
    }

    fn release(&mut self, buffer: MediaBuffer) -> StoryResult<()> {
        self.pool.release(buffer)
    }

    fn close(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.close();
        }
        self.window = Vec::new();
        self.state = StageState::Closed;
    }
}
