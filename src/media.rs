use std::time::Duration;

use symphonia::core::codecs::CodecParameters;

/// Largest content window a pipeline buffer may carry, in bytes.
///
/// Sized so one buffer holds a full decoded audio packet or a generous
/// slice of raw samples without per-pull reallocation.
pub const MAX_BUFFER_SIZE: usize = 128 * 1024;

/// Raw audio samples are interleaved signed 16-bit little-endian.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Poll interval for producers waiting on an empty queue slot. Short enough
/// that a worker observes its shutdown flag promptly.
pub const QUEUE_POLL: Duration = Duration::from_millis(10);

/// Upper bound for a consumer waiting on a filled queue slot. Hitting it
/// means the producer died without flagging end-of-stream; the wait degrades
/// into a `SourceClosed` error instead of hanging forever.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
}

/// Raw audio stream parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Duration of `sample_count` interleaved samples, in microseconds.
    pub fn samples_to_us(&self, sample_count: usize) -> i64 {
        let frames = sample_count as i64 / i64::from(self.channels.max(1));
        frames * 1_000_000 / i64::from(self.sample_rate.max(1))
    }
}

/// Format a pipeline source advertises after setup.
#[derive(Clone)]
pub enum StreamFormat {
    /// Interleaved i16 PCM.
    RawAudio(AudioFormat),
    /// Compressed access units plus the codec parameters a decoder needs.
    CompressedAudio(Box<CodecParameters>),
}

impl StreamFormat {
    pub fn as_raw_audio(&self) -> Option<AudioFormat> {
        match self {
            Self::RawAudio(fmt) => Some(*fmt),
            Self::CompressedAudio(_) => None,
        }
    }
}

/// Per-buffer metadata flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Final buffer of the stream; no further data follows.
    pub end_of_stream: bool,
    /// The access unit is independently decodable.
    pub key_frame: bool,
}

/// Metadata travelling with every pipeline buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferInfo {
    /// Presentation timestamp in microseconds, relative to stream start.
    pub pts_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn at(pts_us: i64) -> Self {
        Self {
            pts_us,
            flags: BufferFlags::default(),
        }
    }

    pub fn end_of_stream(pts_us: i64) -> Self {
        Self {
            pts_us,
            flags: BufferFlags {
                end_of_stream: true,
                key_frame: false,
            },
        }
    }
}

/// Timestamp of sample frame `index` at `sample_rate`, in microseconds.
///
/// Computed from the absolute index rather than accumulated deltas so long
/// streams do not drift.
pub fn time_from_index(sample_rate: u32, index: u64) -> i64 {
    (index as i64) * 1_000_000 / i64::from(sample_rate.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_from_index_does_not_drift() {
        // One hour of 44.1kHz frames lands on the exact second.
        let idx = 44_100u64 * 3600;
        assert_eq!(time_from_index(44_100, idx), 3_600_000_000);
    }

    #[test]
    fn samples_to_us_counts_frames_not_samples() {
        let fmt = AudioFormat::new(48_000, 2);
        // 96000 interleaved stereo samples = 48000 frames = 1 second.
        assert_eq!(fmt.samples_to_us(96_000), 1_000_000);
    }
}
