//! End-to-end checks of the audio pipeline over synthesized WAV fixtures.

use std::path::{Path, PathBuf};

use storyreel::media::BufferInfo;
use storyreel::pipe::{
    AudioConcatenator, AudioFileSource, AudioLooper, AudioMixer, PipelineSource,
    audio_duration_us,
};

const RATE: u32 = 8_000;

fn write_wav(dir: &Path, name: &str, samples: &[i16]) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    path
}

fn ramp(len: usize) -> Vec<i16> {
    (0..len).map(|i| (i % 997) as i16 + 1).collect()
}

fn drain(stage: &mut dyn PipelineSource) -> Vec<i16> {
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
fn file_source_round_trips_wav_samples() {
    let dir = tempfile::tempdir().unwrap();
    let samples = ramp(4_000);
    let path = write_wav(dir.path(), "voice.wav", &samples);

    let mut source = AudioFileSource::new(&path, 0, 0, 1.0).unwrap();
    source.setup().unwrap();
    assert_eq!(drain(&mut source), samples);
    source.close();
}

#[test]
fn duration_probe_matches_the_fixture() {
    let dir = tempfile::tempdir().unwrap();
    // 2 seconds at 8kHz mono.
    let path = write_wav(dir.path(), "two-sec.wav", &vec![5i16; 16_000]);
    assert_eq!(audio_duration_us(&path).unwrap(), 2_000_000);
}

#[test]
fn concatenation_total_length_is_time_exact() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_wav(dir.path(), "a.wav", &ramp(2_000)); // 250ms
    let b = write_wav(dir.path(), "b.wav", &ramp(4_000)); // 500ms

    let transition_us = 100_000;
    let mut concat = AudioConcatenator::with_format(RATE, 1, transition_us).unwrap();
    concat.add_source_path(&a, 250_000).unwrap();
    concat.add_source_path(&b, 500_000).unwrap();
    concat.setup().unwrap();
    let out = drain(&mut concat);
    concat.close();

    // (100ms + 250ms) + (100ms + 500ms) = 950ms.
    let expected = (950_000i64 * i64::from(RATE) / 1_000_000) as usize;
    assert!((out.len() as i64 - expected as i64).abs() <= 1);
    // The transition pad before each source is silent.
    assert!(out[..800].iter().all(|&s| s == 0));
    assert_eq!(&out[800..808], &ramp(2_000)[..8]);
}

#[test]
fn declared_durations_beat_actual_file_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let short = write_wav(dir.path(), "short.wav", &[7i16; 800]); // 100ms of content
    let long = write_wav(dir.path(), "long.wav", &[9i16; 8_000]); // 1s of content

    let mut concat = AudioConcatenator::with_format(RATE, 1, 0).unwrap();
    concat.add_source_path(&short, 300_000).unwrap(); // padded
    concat.add_source_path(&long, 200_000).unwrap(); // truncated
    concat.setup().unwrap();
    let out = drain(&mut concat);
    concat.close();

    assert_eq!(out.len(), 4_000); // 500ms total
    assert!(out[..800].iter().all(|&s| s == 7));
    assert!(out[800..2_400].iter().all(|&s| s == 0)); // pad
    assert!(out[2_400..4_000].iter().all(|&s| s == 9)); // truncated tail
}

#[test]
fn looper_tiles_the_source_without_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let period = 800usize; // 100ms
    let samples = ramp(period);
    let path = write_wav(dir.path(), "loop.wav", &samples);

    // 250ms window = two full periods plus half of one.
    let mut looper = AudioLooper::from_file(&path, 250_000, 0, 0, 1.0);
    looper.setup().unwrap();
    let out = drain(&mut looper);
    looper.close();

    assert_eq!(out.len(), 2_000);
    for k in 0..(out.len() - period) {
        assert_eq!(out[k], out[k + period], "splice broke at sample {k}");
    }
    assert_eq!(&out[..period], &samples[..]);
}

#[test]
fn mixing_with_silence_is_the_identity() {
    let dir = tempfile::tempdir().unwrap();
    let samples = ramp(1_600);
    let path = write_wav(dir.path(), "voice.wav", &samples);

    let voice = AudioFileSource::new(&path, RATE, 1, 1.0).unwrap();
    let mut silence = AudioConcatenator::with_format(RATE, 1, 0).unwrap();
    silence.add_silence(200_000).unwrap();

    let mut mixer = AudioMixer::with_format(RATE, 1).unwrap();
    mixer.add_source(Box::new(voice), 1.0).unwrap();
    mixer.add_source(Box::new(silence), 1.0).unwrap();
    mixer.setup().unwrap();
    let out = drain(&mut mixer);
    mixer.close();

    assert_eq!(out, samples);
}

#[test]
fn half_weight_self_mix_reproduces_the_track() {
    let dir = tempfile::tempdir().unwrap();
    // Even values so 0.5 + 0.5 lands exactly.
    let samples: Vec<i16> = (0..1_600).map(|i| ((i % 100) * 2) as i16).collect();
    let path = write_wav(dir.path(), "voice.wav", &samples);

    let mut mixer = AudioMixer::with_format(RATE, 1).unwrap();
    mixer
        .add_source(Box::new(AudioFileSource::new(&path, RATE, 1, 1.0).unwrap()), 0.5)
        .unwrap();
    mixer
        .add_source(Box::new(AudioFileSource::new(&path, RATE, 1, 1.0).unwrap()), 0.5)
        .unwrap();
    mixer.setup().unwrap();
    let out = drain(&mut mixer);
    mixer.close();

    assert_eq!(out, samples);
}

#[test]
fn final_segment_loops_to_fill_its_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_wav(dir.path(), "bed.wav", &[3i16; 800]);

    let mut concat = AudioConcatenator::with_format(RATE, 1, 0).unwrap();
    concat.add_looping_source_path(&path, 300_000).unwrap();
    concat.setup().unwrap();
    let out = drain(&mut concat);
    concat.close();

    assert_eq!(out.len(), 2_400);
    assert!(out.iter().all(|&s| s == 3));
}
