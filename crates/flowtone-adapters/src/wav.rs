//! WAV file pump and sink built on `hound`.
//!
//! The pump decodes PCM or IEEE-float wav data into planar normalized
//! blocks of the configured buffer size; the sink encodes incoming blocks
//! and finalizes the file on flush. Wav properties (rate, channels, depth)
//! are read at construction so callers can validate wiring before a run.

use std::any::Any;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use hound::{SampleFormat, WavIntoSamples, WavReader, WavSpec, WavWriter};

use flowtone_core::{
    BitDepth, Buffer, BufferSize, NumChannels, Pump, SampleRate, SingleUse, Sink, Stage, Uid,
};

enum SampleSource {
    Int {
        iter: WavIntoSamples<BufReader<File>, i32>,
        scale: f32,
    },
    Float {
        iter: WavIntoSamples<BufReader<File>, f32>,
    },
}

/// Reads a wav file block by block.
///
/// Decoder position is per-run state, so the pump is single-use guarded;
/// each setup reopens the file from the start.
pub struct WavPump {
    uid: Uid,
    guard: SingleUse,
    path: PathBuf,
    buffer_size: BufferSize,
    spec: WavSpec,
    source: Option<SampleSource>,
}

impl WavPump {
    pub fn new(path: impl AsRef<Path>, buffer_size: BufferSize) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = WavReader::open(&path)
            .with_context(|| format!("failed to open wav file {}", path.display()))?;
        let spec = reader.spec();
        Ok(Self {
            uid: Uid::next(),
            guard: SingleUse::new(),
            path,
            buffer_size,
            spec,
            source: None,
        })
    }

    pub fn sample_rate(&self) -> SampleRate {
        SampleRate(self.spec.sample_rate)
    }

    pub fn num_channels(&self) -> NumChannels {
        NumChannels(self.spec.channels)
    }

    pub fn bit_depth(&self) -> BitDepth {
        BitDepth(self.spec.bits_per_sample)
    }
}

impl Stage for WavPump {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn single_use(&self) -> Option<SingleUse> {
        Some(self.guard.clone())
    }

    fn setup(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        self.guard.acquire()?;
        let reader = WavReader::open(&self.path)
            .with_context(|| format!("failed to reopen wav file {}", self.path.display()))?;
        self.source = Some(match self.spec.sample_format {
            SampleFormat::Float => SampleSource::Float {
                iter: reader.into_samples::<f32>(),
            },
            SampleFormat::Int => SampleSource::Int {
                iter: reader.into_samples::<i32>(),
                scale: 1.0 / (1i64 << (self.spec.bits_per_sample - 1)) as f32,
            },
        });
        Ok(())
    }

    fn flush(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        self.source = None;
        Ok(())
    }
}

impl Pump for WavPump {
    fn produce(&mut self) -> anyhow::Result<Option<Buffer>> {
        let channels = self.spec.channels as usize;
        let want = self.buffer_size.0 * channels;
        let source = self
            .source
            .as_mut()
            .context("wav pump produce called before setup")?;

        let mut interleaved = Vec::with_capacity(want);
        match source {
            SampleSource::Int { iter, scale } => {
                for sample in iter.by_ref().take(want) {
                    interleaved.push(sample.context("wav decode failed")? as f32 * *scale);
                }
            },
            SampleSource::Float { iter } => {
                for sample in iter.by_ref().take(want) {
                    interleaved.push(sample.context("wav decode failed")?);
                }
            },
        }
        if interleaved.is_empty() {
            return Ok(None);
        }

        let frames = interleaved.len() / channels;
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for (index, sample) in interleaved.into_iter().enumerate() {
            planar[index % channels].push(sample);
        }
        Ok(Some(Buffer::from_planar(planar)?))
    }
}

/// Writes incoming blocks to a wav file; flush finalizes the header.
///
/// A 32-bit depth writes IEEE-float samples, anything else integer PCM at
/// the requested depth. Each setup recreates the file, so the sink can be
/// reused across runs.
pub struct WavSink {
    uid: Uid,
    path: PathBuf,
    sample_rate: SampleRate,
    num_channels: NumChannels,
    bit_depth: BitDepth,
    writer: Option<WavWriter<std::io::BufWriter<File>>>,
}

impl WavSink {
    pub fn new(
        path: impl AsRef<Path>,
        sample_rate: SampleRate,
        num_channels: NumChannels,
        bit_depth: BitDepth,
    ) -> Self {
        Self {
            uid: Uid::next(),
            path: path.as_ref().to_path_buf(),
            sample_rate,
            num_channels,
            bit_depth,
            writer: None,
        }
    }

    fn spec(&self) -> WavSpec {
        WavSpec {
            channels: self.num_channels.0,
            sample_rate: self.sample_rate.0,
            bits_per_sample: self.bit_depth.0,
            sample_format: if self.bit_depth.0 == 32 {
                SampleFormat::Float
            } else {
                SampleFormat::Int
            },
        }
    }
}

impl Stage for WavSink {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn setup(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        let writer = WavWriter::create(&self.path, self.spec())
            .with_context(|| format!("failed to create wav file {}", self.path.display()))?;
        self.writer = Some(writer);
        Ok(())
    }

    fn flush(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("failed to finalize wav file")?;
        }
        Ok(())
    }
}

impl Sink for WavSink {
    fn consume(&mut self, input: &Buffer) -> anyhow::Result<()> {
        if input.num_channels() != self.num_channels {
            anyhow::bail!(
                "wav sink configured for {} but got {}",
                self.num_channels,
                input.num_channels()
            );
        }
        let writer = self
            .writer
            .as_mut()
            .context("wav sink consume called before setup")?;

        if self.bit_depth.0 == 32 {
            for frame in 0..input.size() {
                for channel in input.channels() {
                    writer.write_sample(channel[frame])?;
                }
            }
        } else {
            let max = (1i64 << (self.bit_depth.0 - 1)) as f32;
            for frame in 0..input.size() {
                for channel in input.channels() {
                    let sample = (channel[frame] * max).clamp(-max, max - 1.0) as i32;
                    writer.write_sample(sample)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{WavPump, WavSink};
    use flowtone_core::{BitDepth, Buffer, BufferSize, NumChannels, Pump, SampleRate, Sink, Stage};
    use tempfile::NamedTempFile;

    fn drain(pump: &mut WavPump) -> Buffer {
        let mut all = Buffer::new(pump.num_channels());
        while let Some(block) = pump.produce().expect("produce") {
            all.append(&block).expect("append");
        }
        all
    }

    #[test]
    fn float_roundtrip_preserves_samples() {
        let file = NamedTempFile::new().expect("temp file");
        let mut sink = WavSink::new(file.path(), SampleRate(48_000), NumChannels(2), BitDepth(32));
        sink.setup("render").expect("sink setup");

        let block = Buffer::from_planar(vec![vec![0.1, -0.2, 0.3], vec![-0.4, 0.5, -0.6]])
            .expect("planar data");
        sink.consume(&block).expect("consume");
        sink.flush("render").expect("flush");

        let mut pump = WavPump::new(file.path(), BufferSize(2)).expect("open wav");
        assert_eq!(pump.sample_rate(), SampleRate(48_000));
        assert_eq!(pump.num_channels(), NumChannels(2));
        pump.setup("replay").expect("pump setup");

        let all = drain(&mut pump);
        assert_eq!(all.size(), 3);
        for (written, read) in block.channels().zip(all.channels()) {
            for (a, b) in written.iter().zip(read) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn int16_roundtrip_is_close() {
        let file = NamedTempFile::new().expect("temp file");
        let mut sink = WavSink::new(file.path(), SampleRate(44_100), NumChannels(1), BitDepth(16));
        sink.setup("render").expect("sink setup");

        let samples: Vec<f32> = (0..100).map(|i| (i as f32 / 100.0).sin() * 0.9).collect();
        let block = Buffer::from_planar(vec![samples.clone()]).expect("planar data");
        sink.consume(&block).expect("consume");
        sink.flush("render").expect("flush");

        let mut pump = WavPump::new(file.path(), BufferSize(32)).expect("open wav");
        assert_eq!(pump.bit_depth(), BitDepth(16));
        pump.setup("replay").expect("pump setup");

        let all = drain(&mut pump);
        assert_eq!(all.size(), 100);
        for (a, b) in samples.iter().zip(all.channel(0)) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn pump_blocks_respect_buffer_size() {
        let file = NamedTempFile::new().expect("temp file");
        let mut sink = WavSink::new(file.path(), SampleRate(8_000), NumChannels(1), BitDepth(32));
        sink.setup("render").expect("sink setup");
        sink.consume(&Buffer::constant(NumChannels(1), 10, 0.25))
            .expect("consume");
        sink.flush("render").expect("flush");

        let mut pump = WavPump::new(file.path(), BufferSize(4)).expect("open wav");
        pump.setup("replay").expect("pump setup");

        let sizes: Vec<usize> = std::iter::from_fn(|| pump.produce().expect("produce"))
            .map(|b| b.size())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn pump_is_single_use_within_a_run() {
        let file = NamedTempFile::new().expect("temp file");
        let mut sink = WavSink::new(file.path(), SampleRate(8_000), NumChannels(1), BitDepth(32));
        sink.setup("render").expect("sink setup");
        sink.consume(&Buffer::constant(NumChannels(1), 4, 0.0))
            .expect("consume");
        sink.flush("render").expect("flush");

        let mut pump = WavPump::new(file.path(), BufferSize(4)).expect("open wav");
        pump.setup("replay").expect("first setup");
        assert!(pump.setup("replay").is_err());

        pump.single_use().expect("pump is guarded").reset();
        pump.setup("replay").expect("setup after reset");
    }
}
