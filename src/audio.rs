/*! Audio sample sources and sinks.

The modem itself only cares about streams of signed 16 bit samples at
a configured rate, mono or two interleaved channels in stereo. This
module provides the abstraction plus file/pipe backends: raw little
endian PCM for pipelines, and WAV via [hound] for test fixtures and
the `gen-packets` utility. A sound card backend built on cpal lives
in `audio_cpal`, behind the `audio` feature.

[hound]: https://docs.rs/hound/
 */
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::{Error, Result};

pub const DEFAULT_SAMPLES_PER_SEC: u32 = 44100;
pub const MIN_SAMPLES_PER_SEC: u32 = 8000;
pub const MAX_SAMPLES_PER_SEC: u32 = 192000;

/// Received signal strength, as displayed to the user. The receive
/// level is 0..100 of full scale; mark and space carry the relative
/// tone levels for AFSK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ALevel {
    pub rec: i32,
    pub mark: i32,
    pub space: i32,
}

impl std::fmt::Display for ALevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}({}/{})", self.rec, self.mark, self.space)
    }
}

/// Stream of samples from one audio device. Samples arrive in the
/// device's own interleaving; the receive thread deals the channels
/// out.
pub trait SampleSource: Send {
    /// The next sample, or `None` at end of stream.
    fn next_sample(&mut self) -> Result<Option<i16>>;
}

/// Sample consumer for one audio device.
pub trait SampleSink: Send {
    fn put_sample(&mut self, sample: i16) -> Result<()>;

    /// Push out a partially filled buffer.
    fn flush(&mut self) -> Result<()>;

    /// Block until everything written has been played. File backends
    /// have nothing to wait for.
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Raw signed 16 bit little endian PCM from a file or pipe.
pub struct RawSource {
    reader: BufReader<Box<dyn Read + Send>>,
}

impl RawSource {
    pub fn open(path: &str) -> Result<Self> {
        let reader: Box<dyn Read + Send> = if path == "-" {
            Box::new(std::io::stdin())
        } else {
            Box::new(
                std::fs::File::open(path)
                    .map_err(|e| Error::msg(format!("can't open audio input {path}: {e}")))?,
            )
        };
        Ok(Self {
            reader: BufReader::new(reader),
        })
    }
}

impl SampleSource for RawSource {
    fn next_sample(&mut self) -> Result<Option<i16>> {
        let mut buf = [0u8; 2];
        let mut got = 0;
        while got < 2 {
            let n = self.reader.read(&mut buf[got..])?;
            if n == 0 {
                return Ok(None);
            }
            got += n;
        }
        Ok(Some(i16::from_le_bytes(buf)))
    }
}

/// Raw signed 16 bit little endian PCM to a file or pipe.
pub struct RawSink {
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl RawSink {
    pub fn open(path: &str) -> Result<Self> {
        let writer: Box<dyn Write + Send> = if path == "-" {
            Box::new(std::io::stdout())
        } else {
            Box::new(
                std::fs::File::create(path)
                    .map_err(|e| Error::msg(format!("can't open audio output {path}: {e}")))?,
            )
        };
        Ok(Self {
            writer: BufWriter::new(writer),
        })
    }
}

impl SampleSink for RawSink {
    fn put_sample(&mut self, sample: i16) -> Result<()> {
        self.writer.write_all(&sample.to_le_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// WAV file input, for running recorded signals through the decoder.
pub struct WavSource {
    reader: hound::WavIntoSamples<BufReader<std::fs::File>, i16>,
    pub samples_per_sec: u32,
    pub num_channels: u16,
}

impl WavSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)
            .map_err(|e| Error::msg(format!("can't open {}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(Error::msg(format!(
                "{}: only 16 bit integer WAV is supported",
                path.display()
            )));
        }
        Ok(Self {
            samples_per_sec: spec.sample_rate,
            num_channels: spec.channels,
            reader: reader.into_samples(),
        })
    }
}

impl SampleSource for WavSource {
    fn next_sample(&mut self) -> Result<Option<i16>> {
        match self.reader.next() {
            None => Ok(None),
            Some(Ok(s)) => Ok(Some(s)),
            Some(Err(e)) => Err(Error::msg(format!("WAV read: {e}"))),
        }
    }
}

/// WAV file output for `gen-packets`.
pub struct WavSink {
    writer: Option<hound::WavWriter<BufWriter<std::fs::File>>>,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P, samples_per_sec: u32, num_channels: u16) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: num_channels,
            sample_rate: samples_per_sec,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)
            .map_err(|e| Error::msg(format!("can't create {}: {e}", path.as_ref().display())))?;
        Ok(Self {
            writer: Some(writer),
        })
    }

    /// Finish the file, patching up the WAV header.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(w) = self.writer.take() {
            w.finalize()
                .map_err(|e| Error::msg(format!("WAV finalize: {e}")))?;
        }
        Ok(())
    }
}

impl SampleSink for WavSink {
    fn put_sample(&mut self, sample: i16) -> Result<()> {
        match self.writer.as_mut() {
            Some(w) => w
                .write_sample(sample)
                .map_err(|e| Error::msg(format!("WAV write: {e}"))),
            None => Err(Error::msg("write after finalize")),
        }
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(w) = self.writer.as_mut() {
            w.flush().map_err(|e| Error::msg(format!("WAV flush: {e}")))?;
        }
        Ok(())
    }
}
