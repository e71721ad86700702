//! Test signal generator.
//!
//! Produces a WAV file of AFSK modulated test frames, optionally
//! with deliberate bit errors, for exercising the receive side
//! without a radio.
//!
//! ```text
//! gen-packets -o test.wav
//! gen-packets -n 100 -e 1e-3 -o noisy.wav
//! gen-packets -o custom.wav "W1ABC>TEST:my own frame"
//! ```
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use rand::Rng;

use rusttnc::audio::{SampleSink, WavSink};
use rusttnc::ax25::Ax25Packet;
use rusttnc::gen_tone::{StereoSide, ToneGen};
use rusttnc::hdlc_framer::{BitSink, HdlcSender};
use rusttnc::parse_verbosity;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Generate AFSK test signals as WAV files")]
struct Opt {
    /// Output WAV file.
    #[arg(short, long)]
    output: String,

    /// Number of generated test frames.
    #[arg(short = 'n', long, default_value_t = 4)]
    count: u32,

    /// Sample rate.
    #[arg(short = 'r', long, default_value_t = 44100)]
    sample_rate: u32,

    /// Bits per second.
    #[arg(short = 'b', long, default_value_t = 1200)]
    baud: u32,

    /// Mark tone frequency.
    #[arg(short = 'm', long, default_value_t = 1200)]
    mark: u32,

    /// Space tone frequency.
    #[arg(short = 's', long, default_value_t = 2200)]
    space: u32,

    /// Amplitude, 0-100.
    #[arg(short = 'a', long, default_value_t = 50)]
    amplitude: u32,

    /// Bit error rate, e.g. 1e-3.
    #[arg(short = 'e', long, default_value_t = 0.0)]
    error_rate: f64,

    /// Leading flags time in 10 ms units.
    #[arg(long, default_value_t = 30)]
    txdelay: u64,

    /// Milliseconds of silence before the first frame.
    #[arg(long, default_value_t = 0)]
    leading_silence_ms: u64,

    /// Verbosity level.
    #[arg(short, value_parser = parse_verbosity, default_value = "info")]
    verbose: usize,

    /// Frames in monitor format instead of the built in test frames.
    frames: Vec<String>,
}

// Inverts bits on their way to the modulator.
struct ErrorInjector {
    inner: ToneGen,
    rate: f64,
    rng: rand::rngs::StdRng,
    flipped: u64,
}

impl BitSink for ErrorInjector {
    fn put_bit(&mut self, line_bit: u8) -> rusttnc::Result<()> {
        let mut b = line_bit;
        if self.rate > 0.0 && self.rng.gen::<f64>() < self.rate {
            b ^= 1;
            self.flipped += 1;
        }
        self.inner.put_bit(b)
    }

    fn flush(&mut self) -> rusttnc::Result<()> {
        self.inner.flush()
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("rusttnc")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let packets: Vec<Ax25Packet> = if opt.frames.is_empty() {
        (1..=opt.count)
            .map(|i| {
                Ax25Packet::from_text(&format!(
                    "N0CALL-{}>TEST:The quick brown fox jumps over the lazy dog!  {i} of {}",
                    i % 16,
                    opt.count,
                ))
            })
            .collect::<rusttnc::Result<_>>()?
    } else {
        opt.frames
            .iter()
            .map(|t| Ax25Packet::from_text(t))
            .collect::<rusttnc::Result<_>>()?
    };

    let sink = Arc::new(Mutex::new(WavSink::create(
        &opt.output,
        opt.sample_rate,
        1,
    )?));
    if opt.leading_silence_ms > 0 {
        let n = opt.leading_silence_ms * opt.sample_rate as u64 / 1000;
        let mut s = sink.lock().unwrap();
        for _ in 0..n {
            s.put_sample(0)?;
        }
    }

    use rand::SeedableRng;
    let tone = ToneGen::new(
        opt.sample_rate,
        opt.baud,
        opt.mark,
        opt.space,
        opt.amplitude,
        StereoSide::Mono,
        sink.clone(),
    )?;
    let mut out = ErrorInjector {
        inner: tone,
        rate: opt.error_rate,
        rng: rand::rngs::StdRng::from_entropy(),
        flipped: 0,
    };
    let mut sender = HdlcSender::new();

    let pre_flags = (opt.txdelay * 10 * opt.baud as u64 / 1000 / 8) as usize;
    let mut total_bits = 0;
    for pkt in &packets {
        println!("{}{}", pkt.format_addrs(), pkt.safe_info());
        total_bits += sender.preamble_postamble(&mut out, pre_flags, false)?;
        total_bits += sender.send_frame(&mut out, pkt.as_bytes(), false)?;
        total_bits += sender.preamble_postamble(&mut out, 2, false)?;
    }

    sink.lock().unwrap().flush()?;
    sink.lock().unwrap().finalize()?;
    println!(
        "{} frames, {total_bits} bits, {} bits intentionally corrupted, written to {}",
        packets.len(),
        out.flipped,
        opt.output,
    );
    Ok(())
}
