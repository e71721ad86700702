//! The TNC daemon.
//!
//! Reads the configuration, opens the audio devices, starts one
//! receive thread per device and one transmit thread per channel,
//! serves KISS clients, and then processes received frames one at a
//! time on this thread.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};

use rusttnc::audio::{RawSink, RawSource, SampleSink, SampleSource, WavSource};
use rusttnc::config::{Config, Medium};
use rusttnc::dcd::DcdMatrix;
use rusttnc::dlq::{Event, EventQueue, FecType};
use rusttnc::gen_tone::{StereoSide, ToneGen};
use rusttnc::kissnet::{kissnet_init, KissClients, KissShared};
use rusttnc::parse_verbosity;
use rusttnc::ptt::{OutCtl, PttFabric};
use rusttnc::recv::recv_init;
use rusttnc::retry::Retry;
use rusttnc::tq::TransmitQueue;
use rusttnc::xmit::{xmit_init, Transmitter, XmitParams, XmitShared};

#[derive(clap::Parser, Debug)]
#[command(version, about = "Software modem and TNC for amateur packet radio")]
struct Opt {
    /// Configuration file.
    #[arg(short, long, default_value = "rusttnc.conf")]
    config: String,

    /// Verbosity level.
    #[arg(short, value_parser = parse_verbosity, default_value = "info")]
    verbose: usize,

    /// Receive bit error rate, for testing. E.g. 1e-4.
    #[arg(short = 'e', long, default_value_t = 0.0)]
    error_rate: f64,

    /// Transmit audio amplitude, 0-100.
    #[arg(long, default_value_t = 100)]
    amplitude: u32,
}

fn open_source(
    name: &str,
    _samples_per_sec: u32,
    _channels: usize,
) -> Result<Box<dyn SampleSource>> {
    if name.ends_with(".wav") {
        let w = WavSource::open(name)?;
        return Ok(Box::new(w));
    }
    if name == "-" || std::path::Path::new(name).exists() {
        return Ok(Box::new(RawSource::open(name)?));
    }
    #[cfg(feature = "audio")]
    {
        return Ok(Box::new(rusttnc::audio_cpal::CpalSource::open(
            name,
            _samples_per_sec,
            _channels as u16,
        )?));
    }
    #[cfg(not(feature = "audio"))]
    Err(anyhow::anyhow!(
        "audio device {name:?} requires a build with --features audio; \
         use a file or - for a pipe"
    ))
}

fn open_sink(
    name: &str,
    _samples_per_sec: u32,
    _channels: usize,
) -> Result<Arc<Mutex<dyn SampleSink>>> {
    if name == "-" || name.starts_with('/') || name.starts_with('.') {
        return Ok(Arc::new(Mutex::new(RawSink::open(name)?)));
    }
    #[cfg(feature = "audio")]
    {
        return Ok(Arc::new(Mutex::new(rusttnc::audio_cpal::CpalSink::open(
            name,
            _samples_per_sec,
            _channels as u16,
        )?)));
    }
    #[cfg(not(feature = "audio"))]
    Err(anyhow::anyhow!(
        "audio device {name:?} requires a build with --features audio; \
         use a path or - for a pipe"
    ))
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    println!("rusttnc {}", env!("CARGO_PKG_VERSION"));
    stderrlog::new()
        .module(module_path!())
        .module("rusttnc")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let mut config = Config::from_file(&opt.config)?;
    config.recv_ber = opt.error_rate;
    let num_chans = config.num_chans();

    // Shared fabric.
    let dlq = Arc::new(EventQueue::new());
    let tq = Arc::new(TransmitQueue::new(num_chans));
    let dcd = Arc::new(DcdMatrix::new(
        config.chan[..num_chans].iter().map(|c| c.num_subchan).collect(),
    ));
    let running = Arc::new(AtomicBool::new(true));

    let mut fabric = PttFabric::new(num_chans);
    for chan in 0..num_chans {
        let cc = &config.chan[chan];
        if cc.medium != Medium::Radio {
            continue;
        }
        for octype in [OutCtl::Ptt, OutCtl::Dcd, OutCtl::Con] {
            if let Some(spec) = &cc.octrl[octype as usize] {
                if let Err(e) = fabric.open(octype, chan, spec) {
                    warn!("channel {chan}: {e}");
                }
            }
        }
        if let Some(spec) = &cc.txinh {
            if let Err(e) = fabric.open_txinh(chan, spec) {
                warn!("channel {chan}: {e}");
            }
        }
    }
    let ptt = Arc::new(fabric);

    // Audio devices and the transmitters hanging off them.
    let mut sources: Vec<(usize, Box<dyn SampleSource>)> = Vec::new();
    let mut transmitters = Vec::new();
    let params: Vec<Arc<XmitParams>> = config
        .chan
        .iter()
        .take(num_chans)
        .map(|c| Arc::new(XmitParams::from_config(c)))
        .collect();
    let shared = XmitShared {
        tq: tq.clone(),
        dcd: dcd.clone(),
        ptt: ptt.clone(),
        dlq: dlq.clone(),
        running: running.clone(),
    };

    for adev in 0..rusttnc::MAX_ADEVS {
        let ac = &config.adev[adev];
        if !ac.defined {
            continue;
        }
        info!(
            "Audio device {adev}: {} / {}, {} samples/sec, {}",
            ac.indev,
            ac.outdev,
            ac.samples_per_sec,
            if ac.num_channels == 2 { "stereo" } else { "mono" },
        );
        sources.push((
            adev,
            open_source(&ac.indev, ac.samples_per_sec, ac.num_channels)?,
        ));
        let sink = open_sink(&ac.outdev, ac.samples_per_sec, ac.num_channels)?;
        let dev_lock = Arc::new(Mutex::new(()));

        for side in 0..ac.num_channels {
            let chan = rusttnc::adev_first_chan(adev) + side;
            if chan >= num_chans || config.chan[chan].medium != Medium::Radio {
                continue;
            }
            let cc = &config.chan[chan];
            let stereo_side = match (ac.num_channels, side) {
                (1, _) => StereoSide::Mono,
                (_, 0) => StereoSide::Left,
                _ => StereoSide::Right,
            };
            let tone = ToneGen::new(
                ac.samples_per_sec,
                cc.baud,
                cc.mark_freq,
                cc.space_freq,
                opt.amplitude,
                stereo_side,
                sink.clone(),
            )?;
            transmitters.push(Transmitter::new(
                chan,
                cc,
                params[chan].clone(),
                Box::new(tone),
                dev_lock.clone(),
                &shared,
            ));
        }
    }

    let _xmit_threads = xmit_init(transmitters);
    let _recv_threads = recv_init(sources, &config, &dlq, &dcd, &ptt);

    let clients = Arc::new(KissClients::new(config.kiss_copy));
    let kiss_shared = Arc::new(KissShared {
        tq: tq.clone(),
        params,
        clients: clients.clone(),
        num_chans,
    });
    let _kiss_threads = kissnet_init(&config, kiss_shared)?;

    {
        let running = running.clone();
        let tq = tq.clone();
        ctrlc::set_handler(move || {
            eprintln!("Received interrupt, shutting down.");
            running.store(false, Ordering::Relaxed);
            tq.shutdown();
        })?;
    }

    // The application thread: drain the event queue forever.
    let mut decoded = 0u64;
    while running.load(Ordering::Relaxed) {
        if dlq.wait_while_empty(Some(Duration::from_millis(500))) {
            continue;
        }
        let Some(event) = dlq.remove() else {
            continue;
        };
        match event {
            Event::RecFrame(f) => {
                decoded += 1;
                let fec = match f.fec_type {
                    FecType::Fx25 => ", FX.25",
                    FecType::None => "",
                };
                let effort = match f.retries {
                    Retry::None => String::new(),
                    Retry::BitsFixed(n) => format!(", {n} bit fixed"),
                    Retry::RsCorrected(n) => format!(", {n} corrected"),
                    Retry::PassAll => ", BAD CRC".to_string(),
                };
                println!(
                    "DECODED[{decoded}] channel {}.{} audio level = {}{fec}{effort}  {}",
                    f.chan, f.subchan, f.alevel, f.spectrum,
                );
                println!("[{}.{}] {}{}", f.chan, f.subchan, f.packet.format_addrs(), f.packet.safe_info());
                clients.send_rec_packet(f.chan, f.packet.as_bytes());
            }
            Event::ChannelActivity {
                chan,
                activity,
                status,
            } => {
                debug!("channel {chan} activity {activity:?} = {status}");
            }
        }
    }
    info!("exiting");
    Ok(())
}
