/*! Receive workers.

One thread per audio device. The thread reads samples, deals them
out to the device's one or two channels, and feeds every channel's
demodulators. Complete frames are appended to the event queue by the
dispatcher, so later processing never has to be reentrant.

Failure to read audio is fatal: there is no point in going on if we
can't get audio.
 */
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info};

use crate::audio::SampleSource;
use crate::config::{ChanConfig, Config, Medium};
use crate::dcd::DcdMatrix;
use crate::demod_afsk::AfskDemodulator;
use crate::dlq::EventQueue;
use crate::multi_modem::{ChannelReceiver, DispatchConfig};
use crate::ptt::PttFabric;
use crate::{adev_first_chan, Result};

/// Everything that processes one channel's samples: the demodulator
/// instances and the dispatcher they feed.
pub struct ChannelModems {
    pub receiver: ChannelReceiver,
    pub demods: Vec<AfskDemodulator>,
}

impl ChannelModems {
    pub fn new(
        chan: usize,
        cfg: &ChanConfig,
        samples_per_sec: u32,
        recv_ber: f64,
        dlq: Arc<EventQueue>,
        dcd: Arc<DcdMatrix>,
        ptt: Arc<PttFabric>,
    ) -> Self {
        let dispatch = DispatchConfig {
            num_subchan: cfg.num_subchan,
            num_slicers: cfg.num_slicers,
            fix_bits: cfg.fix_bits,
            sanity: cfg.sanity,
            passall: cfg.passall,
            recv_ber,
        };
        let demods = (0..cfg.num_subchan)
            .map(|sub| {
                AfskDemodulator::new(
                    sub,
                    samples_per_sec,
                    cfg.baud,
                    cfg.mark_freq,
                    cfg.space_freq,
                    cfg.num_slicers,
                )
            })
            .collect();
        Self {
            receiver: ChannelReceiver::new(chan, dispatch, dlq, dcd, ptt),
            demods,
        }
    }

    pub fn process_sample(&mut self, sample: i16) {
        for d in &mut self.demods {
            d.process_sample(sample, &mut self.receiver);
        }
    }
}

/// Build the modems for every radio channel of one audio device.
pub fn device_modems(
    adev: usize,
    config: &Config,
    dlq: &Arc<EventQueue>,
    dcd: &Arc<DcdMatrix>,
    ptt: &Arc<PttFabric>,
) -> Vec<Option<ChannelModems>> {
    let first = adev_first_chan(adev);
    (0..config.adev[adev].num_channels)
        .map(|c| {
            let chan = first + c;
            let cc = &config.chan[chan];
            (cc.medium == Medium::Radio).then(|| {
                ChannelModems::new(
                    chan,
                    cc,
                    config.adev[adev].samples_per_sec,
                    config.recv_ber,
                    dlq.clone(),
                    dcd.clone(),
                    ptt.clone(),
                )
            })
        })
        .collect()
}

/// Read one device until end of stream, feeding each sample to its
/// channel. Samples are interleaved across the device's channels.
/// Returns the number of samples processed.
pub fn device_loop(
    source: &mut dyn SampleSource,
    modems: &mut [Option<ChannelModems>],
) -> Result<u64> {
    let mut count = 0u64;
    'outer: loop {
        for m in modems.iter_mut() {
            let Some(sample) = source.next_sample()? else {
                break 'outer;
            };
            count += 1;
            if let Some(m) = m {
                m.process_sample(sample);
            }
        }
    }
    for m in modems.iter_mut().flatten() {
        m.receiver.flush();
    }
    Ok(count)
}

/// Start one receive thread per audio device.
///
/// The sources are paired with their device number because devices
/// can be sparsely configured.
pub fn recv_init(
    sources: Vec<(usize, Box<dyn SampleSource>)>,
    config: &Config,
    dlq: &Arc<EventQueue>,
    dcd: &Arc<DcdMatrix>,
    ptt: &Arc<PttFabric>,
) -> Vec<JoinHandle<()>> {
    sources
        .into_iter()
        .map(|(adev, mut source)| {
            let mut modems = device_modems(adev, config, dlq, dcd, ptt);
            std::thread::Builder::new()
                .name(format!("recv-adev{adev}"))
                .spawn(move || {
                    match device_loop(source.as_mut(), &mut modems) {
                        Ok(n) => info!("audio device {adev}: end of stream after {n} samples"),
                        Err(e) => error!("audio device {adev}: {e}"),
                    }
                    // No audio means no TNC. Mirror the rest of the
                    // error handling policy: terminate with a
                    // diagnostic rather than limp along.
                    error!("Terminating after audio input failure on device {adev}.");
                    std::process::exit(1);
                })
                .expect("could not create audio receive thread")
        })
        .collect()
}
