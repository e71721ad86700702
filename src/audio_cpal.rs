/*! Sound card audio via cpal. Compiled with `--features audio`.

cpal streams are callback driven and tied to the thread that built
them, so each stream lives on its own thread and talks to the modem
through a channel (input) or a shared buffer (output).
 */
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info};

use crate::audio::{SampleSink, SampleSource};
use crate::{Error, Result};

fn find_device(name: &str, input: bool) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if name == "default" {
        let dev = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return dev.ok_or_else(|| Error::msg("no default audio device"));
    }
    let mut devices = host
        .devices()
        .map_err(|e| Error::msg(format!("can't enumerate audio devices: {e}")))?;
    devices
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| Error::msg(format!("audio device {name:?} not found")))
}

/// Microphone / line in.
pub struct CpalSource {
    rx: mpsc::Receiver<i16>,
}

impl CpalSource {
    pub fn open(name: &str, samples_per_sec: u32, channels: u16) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<i16>((samples_per_sec as usize) * 2);
        let name = name.to_string();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        std::thread::Builder::new()
            .name("cpal-in".to_string())
            .spawn(move || {
                let build = || -> Result<cpal::Stream> {
                    let device = find_device(&name, true)?;
                    let config = cpal::StreamConfig {
                        channels,
                        sample_rate: cpal::SampleRate(samples_per_sec),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let stream = device
                        .build_input_stream(
                            &config,
                            move |data: &[i16], _| {
                                for &s in data {
                                    // Drop samples rather than block
                                    // inside the audio callback.
                                    let _ = tx.try_send(s);
                                }
                            },
                            |e| error!("audio input stream error: {e}"),
                            None,
                        )
                        .map_err(|e| Error::msg(format!("can't open audio input: {e}")))?;
                    stream
                        .play()
                        .map_err(|e| Error::msg(format!("can't start audio input: {e}")))?;
                    Ok(stream)
                };
                match build() {
                    Ok(_stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Keep the stream alive forever.
                        loop {
                            std::thread::park();
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::msg(format!("can't create audio input thread: {e}")))?;
        ready_rx
            .recv()
            .map_err(|_| Error::msg("audio input thread died"))??;
        info!("audio input open at {samples_per_sec} samples/sec");
        Ok(Self { rx })
    }
}

impl SampleSource for CpalSource {
    fn next_sample(&mut self) -> Result<Option<i16>> {
        match self.rx.recv() {
            Ok(s) => Ok(Some(s)),
            Err(_) => Ok(None),
        }
    }
}

struct OutBuffer {
    queue: Mutex<VecDeque<i16>>,
    drained: Condvar,
}

/// Speaker / line out.
pub struct CpalSink {
    buf: Arc<OutBuffer>,
}

impl CpalSink {
    pub fn open(name: &str, samples_per_sec: u32, channels: u16) -> Result<Self> {
        let buf = Arc::new(OutBuffer {
            queue: Mutex::new(VecDeque::new()),
            drained: Condvar::new(),
        });
        let cb_buf = buf.clone();
        let name = name.to_string();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        std::thread::Builder::new()
            .name("cpal-out".to_string())
            .spawn(move || {
                let build = || -> Result<cpal::Stream> {
                    let device = find_device(&name, false)?;
                    let config = cpal::StreamConfig {
                        channels,
                        sample_rate: cpal::SampleRate(samples_per_sec),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [i16], _| {
                                let mut q = cb_buf.queue.lock().unwrap();
                                for d in data.iter_mut() {
                                    *d = q.pop_front().unwrap_or(0);
                                }
                                if q.is_empty() {
                                    cb_buf.drained.notify_all();
                                }
                            },
                            |e| error!("audio output stream error: {e}"),
                            None,
                        )
                        .map_err(|e| Error::msg(format!("can't open audio output: {e}")))?;
                    stream
                        .play()
                        .map_err(|e| Error::msg(format!("can't start audio output: {e}")))?;
                    Ok(stream)
                };
                match build() {
                    Ok(_stream) => {
                        let _ = ready_tx.send(Ok(()));
                        loop {
                            std::thread::park();
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::msg(format!("can't create audio output thread: {e}")))?;
        ready_rx
            .recv()
            .map_err(|_| Error::msg("audio output thread died"))??;
        info!("audio output open at {samples_per_sec} samples/sec");
        Ok(Self { buf })
    }
}

impl SampleSink for CpalSink {
    fn put_sample(&mut self, sample: i16) -> Result<()> {
        self.buf.queue.lock().unwrap().push_back(sample);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Block until the callback has played everything queued.
    fn wait(&mut self) -> Result<()> {
        let q = self.buf.queue.lock().unwrap();
        let _q = self
            .buf
            .drained
            .wait_timeout_while(q, std::time::Duration::from_secs(30), |q| !q.is_empty())
            .unwrap();
        Ok(())
    }
}
