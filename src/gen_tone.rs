/*! AFSK tone generation.

Direct digital synthesis: a 32 bit phase accumulator steps through a
256 entry sine table, with the step size selected by the current data
bit (mark or space tone). A fractional accumulator keeps the number
of samples per bit exact on average even when the sample rate is not
a multiple of the bit rate.
 */
use std::sync::{Arc, Mutex};

use crate::audio::SampleSink;
use crate::hdlc_framer::BitSink;
use crate::{Error, Result};

// Phase accumulator wraps at 2^32 ticks per cycle.
const TICKS_PER_CYCLE: f64 = 4294967296.0;

/// Which side of a stereo device this channel modulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoSide {
    Mono,
    Left,
    Right,
}

/// Tone generator for one radio channel.
pub struct ToneGen {
    ticks_per_sample: u32,
    ticks_per_bit: u32,
    f1_change_per_sample: u32,
    f2_change_per_sample: u32,

    tone_phase: u32,
    bit_len_acc: u32,

    sine_table: [i16; 256],
    side: StereoSide,
    sink: Arc<Mutex<dyn SampleSink>>,
}

impl ToneGen {
    /// `amp` is the signal amplitude on a scale of 0..100, where 100
    /// uses the full 16 bit sample range.
    pub fn new(
        samples_per_sec: u32,
        baud: u32,
        mark_freq: u32,
        space_freq: u32,
        amp: u32,
        side: StereoSide,
        sink: Arc<Mutex<dyn SampleSink>>,
    ) -> Result<Self> {
        if baud == 0 || samples_per_sec == 0 {
            return Err(Error::msg("sample rate and bit rate must be non zero"));
        }
        if samples_per_sec < 3 * baud {
            return Err(Error::msg(format!(
                "sample rate {samples_per_sec} too low for {baud} baud"
            )));
        }
        let sps = samples_per_sec as f64;
        let mut sine_table = [0i16; 256];
        for (j, entry) in sine_table.iter_mut().enumerate() {
            let a = (j as f64 / 256.0) * 2.0 * std::f64::consts::PI;
            let s = (a.sin() * 32767.0 * amp as f64 / 100.0) as i32;
            *entry = s.clamp(-32767, 32767) as i16;
        }
        Ok(Self {
            ticks_per_sample: (TICKS_PER_CYCLE / sps + 0.5) as u32,
            ticks_per_bit: (TICKS_PER_CYCLE / baud as f64 + 0.5) as u32,
            f1_change_per_sample: (mark_freq as f64 * TICKS_PER_CYCLE / sps + 0.5) as u32,
            f2_change_per_sample: (space_freq as f64 * TICKS_PER_CYCLE / sps + 0.5) as u32,
            tone_phase: 0,
            bit_len_acc: 0,
            sine_table,
            side,
            sink,
        })
    }

    fn put_sample(&mut self, sam: i16) -> Result<()> {
        let mut sink = self.sink.lock().unwrap();
        match self.side {
            StereoSide::Mono => sink.put_sample(sam)?,
            StereoSide::Left => {
                sink.put_sample(sam)?;
                sink.put_sample(0)?;
            }
            StereoSide::Right => {
                sink.put_sample(0)?;
                sink.put_sample(sam)?;
            }
        }
        Ok(())
    }
}

impl BitSink for ToneGen {
    /// Generate a tone of the proper duration for one bit. A one
    /// selects the mark tone, a zero the space tone.
    fn put_bit(&mut self, line_bit: u8) -> Result<()> {
        loop {
            // until enough audio samples for this bit
            self.tone_phase = self.tone_phase.wrapping_add(if line_bit != 0 {
                self.f1_change_per_sample
            } else {
                self.f2_change_per_sample
            });
            let sam = self.sine_table[(self.tone_phase >> 24) as usize];
            self.put_sample(sam)?;

            self.bit_len_acc = self.bit_len_acc.wrapping_add(self.ticks_per_sample);
            if self.bit_len_acc >= self.ticks_per_bit {
                break;
            }
        }
        self.bit_len_acc -= self.ticks_per_bit;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.sink.lock().unwrap().flush()
    }

    fn wait(&mut self) -> Result<()> {
        self.sink.lock().unwrap().wait()
    }
}
