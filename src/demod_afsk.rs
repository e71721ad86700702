/*! AFSK demodulator.

Quadrature correlators at the mark and space frequencies, averaged
over about one symbol, give a tone discriminator output. Each
slicer compares that output against its own threshold and recovers
bit timing with a digital PLL: a 32 bit counter advances by a fixed
step per sample, the bit is sampled when the counter wraps, and every
transition of the sliced data nudges the counter toward zero so the
sampling point settles midway between transitions.

Multiple slicers at different thresholds compensate for uneven mark
and space amplitudes; the dispatcher picks whichever one decodes
best. Carrier detect is based on transition quality: a symbol is
good when the data either held steady or changed close to the
expected instant. Noise changes at random phases and pushes the
quality history down.
 */
use crate::audio::ALevel;
use crate::multi_modem::ChannelReceiver;

// PLL gets multiplied by this on every transition. Lower values pull
// in faster but jitter more.
const PLL_SEARCHING_INERTIA: f32 = 0.64;
const PLL_LOCKED_INERTIA: f32 = 0.74;

// A transition this close to the expected point counts as good.
const DCD_GOOD_PHASE: i32 = 1 << 29;

// Quality history bits needed to declare or drop carrier detect.
const DCD_ON_COUNT: u32 = 26;
const DCD_OFF_COUNT: u32 = 20;

struct Slicer {
    pll: i32,
    data: bool,
    good_transition: bool,
    any_transition: bool,
    dcd_hist: u32,
    dcd_on: bool,
}

/// One demodulator instance, i.e. one subchannel of a radio channel.
pub struct AfskDemodulator {
    subchan: usize,

    // Local oscillator phases, radians.
    mark_phase: f32,
    space_phase: f32,
    mark_step: f32,
    space_step: f32,

    // Moving average over about one symbol of the four mixer
    // products. The boxcar has a null near the symbol rate, which is
    // also where the mark/space beat lands.
    window: Vec<[f32; 4]>,
    wpos: usize,
    sums: [f64; 4],

    // Decaying peak levels for the audio level display.
    sample_peak: f32,
    mark_peak: f32,
    space_peak: f32,
    demod_peak: f32,

    pll_step: i32,
    slicers: Vec<Slicer>,

    samples_until_alevel: u32,
    samples_per_sec: u32,
}

impl AfskDemodulator {
    /// The subchannel number selects a profile: slightly different
    /// filter bandwidths so the instances fail differently on
    /// marginal signals.
    pub fn new(
        subchan: usize,
        samples_per_sec: u32,
        baud: u32,
        mark_freq: u32,
        space_freq: u32,
        num_slicers: usize,
    ) -> Self {
        let two_pi = 2.0 * std::f32::consts::PI;
        let fs = samples_per_sec as f32;
        // Profile spread: nominal, shorter, longer correlation window.
        let profile = match subchan % 3 {
            0 => 1.0,
            1 => 0.75,
            _ => 1.3,
        };
        let window_len = ((fs / baud as f32) * profile).round().max(4.0) as usize;
        Self {
            subchan,
            mark_phase: 0.0,
            space_phase: 0.0,
            mark_step: two_pi * mark_freq as f32 / fs,
            space_step: two_pi * space_freq as f32 / fs,
            window: vec![[0.0; 4]; window_len],
            wpos: 0,
            sums: [0.0; 4],
            sample_peak: 0.0,
            mark_peak: 0.0,
            space_peak: 0.0,
            demod_peak: 1e-6,
            pll_step: (4294967296.0 * baud as f64 / samples_per_sec as f64) as i64 as i32,
            slicers: (0..num_slicers)
                .map(|_| Slicer {
                    pll: 0,
                    data: false,
                    good_transition: false,
                    any_transition: false,
                    dcd_hist: 0,
                    dcd_on: false,
                })
                .collect(),
            samples_until_alevel: samples_per_sec / 10,
            samples_per_sec,
        }
    }

    /// Feed one audio sample. Decoded bits and carrier changes go to
    /// the channel receiver.
    pub fn process_sample(&mut self, sample: i16, rx: &mut ChannelReceiver) {
        let two_pi = 2.0 * std::f32::consts::PI;
        let s = sample as f32 / 32768.0;

        self.mark_phase += self.mark_step;
        if self.mark_phase > two_pi {
            self.mark_phase -= two_pi;
        }
        self.space_phase += self.space_step;
        if self.space_phase > two_pi {
            self.space_phase -= two_pi;
        }

        let products = [
            s * self.mark_phase.cos(),
            s * self.mark_phase.sin(),
            s * self.space_phase.cos(),
            s * self.space_phase.sin(),
        ];
        let oldest = self.window[self.wpos];
        for k in 0..4 {
            self.sums[k] += (products[k] - oldest[k]) as f64;
        }
        self.window[self.wpos] = products;
        self.wpos = (self.wpos + 1) % self.window.len();

        let norm = 1.0 / self.window.len() as f32;
        let m_i = self.sums[0] as f32 * norm;
        let m_q = self.sums[1] as f32 * norm;
        let s_i = self.sums[2] as f32 * norm;
        let s_q = self.sums[3] as f32 * norm;
        let mark_mag = (m_i * m_i + m_q * m_q).sqrt();
        let space_mag = (s_i * s_i + s_q * s_q).sqrt();
        let demod_out = mark_mag - space_mag;

        // Peak tracking with slow decay, for thresholds and levels.
        let decay = 1.0 - 20.0 / self.samples_per_sec as f32;
        self.sample_peak = (self.sample_peak * decay).max(s.abs());
        self.mark_peak = (self.mark_peak * decay).max(mark_mag);
        self.space_peak = (self.space_peak * decay).max(space_mag);
        self.demod_peak = (self.demod_peak * decay).max(demod_out.abs()).max(1e-6);

        let n = self.slicers.len();
        for sl in 0..n {
            // Spread thresholds symmetrically across the signal range.
            let offset = (sl as f32 - (n as f32 - 1.0) / 2.0) / n as f32;
            let threshold = offset * self.demod_peak;
            let data = demod_out > threshold;

            let slicer = &mut self.slicers[sl];
            if data != slicer.data {
                slicer.any_transition = true;
                if slicer.pll.unsigned_abs() < DCD_GOOD_PHASE as u32 {
                    slicer.good_transition = true;
                }
                let inertia = if slicer.dcd_on {
                    PLL_LOCKED_INERTIA
                } else {
                    PLL_SEARCHING_INERTIA
                };
                slicer.pll = (slicer.pll as f32 * inertia) as i32;
                slicer.data = data;
            }

            let prev_pll = slicer.pll;
            slicer.pll = slicer.pll.wrapping_add(self.pll_step);
            if prev_pll > 0 && slicer.pll < 0 {
                // Sampling point: middle of the bit.
                let bit = slicer.data as u8;

                // Symbol quality: quiet symbols and well placed
                // transitions are good, mid phase transitions are
                // not. No signal at all is never good.
                let good = self.demod_peak > 0.01
                    && (!slicer.any_transition || slicer.good_transition);
                slicer.dcd_hist = (slicer.dcd_hist << 1) | good as u32;
                slicer.any_transition = false;
                slicer.good_transition = false;
                let ones = slicer.dcd_hist.count_ones();
                let new_dcd = if slicer.dcd_on {
                    ones > DCD_OFF_COUNT
                } else {
                    ones >= DCD_ON_COUNT
                };
                let dcd_changed = new_dcd != slicer.dcd_on;
                slicer.dcd_on = new_dcd;

                rx.on_bit(self.subchan, sl, bit, false);
                if dcd_changed {
                    rx.dcd_change(self.subchan, sl, new_dcd);
                }
            }
        }

        self.samples_until_alevel = self.samples_until_alevel.saturating_sub(1);
        if self.samples_until_alevel == 0 {
            self.samples_until_alevel = self.samples_per_sec / 10;
            rx.set_alevel(self.subchan, self.alevel());
        }
    }

    /// Current audio level estimate.
    pub fn alevel(&self) -> ALevel {
        let tone_scale = self.mark_peak.max(self.space_peak).max(1e-6);
        ALevel {
            rec: (self.sample_peak * 100.0).round() as i32,
            mark: (self.mark_peak / tone_scale * 100.0).round() as i32,
            space: (self.space_peak / tone_scale * 100.0).round() as i32,
        }
    }
}
