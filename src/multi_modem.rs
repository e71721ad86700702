/*! Frame dispatcher for multiple demodulators per channel.

Several demodulator profiles and slice levels can compete on the same
audio. Each (subchannel, slicer) runs its own HDLC and FX.25 decoder
instance; when one of them completes a candidate, a short resolution
window opens so the siblings working on the same transmission can
finish too, and then the best variant is picked:

1. the payload matching the greatest number of sibling candidates,
2. lowest retry effort,
3. lowest slicer, then subchannel, index.

Exactly one frame event per received transmission goes on the queue.
 */
use std::sync::Arc;

use log::debug;
use rand::Rng;

use crate::audio::ALevel;
use crate::ax25::Ax25Packet;
use crate::dcd::DcdMatrix;
use crate::dlq::{Activity, Event, EventQueue, FecType, FrameEvent};
use crate::fx25::Fx25Rec;
use crate::hdlc_deframer::HdlcState;
use crate::ptt::{OutCtl, PttFabric};
use crate::retry::{decode_candidate, Retry, SanityFilter};

// How long after the first candidate we keep collecting sibling
// variants, in bit times. A few octets is plenty; the variants come
// from the same transmission and finish within a bit or two of each
// other.
const RESOLUTION_WINDOW_BITS: u32 = 64;

/// Settings the dispatcher needs per channel.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub num_subchan: usize,
    pub num_slicers: usize,
    pub fix_bits: u32,
    pub sanity: SanityFilter,
    pub passall: bool,
    /// Probability of inverting each received bit, for testing.
    pub recv_ber: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            num_subchan: 1,
            num_slicers: 1,
            fix_bits: 0,
            sanity: SanityFilter::Aprs,
            passall: false,
            recv_ber: 0.0,
        }
    }
}

struct Candidate {
    subchan: usize,
    slice: usize,
    frame: Vec<u8>,
    retries: Retry,
    fec_type: FecType,
}

/// Receive side state for one radio channel: all the per decoder
/// state machines plus the resolution window.
pub struct ChannelReceiver {
    chan: usize,
    cfg: DispatchConfig,

    hdlc: Vec<Vec<HdlcState>>,
    fx25: Vec<Vec<Fx25Rec>>,
    alevel: Vec<ALevel>,

    window: Option<(u32, Vec<Candidate>)>,

    dlq: Arc<EventQueue>,
    dcd: Arc<DcdMatrix>,
    ptt: Arc<PttFabric>,

    rng: rand::rngs::StdRng,
}

impl ChannelReceiver {
    pub fn new(
        chan: usize,
        cfg: DispatchConfig,
        dlq: Arc<EventQueue>,
        dcd: Arc<DcdMatrix>,
        ptt: Arc<PttFabric>,
    ) -> Self {
        use rand::SeedableRng;
        let rng = rand::rngs::StdRng::from_entropy();
        let hdlc = (0..cfg.num_subchan)
            .map(|sub| {
                (0..cfg.num_slicers)
                    .map(|sl| HdlcState::new(chan, sub, sl))
                    .collect()
            })
            .collect();
        let fx25 = (0..cfg.num_subchan)
            .map(|_| (0..cfg.num_slicers).map(|_| Fx25Rec::new()).collect())
            .collect();
        Self {
            chan,
            alevel: vec![ALevel::default(); cfg.num_subchan],
            cfg,
            hdlc,
            fx25,
            window: None,
            dlq,
            dcd,
            ptt,
            rng,
        }
    }

    /// One bit from a demodulator. This is the single entry point for
    /// the whole receive path of a channel.
    pub fn on_bit(&mut self, subchan: usize, slice: usize, raw: u8, is_scrambled: bool) {
        let mut raw = raw;
        if self.cfg.recv_ber > 0.0 && self.rng.gen::<f64>() < self.cfg.recv_ber {
            raw ^= 1;
        }

        let fx25_busy = self.fx25[subchan][slice].is_busy();
        let (dbit, candidate) = self.hdlc[subchan][slice].rec_bit(raw, is_scrambled);

        if let Some(fx) = self.fx25[subchan][slice].rec_bit(dbit) {
            self.add_candidate(Candidate {
                subchan,
                slice,
                frame: fx.frame,
                retries: Retry::RsCorrected(fx.corrected as u32),
                fec_type: FecType::Fx25,
            });
        }

        // While an FX.25 block is in progress the raw HDLC decoder
        // sees the frame inside the data portion; the corrected copy
        // from the Reed-Solomon decode is the one to deliver.
        if let Some(rrbb) = candidate.filter(|_| !fx25_busy) {
            match decode_candidate(&rrbb, self.cfg.fix_bits, self.cfg.sanity, self.cfg.passall) {
                Some(d) => self.add_candidate(Candidate {
                    subchan,
                    slice,
                    frame: d.frame,
                    retries: d.retries,
                    fec_type: FecType::None,
                }),
                None => debug!(
                    "chan {} {}.{}: candidate of {} bits failed validation",
                    self.chan,
                    subchan,
                    slice,
                    rrbb.len()
                ),
            }
        }

        // The first decoder instance paces the resolution window.
        if subchan == 0 && slice == 0 {
            self.tick();
        }
    }

    /// Report a carrier state change from a demodulator. Updates the
    /// channel aggregate, the DCD indicator and the event queue.
    pub fn dcd_change(&self, subchan: usize, slice: usize, state: bool) {
        if let Some(new) = self.dcd.dcd_change(self.chan, subchan, slice, state) {
            self.ptt.set(OutCtl::Dcd, self.chan, new);
            self.dlq.enqueue(Event::ChannelActivity {
                chan: self.chan,
                activity: Activity::Dcd,
                status: new,
            });
        }
    }

    /// Update the audio level reported with frames from a subchannel.
    pub fn set_alevel(&mut self, subchan: usize, alevel: ALevel) {
        self.alevel[subchan] = alevel;
    }

    /// Close out a pending resolution window, e.g. at end of input.
    pub fn flush(&mut self) {
        if let Some((_, candidates)) = self.window.take() {
            self.resolve(candidates);
        }
    }

    fn add_candidate(&mut self, c: Candidate) {
        match &mut self.window {
            Some((_, candidates)) => candidates.push(c),
            None => self.window = Some((RESOLUTION_WINDOW_BITS, vec![c])),
        }
    }

    fn tick(&mut self) {
        let expired = match &mut self.window {
            Some((left, _)) => {
                *left = left.saturating_sub(1);
                *left == 0
            }
            None => false,
        };
        if expired {
            self.flush();
        }
    }

    // Pick the best variant and deliver exactly one frame event.
    fn resolve(&mut self, candidates: Vec<Candidate>) {
        let best = candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| {
                let matches = candidates
                    .iter()
                    .filter(|other| other.frame == c.frame)
                    .count();
                (
                    std::cmp::Reverse(matches),
                    c.retries.effort(),
                    c.slice,
                    c.subchan,
                )
            })
            .map(|(i, _)| i);
        let Some(best) = best else {
            return;
        };

        let mut spectrum = String::new();
        for sub in 0..self.cfg.num_subchan {
            for sl in 0..self.cfg.num_slicers {
                let got = candidates
                    .iter()
                    .any(|c| c.subchan == sub && c.slice == sl);
                spectrum.push(if got { '|' } else { '_' });
            }
        }

        let winner = &candidates[best];
        let packet = match Ax25Packet::from_frame_bytes(winner.frame.clone()) {
            Ok(p) => p,
            Err(e) => {
                debug!("chan {}: discarding undecodable frame: {e}", self.chan);
                return;
            }
        };
        debug!(
            "chan {}: delivering frame from {}.{}, spectrum {}",
            self.chan, winner.subchan, winner.slice, spectrum
        );
        self.dlq.enqueue(Event::RecFrame(Box::new(FrameEvent {
            chan: self.chan,
            subchan: winner.subchan,
            slice: winner.slice,
            packet,
            alevel: self.alevel[winner.subchan],
            fec_type: winner.fec_type,
            retries: winner.retries,
            spectrum,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdlc_framer::{BitVecSink, HdlcSender};
    use crate::Result;

    fn receiver(cfg: DispatchConfig) -> (ChannelReceiver, Arc<EventQueue>) {
        let dlq = Arc::new(EventQueue::new());
        let dcd = Arc::new(DcdMatrix::new(vec![cfg.num_subchan]));
        let ptt = Arc::new(PttFabric::new(1));
        (
            ChannelReceiver::new(0, cfg, dlq.clone(), dcd, ptt),
            dlq,
        )
    }

    fn frame_bits(text: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let pkt = Ax25Packet::from_text(text)?;
        let mut sender = HdlcSender::new();
        let mut sink = BitVecSink::new();
        sender.preamble_postamble(&mut sink, 4, false)?;
        sender.send_frame(&mut sink, pkt.as_bytes(), false)?;
        sender.preamble_postamble(&mut sink, 10, false)?;
        Ok((pkt.as_bytes().to_vec(), sink.bits))
    }

    fn expect_one_frame(dlq: &EventQueue) -> FrameEvent {
        let mut frames = Vec::new();
        while let Some(e) = dlq.remove() {
            if let Event::RecFrame(f) = e {
                frames.push(*f);
            }
        }
        assert_eq!(frames.len(), 1, "expected exactly one frame event");
        frames.into_iter().next().unwrap()
    }

    #[test]
    fn single_decoder_delivers_one_event() -> Result<()> {
        let (mut rx, dlq) = receiver(DispatchConfig::default());
        let (fbuf, bits) = frame_bits("WB2OSZ-15>TEST:The quick brown fox")?;
        for b in bits {
            rx.on_bit(0, 0, b, false);
        }
        rx.flush();
        let f = expect_one_frame(&dlq);
        assert_eq!(f.packet.as_bytes(), &fbuf[..]);
        assert_eq!(f.fec_type, FecType::None);
        assert_eq!(f.retries, Retry::None);
        assert_eq!(f.spectrum, "|");
        Ok(())
    }

    #[test]
    fn sibling_variants_deduplicated() -> Result<()> {
        let cfg = DispatchConfig {
            num_slicers: 3,
            ..DispatchConfig::default()
        };
        let (mut rx, dlq) = receiver(cfg);
        let (fbuf, bits) = frame_bits("WB2OSZ-15>TEST:multi slicer dedup")?;
        // All three slicers hear the same transmission.
        for b in bits {
            for sl in 0..3 {
                rx.on_bit(0, sl, b, false);
            }
        }
        rx.flush();
        let f = expect_one_frame(&dlq);
        assert_eq!(f.packet.as_bytes(), &fbuf[..]);
        // Lowest slicer wins the tie.
        assert_eq!(f.slice, 0);
        assert_eq!(f.spectrum, "|||");
        Ok(())
    }

    #[test]
    fn majority_payload_wins() -> Result<()> {
        let cfg = DispatchConfig {
            num_slicers: 3,
            fix_bits: 0,
            sanity: SanityFilter::None,
            passall: true,
            ..DispatchConfig::default()
        };
        let (mut rx, dlq) = receiver(cfg);
        let (fbuf, bits) = frame_bits("WB2OSZ-15>TEST:majority vote payload")?;
        // Slicer 0 sees a corrupted copy (delivered via passall),
        // slicers 1 and 2 agree on the clean one.
        let mut corrupted = bits.clone();
        corrupted[60] ^= 1;
        for i in 0..bits.len() {
            rx.on_bit(0, 0, corrupted[i], false);
            rx.on_bit(0, 1, bits[i], false);
            rx.on_bit(0, 2, bits[i], false);
        }
        rx.flush();
        let f = expect_one_frame(&dlq);
        assert_eq!(f.packet.as_bytes(), &fbuf[..]);
        assert!(f.slice >= 1, "corrupted slicer 0 must not win");
        Ok(())
    }

    #[test]
    fn window_closes_on_its_own() -> Result<()> {
        let (mut rx, dlq) = receiver(DispatchConfig::default());
        let (_, bits) = frame_bits("WB2OSZ-15>TEST:window close")?;
        for b in bits {
            rx.on_bit(0, 0, b, false);
        }
        // Keep the line idle; flags keep the bits flowing.
        let mut sender = HdlcSender::new();
        let mut idle = BitVecSink::new();
        sender.preamble_postamble(&mut idle, 2 * RESOLUTION_WINDOW_BITS as usize, false)?;
        for b in idle.bits {
            rx.on_bit(0, 0, b, false);
        }
        // No flush: the window expired by itself.
        let f = expect_one_frame(&dlq);
        assert_eq!(f.fec_type, FecType::None);
        Ok(())
    }

    #[test]
    fn dcd_transition_posts_activity() {
        let (rx, dlq) = receiver(DispatchConfig::default());
        rx.dcd_change(0, 0, true);
        rx.dcd_change(0, 0, true);
        match dlq.remove().unwrap() {
            Event::ChannelActivity {
                chan,
                activity,
                status,
            } => {
                assert_eq!(chan, 0);
                assert_eq!(activity, Activity::Dcd);
                assert!(status);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Second identical report is not a transition.
        assert!(dlq.remove().is_none());
    }
}
