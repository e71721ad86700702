/*! Transmit scheduler.

Producers append packets to the transmit queue and go merrily on
their way. One worker thread per radio channel waits until the
channel is clear, keys the transmitter, and empties the queue.

Channel access is p-persistent CSMA: wait for DCD to drop, sleep a
slot time, then transmit with probability (persist+1)/256, otherwise
sleep another slot and roll again. Anything appearing in the high
priority queue, i.e. a digipeated frame, cuts the random wait short.
Carrier coming back at any point restarts the wait from the top. A
hard timeout keeps a stuck carrier from wedging the queue forever:
the head frame is dropped and reported.

Two channels sharing one stereo device are kept from talking at the
same time with a per device lock.
 */
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::Rng;

use crate::ax25::{Ax25Packet, AX25_REPEATER_1};
use crate::config::ChanConfig;
use crate::dcd::DcdMatrix;
use crate::dlq::{Activity, Event, EventQueue};
use crate::fx25::fx25_send_frame;
use crate::hdlc_framer::{BitSink, HdlcSender};
use crate::ptt::{OutCtl, PttFabric};
use crate::tq::{Priority, TransmitQueue};

/// Give up waiting for a clear channel after a minute. That is a
/// long time for APRS, but connected mode file transfers might need
/// it.
pub const WAIT_TIMEOUT_MS: u64 = 60 * 1000;
pub const WAIT_CHECK_EVERY_MS: u64 = 10;

/// Most frames one transmission will ever carry.
pub const MAX_BUNDLE: usize = 256;

/// Transmit timing for one channel. The KISS protocol can change
/// these at run time, so they are shared atomics rather than copies.
pub struct XmitParams {
    pub txdelay: AtomicU8,
    pub txtail: AtomicU8,
    pub slottime: AtomicU8,
    pub persist: AtomicU8,
    pub dwait: AtomicU8,
    pub fulldup: AtomicBool,
}

impl XmitParams {
    pub fn from_config(cfg: &ChanConfig) -> Self {
        Self {
            txdelay: AtomicU8::new(cfg.txdelay),
            txtail: AtomicU8::new(cfg.txtail),
            slottime: AtomicU8::new(cfg.slottime),
            persist: AtomicU8::new(cfg.persist),
            dwait: AtomicU8::new(cfg.dwait),
            fulldup: AtomicBool::new(cfg.fulldup),
        }
    }

    pub fn set_txdelay(&self, v: u8) {
        self.txdelay.store(v, Ordering::Relaxed);
    }
    pub fn set_txtail(&self, v: u8) {
        self.txtail.store(v, Ordering::Relaxed);
    }
    pub fn set_slottime(&self, v: u8) {
        self.slottime.store(v, Ordering::Relaxed);
    }
    pub fn set_persist(&self, v: u8) {
        self.persist.store(v, Ordering::Relaxed);
    }
    pub fn set_fulldup(&self, v: bool) {
        self.fulldup.store(v, Ordering::Relaxed);
    }
}

// Who is allowed in the same transmission as whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    AprsNew,
    AprsDigi,
    Other,
}

fn frame_flavor(p: &Ax25Packet) -> Flavor {
    if p.is_aprs() {
        // Is there at least one digipeater and has the first one been
        // used? Then this is a digipeat in progress.
        if p.num_repeaters() >= 1 && p.get_h(AX25_REPEATER_1) {
            return Flavor::AprsDigi;
        }
        return Flavor::AprsNew;
    }
    Flavor::Other
}

/// The transmit side of one radio channel, owned by its worker
/// thread.
pub struct Transmitter {
    chan: usize,
    bits_per_sec: u32,
    fx25_tx: u32,
    xmit_error_rate: u8,

    params: Arc<XmitParams>,
    sender: HdlcSender,
    sink: Box<dyn BitSink>,

    tq: Arc<TransmitQueue>,
    dcd: Arc<DcdMatrix>,
    ptt: Arc<PttFabric>,
    dlq: Arc<EventQueue>,
    dev_lock: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,

    rng: rand::rngs::StdRng,
}

/// Shared handles a transmitter needs, bundled so construction sites
/// stay readable.
pub struct XmitShared {
    pub tq: Arc<TransmitQueue>,
    pub dcd: Arc<DcdMatrix>,
    pub ptt: Arc<PttFabric>,
    pub dlq: Arc<EventQueue>,
    pub running: Arc<AtomicBool>,
}

impl Transmitter {
    pub fn new(
        chan: usize,
        cfg: &ChanConfig,
        params: Arc<XmitParams>,
        sink: Box<dyn BitSink>,
        dev_lock: Arc<Mutex<()>>,
        shared: &XmitShared,
    ) -> Self {
        use rand::SeedableRng;
        Self {
            chan,
            bits_per_sec: cfg.baud,
            fx25_tx: cfg.fx25_tx,
            xmit_error_rate: cfg.xmit_error_rate,
            params,
            sender: HdlcSender::new(),
            sink,
            tq: shared.tq.clone(),
            dcd: shared.dcd.clone(),
            ptt: shared.ptt.clone(),
            dlq: shared.dlq.clone(),
            dev_lock,
            running: shared.running.clone(),
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    fn ms_to_bits(&self, ms: u64) -> u64 {
        ms * self.bits_per_sec as u64 / 1000
    }

    fn bits_to_ms(&self, bits: u64) -> u64 {
        bits * 1000 / self.bits_per_sec as u64
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // Channel is busy when any decoder hears a carrier or the
    // transmit inhibit input is asserted.
    fn channel_busy(&self) -> bool {
        self.dcd.detect_any(self.chan) || self.ptt.txinh(self.chan)
    }

    /// Process this channel's queue until shutdown.
    pub fn worker_loop(mut self) {
        while self.tq.wait_while_empty(self.chan) {
            debug!("xmit channel {}: woke up", self.chan);
            while self.running() && !self.tq.is_empty(self.chan) {
                let lock = self.dev_lock.clone();
                let guard = self.wait_for_clear_channel(&lock);

                let Some((prio, pp)) = self.tq.remove_next(self.chan) else {
                    break;
                };
                match guard {
                    Some(_guard) => {
                        let max_bundle = match frame_flavor(&pp) {
                            // General agreement is that APRS digipeaters
                            // should transmit one frame at a time rather
                            // than bundling.
                            Flavor::AprsDigi => 1,
                            Flavor::AprsNew | Flavor::Other => MAX_BUNDLE,
                        };
                        if let Err(e) = self.xmit_frames(prio, pp, max_bundle) {
                            error!("xmit channel {}: {e}", self.chan);
                        }
                        // Device lock released here.
                    }
                    None => {
                        error!(
                            "Waited too long for clear channel.  Discarding packet below."
                        );
                        error!(
                            "[{}{}] {}{}",
                            self.chan,
                            if prio == Priority::High { 'H' } else { 'L' },
                            pp.format_addrs(),
                            pp.safe_info(),
                        );
                    }
                }
            }
        }
        debug!("xmit channel {}: shutting down", self.chan);
    }

    /// One keyed transmission: preamble, the given frame, any other
    /// eligible frames up to the bundle limit, postamble. Returns
    /// (frames sent, bits sent).
    fn xmit_frames(
        &mut self,
        prio: Priority,
        pp: Ax25Packet,
        max_bundle: usize,
    ) -> crate::Result<(usize, u64)> {
        self.ptt.set(OutCtl::Ptt, self.chan, true);
        self.dlq.enqueue(Event::ChannelActivity {
            chan: self.chan,
            activity: Activity::Ptt,
            status: true,
        });
        let keyed_at = Instant::now();

        let txdelay = self.params.txdelay.load(Ordering::Relaxed) as u64;
        let pre_flags = (self.ms_to_bits(txdelay * 10) / 8) as usize;
        let mut num_bits =
            self.sender
                .preamble_postamble(self.sink.as_mut(), pre_flags, false)? as u64;

        let mut num_frames = 0usize;
        let nb = self.send_one_frame(prio, &pp)?;
        num_bits += nb as u64;
        if nb > 0 {
            num_frames += 1;
        }

        // See if more frames can ride along in this transmission.
        // High priority frames still go to the head of the line.
        while num_frames < max_bundle {
            let next = self
                .tq
                .remove_next_if(self.chan, |p| frame_flavor(p) != Flavor::AprsDigi);
            let Some((prio, pp)) = next else {
                break;
            };
            let nb = self.send_one_frame(prio, &pp)?;
            num_bits += nb as u64;
            if nb > 0 {
                num_frames += 1;
            }
        }

        // Keep transmitting a little longer so the radio does not
        // chop off the end of the frame.
        let txtail = self.params.txtail.load(Ordering::Relaxed) as u64;
        let post_flags = (self.ms_to_bits(txtail * 10) / 8) as usize;
        num_bits += self
            .sender
            .preamble_postamble(self.sink.as_mut(), post_flags, true)? as u64;

        self.sink.wait()?;

        // The audio backend may buffer; hold PTT until wall clock
        // catches up with the computed duration.
        let duration = Duration::from_millis(self.bits_to_ms(num_bits));
        let elapsed = keyed_at.elapsed();
        if duration > elapsed {
            std::thread::sleep(duration - elapsed);
        }

        self.ptt.set(OutCtl::Ptt, self.chan, false);
        self.dlq.enqueue(Event::ChannelActivity {
            chan: self.chan,
            activity: Activity::Ptt,
            status: false,
        });
        Ok((num_frames, num_bits))
    }

    fn send_one_frame(&mut self, prio: Priority, pp: &Ax25Packet) -> crate::Result<usize> {
        info!(
            "[{}{}] {}{}",
            self.chan,
            if prio == Priority::High { 'H' } else { 'L' },
            pp.format_addrs(),
            pp.safe_info(),
        );

        let mut bad_fcs = false;
        if self.xmit_error_rate != 0 {
            let r: f32 = self.rng.gen();
            if self.xmit_error_rate as f32 / 100.0 > r {
                info!(
                    "Intentionally sending invalid CRC for frame above.  Xmit Error rate = {} per cent.",
                    self.xmit_error_rate
                );
                bad_fcs = true;
            }
        }

        if self.fx25_tx != 0 {
            if let Some(n) =
                fx25_send_frame(&mut self.sender, self.sink.as_mut(), pp.as_bytes(), self.fx25_tx)?
            {
                return Ok(n);
            }
            warn!("Unable to send FX.25.  Falling back to regular AX.25.");
        }
        self.sender
            .send_frame(self.sink.as_mut(), pp.as_bytes(), bad_fcs)
    }

    // Wait for the channel to be clear and grab the audio device.
    //
    // Returns the device guard, or None on timeout. Any carrier
    // detection during the random wait restarts the wait from the
    // top.
    fn wait_for_clear_channel<'a>(
        &mut self,
        lock: &'a Mutex<()>,
    ) -> Option<MutexGuard<'a, ()>> {
        let check = Duration::from_millis(WAIT_CHECK_EVERY_MS);
        let limit = WAIT_TIMEOUT_MS / WAIT_CHECK_EVERY_MS;
        let mut n = 0u64;

        if !self.params.fulldup.load(Ordering::Relaxed) {
            'wait: loop {
                while self.channel_busy() {
                    if !self.running() {
                        return None;
                    }
                    std::thread::sleep(check);
                    n += 1;
                    if n > limit {
                        return None;
                    }
                }

                // For transceivers that can't turn around fast enough
                // when using squelch and VOX.
                let dwait = self.params.dwait.load(Ordering::Relaxed) as u64;
                if dwait > 0 {
                    std::thread::sleep(Duration::from_millis(dwait * 10));
                }
                if self.channel_busy() {
                    continue 'wait;
                }

                // Random wait. Transmit sooner if anything shows up
                // in the high priority queue.
                while !self.tq.peek_high(self.chan) {
                    if !self.running() {
                        return None;
                    }
                    let slottime = self.params.slottime.load(Ordering::Relaxed) as u64;
                    std::thread::sleep(Duration::from_millis(slottime * 10));

                    if self.channel_busy() {
                        continue 'wait;
                    }
                    let r: u8 = self.rng.gen();
                    if r <= self.params.persist.load(Ordering::Relaxed) {
                        break;
                    }
                }
                break;
            }
        }

        // Two channels on one stereo device must go out one at a
        // time; we are not clever enough to mix the streams.
        loop {
            if let Ok(guard) = lock.try_lock() {
                return Some(guard);
            }
            if !self.running() {
                return None;
            }
            std::thread::sleep(check);
            n += 1;
            if n > limit {
                return None;
            }
        }
    }
}

/// Start one transmit worker per radio channel.
///
/// `transmitters` were built by the caller because the audio sink
/// wiring differs between production and tests.
pub fn xmit_init(transmitters: Vec<Transmitter>) -> Vec<JoinHandle<()>> {
    transmitters
        .into_iter()
        .map(|t| {
            let name = format!("xmit-chan{}", t.chan);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || t.worker_loop())
                .expect("could not create xmit thread")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptt::ControlLine;
    use crate::Result;

    // Counts bits and frame boundaries instead of making sound.
    struct CountingSink {
        bits: Arc<Mutex<u64>>,
    }

    impl BitSink for CountingSink {
        fn put_bit(&mut self, _line_bit: u8) -> Result<()> {
            *self.bits.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct PttRecorder(Arc<Mutex<Vec<bool>>>);

    impl ControlLine for PttRecorder {
        fn set(&mut self, state: bool) -> Result<()> {
            self.0.lock().unwrap().push(state);
            Ok(())
        }
    }

    struct Rig {
        tq: Arc<TransmitQueue>,
        dcd: Arc<DcdMatrix>,
        running: Arc<AtomicBool>,
        ptt_events: Arc<Mutex<Vec<bool>>>,
        bits: Arc<Mutex<u64>>,
        handle: JoinHandle<()>,
    }

    fn rig(cfg: ChanConfig) -> Rig {
        let tq = Arc::new(TransmitQueue::new(1));
        let dcd = Arc::new(DcdMatrix::new(vec![1]));
        let dlq = Arc::new(EventQueue::new());
        let running = Arc::new(AtomicBool::new(true));
        let ptt_events = Arc::new(Mutex::new(Vec::new()));
        let mut fabric = PttFabric::new(1);
        fabric.add_line(OutCtl::Ptt, 0, Box::new(PttRecorder(ptt_events.clone())));
        let ptt = Arc::new(fabric);
        let bits = Arc::new(Mutex::new(0));
        let shared = XmitShared {
            tq: tq.clone(),
            dcd: dcd.clone(),
            ptt,
            dlq,
            running: running.clone(),
        };
        let params = Arc::new(XmitParams::from_config(&cfg));
        let t = Transmitter::new(
            0,
            &cfg,
            params,
            Box::new(CountingSink { bits: bits.clone() }),
            Arc::new(Mutex::new(())),
            &shared,
        );
        let handle = std::thread::spawn(move || t.worker_loop());
        Rig {
            tq,
            dcd,
            running,
            ptt_events,
            bits,
            handle,
        }
    }

    fn fast_cfg() -> ChanConfig {
        ChanConfig {
            txdelay: 2,
            txtail: 1,
            slottime: 1,
            persist: 255,
            ..ChanConfig::default()
        }
    }

    fn stop(r: Rig) {
        r.running.store(false, Ordering::Relaxed);
        r.tq.shutdown();
        r.handle.join().unwrap();
    }

    fn pkt(text: &str) -> Ax25Packet {
        Ax25Packet::from_text(text).unwrap()
    }

    fn ptt_cycles(events: &[bool]) -> usize {
        events.windows(2).filter(|w| w == &[true, false]).count()
    }

    #[test]
    fn flavor_classification() {
        assert_eq!(
            frame_flavor(&pkt("A>B,WIDE1-1*:digipeated")),
            Flavor::AprsDigi
        );
        assert_eq!(frame_flavor(&pkt("A>B,WIDE1-1:not yet")), Flavor::AprsNew);
        assert_eq!(frame_flavor(&pkt("A>B:no path")), Flavor::AprsNew);
    }

    // With persist 255 and a clear channel, transmission begins
    // within roughly one slot time.
    #[test]
    fn persist_255_transmits_promptly() -> Result<()> {
        let r = rig(fast_cfg());
        let started = Instant::now();
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:prompt"))?;
        loop {
            if !r.ptt_events.lock().unwrap().is_empty() {
                break;
            }
            assert!(
                started.elapsed() < Duration::from_millis(2000),
                "no PTT within two seconds"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        stop(r);
        Ok(())
    }

    // Three low priority frames, clear channel: exactly one PTT
    // cycle with all three frames inside.
    #[test]
    fn bundles_in_one_keyup() -> Result<()> {
        let cfg = fast_cfg();
        let r = rig(cfg.clone());
        // Queue before the worker can grab the first one: the worker
        // waits a slot time first.
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:one"))?;
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:two"))?;
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:three"))?;
        std::thread::sleep(Duration::from_millis(1500));
        let events = r.ptt_events.lock().unwrap().clone();
        assert_eq!(events, vec![true, false], "expected exactly one PTT cycle");

        // Check the arithmetic: preamble + three frames + postamble.
        let mut sender = HdlcSender::new();
        let mut check = crate::hdlc_framer::BitVecSink::new();
        let mut want = sender.preamble_postamble(&mut check, 2 * 10 * 1200 / 1000 / 8, false)?;
        for t in ["N0CALL>TEST:one", "N0CALL>TEST:two", "N0CALL>TEST:three"] {
            want += sender.send_frame(&mut check, pkt(t).as_bytes(), false)?;
        }
        want += sender.preamble_postamble(&mut check, 10 * 1200 / 1000 / 8, false)?;
        assert_eq!(*r.bits.lock().unwrap(), want as u64);
        stop(r);
        Ok(())
    }

    // A digipeated frame is never bundled with anything.
    #[test]
    fn digipeat_goes_alone() -> Result<()> {
        let r = rig(fast_cfg());
        r.tq.append(0, Priority::High, pkt("A>B,WIDE1-1*:digipeat"))?;
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:later one"))?;
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:later two"))?;
        std::thread::sleep(Duration::from_millis(2500));
        let events = r.ptt_events.lock().unwrap().clone();
        // Digipeat alone, then the two others bundled.
        assert_eq!(
            events,
            vec![true, false, true, false],
            "expected two PTT cycles"
        );
        stop(r);
        Ok(())
    }

    // DCD asserted: nothing goes out until it clears.
    #[test]
    fn busy_channel_defers() -> Result<()> {
        let r = rig(fast_cfg());
        r.dcd.dcd_change(0, 0, 0, true);
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:deferred"))?;
        std::thread::sleep(Duration::from_millis(300));
        assert!(
            r.ptt_events.lock().unwrap().is_empty(),
            "transmitted while channel busy"
        );
        r.dcd.dcd_change(0, 0, 0, false);
        std::thread::sleep(Duration::from_millis(1000));
        assert_eq!(ptt_cycles(&r.ptt_events.lock().unwrap()), 1);
        stop(r);
        Ok(())
    }

    // Full duplex skips the carrier check entirely.
    #[test]
    fn fulldup_ignores_dcd() -> Result<()> {
        let mut cfg = fast_cfg();
        cfg.fulldup = true;
        let r = rig(cfg);
        r.dcd.dcd_change(0, 0, 0, true);
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:fulldup"))?;
        std::thread::sleep(Duration::from_millis(800));
        assert_eq!(ptt_cycles(&r.ptt_events.lock().unwrap()), 1);
        stop(r);
        Ok(())
    }

    // The 60 second stuck carrier timeout discards the head frame.
    // Takes over a minute, so not part of the normal test run.
    #[test]
    #[ignore]
    fn stuck_carrier_times_out() -> Result<()> {
        let r = rig(fast_cfg());
        r.dcd.dcd_change(0, 0, 0, true);
        r.tq.append(0, Priority::Low, pkt("N0CALL>TEST:doomed"))?;
        std::thread::sleep(Duration::from_millis(WAIT_TIMEOUT_MS + 5000));
        assert!(r.ptt_events.lock().unwrap().is_empty());
        assert!(r.tq.is_empty(0), "timed out frame still queued");
        stop(r);
        Ok(())
    }
}
