/*! HDLC deframer.

Extracts frame candidates from a stream of demodulated bits. One
state machine instance runs per (channel, subchannel, slicer), so
several decoders can compete on the same audio.

The decoder is purely feed forward: one bit in, zero or one candidate
out. A candidate is the raw (pre NRZI) bit buffer between two flags;
FCS checking and any single bit repair happen later, in the
dispatcher, so they can work on the raw bits.
 */
use crate::rrbb::Rrbb;
use crate::{AX25_MAX_PACKET_LEN, AX25_MIN_PACKET_LEN};

/// Smallest candidate worth validating: a minimum packet plus FCS.
pub const MIN_FRAME_LEN: usize = AX25_MIN_PACKET_LEN + 2;

/// Largest frame kept: a maximum packet plus FCS. Longer candidates
/// are truncated and will fail the FCS check.
pub const MAX_FRAME_LEN: usize = AX25_MAX_PACKET_LEN + 2;

/// Decoder state for one (channel, subchannel, slicer).
pub struct HdlcState {
    chan: usize,
    subchan: usize,
    slice: usize,

    // Previous raw bit, for undoing NRZI.
    prev_raw: u8,

    // The last eight data bits, LSB first, for spotting the flag
    // pattern 0x7e and the abort pattern 0xfe.
    pat_det: u8,

    // Octet accumulator and the number of bits in it. -1 means bits
    // are not being accumulated (before the first flag, or after an
    // abort).
    oacc: u8,
    olen: i32,

    // Completed octets of the frame in progress.
    frame_buf: Vec<u8>,

    // Raw bits of the frame in progress, for the fixup retry.
    rrbb: Rrbb,
}

impl HdlcState {
    pub fn new(chan: usize, subchan: usize, slice: usize) -> Self {
        Self {
            chan,
            subchan,
            slice,
            prev_raw: 0,
            pat_det: 0,
            oacc: 0,
            olen: -1,
            frame_buf: Vec::with_capacity(MAX_FRAME_LEN),
            rrbb: Rrbb::new(chan, subchan, slice, false),
        }
    }

    /// Process one bit from the demodulator.
    ///
    /// Returns the data bit after NRZI decoding, which the caller
    /// also feeds to the FX.25 decoder, and possibly a complete
    /// candidate for the dispatcher.
    pub fn rec_bit(&mut self, raw: u8, is_scrambled: bool) -> (u8, Option<Rrbb>) {
        // A '0' is represented by an inversion since the previous
        // bit, a '1' by no change.
        let dbit = (raw == self.prev_raw) as u8;
        self.prev_raw = raw;

        // Octets are sent LSB first, so shift the detector right.
        self.pat_det >>= 1;
        if dbit != 0 {
            self.pat_det |= 0x80;
        }

        self.rrbb.append_bit(raw);

        let mut candidate = None;

        if self.pat_det == 0x7e {
            // Flag. The eight raw bits just collected belong to it,
            // not to the frame.
            self.rrbb.chop8();

            if self.rrbb.len() >= MIN_FRAME_LEN * 8 {
                let mut done = Rrbb::new(self.chan, self.subchan, self.slice, is_scrambled);
                std::mem::swap(&mut done, &mut self.rrbb);
                candidate = Some(done);
            } else {
                self.rrbb.clear(is_scrambled);
            }

            self.olen = 0;
            self.frame_buf.clear();

            // Last bit of the flag seeds the NRZI decode of the next
            // frame's first data bit.
            self.rrbb.append_bit(self.prev_raw);
        } else if self.pat_det == 0xfe {
            // Seven ones in a row is never valid data. Loss of
            // signal; discard anything in progress.
            self.olen = -1;
            self.frame_buf.clear();
            self.rrbb.clear(is_scrambled);
        } else if (self.pat_det & 0xfc) == 0x7c {
            // Five ones followed by a zero: the zero was added for
            // bit stuffing. Drop it.
        } else if self.olen >= 0 {
            self.oacc >>= 1;
            if dbit != 0 {
                self.oacc |= 0x80;
            }
            self.olen += 1;

            if self.olen == 8 {
                self.olen = 0;
                if self.frame_buf.len() < MAX_FRAME_LEN {
                    self.frame_buf.push(self.oacc);
                }
            }
        }

        (dbit, candidate)
    }

    /// Octets assembled so far for the frame in progress.
    pub fn frame_len(&self) -> usize {
        self.frame_buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdlc_framer::{BitVecSink, HdlcSender};
    use crate::retry::{decode_candidate, SanityFilter};
    use crate::Result;

    fn feed(h: &mut HdlcState, bits: &[u8]) -> Vec<Rrbb> {
        let mut out = Vec::new();
        for &b in bits {
            if let (_, Some(c)) = h.rec_bit(b, false) {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn serialize_then_deframe_is_identity() -> Result<()> {
        let payload = b"just some link layer payload bits";
        let mut sender = HdlcSender::new();
        let mut sink = BitVecSink::new();
        // Flags around the frame so the decoder can sync.
        sender.preamble_postamble(&mut sink, 4, false)?;
        sender.send_frame(&mut sink, payload, false)?;
        sender.preamble_postamble(&mut sink, 2, false)?;

        let mut h = HdlcState::new(0, 0, 0);
        let candidates = feed(&mut h, &sink.bits);
        assert_eq!(candidates.len(), 1);
        let got = decode_candidate(&candidates[0], 0, SanityFilter::None, false)
            .expect("candidate should decode");
        assert_eq!(got.frame, payload.to_vec());
        Ok(())
    }

    #[test]
    fn short_candidate_discarded() -> Result<()> {
        let mut sender = HdlcSender::new();
        let mut sink = BitVecSink::new();
        sender.preamble_postamble(&mut sink, 2, false)?;
        sender.send_frame(&mut sink, b"tiny", false)?;
        sender.preamble_postamble(&mut sink, 2, false)?;

        let mut h = HdlcState::new(0, 0, 0);
        assert!(feed(&mut h, &sink.bits).is_empty());
        Ok(())
    }

    #[test]
    fn abort_discards_frame() -> Result<()> {
        let payload = b"a frame that will be torn by an abort";
        let mut sender = HdlcSender::new();
        let mut sink = BitVecSink::new();
        sender.preamble_postamble(&mut sink, 2, false)?;
        sender.send_frame(&mut sink, payload, false)?;

        // Inject eight identical raw bits mid frame. After NRZI they
        // decode as eight ones, the abort pattern.
        let mut bits = sink.bits.clone();
        let at = 40;
        let level = bits[at - 1];
        for _ in 0..8 {
            bits.insert(at, level);
        }

        let mut h = HdlcState::new(0, 0, 0);
        for c in feed(&mut h, &bits) {
            // Anything that still comes out must not carry the payload.
            if let Some(d) = decode_candidate(&c, 0, SanityFilter::None, false) {
                assert_ne!(d.frame, payload.to_vec());
            }
        }
        Ok(())
    }

    #[test]
    fn consecutive_frames_share_flags() -> Result<()> {
        let mut sender = HdlcSender::new();
        let mut sink = BitVecSink::new();
        sender.preamble_postamble(&mut sink, 2, false)?;
        for payload in [&b"first frame payload bits"[..], &b"second frame payload bits"[..]] {
            sender.send_frame(&mut sink, payload, false)?;
        }
        sender.preamble_postamble(&mut sink, 2, false)?;

        let mut h = HdlcState::new(0, 0, 0);
        let candidates = feed(&mut h, &sink.bits);
        assert_eq!(candidates.len(), 2);
        Ok(())
    }

    #[test]
    fn oversize_frame_truncated_without_panic() -> Result<()> {
        let mut sender = HdlcSender::new();
        let mut sink = BitVecSink::new();
        sender.preamble_postamble(&mut sink, 2, false)?;
        // Way over MAX_FRAME_LEN.
        sender.send_frame(&mut sink, &vec![0x55u8; MAX_FRAME_LEN * 2], false)?;
        sender.preamble_postamble(&mut sink, 2, false)?;

        let mut h = HdlcState::new(0, 0, 0);
        for c in feed(&mut h, &sink.bits) {
            assert!(decode_candidate(&c, 0, SanityFilter::None, false).is_none());
        }
        Ok(())
    }
}
