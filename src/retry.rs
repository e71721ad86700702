/*! Candidate validation and single bit repair.

A candidate arrives as raw bits between two flags. Undo NRZI, remove
the stuffing, assemble octets and check the FCS. When the FCS fails
and a fix budget is configured, retry with every single bit inverted
in turn; a repaired frame must also pass a sanity filter so random
bit flips cannot manufacture plausible garbage.
 */
use crate::ax25::Ax25Packet;
use crate::fcs::fcs_check;
use crate::hdlc_deframer::{MAX_FRAME_LEN, MIN_FRAME_LEN};
use crate::rrbb::Rrbb;

/// Effort spent getting a valid frame out of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Frame was good as received.
    None,
    /// Number of bits inverted for regular AX.25.
    BitsFixed(u32),
    /// Delivered despite a failed check, because `passall` is set.
    PassAll,
    /// Number of bytes corrected by Reed-Solomon for FX.25.
    RsCorrected(u32),
}

impl Retry {
    /// Comparable effort level, lower is better.
    pub fn effort(&self) -> u32 {
        match self {
            Retry::None => 0,
            Retry::BitsFixed(n) => *n,
            Retry::RsCorrected(n) => *n,
            Retry::PassAll => 99,
        }
    }
}

/// Which decoded frames are believable enough to deliver after a
/// repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SanityFilter {
    /// Addresses must be valid and the info field printable, the way
    /// APRS traffic looks.
    #[default]
    Aprs,
    /// Addresses must be structurally valid AX.25.
    Ax25,
    /// Anything that checks out.
    None,
}

/// A validated candidate.
#[derive(Debug)]
pub struct Decoded {
    /// Frame body without the FCS.
    pub frame: Vec<u8>,
    pub retries: Retry,
    /// False only for `passall` deliveries.
    pub crc_ok: bool,
}

/// Try to turn a raw bit candidate into a frame.
///
/// `fix_bits` is the number of bits we are allowed to invert; only 0
/// and 1 are meaningful, larger budgets are clamped to single bit
/// repair. With `passall`, a candidate of believable length is
/// delivered even when everything failed, marked accordingly.
pub fn decode_candidate(
    rrbb: &Rrbb,
    fix_bits: u32,
    sanity: SanityFilter,
    passall: bool,
) -> Option<Decoded> {
    // As received.
    if let Some(frame) = bits_to_frame(rrbb, None) {
        if fcs_check(&frame) {
            return Some(Decoded {
                frame: strip_fcs(frame),
                retries: Retry::None,
                crc_ok: true,
            });
        }
    }

    if fix_bits >= 1 {
        for flip in 0..rrbb.len() {
            let Some(frame) = bits_to_frame(rrbb, Some(flip)) else {
                continue;
            };
            if fcs_check(&frame) {
                let frame = strip_fcs(frame);
                if sane(&frame, sanity) {
                    return Some(Decoded {
                        frame,
                        retries: Retry::BitsFixed(1),
                        crc_ok: true,
                    });
                }
            }
        }
    }

    if passall {
        if let Some(frame) = bits_to_frame(rrbb, None) {
            if frame.len() >= MIN_FRAME_LEN {
                return Some(Decoded {
                    frame: strip_fcs(frame),
                    retries: Retry::PassAll,
                    crc_ok: false,
                });
            }
        }
    }

    None
}

fn strip_fcs(mut frame: Vec<u8>) -> Vec<u8> {
    frame.truncate(frame.len() - 2);
    frame
}

// NRZI decode and destuff the candidate into octets, FCS included.
// Bit 0 of the buffer is the seed (the last bit of the opening flag),
// not data. `flip` optionally inverts one raw bit.
fn bits_to_frame(rrbb: &Rrbb, flip: Option<usize>) -> Option<Vec<u8>> {
    if rrbb.len() < 2 {
        return None;
    }
    let get = |i: usize| rrbb.get_bit(i) ^ (flip == Some(i)) as u8;

    let mut frame: Vec<u8> = Vec::with_capacity(MAX_FRAME_LEN);
    let mut prev = get(0);
    let mut ones = 0u32;
    let mut oacc = 0u8;
    let mut olen = 0u32;

    for i in 1..rrbb.len() {
        let raw = get(i);
        let dbit = (raw == prev) as u8;
        prev = raw;

        if dbit != 0 {
            ones += 1;
            if ones > 5 {
                // Would have been seen as a flag or abort.
                return None;
            }
        } else {
            if ones == 5 {
                // Stuffed bit, drop it.
                ones = 0;
                continue;
            }
            ones = 0;
        }

        oacc >>= 1;
        if dbit != 0 {
            oacc |= 0x80;
        }
        olen += 1;
        if olen == 8 {
            olen = 0;
            if frame.len() >= MAX_FRAME_LEN {
                return None;
            }
            frame.push(oacc);
        }
    }

    // A real frame destuffs to a whole number of octets.
    if olen != 0 {
        return None;
    }
    if frame.len() < MIN_FRAME_LEN || frame.len() > MAX_FRAME_LEN {
        return None;
    }
    Some(frame)
}

// Would we believe this repaired frame?
fn sane(frame: &[u8], filter: SanityFilter) -> bool {
    match filter {
        SanityFilter::None => true,
        SanityFilter::Ax25 => Ax25Packet::from_frame_bytes(frame.to_vec())
            .map(|p| p.check_addresses())
            .unwrap_or(false),
        SanityFilter::Aprs => {
            let Ok(p) = Ax25Packet::from_frame_bytes(frame.to_vec()) else {
                return false;
            };
            if !p.check_addresses() || !p.is_aprs() {
                return false;
            }
            p.info()
                .iter()
                .all(|&b| (0x20..=0x7e).contains(&b) || b == b'\r' || b == b'\n')
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdlc_framer::{BitVecSink, HdlcSender};
    use crate::Result;

    // Serialize a frame and capture the raw bits between the flags,
    // with the final flag bit kept as the seed.
    fn candidate_for(payload: &[u8]) -> Result<Rrbb> {
        let mut sender = HdlcSender::new();
        let mut sink = BitVecSink::new();
        sender.preamble_postamble(&mut sink, 1, false)?;
        sender.send_frame(&mut sink, payload, false)?;
        // Strip preamble flag (8), opening flag minus seed (7), and
        // the closing flag (8).
        let inner = &sink.bits[8 + 7..sink.bits.len() - 8];
        let mut rrbb = Rrbb::new(0, 0, 0, false);
        for &b in inner {
            rrbb.append_bit(b);
        }
        Ok(rrbb)
    }

    #[test]
    fn clean_candidate_decodes() -> Result<()> {
        let payload = b"some reasonable payload, long enough to be a frame";
        let rrbb = candidate_for(payload)?;
        let d = decode_candidate(&rrbb, 0, SanityFilter::None, false).unwrap();
        assert_eq!(d.frame, payload.to_vec());
        assert_eq!(d.retries, Retry::None);
        assert!(d.crc_ok);
        Ok(())
    }

    #[test]
    fn one_bad_bit_rejected_without_budget() -> Result<()> {
        let payload = b"some reasonable payload, long enough to be a frame";
        let mut rrbb = candidate_for(payload)?;
        rrbb.flip_bit(100);
        assert!(decode_candidate(&rrbb, 0, SanityFilter::None, false).is_none());
        Ok(())
    }

    #[test]
    fn one_bad_bit_repaired_with_budget() -> Result<()> {
        let payload = b"some reasonable payload, long enough to be a frame";
        let mut rrbb = candidate_for(payload)?;
        rrbb.flip_bit(100);
        let d = decode_candidate(&rrbb, 1, SanityFilter::None, false).unwrap();
        assert_eq!(d.frame, payload.to_vec());
        assert_eq!(d.retries, Retry::BitsFixed(1));
        Ok(())
    }

    #[test]
    fn aprs_sanity_blocks_ui_less_repair() -> Result<()> {
        // Payload is not a valid APRS frame, so a repaired version
        // must not pass the APRS filter.
        let payload = b"some reasonable payload, long enough to be a frame";
        let mut rrbb = candidate_for(payload)?;
        rrbb.flip_bit(100);
        assert!(decode_candidate(&rrbb, 1, SanityFilter::Aprs, false).is_none());
        Ok(())
    }

    #[test]
    fn passall_delivers_marked() -> Result<()> {
        let payload = b"some reasonable payload, long enough to be a frame";
        let mut rrbb = candidate_for(payload)?;
        rrbb.flip_bit(100);
        let d = decode_candidate(&rrbb, 0, SanityFilter::None, true).unwrap();
        assert_eq!(d.retries, Retry::PassAll);
        assert!(!d.crc_ok);
        Ok(())
    }

    #[test]
    fn effort_ordering() {
        assert!(Retry::None.effort() < Retry::BitsFixed(1).effort());
        assert!(Retry::BitsFixed(1).effort() < Retry::PassAll.effort());
    }
}
