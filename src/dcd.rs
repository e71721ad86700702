/*! Data carrier detect aggregation.

Every (subchannel, slicer) decoder reports its own carrier state.
The channel is considered busy when ANY of them hears something, so
with multiple decoders running against the same audio the transmit
logic stays polite as long as one of them still has a signal. One
extra subchannel slot is reserved for an external DTMF detector.

Writes are atomic per word. Readers are the transmit threads, which
re-poll anyway, so a transiently stale read is harmless.
 */
use std::sync::atomic::{AtomicU16, Ordering};

use crate::{MAX_SLICERS, MAX_SUBCHANS};

/// Slot index used by the DTMF detector.
pub const DTMF_SUBCHAN: usize = MAX_SUBCHANS;

/// Per channel bitmap over (subchannel x slicer).
pub struct DcdMatrix {
    // One word per subchannel, one bit per slicer.
    chans: Vec<[AtomicU16; MAX_SUBCHANS + 1]>,
    num_subchan: Vec<usize>,
}

impl DcdMatrix {
    /// `num_subchan` holds the configured subchannel count per channel.
    pub fn new(num_subchan: Vec<usize>) -> Self {
        Self {
            chans: (0..num_subchan.len())
                .map(|_| std::array::from_fn(|_| AtomicU16::new(0)))
                .collect(),
            num_subchan,
        }
    }

    /// Record a carrier state change from one decoder.
    ///
    /// Returns the new channel level state if the aggregate changed,
    /// so the caller can update the DCD indicator line and post a
    /// channel activity event.
    pub fn dcd_change(&self, chan: usize, subchan: usize, slice: usize, state: bool) -> Option<bool> {
        assert!(subchan <= DTMF_SUBCHAN);
        assert!(slice < MAX_SLICERS);

        let old = self.detect_any(chan);
        let word = &self.chans[chan][subchan];
        if state {
            word.fetch_or(1 << slice, Ordering::Relaxed);
        } else {
            word.fetch_and(!(1 << slice), Ordering::Relaxed);
        }
        let new = self.detect_any(chan);

        (new != old).then_some(new)
    }

    /// Is the radio channel currently busy with a signal?
    ///
    /// True if any decoder for this channel, or the DTMF slot, hears
    /// something. The transmit logic combines this with the transmit
    /// inhibit input before deciding the channel is clear.
    pub fn detect_any(&self, chan: usize) -> bool {
        let row = &self.chans[chan];
        for sc in 0..self.num_subchan[chan] {
            if row[sc].load(Ordering::Relaxed) != 0 {
                return true;
            }
        }
        row[DTMF_SUBCHAN].load(Ordering::Relaxed) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_bit_sets_channel() {
        let m = DcdMatrix::new(vec![3, 1]);
        assert!(!m.detect_any(0));
        assert_eq!(m.dcd_change(0, 2, 5, true), Some(true));
        assert!(m.detect_any(0));
        // Another bit on the same channel does not change the aggregate.
        assert_eq!(m.dcd_change(0, 0, 0, true), None);
        assert_eq!(m.dcd_change(0, 2, 5, false), None);
        assert_eq!(m.dcd_change(0, 0, 0, false), Some(false));
        assert!(!m.detect_any(0));
    }

    #[test]
    fn channels_independent() {
        let m = DcdMatrix::new(vec![1, 1]);
        m.dcd_change(1, 0, 0, true);
        assert!(!m.detect_any(0));
        assert!(m.detect_any(1));
    }

    #[test]
    fn dtmf_slot_counts() {
        let m = DcdMatrix::new(vec![1]);
        assert_eq!(m.dcd_change(0, DTMF_SUBCHAN, 0, true), Some(true));
        assert!(m.detect_any(0));
    }

    #[test]
    fn clearing_unused_bit_is_noop() {
        let m = DcdMatrix::new(vec![2]);
        assert_eq!(m.dcd_change(0, 1, 3, false), None);
        assert!(!m.detect_any(0));
    }
}
