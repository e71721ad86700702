/*! Transmit packet queues.

Each radio channel has two FIFOs. Packets being digipeated go in the
high priority queue so they go out first; everything else, including
anything a client application wants transmitted, goes in the low
priority queue and waits its turn behind the persistence algorithm.

Producers append and go merrily on their way; the channel's transmit
thread removes packets when the air is clear. A packet handed to
`append` is owned by the queue, and by the transmit thread after
that.
 */
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::ax25::Ax25Packet;
use crate::{Error, Result};

/// Queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Digipeated and expedited frames.
    High = 0,
    /// Originations and ordinary traffic.
    Low = 1,
}

struct Inner {
    chans: Vec<[VecDeque<Ax25Packet>; 2]>,
    shutdown: bool,
}

/// The set of per channel transmit queues.
pub struct TransmitQueue {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl TransmitQueue {
    pub fn new(num_chans: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chans: (0..num_chans)
                    .map(|_| [VecDeque::new(), VecDeque::new()])
                    .collect(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Append a packet to one channel's queue.
    pub fn append(&self, chan: usize, prio: Priority, packet: Ax25Packet) -> Result<()> {
        let mut q = self.inner.lock().unwrap();
        let chans = q.chans.len();
        let Some(c) = q.chans.get_mut(chan) else {
            return Err(Error::msg(format!(
                "transmit to invalid channel {chan}, have {chans}",
            )));
        };
        c[prio as usize].push_back(packet);
        drop(q);
        self.wake.notify_all();
        Ok(())
    }

    /// Block until this channel has something to send.
    ///
    /// Returns false when the queue has been shut down.
    pub fn wait_while_empty(&self, chan: usize) -> bool {
        let q = self.inner.lock().unwrap();
        let q = self
            .wake
            .wait_while(q, |q| {
                !q.shutdown && q.chans[chan].iter().all(|f| f.is_empty())
            })
            .unwrap();
        !q.shutdown
    }

    /// Is anything waiting in the high priority queue?
    pub fn peek_high(&self, chan: usize) -> bool {
        !self.inner.lock().unwrap().chans[chan][Priority::High as usize].is_empty()
    }

    /// Remove the next packet, high priority first.
    pub fn remove_next(&self, chan: usize) -> Option<(Priority, Ax25Packet)> {
        let mut q = self.inner.lock().unwrap();
        let c = &mut q.chans[chan];
        if let Some(p) = c[Priority::High as usize].pop_front() {
            return Some((Priority::High, p));
        }
        c[Priority::Low as usize].pop_front().map(|p| (Priority::Low, p))
    }

    /// Remove the next packet only if the predicate approves of it.
    /// Used while bundling: peek at what is available, but leave it
    /// queued when it is not eligible for this transmission.
    pub fn remove_next_if<F>(&self, chan: usize, eligible: F) -> Option<(Priority, Ax25Packet)>
    where
        F: Fn(&Ax25Packet) -> bool,
    {
        let mut q = self.inner.lock().unwrap();
        let c = &mut q.chans[chan];
        for prio in [Priority::High, Priority::Low] {
            if let Some(head) = c[prio as usize].front() {
                if eligible(head) {
                    let p = c[prio as usize].pop_front().unwrap();
                    return Some((prio, p));
                }
                // Head exists but is not eligible; the bundle ends here.
                return None;
            }
        }
        None
    }

    /// Packets waiting on one channel, both priorities.
    pub fn len(&self, chan: usize) -> usize {
        let q = self.inner.lock().unwrap();
        q.chans[chan].iter().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self, chan: usize) -> bool {
        self.len(chan) == 0
    }

    /// Wake all waiting transmit threads and make them exit.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pkt(info: &str) -> Ax25Packet {
        Ax25Packet::from_text(&format!("N0CALL>TEST:{info}")).unwrap()
    }

    #[test]
    fn high_before_low() -> Result<()> {
        let tq = TransmitQueue::new(2);
        tq.append(0, Priority::Low, pkt("low1"))?;
        tq.append(0, Priority::High, pkt("high1"))?;
        tq.append(0, Priority::Low, pkt("low2"))?;
        tq.append(0, Priority::High, pkt("high2"))?;

        let order: Vec<String> = std::iter::from_fn(|| tq.remove_next(0))
            .map(|(_, p)| String::from_utf8_lossy(p.info()).into_owned())
            .collect();
        assert_eq!(order, ["high1", "high2", "low1", "low2"]);
        Ok(())
    }

    #[test]
    fn channels_are_separate() -> Result<()> {
        let tq = TransmitQueue::new(2);
        tq.append(1, Priority::Low, pkt("other"))?;
        assert!(tq.remove_next(0).is_none());
        assert_eq!(tq.len(1), 1);
        Ok(())
    }

    #[test]
    fn invalid_channel_rejected() {
        let tq = TransmitQueue::new(1);
        assert!(tq.append(3, Priority::Low, pkt("x")).is_err());
    }

    #[test]
    fn remove_if_leaves_ineligible_head() -> Result<()> {
        let tq = TransmitQueue::new(1);
        tq.append(0, Priority::Low, pkt("stay"))?;
        assert!(tq.remove_next_if(0, |_| false).is_none());
        assert_eq!(tq.len(0), 1);
        assert!(tq.remove_next_if(0, |_| true).is_some());
        Ok(())
    }

    #[test]
    fn append_wakes_waiter() -> Result<()> {
        let tq = Arc::new(TransmitQueue::new(1));
        let tq2 = tq.clone();
        let t = std::thread::spawn(move || tq2.wait_while_empty(0));
        std::thread::sleep(Duration::from_millis(20));
        tq.append(0, Priority::Low, pkt("wake"))?;
        assert!(t.join().unwrap());
        Ok(())
    }

    #[test]
    fn shutdown_unblocks() {
        let tq = Arc::new(TransmitQueue::new(1));
        let tq2 = tq.clone();
        let t = std::thread::spawn(move || tq2.wait_while_empty(0));
        std::thread::sleep(Duration::from_millis(20));
        tq.shutdown();
        assert!(!t.join().unwrap());
    }
}
