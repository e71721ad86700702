/*! Received frame and event queue.

Every audio device has its own receive thread, but the application
wants to process frames one at a time. This queue collects frames
from all channels, plus channel activity notifications, for serial
processing by the application thread.
 */
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::{error, warn};

use crate::audio::ALevel;
use crate::ax25::Ax25Packet;
use crate::retry::Retry;

/// Type of FEC that delivered a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FecType {
    #[default]
    None,
    Fx25,
}

/// Whose transmitter made the channel busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Our own PTT.
    Ptt,
    /// Somebody else heard on the air.
    Dcd,
}

/// A received frame, with everything the application wants to know
/// about how it got here.
#[derive(Debug)]
pub struct FrameEvent {
    pub chan: usize,
    /// Winning subchannel when several decoders ran.
    pub subchan: usize,
    /// Winning slicer.
    pub slice: usize,
    pub packet: Ax25Packet,
    pub alevel: ALevel,
    pub fec_type: FecType,
    /// Effort spent getting a valid CRC.
    pub retries: Retry,
    /// One character per decoder showing which ones got it.
    pub spectrum: String,
}

/// Events consumed by the application thread.
#[derive(Debug)]
pub enum Event {
    RecFrame(Box<FrameEvent>),
    ChannelActivity {
        chan: usize,
        activity: Activity,
        status: bool,
    },
}

// If this many frames are sitting in the queue, the consumer is stuck.
const COMPLAIN_LENGTH: usize = 10;

// Allocation imbalance that smells like a leak.
const LEAK_SLACK: u64 = 50;

/// Thread safe single consumer, multi producer FIFO.
pub struct EventQueue {
    queue: Mutex<QueueInner>,
    wake: Condvar,
}

struct QueueInner {
    items: VecDeque<Event>,
    enqueued: u64,
    removed: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(QueueInner {
                items: VecDeque::new(),
                enqueued: 0,
                removed: 0,
            }),
            wake: Condvar::new(),
        }
    }

    /// Append an event and wake the consumer.
    pub fn enqueue(&self, event: Event) {
        let len = {
            let mut q = self.queue.lock().unwrap();
            q.items.push_back(event);
            q.enqueued += 1;
            if q.enqueued > q.removed + LEAK_SLACK {
                error!(
                    "event queue leak, enqueued={} removed={}",
                    q.enqueued, q.removed
                );
            }
            q.items.len()
        };
        if len > COMPLAIN_LENGTH {
            warn!("Received frame queue is out of control. Length={len}.");
            warn!("Reader thread is probably frozen.");
            warn!("This can be caused by a virtual KISS TNC (pseudo terminal) where");
            warn!("no application is reading the frames from the other side.");
        }
        self.wake.notify_one();
    }

    /// Sleep while the queue is empty rather than polling.
    ///
    /// Returns true if the timeout expired before anything arrived.
    /// `None` waits forever.
    pub fn wait_while_empty(&self, timeout: Option<Duration>) -> bool {
        let q = self.queue.lock().unwrap();
        if !q.items.is_empty() {
            return false;
        }
        match timeout {
            Some(t) => {
                let (_q, res) = self
                    .wake
                    .wait_timeout_while(q, t, |q| q.items.is_empty())
                    .unwrap();
                res.timed_out()
            }
            None => {
                let _q = self.wake.wait_while(q, |q| q.items.is_empty()).unwrap();
                false
            }
        }
    }

    /// Remove the oldest event, if any.
    pub fn remove(&self) -> Option<Event> {
        let mut q = self.queue.lock().unwrap();
        let item = q.items.pop_front();
        if item.is_some() {
            q.removed += 1;
        }
        item
    }

    /// Events currently waiting.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
