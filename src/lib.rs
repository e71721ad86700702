/*! This crate provides a software modem and terminal node controller
(TNC) for amateur packet radio.

Audio samples come in from a sound interface, get demodulated into a
bit stream, framed into AX.25 link layer packets, and are delivered to
client applications over KISS (TCP or a pseudo terminal). Outgoing
KISS frames are queued, the channel is arbitrated with p-persistent
CSMA, and the frames are shaped into AFSK audio for transmission.

# Architecture overview

Receive side, per audio device, running on one thread per device:

```text
   [ Sample source ]
          ↓
   [ AFSK demodulator, one per subchannel,     ]
   [ with one or more slicers per demodulator  ]
          ↓ (bits)
   [ HDLC deframer ] — in parallel → [ FX.25 deframer ]
          ↓
   [ Frame dispatcher: CRC, bit fixup, pick best slicer ]
          ↓
   [ Event queue ]
```

Transmit side, one thread per radio channel:

```text
   [ Transmit queue, two priorities ]
          ↓
   [ CSMA scheduler: DCD, slot time, persistence, PTT ]
          ↓
   [ AX.25/HDLC serializer ] or [ FX.25 encoder ]
          ↓
   [ Tone generator ] → [ Sample sink ]
```

A single application thread drains the event queue, prints received
frames in monitor format, and forwards them to KISS clients.

## Links

* AX.25: <https://en.wikipedia.org/wiki/AX.25>
* KISS: <https://en.wikipedia.org/wiki/KISS_(amateur_radio_protocol)>
* FX.25: <https://en.wikipedia.org/wiki/FX.25_Forward_Error_Correction>
 */

pub mod ax25;
pub mod config;
pub mod dcd;
pub mod demod_afsk;
pub mod dlq;
pub mod fcs;
pub mod fx25;
pub mod gen_tone;
pub mod hdlc_deframer;
pub mod hdlc_framer;
pub mod kiss_frame;
pub mod kissnet;
pub mod multi_modem;
pub mod ptt;
pub mod recv;
pub mod retry;
pub mod rrbb;
pub mod tq;
pub mod xmit;

pub mod audio;

#[cfg(feature = "audio")]
pub mod audio_cpal;

/// Maximum number of audio devices.
pub const MAX_ADEVS: usize = 3;

/// Maximum number of radio channels. Each audio device carries up to
/// two channels (left and right in stereo mode).
pub const MAX_RADIO_CHANS: usize = MAX_ADEVS * 2;

/// Maximum number of demodulators ("subchannels") per radio channel.
pub const MAX_SUBCHANS: usize = 9;

/// Maximum number of slicers per subchannel, at different amplitude
/// levels, to compensate for uneven AFSK tone amplitudes.
pub const MAX_SLICERS: usize = 9;

/// Minimum AX.25 packet length: two addresses plus control.
pub const AX25_MIN_PACKET_LEN: usize = 2 * 7 + 1;

/// Maximum AX.25 packet length, not counting the FCS.
pub const AX25_MAX_PACKET_LEN: usize = 256;

/// Audio device number for a given channel.
pub const fn chan_to_adev(chan: usize) -> usize {
    chan >> 1
}

/// First channel number for a given audio device.
pub const fn adev_first_chan(adev: usize) -> usize {
    adev * 2
}

/// Error type for this crate.
#[derive(Debug, Clone)]
pub struct Error {
    msg: String,
}

impl Error {
    /// Create new error with message.
    pub fn new(msg: &str) -> Self {
        Self {
            msg: msg.to_string(),
        }
    }
    /// Create error from message.
    pub fn msg<S: Into<String>>(msg: S) -> Self {
        Self { msg: msg.into() }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "rusttnc error: {}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Error {
        Error::msg(format!("{e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::msg(format!("IO error: {e}"))
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::msg(format!("invalid number: {e}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::msg(format!("poisoned lock: {e}"))
    }
}

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parse a verbosity level for stderrlog, for use as a clap value parser.
pub fn parse_verbosity(v: &str) -> Result<usize, String> {
    match v {
        "error" => Ok(0),
        "warn" => Ok(1),
        "info" => Ok(2),
        "debug" => Ok(3),
        "trace" => Ok(4),
        x => Err(format!("invalid verbosity level {x:?}")),
    }
}
