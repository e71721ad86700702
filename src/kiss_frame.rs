/*! KISS protocol framing.

<https://en.wikipedia.org/wiki/KISS_(amateur_radio_protocol)>

Frames are delimited by FEND bytes, with FESC escapes inside. The
byte after the opening FEND carries the channel in the high nibble
and a command in the low nibble: 0 is data, 1..6 set transmit
parameters at run time.
 */
use crate::{Error, Result};

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// Longest sensible KISS frame; anything bigger is a framing error.
const MAX_LEN: usize = 2048;

/// Wrap a received frame for delivery to a client.
#[must_use]
pub fn encode(chan: u8, payload: &[u8]) -> Vec<u8> {
    // Add a little capacity to leave room for escapes.
    let mut ret = Vec::with_capacity((3 + payload.len()) * 110 / 100);
    ret.push(FEND);
    ret.push((chan & 0x0f) << 4);
    for &b in payload {
        match b {
            FEND => ret.extend([FESC, TFEND]),
            FESC => ret.extend([FESC, TFESC]),
            b => ret.push(b),
        }
    }
    ret.push(FEND);
    ret
}

/// Undo the FESC escapes.
pub fn unescape(data: &[u8]) -> Result<Vec<u8>> {
    let mut unescaped = Vec::with_capacity(data.len());
    let mut is_escaped = false;
    for &byte in data {
        if is_escaped {
            unescaped.push(match byte {
                TFESC => FESC,
                TFEND => FEND,
                other => {
                    return Err(Error::msg(format!("invalid KISS escape byte {other:02x}")));
                }
            });
            is_escaped = false;
        } else if byte == FESC {
            is_escaped = true;
        } else if byte == FEND {
            return Err(Error::msg("FEND in the middle of a KISS frame"));
        } else {
            unescaped.push(byte);
        }
    }
    if is_escaped {
        Err(Error::msg("KISS frame ended on an escape"))
    } else {
        Ok(unescaped)
    }
}

/// One parsed frame from a client.
#[derive(Debug, PartialEq, Eq)]
pub enum KissCmd {
    /// Transmit this frame on the given channel.
    Data { chan: u8, payload: Vec<u8> },
    TxDelay { chan: u8, value: u8 },
    Persist { chan: u8, value: u8 },
    SlotTime { chan: u8, value: u8 },
    TxTail { chan: u8, value: u8 },
    FullDuplex { chan: u8, value: u8 },
    SetHardware { chan: u8, data: Vec<u8> },
}

/// Interpret the content between two FENDs.
pub fn decode(raw: &[u8]) -> Result<KissCmd> {
    let bytes = unescape(raw)?;
    let Some((&first, rest)) = bytes.split_first() else {
        return Err(Error::msg("empty KISS frame"));
    };
    let chan = (first >> 4) & 0x0f;
    let cmd = first & 0x0f;
    let one = || -> Result<u8> {
        rest.first()
            .copied()
            .ok_or_else(|| Error::msg(format!("KISS command {cmd:x} without a value")))
    };
    Ok(match cmd {
        0 => KissCmd::Data {
            chan,
            payload: rest.to_vec(),
        },
        1 => KissCmd::TxDelay { chan, value: one()? },
        2 => KissCmd::Persist { chan, value: one()? },
        3 => KissCmd::SlotTime { chan, value: one()? },
        4 => KissCmd::TxTail { chan, value: one()? },
        5 => KissCmd::FullDuplex { chan, value: one()? },
        6 => KissCmd::SetHardware {
            chan,
            data: rest.to_vec(),
        },
        other => return Err(Error::msg(format!("unsupported KISS command {other:x}"))),
    })
}

#[derive(Default)]
enum FrameState {
    #[default]
    Unsynced,
    Synced(Vec<u8>),
}

/// Accumulate a byte stream into frames. Content is returned still
/// escaped; run it through [`decode`].
#[derive(Default)]
pub struct KissAssembler {
    state: FrameState,
}

impl KissAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, collecting any complete frames.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<Vec<u8>>) {
        for &byte in data {
            let old_state = std::mem::replace(&mut self.state, FrameState::Unsynced);
            self.state = match old_state {
                FrameState::Unsynced => {
                    if byte == FEND {
                        FrameState::Synced(Vec::new())
                    } else {
                        FrameState::Unsynced
                    }
                }
                FrameState::Synced(mut v) => {
                    if byte == FEND {
                        if !v.is_empty() {
                            out.push(v);
                        }
                        FrameState::Synced(Vec::new())
                    } else if v.len() >= MAX_LEN {
                        FrameState::Unsynced
                    } else {
                        v.push(byte);
                        FrameState::Synced(v)
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_empty() {
        assert_eq!(encode(0, &[]), &[FEND, 0, FEND]);
    }

    #[test]
    fn encode_escapes() {
        let got = encode(1, b"fo\xC0o\xDB");
        let want = [
            FEND, 0x10, b'f', b'o', FESC, TFEND, b'o', FESC, TFESC, FEND,
        ];
        assert_eq!(got, want);
    }

    #[test]
    fn decode_data_frame() -> Result<()> {
        let cmd = decode(b"\x30foo\xDB\xDCA\xDB\xDD")?;
        assert_eq!(
            cmd,
            KissCmd::Data {
                chan: 3,
                payload: b"foo\xC0A\xDB".to_vec()
            }
        );
        Ok(())
    }

    #[test]
    fn decode_set_hardware_params() -> Result<()> {
        assert_eq!(decode(&[0x01, 40])?, KissCmd::TxDelay { chan: 0, value: 40 });
        assert_eq!(decode(&[0x12, 128])?, KissCmd::Persist { chan: 1, value: 128 });
        assert_eq!(decode(&[0x05, 1])?, KissCmd::FullDuplex { chan: 0, value: 1 });
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x0f, 1]).is_err());
        assert!(decode(&[0x01]).is_err());
        assert!(unescape(&[FESC, 0x00]).is_err());
        assert!(unescape(&[FESC]).is_err());
    }

    #[test]
    fn assembler_finds_frames() {
        let mut a = KissAssembler::new();
        let mut out = Vec::new();
        a.feed(&[0x55, FEND, 0x00, 1, 2], &mut out);
        assert!(out.is_empty());
        a.feed(&[3, FEND], &mut out);
        assert_eq!(out, vec![vec![0x00, 1, 2, 3]]);

        // Back to back frames share a FEND; empty frames are skipped.
        out.clear();
        a.feed(&[FEND, FEND, 0x00, 9, FEND], &mut out);
        assert_eq!(out, vec![vec![0x00, 9]]);
    }

    #[test]
    fn roundtrip_through_assembler() -> Result<()> {
        let payload = b"payload with \xC0 and \xDB inside".to_vec();
        let wire = encode(2, &payload);
        let mut a = KissAssembler::new();
        let mut out = Vec::new();
        a.feed(&wire, &mut out);
        assert_eq!(out.len(), 1);
        match decode(&out[0])? {
            KissCmd::Data { chan, payload: p } => {
                assert_eq!(chan, 2);
                assert_eq!(p, payload);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }
}
