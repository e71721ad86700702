/*! AX.25 packet objects.

A packet is kept in wire format (the frame body, without FCS), with
accessors for the pieces the TNC needs: addresses, the
has-been-repeated bit of digipeaters, and the UI/APRS classification
used by the transmit bundling rules.

Address fields are seven octets: six callsign characters shifted left
one bit, then an octet holding the H bit (0x80), two reserved bits
(0x60), the SSID (0x1e) and the extension bit (0x01) marking the last
address.
 */
use crate::{AX25_MAX_PACKET_LEN, AX25_MIN_PACKET_LEN, Error, Result};

/// Index of the destination address.
pub const AX25_DESTINATION: usize = 0;
/// Index of the source address.
pub const AX25_SOURCE: usize = 1;
/// Index of the first digipeater.
pub const AX25_REPEATER_1: usize = 2;

/// Smallest and largest number of addresses in a frame.
pub const AX25_MIN_ADDRS: usize = 2;
pub const AX25_MAX_ADDRS: usize = 10;

/// Longest printable address: six characters, dash, two digit SSID.
pub const AX25_MAX_ADDR_LEN: usize = 12;

const UI_FRAME: u8 = 0x03;
const PID_NO_LAYER_3: u8 = 0xf0;

/// One AX.25 frame, in wire format without the FCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Packet {
    bytes: Vec<u8>,
}

impl Ax25Packet {
    /// Wrap a received frame body. The address structure is validated;
    /// the rest of the frame is taken as is.
    pub fn from_frame_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < AX25_MIN_PACKET_LEN {
            return Err(Error::msg(format!("frame too short: {} octets", bytes.len())));
        }
        if bytes.len() > AX25_MAX_PACKET_LEN {
            return Err(Error::msg(format!("frame too long: {} octets", bytes.len())));
        }
        let p = Self { bytes };
        let n = p.num_addr()?;
        if !(AX25_MIN_ADDRS..=AX25_MAX_ADDRS).contains(&n) {
            return Err(Error::msg(format!("bad number of addresses: {n}")));
        }
        if p.bytes.len() < 7 * n + 1 {
            return Err(Error::msg("frame ends before control octet"));
        }
        Ok(p)
    }

    /// Build a UI frame from parts. Digipeaters are (addr, has-been-repeated).
    pub fn build_ui(
        dest: &str,
        src: &str,
        repeaters: &[(&str, bool)],
        info: &[u8],
    ) -> Result<Self> {
        if repeaters.len() > AX25_MAX_ADDRS - AX25_MIN_ADDRS {
            return Err(Error::msg(format!("too many digipeaters: {}", repeaters.len())));
        }
        let mut bytes = Vec::with_capacity(AX25_MIN_PACKET_LEN + info.len());
        let last = repeaters.is_empty();
        bytes.extend(pack_addr(dest, false, false)?);
        bytes.extend(pack_addr(src, false, last)?);
        for (i, (r, h)) in repeaters.iter().enumerate() {
            bytes.extend(pack_addr(r, *h, i + 1 == repeaters.len())?);
        }
        bytes.push(UI_FRAME);
        bytes.push(PID_NO_LAYER_3);
        bytes.extend_from_slice(info);
        if bytes.len() > AX25_MAX_PACKET_LEN {
            return Err(Error::msg(format!("frame too long: {} octets", bytes.len())));
        }
        Ok(Self { bytes })
    }

    /// Build a frame from the usual monitor notation,
    /// e.g. `W1ABC-1>TEST,WIDE1-1*:payload`.
    pub fn from_text(text: &str) -> Result<Self> {
        let (head, info) = text
            .split_once(':')
            .ok_or_else(|| Error::msg(format!("no ':' in frame text {text:?}")))?;
        let (src, rest) = head
            .split_once('>')
            .ok_or_else(|| Error::msg(format!("no '>' in frame text {text:?}")))?;
        let mut path = rest.split(',');
        let dest = path
            .next()
            .ok_or_else(|| Error::msg("missing destination address"))?;
        let digis: Vec<(&str, bool)> = path
            .map(|d| match d.strip_suffix('*') {
                Some(d) => (d, true),
                None => (d, false),
            })
            .collect();
        Self::build_ui(dest, src, &digis, info.as_bytes())
    }

    /// The frame body, without FCS.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of addresses, found by scanning for the extension bit.
    pub fn num_addr(&self) -> Result<usize> {
        for n in 0..AX25_MAX_ADDRS {
            let ssid = 7 * n + 6;
            if ssid >= self.bytes.len() {
                break;
            }
            if self.bytes[ssid] & 0x01 != 0 {
                return Ok(n + 1);
            }
        }
        Err(Error::msg("no address extension bit found"))
    }

    /// Number of digipeater addresses.
    pub fn num_repeaters(&self) -> usize {
        self.num_addr().map_or(0, |n| n.saturating_sub(AX25_MIN_ADDRS))
    }

    /// Printable form of address `n`, e.g. `WB2OSZ-15`.
    pub fn get_addr(&self, n: usize) -> String {
        let field = &self.bytes[7 * n..7 * n + 7];
        let mut s = String::with_capacity(AX25_MAX_ADDR_LEN);
        for c in &field[..6] {
            let c = (c >> 1) as char;
            if c != ' ' {
                s.push(c);
            }
        }
        let ssid = (field[6] >> 1) & 0x0f;
        if ssid != 0 {
            s.push('-');
            s.push_str(&ssid.to_string());
        }
        s
    }

    /// The H ("has been repeated") bit of address `n`.
    pub fn get_h(&self, n: usize) -> bool {
        self.bytes[7 * n + 6] & 0x80 != 0
    }

    fn control_offset(&self) -> usize {
        7 * self.num_addr().unwrap_or(AX25_MIN_ADDRS)
    }

    /// Control octet. Present in every valid frame.
    pub fn control(&self) -> u8 {
        self.bytes[self.control_offset()]
    }

    /// The information field, empty when the frame has none.
    pub fn info(&self) -> &[u8] {
        let c = self.control_offset();
        // UI and I frames carry a PID octet between control and info.
        if self.control() & 0x01 == 0 || self.control() == UI_FRAME {
            self.bytes.get(c + 2..).unwrap_or(&[])
        } else {
            self.bytes.get(c + 1..).unwrap_or(&[])
        }
    }

    /// True for a UI frame with PID 0xF0, which is how APRS frames go
    /// out on the air.
    pub fn is_aprs(&self) -> bool {
        let c = self.control_offset();
        self.bytes.get(c) == Some(&UI_FRAME) && self.bytes.get(c + 1) == Some(&PID_NO_LAYER_3)
    }

    /// All addresses contain only uppercase letters and digits with an
    /// SSID in range. Used by the bit fixup sanity filter.
    pub fn check_addresses(&self) -> bool {
        let Ok(n) = self.num_addr() else {
            return false;
        };
        for a in 0..n {
            let field = &self.bytes[7 * a..7 * a + 7];
            let mut seen_space = false;
            for c in &field[..6] {
                if c & 0x01 != 0 {
                    return false;
                }
                let c = (c >> 1) as char;
                match c {
                    ' ' => seen_space = true,
                    'A'..='Z' | '0'..='9' if !seen_space => (),
                    _ => return false,
                }
            }
            // First character must not be a space.
            if field[0] >> 1 == b' ' {
                return false;
            }
        }
        true
    }

    /// Addresses in monitor format: `SRC>DST,DIGI*,DIGI2:`. The `*`
    /// marks the last digipeater already used.
    pub fn format_addrs(&self) -> String {
        let Ok(n) = self.num_addr() else {
            return "?>?:".to_string();
        };
        let mut s = format!(
            "{}>{}",
            self.get_addr(AX25_SOURCE),
            self.get_addr(AX25_DESTINATION)
        );
        let mut last_used = None;
        for r in AX25_REPEATER_1..n {
            if self.get_h(r) {
                last_used = Some(r);
            }
        }
        for r in AX25_REPEATER_1..n {
            s.push(',');
            s.push_str(&self.get_addr(r));
            if last_used == Some(r) {
                s.push('*');
            }
        }
        s.push(':');
        s
    }

    /// Information field with unprintable bytes escaped as `<0xNN>`.
    pub fn safe_info(&self) -> String {
        let mut s = String::new();
        for &b in self.info() {
            match b {
                0x20..=0x7e => s.push(b as char),
                b => s.push_str(&format!("<0x{b:02x}>")),
            }
        }
        s
    }
}

fn pack_addr(addr: &str, h: bool, last: bool) -> Result<[u8; 7]> {
    let (call, ssid) = match addr.split_once('-') {
        Some((c, s)) => {
            let ssid: u8 = s
                .parse()
                .map_err(|_| Error::msg(format!("bad SSID in address {addr:?}")))?;
            (c, ssid)
        }
        None => (addr, 0),
    };
    if call.is_empty() || call.len() > 6 || ssid > 15 {
        return Err(Error::msg(format!("invalid address {addr:?}")));
    }
    let mut field = [b' ' << 1; 7];
    for (i, c) in call.chars().enumerate() {
        if !c.is_ascii_uppercase() && !c.is_ascii_digit() {
            return Err(Error::msg(format!("invalid character in address {addr:?}")));
        }
        field[i] = (c as u8) << 1;
    }
    field[6] = 0x60 | (ssid << 1);
    if h {
        field[6] |= 0x80;
    }
    if last {
        field[6] |= 0x01;
    }
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_read_back() -> Result<()> {
        let p = Ax25Packet::build_ui("TEST", "WB2OSZ-15", &[], b"The quick brown fox")?;
        assert_eq!(p.num_addr()?, 2);
        assert_eq!(p.get_addr(AX25_DESTINATION), "TEST");
        assert_eq!(p.get_addr(AX25_SOURCE), "WB2OSZ-15");
        assert_eq!(p.info(), b"The quick brown fox");
        assert!(p.is_aprs());
        assert!(p.check_addresses());
        Ok(())
    }

    #[test]
    fn text_roundtrip() -> Result<()> {
        let p = Ax25Packet::from_text("W1ABC-1>APRS,WIDE1-1*,WIDE2-2:hello")?;
        assert_eq!(p.num_repeaters(), 2);
        assert!(p.get_h(AX25_REPEATER_1));
        assert!(!p.get_h(AX25_REPEATER_1 + 1));
        assert_eq!(p.format_addrs(), "W1ABC-1>APRS,WIDE1-1*,WIDE2-2:");
        Ok(())
    }

    #[test]
    fn wire_format_survives_reparse() -> Result<()> {
        let p = Ax25Packet::from_text("N0CALL>TEST,DIGI-7:x")?;
        let q = Ax25Packet::from_frame_bytes(p.as_bytes().to_vec())?;
        assert_eq!(p, q);
        Ok(())
    }

    #[test]
    fn reject_garbage() {
        assert!(Ax25Packet::from_frame_bytes(vec![0u8; 5]).is_err());
        assert!(Ax25Packet::from_text("no separator").is_err());
        assert!(Ax25Packet::build_ui("TOOLONGCALL", "A", &[], b"").is_err());
        assert!(Ax25Packet::build_ui("TEST", "W1ABC-16", &[], b"").is_err());
    }

    #[test]
    fn safe_info_escapes() -> Result<()> {
        let p = Ax25Packet::build_ui("TEST", "N0CALL", &[], b"ok\x01")?;
        assert_eq!(p.safe_info(), "ok<0x01>");
        Ok(())
    }

    #[test]
    fn not_aprs_without_ui() -> Result<()> {
        let mut bytes = Ax25Packet::build_ui("TEST", "N0CALL", &[], b"x")?
            .as_bytes()
            .to_vec();
        let ctrl = 14;
        bytes[ctrl] = 0x00; // I frame.
        let p = Ax25Packet::from_frame_bytes(bytes)?;
        assert!(!p.is_aprs());
        Ok(())
    }
}
