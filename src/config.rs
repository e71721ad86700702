/*! Configuration file reader.

Line oriented, `#` starts a comment, a tag followed by whitespace
separated arguments. Tags are case insensitive. Channel scoped tags
apply to the channel most recently named with `CHANNEL`, device
scoped tags to the device most recently named with `ADEVICE`.

Errors in the configuration produce a complaint on standard output
with the line number, and the default value is used instead; only a
configuration that leaves no usable audio device aborts startup.
 */
use crate::audio::{DEFAULT_SAMPLES_PER_SEC, MAX_SAMPLES_PER_SEC, MIN_SAMPLES_PER_SEC};
use crate::ptt::{InputSpec, LineSpec, OutCtl, SerialBit};
use crate::retry::SanityFilter;
use crate::{Error, Result, MAX_ADEVS, MAX_RADIO_CHANS, MAX_SLICERS, MAX_SUBCHANS};

/// What one channel number refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Medium {
    /// Nothing attached.
    #[default]
    None,
    /// A modem on an audio device.
    Radio,
}

/// One audio device.
#[derive(Debug, Clone)]
pub struct AdevConfig {
    pub defined: bool,
    pub indev: String,
    pub outdev: String,
    pub samples_per_sec: u32,
    /// 1 for mono, 2 for stereo.
    pub num_channels: usize,
}

impl Default for AdevConfig {
    fn default() -> Self {
        Self {
            defined: false,
            indev: "default".to_string(),
            outdev: "default".to_string(),
            samples_per_sec: DEFAULT_SAMPLES_PER_SEC,
            num_channels: 1,
        }
    }
}

/// One radio channel.
#[derive(Debug, Clone)]
pub struct ChanConfig {
    pub medium: Medium,
    pub baud: u32,
    pub mark_freq: u32,
    pub space_freq: u32,
    pub num_subchan: usize,
    pub num_slicers: usize,

    // Transmit timing, 10 ms units except fulldup.
    pub txdelay: u8,
    pub txtail: u8,
    pub slottime: u8,
    pub persist: u8,
    pub dwait: u8,
    pub fulldup: bool,

    pub fix_bits: u32,
    pub sanity: SanityFilter,
    pub passall: bool,

    /// 0 = off, 16/32/64 = that many check bytes, 1 = automatic.
    pub fx25_tx: u32,

    /// Per cent of transmitted frames to corrupt, for testing.
    pub xmit_error_rate: u8,

    /// PTT, DCD, CON output lines.
    pub octrl: [Option<LineSpec>; 3],
    pub txinh: Option<InputSpec>,
}

impl Default for ChanConfig {
    fn default() -> Self {
        Self {
            medium: Medium::None,
            baud: 1200,
            mark_freq: 1200,
            space_freq: 2200,
            num_subchan: 1,
            num_slicers: 1,
            txdelay: 30,
            txtail: 10,
            slottime: 10,
            persist: 63,
            dwait: 0,
            fulldup: false,
            fix_bits: 0,
            sanity: SanityFilter::Aprs,
            passall: false,
            fx25_tx: 0,
            xmit_error_rate: 0,
            octrl: [None, None, None],
            txinh: None,
        }
    }
}

/// One TCP KISS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissPortConfig {
    pub port: u16,
    /// Bind this port to a single radio channel, or serve all.
    pub chan: Option<usize>,
}

pub const DEFAULT_KISS_PORT: u16 = 8001;

/// Everything read from the configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub adev: Vec<AdevConfig>,
    pub chan: Vec<ChanConfig>,
    pub kiss_ports: Vec<KissPortConfig>,
    pub kiss_copy: bool,
    pub serial_kiss: Option<String>,
    pub serial_kiss_poll_sec: u32,
    /// Receive bit error rate for testing, set from the command line.
    pub recv_ber: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adev: (0..MAX_ADEVS).map(|_| AdevConfig::default()).collect(),
            chan: (0..MAX_RADIO_CHANS).map(|_| ChanConfig::default()).collect(),
            kiss_ports: Vec::new(),
            kiss_copy: false,
            serial_kiss: None,
            serial_kiss_poll_sec: 0,
            recv_ber: 0.0,
        }
    }
}

impl Config {
    /// Read a configuration file. Complaints go to standard output;
    /// only a completely unusable result is an error.
    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("can't open configuration file {path}: {e}")))?;
        Self::from_str_impl(&text)
    }

    /// Parse configuration text. Used directly by tests.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_str_impl(text)
    }

    fn from_str_impl(text: &str) -> Result<Self> {
        let mut p = Parser {
            config: Config::default(),
            adev: 0,
            chan: 0,
            seen_adevice: false,
        };
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("");
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            p.line(lineno + 1, &tokens);
        }
        let mut config = p.config;
        if !p.seen_adevice {
            // No ADEVICE at all: use the first device with defaults.
            config.adev[0].defined = true;
        }
        // Channel 0 of each defined device defaults to a radio.
        for a in 0..MAX_ADEVS {
            if config.adev[a].defined {
                for c in 0..config.adev[a].num_channels {
                    config.chan[crate::adev_first_chan(a) + c].medium = Medium::Radio;
                }
            }
        }
        if config.kiss_ports.is_empty() {
            config.kiss_ports.push(KissPortConfig {
                port: DEFAULT_KISS_PORT,
                chan: None,
            });
        }
        if !config.chan.iter().any(|c| c.medium == Medium::Radio) {
            return Err(Error::msg("configuration defines no usable radio channel"));
        }
        Ok(config)
    }

    /// Number of the highest radio channel plus one.
    pub fn num_chans(&self) -> usize {
        self.chan
            .iter()
            .rposition(|c| c.medium == Medium::Radio)
            .map_or(0, |i| i + 1)
    }
}

struct Parser {
    config: Config,
    adev: usize,
    chan: usize,
    seen_adevice: bool,
}

fn complain(lineno: usize, msg: &str) {
    println!("Config file line {lineno}: {msg}");
}

// Parse a number in a range, complaining and substituting a default.
fn ranged<T: std::str::FromStr + PartialOrd + Copy + std::fmt::Display>(
    lineno: usize,
    what: &str,
    s: &str,
    lo: T,
    hi: T,
    default: T,
) -> T {
    match s.parse::<T>() {
        Ok(v) if v >= lo && v <= hi => v,
        _ => {
            complain(
                lineno,
                &format!("invalid {what} {s:?}, using {default}. Valid range is {lo} to {hi}."),
            );
            default
        }
    }
}

impl Parser {
    fn line(&mut self, n: usize, t: &[&str]) {
        let tag = t[0].to_uppercase();
        let args = &t[1..];
        match tag.as_str() {
            "ADEVICE" => self.adevice(n, args),
            "ARATE" => {
                self.config.adev[self.adev].samples_per_sec = ranged(
                    n,
                    "sample rate",
                    args.first().unwrap_or(&""),
                    MIN_SAMPLES_PER_SEC,
                    MAX_SAMPLES_PER_SEC,
                    DEFAULT_SAMPLES_PER_SEC,
                );
            }
            "ACHANNELS" => {
                self.config.adev[self.adev].num_channels =
                    ranged(n, "audio channel count", args.first().unwrap_or(&""), 1, 2, 1);
            }
            "CHANNEL" => {
                let c = ranged(
                    n,
                    "channel number",
                    args.first().unwrap_or(&""),
                    0,
                    MAX_RADIO_CHANS - 1,
                    0,
                );
                self.chan = c;
            }
            "MODEM" => self.modem(n, args),
            "FIX_BITS" => self.fix_bits(n, args),
            "PTT" => self.octrl(n, OutCtl::Ptt, args),
            "DCD" => self.octrl(n, OutCtl::Dcd, args),
            "CON" => self.octrl(n, OutCtl::Con, args),
            "TXINH" => self.txinh(n, args),
            "DWAIT" => {
                self.config.chan[self.chan].dwait =
                    ranged(n, "DWAIT", args.first().unwrap_or(&""), 0, 255, 0)
            }
            "SLOTTIME" => {
                self.config.chan[self.chan].slottime =
                    ranged(n, "SLOTTIME", args.first().unwrap_or(&""), 0, 255, 10)
            }
            "PERSIST" => {
                self.config.chan[self.chan].persist =
                    ranged(n, "PERSIST", args.first().unwrap_or(&""), 0, 255, 63)
            }
            "TXDELAY" => {
                self.config.chan[self.chan].txdelay =
                    ranged(n, "TXDELAY", args.first().unwrap_or(&""), 0, 255, 30)
            }
            "TXTAIL" => {
                self.config.chan[self.chan].txtail =
                    ranged(n, "TXTAIL", args.first().unwrap_or(&""), 0, 255, 10)
            }
            "FULLDUP" => {
                self.config.chan[self.chan].fulldup = match args.first().map(|s| s.to_uppercase()) {
                    Some(ref s) if s == "ON" => true,
                    Some(ref s) if s == "OFF" => false,
                    other => {
                        complain(n, &format!("FULLDUP requires ON or OFF, not {other:?}"));
                        false
                    }
                }
            }
            "FX25TX" => {
                let v = ranged(n, "FX25TX", args.first().unwrap_or(&"1"), 0, 64, 1);
                if matches!(v, 0 | 1 | 16 | 32 | 64) {
                    self.config.chan[self.chan].fx25_tx = v;
                } else {
                    complain(n, &format!("FX25TX {v} is not 0, 1, 16, 32 or 64, using 1."));
                    self.config.chan[self.chan].fx25_tx = 1;
                }
            }
            "KISSPORT" => self.kissport(n, args),
            "NULLMODEM" | "SERIALKISS" => match args.first() {
                Some(dev) => self.config.serial_kiss = Some(dev.to_string()),
                None => complain(n, "SERIALKISS requires a device name."),
            },
            "SERIALKISSPOLL" => {
                self.config.serial_kiss_poll_sec =
                    ranged(n, "SERIALKISSPOLL", args.first().unwrap_or(&""), 0, 3600, 0)
            }
            "KISSCOPY" => self.config.kiss_copy = true,
            other => complain(n, &format!("unrecognized command {other:?}, ignored.")),
        }
    }

    fn adevice(&mut self, n: usize, args: &[&str]) {
        let mut args = args;
        // Optional leading device number.
        if let Some(num) = args.first().and_then(|s| s.parse::<usize>().ok()) {
            if num < MAX_ADEVS && args.len() > 1 {
                self.adev = num;
                args = &args[1..];
            }
        }
        let Some(indev) = args.first() else {
            complain(n, "ADEVICE requires a device name.");
            return;
        };
        self.seen_adevice = true;
        let a = &mut self.config.adev[self.adev];
        a.defined = true;
        a.indev = indev.to_string();
        a.outdev = args.get(1).unwrap_or(indev).to_string();
        self.chan = crate::adev_first_chan(self.adev);
    }

    fn modem(&mut self, n: usize, args: &[&str]) {
        let c = &mut self.config.chan[self.chan];
        c.baud = ranged(n, "bit rate", args.first().unwrap_or(&""), 100, 38400, 1200);
        // Tones can be given as "1200 2200" or "1200:2200".
        let mut rest = &args[1.min(args.len())..];
        if let Some(tones) = rest.first() {
            if let Some((m, s)) = tones.split_once(':') {
                c.mark_freq = ranged(n, "mark frequency", m, 100, 10000, 1200);
                c.space_freq = ranged(n, "space frequency", s, 100, 10000, 2200);
                rest = &rest[1..];
            } else if rest.len() >= 2 && rest[0].parse::<u32>().is_ok() {
                c.mark_freq = ranged(n, "mark frequency", rest[0], 100, 10000, 1200);
                c.space_freq = ranged(n, "space frequency", rest[1], 100, 10000, 2200);
                rest = &rest[2..];
            }
        }
        if let Some(sub) = rest.first() {
            c.num_subchan = ranged(n, "number of demodulators", sub, 1, MAX_SUBCHANS, 1);
            rest = &rest[1..];
        }
        if let Some(sl) = rest.first() {
            c.num_slicers = ranged(n, "number of slicers", sl, 1, MAX_SLICERS, 1);
        }
    }

    fn fix_bits(&mut self, n: usize, args: &[&str]) {
        let c = &mut self.config.chan[self.chan];
        c.fix_bits = ranged(n, "FIX_BITS level", args.first().unwrap_or(&""), 0, 2, 0);
        if c.fix_bits > 1 {
            complain(
                n,
                "FIX_BITS levels above 1 spend a lot of CPU for little benefit.",
            );
        }
        for a in &args[1.min(args.len())..] {
            match a.to_uppercase().as_str() {
                "APRS" => c.sanity = SanityFilter::Aprs,
                "AX25" | "AX.25" => c.sanity = SanityFilter::Ax25,
                "NONE" => c.sanity = SanityFilter::None,
                "PASSALL" => c.passall = true,
                other => complain(n, &format!("unknown FIX_BITS option {other:?}.")),
            }
        }
    }

    fn octrl(&mut self, n: usize, octype: OutCtl, args: &[&str]) {
        let Some(spec) = parse_line_spec(n, args) else {
            return;
        };
        self.config.chan[self.chan].octrl[octype as usize] = Some(spec);
    }

    fn txinh(&mut self, n: usize, args: &[&str]) {
        // "TXINH GPIO [-]n" or just "TXINH [-]n".
        let arg = match args.first().map(|s| s.to_uppercase()) {
            Some(ref s) if s == "GPIO" => args.get(1),
            _ => args.first(),
        };
        let Some(arg) = arg else {
            complain(n, "TXINH requires a GPIO number.");
            return;
        };
        let (invert, num) = match arg.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, *arg),
        };
        match num.parse::<u32>() {
            Ok(pin) => self.config.chan[self.chan].txinh = Some(InputSpec { pin, invert }),
            Err(_) => complain(n, &format!("invalid TXINH GPIO number {arg:?}.")),
        }
    }

    fn kissport(&mut self, n: usize, args: &[&str]) {
        let port = ranged(n, "KISS port", args.first().unwrap_or(&""), 1024u32, 49151, 8001);
        let chan = args.get(1).map(|s| {
            ranged(n, "KISS port channel", s, 0, MAX_RADIO_CHANS - 1, 0)
        });
        self.config.kiss_ports.push(KissPortConfig {
            port: port as u16,
            chan,
        });
    }
}

fn parse_line_spec(n: usize, args: &[&str]) -> Option<LineSpec> {
    let first = args.first()?.to_uppercase();
    match first.as_str() {
        "GPIO" => {
            let arg = args.get(1)?;
            let (invert, num) = match arg.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, *arg),
            };
            match num.parse() {
                Ok(pin) => Some(LineSpec::Gpio { pin, invert }),
                Err(_) => {
                    complain(n, &format!("invalid GPIO number {arg:?}."));
                    None
                }
            }
        }
        "LPT" => match args.get(1)?.parse() {
            Ok(bit) if bit <= 7 => Some(LineSpec::Lpt { bit }),
            _ => {
                complain(n, "LPT bit must be 0 to 7.");
                None
            }
        },
        "RIG" => {
            if args.len() < 3 {
                complain(n, "RIG requires a model number and a port.");
                return None;
            }
            Some(LineSpec::Rig {
                model: args[1].to_string(),
                port: args[2].to_string(),
            })
        }
        "CM108" => {
            let bit = match args.get(1).map(|s| s.parse::<u8>()) {
                Some(Ok(b)) if (1..=8).contains(&b) => b,
                Some(_) => {
                    complain(n, "CM108 GPIO bit must be 1 to 8, using 3.");
                    3
                }
                None => 3,
            };
            let device = args
                .get(2)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "/dev/hidraw0".to_string());
            Some(LineSpec::Cm108 { bit, device })
        }
        _ => {
            // Serial port device followed by one or two control lines.
            let port = args[0].to_string();
            let mut lines = Vec::new();
            for a in &args[1..] {
                let (invert, name) = match a.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, *a),
                };
                match name.to_uppercase().as_str() {
                    "RTS" => lines.push((SerialBit::Rts, invert)),
                    "DTR" => lines.push((SerialBit::Dtr, invert)),
                    other => {
                        complain(n, &format!("expected RTS or DTR, not {other:?}."));
                        return None;
                    }
                }
            }
            if lines.is_empty() {
                // RTS is the usual wiring.
                lines.push((SerialBit::Rts, false));
            }
            if lines.len() > 2 {
                complain(n, "at most two serial control lines make sense.");
                return None;
            }
            Some(LineSpec::Serial {
                port,
                bit: lines[0].0,
                invert: lines[0].1,
                bit2: lines.get(1).copied(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied() -> Result<()> {
        let c = Config::parse("ADEVICE test.wav\n")?;
        assert_eq!(c.num_chans(), 1);
        let ch = &c.chan[0];
        assert_eq!(ch.medium, Medium::Radio);
        assert_eq!(ch.baud, 1200);
        assert_eq!((ch.txdelay, ch.txtail, ch.slottime, ch.persist), (30, 10, 10, 63));
        assert!(!ch.fulldup);
        assert_eq!(c.kiss_ports, vec![KissPortConfig { port: 8001, chan: None }]);
        Ok(())
    }

    #[test]
    fn channel_scoped_settings() -> Result<()> {
        let c = Config::parse(
            "ADEVICE test.wav\n\
             ACHANNELS 2\n\
             CHANNEL 1\n\
             MODEM 300 1600:1800 3 3\n\
             PERSIST 100\n\
             SLOTTIME 20\n\
             FULLDUP ON\n",
        )?;
        assert_eq!(c.num_chans(), 2);
        assert_eq!(c.chan[0].persist, 63);
        let ch = &c.chan[1];
        assert_eq!((ch.baud, ch.mark_freq, ch.space_freq), (300, 1600, 1800));
        assert_eq!((ch.num_subchan, ch.num_slicers), (3, 3));
        assert_eq!(ch.persist, 100);
        assert_eq!(ch.slottime, 20);
        assert!(ch.fulldup);
        Ok(())
    }

    #[test]
    fn out_of_range_falls_back() -> Result<()> {
        let c = Config::parse("ADEVICE t.wav\nPERSIST 300\nTXDELAY -5\n")?;
        assert_eq!(c.chan[0].persist, 63);
        assert_eq!(c.chan[0].txdelay, 30);
        Ok(())
    }

    #[test]
    fn fix_bits_options() -> Result<()> {
        let c = Config::parse("ADEVICE t.wav\nFIX_BITS 1 AX25 PASSALL\n")?;
        assert_eq!(c.chan[0].fix_bits, 1);
        assert_eq!(c.chan[0].sanity, SanityFilter::Ax25);
        assert!(c.chan[0].passall);
        Ok(())
    }

    #[test]
    fn ptt_variants() -> Result<()> {
        let c = Config::parse(
            "ADEVICE t.wav\n\
             PTT /dev/ttyUSB0 RTS -DTR\n\
             DCD GPIO -17\n\
             CHANNEL 1\n",
        )?;
        assert_eq!(
            c.chan[0].octrl[OutCtl::Ptt as usize],
            Some(LineSpec::Serial {
                port: "/dev/ttyUSB0".to_string(),
                bit: SerialBit::Rts,
                invert: false,
                bit2: Some((SerialBit::Dtr, true)),
            })
        );
        assert_eq!(
            c.chan[0].octrl[OutCtl::Dcd as usize],
            Some(LineSpec::Gpio {
                pin: 17,
                invert: true
            })
        );
        Ok(())
    }

    #[test]
    fn kiss_settings() -> Result<()> {
        let c = Config::parse(
            "ADEVICE t.wav\n\
             KISSPORT 7000 0\n\
             KISSPORT 7001\n\
             KISSCOPY\n\
             SERIALKISS /tmp/kisstnc\n\
             SERIALKISSPOLL 30\n",
        )?;
        assert_eq!(
            c.kiss_ports,
            vec![
                KissPortConfig { port: 7000, chan: Some(0) },
                KissPortConfig { port: 7001, chan: None },
            ]
        );
        assert!(c.kiss_copy);
        assert_eq!(c.serial_kiss.as_deref(), Some("/tmp/kisstnc"));
        assert_eq!(c.serial_kiss_poll_sec, 30);
        Ok(())
    }

    #[test]
    fn fx25_and_errors() -> Result<()> {
        let c = Config::parse("ADEVICE t.wav\nFX25TX 32\nTXINH GPIO -22\n")?;
        assert_eq!(c.chan[0].fx25_tx, 32);
        assert_eq!(
            c.chan[0].txinh,
            Some(InputSpec {
                pin: 22,
                invert: true
            })
        );
        Ok(())
    }

    #[test]
    fn unknown_tags_ignored() -> Result<()> {
        let c = Config::parse("ADEVICE t.wav\nNOSUCHTHING a b c\n")?;
        assert_eq!(c.num_chans(), 1);
        Ok(())
    }

    #[test]
    fn no_radio_channel_is_fatal() {
        assert!(Config::parse("KISSCOPY\n").is_ok()); // default device
        // An explicit zero channel device set is not expressible, so
        // the failure path needs an empty text with ACHANNELS tricks;
        // verify the default path instead.
    }

    #[test]
    fn second_device_channels() -> Result<()> {
        let c = Config::parse(
            "ADEVICE plughw:0,0\n\
             ADEVICE 1 plughw:1,0\n\
             ACHANNELS 2\n",
        )?;
        assert_eq!(c.chan[0].medium, Medium::Radio);
        assert_eq!(c.chan[1].medium, Medium::None);
        assert_eq!(c.chan[2].medium, Medium::Radio);
        assert_eq!(c.chan[3].medium, Medium::Radio);
        assert_eq!(c.num_chans(), 4);
        Ok(())
    }
}
