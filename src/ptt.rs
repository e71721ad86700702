/*! PTT and DCD indicator outputs, and the transmit inhibit input.

Each channel can key its transmitter and drive carrier/connection
indicators through one of several transports: a serial port control
line (RTS or DTR, optionally inverted, optionally a second line with
opposite polarity), a GPIO pin, a parallel printer port data bit, or
a CM108/CM119 USB audio adapter's HID GPIO. The transmit inhibit
input is a GPIO read by the CSMA logic.

Missing lines are fine; `set` on an unconfigured output does nothing.
 */
use std::io::Write;
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::{Error, Result};

/// The three output functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutCtl {
    /// Push to talk.
    Ptt = 0,
    /// Data carrier detect indicator.
    Dcd = 1,
    /// Connected indicator.
    Con = 2,
}

const NUM_OCTYPES: usize = 3;

/// Which serial control line to wiggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialBit {
    Rts,
    Dtr,
}

/// Configuration of one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineSpec {
    Serial {
        port: String,
        bit: SerialBit,
        invert: bool,
        /// Optional second control line on the same port, e.g. RTS
        /// active and DTR inverted for radios wired either way.
        bit2: Option<(SerialBit, bool)>,
    },
    Gpio {
        pin: u32,
        invert: bool,
    },
    Lpt {
        bit: u8,
    },
    Rig {
        model: String,
        port: String,
    },
    Cm108 {
        bit: u8,
        device: String,
    },
}

/// Transmit inhibit input pin.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub pin: u32,
    pub invert: bool,
}

/// A thing that can be asserted and deasserted.
pub trait ControlLine: Send {
    fn set(&mut self, state: bool) -> Result<()>;
}

/// All output lines and inhibit inputs for the whole station.
pub struct PttFabric {
    lines: Vec<[Mutex<Option<Box<dyn ControlLine>>>; NUM_OCTYPES]>,
    txinh: Vec<Option<TxinhInput>>,
}

impl PttFabric {
    pub fn new(num_chans: usize) -> Self {
        Self {
            lines: (0..num_chans)
                .map(|_| std::array::from_fn(|_| Mutex::new(None)))
                .collect(),
            txinh: (0..num_chans).map(|_| None).collect(),
        }
    }

    /// Open an output line from its configuration.
    pub fn open(&mut self, octype: OutCtl, chan: usize, spec: &LineSpec) -> Result<()> {
        info!("{octype:?} channel {chan}: {spec:?}");
        let line = open_line(spec)?;
        self.add_line(octype, chan, line);
        Ok(())
    }

    /// Install an already constructed line. This is also how tests
    /// observe PTT without hardware.
    pub fn add_line(&mut self, octype: OutCtl, chan: usize, line: Box<dyn ControlLine>) {
        *self.lines[chan][octype as usize].lock().unwrap() = Some(line);
    }

    /// Configure the transmit inhibit input for a channel.
    pub fn open_txinh(&mut self, chan: usize, spec: &InputSpec) -> Result<()> {
        info!("TXINH channel {chan}: gpio {}{}", if spec.invert { "-" } else { "" }, spec.pin);
        self.txinh[chan] = Some(TxinhInput::open(spec)?);
        Ok(())
    }

    /// Drive one output. Unconfigured outputs are ignored.
    pub fn set(&self, octype: OutCtl, chan: usize, state: bool) {
        debug!("{octype:?} {chan} = {}", state as u8);
        let mut guard = self.lines[chan][octype as usize].lock().unwrap();
        if let Some(line) = guard.as_mut() {
            if let Err(e) = line.set(state) {
                warn!("failed to set {octype:?} for channel {chan}: {e}");
            }
        }
    }

    /// Is transmitting inhibited by the input line right now?
    pub fn txinh(&self, chan: usize) -> bool {
        match &self.txinh[chan] {
            Some(input) => input.read().unwrap_or_else(|e| {
                warn!("TXINH read failed for channel {chan}: {e}");
                false
            }),
            None => false,
        }
    }
}

fn open_line(spec: &LineSpec) -> Result<Box<dyn ControlLine>> {
    match spec {
        LineSpec::Serial {
            port,
            bit,
            invert,
            bit2,
        } => Ok(Box::new(SerialLine::open(port, *bit, *invert, *bit2)?)),
        LineSpec::Gpio { pin, invert } => Ok(Box::new(GpioLine::open(*pin, *invert)?)),
        LineSpec::Lpt { bit } => Ok(Box::new(LptLine::open(*bit)?)),
        LineSpec::Rig { model, port } => Err(Error::msg(format!(
            "PTT via rig control ({model} on {port}) requires a build with hamlib support"
        ))),
        LineSpec::Cm108 { bit, device } => Ok(Box::new(Cm108Line::open(*bit, device.clone())?)),
    }
}

/// Serial port RTS/DTR control line.
struct SerialLine {
    file: std::fs::File,
    bit: SerialBit,
    invert: bool,
    bit2: Option<(SerialBit, bool)>,
}

impl SerialLine {
    fn open(port: &str, bit: SerialBit, invert: bool, bit2: Option<(SerialBit, bool)>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(port)
            .map_err(|e| Error::msg(format!("can't open serial port {port}: {e}")))?;
        let mut line = Self {
            file,
            bit,
            invert,
            bit2,
        };
        line.set(false)?;
        Ok(line)
    }

    #[cfg(unix)]
    fn modem_bits(&mut self, bits: libc::c_int, assert: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        nix::ioctl_write_ptr_bad!(tiocmbis, libc::TIOCMBIS, libc::c_int);
        nix::ioctl_write_ptr_bad!(tiocmbic, libc::TIOCMBIC, libc::c_int);
        let fd = self.file.as_raw_fd();
        let res = unsafe {
            if assert {
                tiocmbis(fd, &bits)
            } else {
                tiocmbic(fd, &bits)
            }
        };
        res.map_err(|e| Error::msg(format!("serial line ioctl: {e}")))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn modem_bits(&mut self, _bits: i32, _assert: bool) -> Result<()> {
        Err(Error::msg("serial control lines are only supported on unix"))
    }
}

#[cfg(unix)]
fn serial_bit_mask(bit: SerialBit) -> libc::c_int {
    match bit {
        SerialBit::Rts => libc::TIOCM_RTS,
        SerialBit::Dtr => libc::TIOCM_DTR,
    }
}

impl ControlLine for SerialLine {
    fn set(&mut self, state: bool) -> Result<()> {
        #[cfg(unix)]
        {
            self.modem_bits(serial_bit_mask(self.bit), state != self.invert)?;
            if let Some((bit2, invert2)) = self.bit2 {
                self.modem_bits(serial_bit_mask(bit2), state != invert2)?;
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = state;
            Err(Error::msg("serial control lines are only supported on unix"))
        }
    }
}

/// Sysfs GPIO output.
struct GpioLine {
    value_path: std::path::PathBuf,
    invert: bool,
}

impl GpioLine {
    fn open(pin: u32, invert: bool) -> Result<Self> {
        let dir = std::path::PathBuf::from(format!("/sys/class/gpio/gpio{pin}"));
        if !dir.exists() {
            std::fs::write("/sys/class/gpio/export", pin.to_string())
                .map_err(|e| Error::msg(format!("can't export gpio {pin}: {e}")))?;
        }
        std::fs::write(dir.join("direction"), "out")
            .map_err(|e| Error::msg(format!("can't set gpio {pin} direction: {e}")))?;
        let mut line = Self {
            value_path: dir.join("value"),
            invert,
        };
        line.set(false)?;
        Ok(line)
    }
}

impl ControlLine for GpioLine {
    fn set(&mut self, state: bool) -> Result<()> {
        let v = if state != self.invert { "1" } else { "0" };
        std::fs::write(&self.value_path, v)
            .map_err(|e| Error::msg(format!("gpio write: {e}")))?;
        Ok(())
    }
}

/// One data bit of a PC parallel printer port.
struct LptLine {
    #[cfg(target_os = "linux")]
    file: std::fs::File,
    bit: u8,
    data: u8,
}

impl LptLine {
    #[cfg(target_os = "linux")]
    fn open(bit: u8) -> Result<Self> {
        use std::os::unix::io::AsRawFd;
        if bit > 7 {
            return Err(Error::msg(format!("parallel port bit {bit} out of range 0..7")));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/parport0")
            .map_err(|e| Error::msg(format!("can't open /dev/parport0: {e}")))?;
        nix::ioctl_none!(ppclaim, b'p', 0x8b);
        unsafe { ppclaim(file.as_raw_fd()) }
            .map_err(|e| Error::msg(format!("can't claim parallel port: {e}")))?;
        Ok(Self { file, bit, data: 0 })
    }

    #[cfg(not(target_os = "linux"))]
    fn open(_bit: u8) -> Result<Self> {
        Err(Error::msg("parallel port PTT is only supported on linux"))
    }
}

impl ControlLine for LptLine {
    #[cfg(target_os = "linux")]
    fn set(&mut self, state: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        nix::ioctl_write_ptr!(ppwdata, b'p', 0x86, u8);
        if state {
            self.data |= 1 << self.bit;
        } else {
            self.data &= !(1 << self.bit);
        }
        unsafe { ppwdata(self.file.as_raw_fd(), &self.data) }
            .map_err(|e| Error::msg(format!("parallel port write: {e}")))?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set(&mut self, _state: bool) -> Result<()> {
        let _ = self.bit;
        let _ = self.data;
        Err(Error::msg("parallel port PTT is only supported on linux"))
    }
}

/// GPIO of a CM108/CM119 USB audio adapter, via its hidraw device.
/// Bit numbers are 1..8 as printed on schematics, high = transmit.
struct Cm108Line {
    file: std::fs::File,
    bit: u8,
}

impl Cm108Line {
    fn open(bit: u8, device: String) -> Result<Self> {
        if !(1..=8).contains(&bit) {
            return Err(Error::msg(format!("CM108 GPIO bit {bit} out of range 1..8")));
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&device)
            .map_err(|e| Error::msg(format!("can't open CM108 device {device}: {e}")))?;
        Ok(Self { file, bit })
    }
}

impl ControlLine for Cm108Line {
    fn set(&mut self, state: bool) -> Result<()> {
        let mask = 1u8 << (self.bit - 1);
        let data = if state { mask } else { 0 };
        // HID output report: report number, reserved, GPIO data, GPIO
        // direction mask, reserved.
        let report = [0u8, 0, data, mask, 0];
        self.file
            .write_all(&report)
            .map_err(|e| Error::msg(format!("CM108 write: {e}")))?;
        Ok(())
    }
}

/// Sysfs GPIO input for transmit inhibit.
struct TxinhInput {
    value_path: std::path::PathBuf,
    invert: bool,
}

impl TxinhInput {
    fn open(spec: &InputSpec) -> Result<Self> {
        let dir = std::path::PathBuf::from(format!("/sys/class/gpio/gpio{}", spec.pin));
        if !dir.exists() {
            std::fs::write("/sys/class/gpio/export", spec.pin.to_string())
                .map_err(|e| Error::msg(format!("can't export gpio {}: {e}", spec.pin)))?;
        }
        std::fs::write(dir.join("direction"), "in")
            .map_err(|e| Error::msg(format!("can't set gpio {} direction: {e}", spec.pin)))?;
        Ok(Self {
            value_path: dir.join("value"),
            invert: spec.invert,
        })
    }

    fn read(&self) -> Result<bool> {
        let v = std::fs::read_to_string(&self.value_path)?;
        Ok((v.trim() != "0") != self.invert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Recorder(Arc<Mutex<Vec<bool>>>);

    impl ControlLine for Recorder {
        fn set(&mut self, state: bool) -> Result<()> {
            self.0.lock().unwrap().push(state);
            Ok(())
        }
    }

    #[test]
    fn set_reaches_installed_line() {
        let mut fabric = PttFabric::new(2);
        let rec = Arc::new(Mutex::new(Vec::new()));
        fabric.add_line(OutCtl::Ptt, 1, Box::new(Recorder(rec.clone())));
        fabric.set(OutCtl::Ptt, 1, true);
        fabric.set(OutCtl::Ptt, 1, false);
        // Different octype and channel must not touch it.
        fabric.set(OutCtl::Dcd, 1, true);
        fabric.set(OutCtl::Ptt, 0, true);
        assert_eq!(*rec.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn unconfigured_is_silent() {
        let fabric = PttFabric::new(1);
        fabric.set(OutCtl::Ptt, 0, true);
        assert!(!fabric.txinh(0));
    }

    #[test]
    fn rig_requires_hamlib() {
        let mut fabric = PttFabric::new(1);
        let spec = LineSpec::Rig {
            model: "2".to_string(),
            port: "/dev/ttyUSB0".to_string(),
        };
        assert!(fabric.open(OutCtl::Ptt, 0, &spec).is_err());
    }
}
