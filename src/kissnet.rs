/*! KISS client transports.

Client applications talk KISS over TCP (one or more listening ports,
each optionally bound to a single radio channel) or over a serial
style byte stream: either a real device that may come and go, or a
pseudo terminal with a convenience symlink so applications have a
stable path to open.

Data frames from any client go into the low priority transmit queue.
Received frames are forwarded to every connected client. The KISS
set hardware commands adjust the per channel transmit timing.
 */
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::ax25::Ax25Packet;
use crate::config::Config;
use crate::kiss_frame::{self, KissAssembler, KissCmd};
use crate::tq::{Priority, TransmitQueue};
use crate::xmit::XmitParams;
use crate::{Error, Result};

struct ClientWriter {
    id: u64,
    /// Only forward frames from this channel; `None` serves all.
    chan: Option<usize>,
    stream: Box<dyn Write + Send>,
}

/// The set of currently connected KISS clients.
pub struct KissClients {
    writers: Mutex<Vec<ClientWriter>>,
    next_id: AtomicU64,
    kiss_copy: bool,
}

impl KissClients {
    pub fn new(kiss_copy: bool) -> Self {
        Self {
            writers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            kiss_copy,
        }
    }

    fn register(&self, chan: Option<usize>, stream: Box<dyn Write + Send>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.writers.lock().unwrap().push(ClientWriter { id, chan, stream });
        id
    }

    fn unregister(&self, id: u64) {
        self.writers.lock().unwrap().retain(|w| w.id != id);
    }

    /// Forward a received frame to every interested client. Clients
    /// with a dead connection are dropped here.
    pub fn send_rec_packet(&self, chan: usize, fbuf: &[u8]) {
        let mut writers = self.writers.lock().unwrap();
        writers.retain_mut(|w| {
            let kiss_chan = match w.chan {
                // A port bound to one radio channel sees only that
                // channel, renumbered to KISS channel 0.
                Some(c) if c == chan => 0,
                Some(_) => return true,
                None => chan as u8,
            };
            let data = kiss_frame::encode(kiss_chan, fbuf);
            match w.stream.write_all(&data).and_then(|_| w.stream.flush()) {
                Ok(()) => true,
                Err(e) => {
                    info!("dropping KISS client: {e}");
                    false
                }
            }
        });
    }

    // KISSCOPY: echo one client's traffic to all the others.
    fn copy_to_others(&self, from: u64, raw: &[u8]) {
        if !self.kiss_copy {
            return;
        }
        let mut data = Vec::with_capacity(raw.len() + 2);
        data.push(kiss_frame::FEND);
        data.extend_from_slice(raw);
        data.push(kiss_frame::FEND);
        let mut writers = self.writers.lock().unwrap();
        writers.retain_mut(|w| {
            if w.id == from {
                return true;
            }
            w.stream.write_all(&data).and_then(|_| w.stream.flush()).is_ok()
        });
    }
}

/// Shared state the client handlers need.
pub struct KissShared {
    pub tq: Arc<TransmitQueue>,
    pub params: Vec<Arc<XmitParams>>,
    pub clients: Arc<KissClients>,
    pub num_chans: usize,
}

/// Start all configured KISS transports.
pub fn kissnet_init(config: &Config, shared: Arc<KissShared>) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    for kp in &config.kiss_ports {
        let listener = TcpListener::bind(("0.0.0.0", kp.port))
            .map_err(|e| Error::msg(format!("can't listen on KISS port {}: {e}", kp.port)))?;
        info!(
            "Ready to accept KISS TCP clients on port {}{}",
            kp.port,
            match kp.chan {
                Some(c) => format!(" (radio channel {c})"),
                None => String::new(),
            }
        );
        let shared = shared.clone();
        let chan = kp.chan;
        let port = kp.port;
        handles.push(
            std::thread::Builder::new()
                .name(format!("kiss-listen-{port}"))
                .spawn(move || listen_loop(listener, chan, shared))
                .expect("could not create KISS listener thread"),
        );
    }

    if let Some(path) = &config.serial_kiss {
        let path = path.clone();
        let poll = config.serial_kiss_poll_sec;
        let shared = shared.clone();
        handles.push(
            std::thread::Builder::new()
                .name("kiss-serial".to_string())
                .spawn(move || serial_kiss(&path, poll, shared))
                .expect("could not create serial KISS thread"),
        );
    }
    Ok(handles)
}

fn listen_loop(listener: TcpListener, chan: Option<usize>, shared: Arc<KissShared>) {
    for conn in listener.incoming() {
        let stream = match conn {
            Ok(s) => s,
            Err(e) => {
                warn!("KISS accept failed: {e}");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        info!("Connected to KISS client application from {peer}");
        let writer = match stream.try_clone() {
            Ok(w) => w,
            Err(e) => {
                warn!("KISS client setup failed: {e}");
                continue;
            }
        };
        let id = shared.clients.register(chan, Box::new(writer));
        let shared2 = shared.clone();
        let r = std::thread::Builder::new()
            .name(format!("kiss-client-{id}"))
            .spawn(move || {
                client_reader(stream, id, chan, &shared2);
                shared2.clients.unregister(id);
                info!("KISS client {id} disconnected");
            });
        if let Err(e) = r {
            error!("could not create KISS client thread: {e}");
            shared.clients.unregister(id);
        }
    }
}

fn client_reader<R: Read>(mut stream: R, id: u64, bound_chan: Option<usize>, shared: &KissShared) {
    let mut assembler = KissAssembler::new();
    let mut buf = [0u8; 2048];
    let mut frames = Vec::new();
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!("KISS client {id} read: {e}");
                return;
            }
        };
        assembler.feed(&buf[..n], &mut frames);
        for raw in frames.drain(..) {
            shared.clients.copy_to_others(id, &raw);
            match kiss_frame::decode(&raw) {
                Ok(cmd) => handle_command(cmd, bound_chan, shared),
                Err(e) => debug!("bad KISS frame from client {id}: {e}"),
            }
        }
    }
}

fn handle_command(cmd: KissCmd, bound_chan: Option<usize>, shared: &KissShared) {
    // A port bound to a radio channel transmits there no matter what
    // channel the client asked for.
    let resolve = |chan: u8| -> Option<usize> {
        let chan = bound_chan.unwrap_or(chan as usize);
        if chan < shared.num_chans {
            Some(chan)
        } else {
            warn!("KISS client addressed invalid channel {chan}");
            None
        }
    };
    match cmd {
        KissCmd::Data { chan, payload } => {
            let Some(chan) = resolve(chan) else { return };
            match Ax25Packet::from_frame_bytes(payload) {
                Ok(pkt) => {
                    debug!("KISS client transmit request for channel {chan}");
                    if let Err(e) = shared.tq.append(chan, Priority::Low, pkt) {
                        warn!("{e}");
                    }
                }
                Err(e) => warn!("discarding invalid frame from KISS client: {e}"),
            }
        }
        KissCmd::TxDelay { chan, value } => {
            if let Some(chan) = resolve(chan) {
                info!("KISS client sets channel {chan} TXDELAY = {value}");
                shared.params[chan].set_txdelay(value);
            }
        }
        KissCmd::Persist { chan, value } => {
            if let Some(chan) = resolve(chan) {
                info!("KISS client sets channel {chan} PERSIST = {value}");
                shared.params[chan].set_persist(value);
            }
        }
        KissCmd::SlotTime { chan, value } => {
            if let Some(chan) = resolve(chan) {
                info!("KISS client sets channel {chan} SLOTTIME = {value}");
                shared.params[chan].set_slottime(value);
            }
        }
        KissCmd::TxTail { chan, value } => {
            if let Some(chan) = resolve(chan) {
                info!("KISS client sets channel {chan} TXTAIL = {value}");
                shared.params[chan].set_txtail(value);
            }
        }
        KissCmd::FullDuplex { chan, value } => {
            if let Some(chan) = resolve(chan) {
                info!("KISS client sets channel {chan} FULLDUPLEX = {value}");
                shared.params[chan].set_fulldup(value != 0);
            }
        }
        KissCmd::SetHardware { chan, data } => {
            debug!(
                "ignoring KISS set hardware for channel {chan}: {} bytes",
                data.len()
            );
        }
    }
}

/// Serial style KISS. With polling, `path` is a device (e.g. a
/// Bluetooth rfcomm port) that may appear and disappear; it is
/// reopened whenever it shows up. Without polling, a pseudo terminal
/// is created and `path` becomes a symlink to its slave side, which
/// is what client applications open.
#[cfg(unix)]
fn serial_kiss(path: &str, poll_sec: u32, shared: Arc<KissShared>) {
    if poll_sec > 0 {
        loop {
            match std::fs::OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => {
                    info!("Serial KISS device {path} opened");
                    serve_stream_pair(&file, &shared);
                    info!("Serial KISS device {path} closed");
                }
                Err(_) => {
                    std::thread::sleep(std::time::Duration::from_secs(poll_sec as u64));
                }
            }
        }
    } else {
        match open_pty_with_symlink(path) {
            Ok(master) => {
                info!("Virtual KISS TNC is available as {path}");
                warn!("Beware: the TNC will appear hung if nothing reads from {path}.");
                serve_stream_pair(&master, &shared);
                error!("pseudo terminal KISS closed unexpectedly");
            }
            Err(e) => error!("can't create pseudo terminal for KISS: {e}"),
        }
    }
}

#[cfg(not(unix))]
fn serial_kiss(path: &str, _poll_sec: u32, _shared: Arc<KissShared>) {
    error!("serial KISS ({path}) is only supported on unix");
}

// Register the writer side and run the reader inline.
#[cfg(unix)]
fn serve_stream_pair(file: &std::fs::File, shared: &Arc<KissShared>) {
    let writer = match file.try_clone() {
        Ok(w) => w,
        Err(e) => {
            error!("serial KISS setup failed: {e}");
            return;
        }
    };
    let reader = match file.try_clone() {
        Ok(r) => r,
        Err(e) => {
            error!("serial KISS setup failed: {e}");
            return;
        }
    };
    let id = shared.clients.register(None, Box::new(writer));
    client_reader(reader, id, None, shared);
    shared.clients.unregister(id);
}

// Create a pty and maintain a convenience symlink pointing at the
// slave device.
#[cfg(unix)]
fn open_pty_with_symlink(link: &str) -> Result<std::fs::File> {
    use nix::pty::{openpty, OpenptyResult};
    use std::os::fd::AsRawFd;

    let OpenptyResult { master, slave } = openpty(None, None)
        .map_err(|e| Error::msg(format!("openpty: {e}")))?;
    // SAFETY: fd comes from a successful openpty.
    let ptr = unsafe { libc::ptsname(master.as_raw_fd()) };
    if ptr.is_null() {
        return Err(Error::msg("ptsname() on newly created pty returned NULL"));
    }
    // SAFETY: checked for null above.
    let slave_name = unsafe { std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned() };
    info!("Slave tty device: {slave_name}");

    let link_path = std::path::Path::new(link);
    if let Err(e) = std::os::unix::fs::symlink(&slave_name, link_path) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(Error::msg(format!("can't create symlink {link}: {e}")));
        }
        std::fs::remove_file(link_path)?;
        std::os::unix::fs::symlink(&slave_name, link_path)?;
    }

    // The slave stays open so reads on the master don't return EOF
    // before a client connects.
    std::mem::forget(slave);
    Ok(std::fs::File::from(master))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChanConfig;

    fn shared(num_chans: usize, kiss_copy: bool) -> Arc<KissShared> {
        Arc::new(KissShared {
            tq: Arc::new(TransmitQueue::new(num_chans)),
            params: (0..num_chans)
                .map(|_| Arc::new(XmitParams::from_config(&ChanConfig::default())))
                .collect(),
            clients: Arc::new(KissClients::new(kiss_copy)),
            num_chans,
        })
    }

    #[test]
    fn data_frame_enters_transmit_queue() {
        let s = shared(2, false);
        let pkt = Ax25Packet::from_text("N0CALL>TEST:via kiss").unwrap();
        let mut wire = vec![0x10]; // channel 1, data
        wire.extend_from_slice(pkt.as_bytes());
        handle_command(kiss_frame::decode(&wire).unwrap(), None, &s);
        let (prio, got) = s.tq.remove_next(1).unwrap();
        assert_eq!(prio, Priority::Low);
        assert_eq!(got, pkt);
    }

    #[test]
    fn bound_port_overrides_channel() {
        let s = shared(2, false);
        let pkt = Ax25Packet::from_text("N0CALL>TEST:bound").unwrap();
        let mut wire = vec![0x70]; // client says channel 7
        wire.extend_from_slice(pkt.as_bytes());
        handle_command(kiss_frame::decode(&wire).unwrap(), Some(0), &s);
        assert!(s.tq.remove_next(0).is_some());
    }

    #[test]
    fn invalid_channel_dropped() {
        let s = shared(1, false);
        let pkt = Ax25Packet::from_text("N0CALL>TEST:nowhere").unwrap();
        let mut wire = vec![0x50];
        wire.extend_from_slice(pkt.as_bytes());
        handle_command(kiss_frame::decode(&wire).unwrap(), None, &s);
        assert!(s.tq.remove_next(0).is_none());
    }

    #[test]
    fn set_hardware_updates_params() {
        let s = shared(1, false);
        handle_command(kiss_frame::decode(&[0x01, 45]).unwrap(), None, &s);
        handle_command(kiss_frame::decode(&[0x03, 7]).unwrap(), None, &s);
        assert_eq!(s.params[0].txdelay.load(Ordering::Relaxed), 45);
        assert_eq!(s.params[0].slottime.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn rec_packet_respects_port_binding() {
        let s = shared(2, false);
        let all: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let bound: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl Write for Sink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        s.clients.register(None, Box::new(Sink(all.clone())));
        s.clients.register(Some(1), Box::new(Sink(bound.clone())));

        s.clients.send_rec_packet(0, b"frame-zero");
        // All-channel client saw it; channel 1 client did not.
        assert!(!all.lock().unwrap().is_empty());
        assert!(bound.lock().unwrap().is_empty());

        s.clients.send_rec_packet(1, b"frame-one");
        let b = bound.lock().unwrap();
        // Bound client gets it renumbered to KISS channel 0.
        assert_eq!(b[1], 0x00);
    }

    #[test]
    fn tcp_end_to_end() -> Result<()> {
        let s = shared(1, false);
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let s2 = s.clone();
        std::thread::spawn(move || listen_loop(listener, None, s2));

        let mut client = TcpStream::connect(addr)?;
        let pkt = Ax25Packet::from_text("N0CALL>TEST:over tcp").unwrap();
        client.write_all(&kiss_frame::encode(0, pkt.as_bytes()))?;
        client.flush()?;

        // Wait for the transmit queue to receive it.
        for _ in 0..100 {
            if !s.tq.is_empty(0) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (_, got) = s.tq.remove_next(0).expect("frame did not arrive");
        assert_eq!(got, pkt);

        // And frames flow back out to the client.
        s.clients.send_rec_packet(0, b"hello client");
        let mut buf = [0u8; 64];
        client.set_read_timeout(Some(std::time::Duration::from_secs(5)))?;
        let n = client.read(&mut buf)?;
        assert_eq!(buf[0], kiss_frame::FEND);
        assert!(n >= 4);
        Ok(())
    }
}
