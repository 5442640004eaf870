/*!
 * Isolated Bluetooth Input Reader
 * One non-blocking evdev descriptor, drained on demand
 */

use chrono::{DateTime, Utc};
use evdev::EventType;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::error::{BluetoothError, Result};

pub const EV_KEY: u16 = EventType::KEY.0;
pub const KEY_PRESS: i32 = 1;
pub const SOURCE_BLUETOOTH: &str = "bluetooth";

pub(crate) const EVENT_SIZE: usize = std::mem::size_of::<libc::input_event>();
/// Each half of the timeval: 4 bytes on 32-bit ARM readers, 8 on 64-bit hosts.
pub(crate) const TIME_FIELD_SIZE: usize = (EVENT_SIZE - 8) / 2;
const EVENTS_PER_READ: usize = 64;

/// Receives key-class events as they are drained from a reader.
pub type KeyListener = Rc<dyn Fn(&InputEvent) -> anyhow::Result<()>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
    pub time: DateTime<Utc>,
    pub source: String,
    pub device_path: PathBuf,
    /// Filled in by the handler that owns the reader.
    pub address: Option<String>,
}

impl InputEvent {
    pub fn is_key(&self) -> bool {
        EventType(self.event_type) == EventType::KEY
    }

    pub fn is_key_press(&self) -> bool {
        self.is_key() && self.value == KEY_PRESS
    }

    pub fn key_name(&self) -> String {
        key_name(self.code)
    }
}

pub fn key_name(code: u16) -> String {
    format!("KEY_{}", code)
}

pub struct BluetoothInputReader {
    path: PathBuf,
    file: Option<File>,
    listeners: Vec<KeyListener>,
}

impl BluetoothInputReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| BluetoothError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Opened isolated input device {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            listeners: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn add_listener(&mut self, listener: KeyListener) {
        self.listeners.push(listener);
    }

    /// Waits up to `timeout_ms` for input, then drains everything queued.
    ///
    /// A hangup or error on the descriptor closes the reader.
    pub fn poll(&mut self, timeout_ms: u16) -> Vec<InputEvent> {
        let revents = match self.file.as_ref() {
            Some(file) => {
                let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                    Ok(0) => return Vec::new(),
                    Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                    Err(Errno::EINTR) => return Vec::new(),
                    Err(e) => {
                        warn!("poll failed on {}: {}", self.path.display(), e);
                        PollFlags::POLLERR
                    }
                }
            }
            None => return Vec::new(),
        };

        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            info!("Input device {} went away", self.path.display());
            self.close();
            return Vec::new();
        }
        if !revents.contains(PollFlags::POLLIN) {
            return Vec::new();
        }

        let events = self.drain();
        for event in events.iter().filter(|e| e.is_key()) {
            for listener in &self.listeners {
                if let Err(e) = listener(event) {
                    warn!("Key listener failed for {}: {:#}", self.path.display(), e);
                }
            }
        }
        events
    }

    fn drain(&mut self) -> Vec<InputEvent> {
        let mut events = Vec::new();
        let mut gone = false;
        let mut buf = [0u8; EVENT_SIZE * EVENTS_PER_READ];

        if let Some(mut file) = self.file.as_ref() {
            loop {
                match file.read(&mut buf) {
                    Ok(0) => {
                        gone = true;
                        break;
                    }
                    Ok(n) => {
                        events.extend(
                            buf[..n]
                                .chunks_exact(EVENT_SIZE)
                                .map(|chunk| decode_event(chunk, &self.path)),
                        );
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                        gone = true;
                        break;
                    }
                    Err(e) => {
                        warn!("read failed on {}: {}", self.path.display(), e);
                        break;
                    }
                }
            }
        }

        if gone {
            info!("Input device {} was removed", self.path.display());
            self.close();
        }
        debug!(count = events.len(), path = %self.path.display(), "drained input events");
        events
    }

    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Closed input device {}", self.path.display());
        }
        self.listeners.clear();
    }
}

impl Drop for BluetoothInputReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_event(chunk: &[u8], path: &Path) -> InputEvent {
    let raw = raw_event(chunk);
    let event = evdev::InputEvent::from(raw);
    InputEvent {
        event_type: event.event_type().0,
        code: event.code(),
        value: event.value(),
        time: DateTime::<Utc>::from(event.timestamp()),
        source: SOURCE_BLUETOOTH.to_string(),
        device_path: path.to_path_buf(),
        address: None,
    }
}

/// Splits one kernel record into its fields in native byte order.
fn raw_event(chunk: &[u8]) -> libc::input_event {
    let (time, rest) = chunk.split_at(TIME_FIELD_SIZE * 2);
    let (secs, micros) = time.split_at(TIME_FIELD_SIZE);
    libc::input_event {
        time: libc::timeval {
            tv_sec: signed(secs) as libc::time_t,
            tv_usec: signed(micros) as libc::suseconds_t,
        },
        type_: u16::from_ne_bytes([rest[0], rest[1]]),
        code: u16::from_ne_bytes([rest[2], rest[3]]),
        value: i32::from_ne_bytes([rest[4], rest[5], rest[6], rest[7]]),
    }
}

fn signed(bytes: &[u8]) -> i64 {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).map_or(0, |b| i32::from_ne_bytes(b) as i64),
        _ => <[u8; 8]>::try_from(bytes).map_or(0, i64::from_ne_bytes),
    }
}
