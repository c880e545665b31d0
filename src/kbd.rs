//! Keyboard device handles and readiness multiplexing.
//!
//! Each [`Keyboard`] wraps one `/dev/input/event*` character device. The
//! dispatcher holds an exclusive grab on every keyboard it owns, so the rest
//! of the system only ever sees the events re-emitted through the virtual
//! device. Devices move between `event*` numbers on replug, so a keyboard is
//! identified by its kernel id and name, never by path.

use crate::keys::KeyEvent;
use evdev::Device;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbdError {
    #[error("keyboard device: {0}")]
    Io(#[from] io::Error),
    #[error("keyboard device is not open")]
    NotOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbdState {
    /// Descriptor held, no exclusive grab; events are not authoritative.
    Open,
    /// Exclusive grab held; the dispatcher owns every event.
    Grabbed,
    /// Descriptor closed after unplug; waiting for the device to come back.
    Disabled,
}

/// Kernel-reported identity of a physical keyboard, stable across replug.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KbdIdentity {
    vendor: u16,
    product: u16,
    version: u16,
    name: String,
}

impl KbdIdentity {
    fn of(dev: &Device) -> Self {
        let id = dev.input_id();
        Self {
            vendor: id.vendor(),
            product: id.product(),
            version: id.version(),
            name: dev.name().unwrap_or("").to_string(),
        }
    }
}

pub struct Keyboard {
    dev: Option<Device>,
    path: PathBuf,
    identity: KbdIdentity,
    state: KbdState,
    /// Records already fetched from the kernel but not yet consumed.
    pending: VecDeque<evdev::InputEvent>,
}

impl Keyboard {
    pub fn open(path: &Path) -> Result<Self, KbdError> {
        let dev = Device::open(path)?;
        let identity = KbdIdentity::of(&dev);
        log::info!(
            "opened keyboard \"{}\" at {}",
            identity.name,
            path.display()
        );
        Ok(Self {
            dev: Some(dev),
            path: path.to_path_buf(),
            identity,
            state: KbdState::Open,
            pending: VecDeque::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> KbdState {
        self.state
    }

    /// Take the exclusive grab so the kernel stops delivering this device's
    /// events to any other consumer.
    pub fn grab(&mut self) -> Result<(), KbdError> {
        let dev = self.dev.as_mut().ok_or(KbdError::NotOpen)?;
        dev.grab()?;
        self.state = KbdState::Grabbed;
        log::info!("grabbed keyboard \"{}\"", self.identity.name);
        Ok(())
    }

    /// Release the grab and close the descriptor. Used after the device
    /// vanished; the handle sticks around to be matched on replug.
    pub fn disable(&mut self) {
        if let Some(mut dev) = self.dev.take() {
            let _ = dev.ungrab();
        }
        self.pending.clear();
        self.state = KbdState::Disabled;
        log::info!("disabled keyboard \"{}\"", self.identity.name);
    }

    /// Re-open after replug, possibly at a different device path.
    pub fn reset(&mut self, path: &Path) -> Result<(), KbdError> {
        let dev = Device::open(path)?;
        self.dev = Some(dev);
        self.path = path.to_path_buf();
        self.state = KbdState::Open;
        Ok(())
    }

    /// Whether the device at `path` is this physical keyboard.
    pub fn is_me(&self, path: &Path) -> bool {
        match Device::open(path) {
            Ok(dev) => KbdIdentity::of(&dev) == self.identity,
            Err(_) => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.dev.as_ref().map(|d| d.as_raw_fd())
    }

    /// Read the next input record, blocking if none is buffered. Fails when
    /// the descriptor is gone (device unplugged).
    pub fn get(&mut self) -> Result<KeyEvent, KbdError> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Ok(ev.into());
            }
            let dev = self.dev.as_mut().ok_or(KbdError::NotOpen)?;
            let events = dev.fetch_events()?;
            self.pending.extend(events);
        }
    }
}

pub type KbdHandle = Arc<Mutex<Keyboard>>;

/// Readiness poll over a set of grabbed keyboards.
pub struct KbdMultiplexer {
    poll: Poll,
    events: Events,
}

impl KbdMultiplexer {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(32),
        })
    }

    /// Return the index of a keyboard with a readable record, or `None` on
    /// timeout. Keyboards with already-buffered records win without
    /// polling; ties go to the lowest index so behaviour is reproducible.
    pub fn wait(&mut self, kbds: &[KbdHandle], timeout: Duration) -> io::Result<Option<usize>> {
        let mut fds = Vec::with_capacity(kbds.len());
        for (i, kbd) in kbds.iter().enumerate() {
            let kbd = kbd.lock();
            if kbd.has_pending() {
                return Ok(Some(i));
            }
            if let Some(fd) = kbd.raw_fd() {
                fds.push((i, fd));
            }
        }
        poll_ready(&mut self.poll, &mut self.events, &fds, timeout)
    }
}

fn poll_ready(
    poll: &mut Poll,
    events: &mut Events,
    fds: &[(usize, RawFd)],
    timeout: Duration,
) -> io::Result<Option<usize>> {
    for &(i, fd) in fds {
        poll.registry()
            .register(&mut SourceFd(&fd), Token(i), Interest::READABLE)?;
    }
    let res = poll.poll(events, Some(timeout));
    for &(_, fd) in fds {
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
    }
    match res {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
        Err(e) => return Err(e),
    }
    Ok(events.iter().map(|ev| ev.token().0).min())
}
