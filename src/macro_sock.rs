//! The socket endpoint the macro daemon talks to.
//!
//! The daemon owns the listening socket inside its data root; the
//! unprivileged macro daemon connects to it. Each exchange is initiated by
//! the daemon: one [`KbdAction`] out, then replies in until one arrives with
//! its `done` byte set. Records have a fixed 12-byte layout; there is no
//! other framing.

use crate::keys::KbdAction;
use std::fs;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// How long `recv` waits for the macro daemon before the exchange is
/// treated as failed.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("macro daemon socket: {0}")]
    Io(#[from] io::Error),
    #[error("macro daemon closed the connection")]
    Eof,
}

/// The listening side, bound to a fixed path in the data root.
pub struct MacroEndpoint {
    listener: UnixListener,
    path: PathBuf,
}

impl MacroEndpoint {
    /// Bind the socket, replacing a stale socket file from a previous run.
    pub fn bind(path: &Path) -> Result<Self, SocketError> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        // Connecting is what makes the peer trusted; keep others out.
        fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
        log::info!("listening for the macro daemon on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept the macro daemon. Blocks until the peer connects.
    pub fn accept(&self) -> Result<MacroConn, SocketError> {
        let (stream, _) = self.listener.accept()?;
        stream.set_read_timeout(Some(RECV_TIMEOUT))?;
        log::info!("macro daemon connected");
        Ok(MacroConn { stream })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }
}

/// One established connection to the macro daemon.
pub struct MacroConn {
    stream: UnixStream,
}

impl MacroConn {
    /// Connect to an endpoint. This is the peer side of [`MacroEndpoint`];
    /// the daemon itself only accepts.
    pub fn connect(path: &Path) -> Result<Self, SocketError> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(Self { stream })
    }

    /// Write one record. `write_all` keeps going through partial writes.
    pub fn send(&mut self, action: &KbdAction) -> Result<(), SocketError> {
        self.stream.write_all(&action.to_bytes())?;
        Ok(())
    }

    /// Read exactly one record; blocks up to [`RECV_TIMEOUT`].
    pub fn recv(&mut self) -> Result<KbdAction, SocketError> {
        let mut buf = [0u8; KbdAction::WIRE_LEN];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => Ok(KbdAction::from_bytes(&buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(SocketError::Eof),
            Err(e) => Err(e.into()),
        }
    }

    /// Shut the stream down so the peer observes EOF.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
