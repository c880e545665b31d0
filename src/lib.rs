//! keygated: the privileged input half of the keygate keyboard scripting
//! system.
//!
//! The daemon exclusively grabs one or more keyboards, re-emits their events
//! through a synthetic uinput keyboard, and hands an administrator-approved
//! set of key codes to the unprivileged macro daemon for rewriting. It is
//! the security boundary between raw input devices and user scripts.

use std::path::PathBuf;

pub mod daemon;
pub mod fswatcher;
pub mod kbd;
pub mod keys;
pub mod macro_sock;
pub mod registry;
pub mod uinput;

pub use daemon::InputDaemon;

pub struct ValidatedArgs {
    /// Keyboard event devices to grab.
    pub devices: Vec<PathBuf>,
    /// Data root holding the passthrough key directory.
    pub data_dir: PathBuf,
    /// Socket path the macro daemon connects to.
    pub socket_path: PathBuf,
}

impl ValidatedArgs {
    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join(daemon::KEYS_SUBDIR)
    }
}
