//! The dispatcher: ties keyboards, registry, uinput, and the macro daemon
//! socket together.
//!
//! One thread runs the event loop below; each watcher delivers on its own
//! worker. Keyboards live in one of two lists: `available_kbds` (grabbed,
//! events are authoritative) and `pulled_kbds` (unplugged, waiting for the
//! device to reappear under `/dev/input`).

use crate::fswatcher::{FsEvent, FsWatcher};
use crate::kbd::{KbdHandle, KbdMultiplexer, KbdState, Keyboard};
use crate::keys::{KbdAction, KeyEvent};
use crate::macro_sock::{MacroConn, MacroEndpoint, SocketError};
use crate::registry::PassthroughRegistry;
use crate::uinput::UinputKbd;
use crate::ValidatedArgs;
use anyhow::{bail, Context, Result};
use inotify::EventMask;
use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Heartbeat of the event loop: how long one readiness poll may block
/// before the loop re-observes keyboard list changes.
pub const MUX_TIMEOUT: Duration = Duration::from_millis(64);

/// Consecutive socket failures tolerated before the macro daemon is
/// considered dead and the process exits.
pub const MAX_ERRORS: u32 = 30;

/// Ceiling for the wait on udev applying its permission rules to a freshly
/// plugged device, and the poll interval used during that wait.
const PERMISSION_WAIT: Duration = Duration::from_secs(5);
const PERMISSION_POLL: Duration = Duration::from_micros(100);

/// Subdirectory of the data root holding passthrough key CSV files.
pub const KEYS_SUBDIR: &str = "passthrough_keys";

const INPUT_TREE: &str = "/dev/input";

pub struct InputDaemon {
    available_kbds: Arc<Mutex<Vec<KbdHandle>>>,
    pulled_kbds: Arc<Mutex<Vec<KbdHandle>>>,
    registry: Arc<Mutex<PassthroughRegistry>>,
    key_watcher: Arc<FsWatcher>,
    input_watcher: Arc<FsWatcher>,
    _endpoint: MacroEndpoint,
    conn: MacroConn,
    udev: UinputKbd,
    mux: KbdMultiplexer,
    errors: u32,
}

impl InputDaemon {
    pub fn new(args: &ValidatedArgs) -> Result<Self> {
        let key_watcher = Arc::new(FsWatcher::new()?);
        let input_watcher = Arc::new(FsWatcher::new()?);
        input_watcher.set_watch_dirs(true);
        input_watcher.set_auto_add(false);

        let registry = Arc::new(Mutex::new(PassthroughRegistry::new()));
        let keys_dir = args.keys_dir();
        fs::create_dir_all(&keys_dir)
            .with_context(|| format!("cannot create {}", keys_dir.display()))?;
        let initial = key_watcher
            .add_from(&keys_dir)
            .with_context(|| format!("cannot watch {}", keys_dir.display()))?;
        log::info!(
            "found {} key file(s) in {}",
            initial.len(),
            keys_dir.display()
        );
        for ev in &initial {
            handle_key_file_event(&registry, &key_watcher, ev);
        }
        input_watcher
            .add(Path::new(INPUT_TREE))
            .context("cannot watch /dev/input")?;

        let udev = UinputKbd::new().context(
            "cannot create the uinput output device; is the uinput module loaded and are we in the uinput group?",
        )?;

        let endpoint = MacroEndpoint::bind(&args.socket_path)?;
        log::info!("waiting for the macro daemon to connect");
        let conn = endpoint.accept()?;

        // Grab the keyboards last so the user is not locked out while the
        // macro daemon is still starting up.
        let mut kbds = Vec::with_capacity(args.devices.len());
        for path in &args.devices {
            let mut kbd = Keyboard::open(path)
                .with_context(|| format!("cannot open keyboard {}", path.display()))?;
            kbd.grab()
                .with_context(|| format!("cannot grab keyboard {}", path.display()))?;
            kbds.push(Arc::new(Mutex::new(kbd)));
        }

        Ok(Self {
            available_kbds: Arc::new(Mutex::new(kbds)),
            pulled_kbds: Arc::new(Mutex::new(Vec::new())),
            registry,
            key_watcher,
            input_watcher,
            _endpoint: endpoint,
            conn,
            udev,
            mux: KbdMultiplexer::new()?,
            errors: 0,
        })
    }

    /// Start the watcher workers and run the event loop. Only returns on a
    /// fatal error.
    pub fn run(mut self) -> Result<()> {
        self.start_registry_watcher()?;
        self.start_hotplug_watcher()?;
        log::info!("entering the event loop");
        loop {
            let snapshot: Vec<KbdHandle> = self.available_kbds.lock().clone();
            if snapshot.is_empty() {
                // Every keyboard is pulled; idle until recovery refills the
                // list.
                thread::sleep(MUX_TIMEOUT);
                continue;
            }
            let Some(idx) = self.mux.wait(&snapshot, MUX_TIMEOUT)? else {
                continue;
            };
            let kbd = &snapshot[idx];
            let (res, state) = {
                let mut k = kbd.lock();
                (k.get(), k.state())
            };
            let ev = match res {
                Ok(ev) => ev,
                Err(e) => {
                    log::warn!("lost keyboard \"{}\": {e}", kbd.lock().name());
                    self.pull(kbd);
                    continue;
                }
            };
            if state != KbdState::Grabbed {
                // Stale record read between unplug and disable.
                continue;
            }
            if ev.is_syn() {
                // The output device writes its own barriers.
                continue;
            }

            let passthrough = self.registry.lock().contains(ev.code as u32);
            if passthrough {
                match self.exchange(ev) {
                    Ok(()) => {
                        self.udev.flush()?;
                        self.errors = 0;
                        continue;
                    }
                    Err(e) => {
                        self.errors += 1;
                        log::warn!(
                            "macro daemon exchange failed ({e}); re-emitting the key \
                             ({}/{MAX_ERRORS} consecutive errors)",
                            self.errors,
                        );
                        if self.errors > MAX_ERRORS {
                            self.conn.close();
                            bail!(
                                "macro daemon is unreachable after {MAX_ERRORS} consecutive \
                                 socket errors"
                            );
                        }
                        // Fall through: the user still gets the keystroke.
                    }
                }
            }

            self.udev.emit(&ev);
            self.udev.flush()?;
        }
    }

    /// One passthrough exchange: send the grabbed key, queue every reply for
    /// emission until the terminator record arrives. The grabbed key itself
    /// is never emitted; the macro daemon decides the output.
    fn exchange(&mut self, ev: KeyEvent) -> Result<(), SocketError> {
        self.conn.send(&KbdAction::from_event(ev))?;
        loop {
            let action = self.conn.recv()?;
            if action.done != 0 {
                return Ok(());
            }
            self.udev.emit(&action.ev);
        }
    }

    /// Move a dead keyboard from `available_kbds` to `pulled_kbds`.
    fn pull(&self, kbd: &KbdHandle) {
        kbd.lock().disable();
        {
            let mut avail = self.available_kbds.lock();
            if let Some(i) = avail.iter().position(|k| Arc::ptr_eq(k, kbd)) {
                avail.remove(i);
            }
        }
        self.pulled_kbds.lock().push(Arc::clone(kbd));
        log::warn!("watching {INPUT_TREE} for the device to come back");
    }

    fn start_registry_watcher(&self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let watcher = Arc::clone(&self.key_watcher);
        self.key_watcher.begin(move |ev| {
            handle_key_file_event(&registry, &watcher, ev);
            true
        })?;
        Ok(())
    }

    fn start_hotplug_watcher(&self) -> Result<()> {
        let available = Arc::clone(&self.available_kbds);
        let pulled = Arc::clone(&self.pulled_kbds);
        self.input_watcher.begin(move |ev| {
            if ev
                .mask
                .intersects(EventMask::CREATE | EventMask::MOVED_TO)
            {
                try_recover(&available, &pulled, &ev.path);
            }
            true
        })?;
        Ok(())
    }
}

/// Registry reactions to key-directory events: a deleted file is unloaded,
/// anything created, modified, re-chmodded, or moved in goes through the
/// trust gate. Synthetic events from the initial directory scan take the
/// same path.
fn handle_key_file_event(
    registry: &Mutex<PassthroughRegistry>,
    watcher: &FsWatcher,
    ev: &FsEvent,
) {
    let mut registry = registry.lock();
    if ev.mask.contains(EventMask::DELETE_SELF) {
        registry.unload(&ev.path);
    } else if ev.added
        || ev.mask.intersects(
            EventMask::CREATE | EventMask::MODIFY | EventMask::ATTRIB | EventMask::MOVED_TO,
        )
    {
        registry.load_event(watcher, ev);
    }
}

/// Hot-plug recovery: when something appears under `/dev/input`, see if it
/// is one of our pulled keyboards and take it back.
fn try_recover(
    available: &Mutex<Vec<KbdHandle>>,
    pulled: &Mutex<Vec<KbdHandle>>,
    path: &Path,
) {
    if path == Path::new(INPUT_TREE) {
        return;
    }
    match fs::metadata(path) {
        Ok(m) if m.file_type().is_char_device() => {}
        _ => return,
    }
    if pulled.lock().is_empty() {
        return;
    }
    // udev may not have applied its rules yet when the node appears; wait
    // for the input group to get read/write before touching the device.
    if !wait_group_rw(path, PERMISSION_WAIT) {
        log::warn!("could not acquire permissions on {}", path.display());
        return;
    }
    let mut pulled = pulled.lock();
    let Some(idx) = pulled.iter().position(|k| k.lock().is_me(path)) else {
        return;
    };
    let kbd = Arc::clone(&pulled[idx]);
    {
        let mut k = kbd.lock();
        if let Err(e) = k.reset(path) {
            log::error!("cannot reopen {}: {e}", path.display());
            return;
        }
        if let Err(e) = k.grab() {
            log::error!("cannot re-grab {}: {e}", path.display());
            k.disable();
            return;
        }
        log::info!("keyboard \"{}\" is back at {}", k.name(), path.display());
    }
    pulled.remove(idx);
    available.lock().push(kbd);
}

/// Poll `stat` until the group read and write bits are both set, up to
/// `ceiling`.
fn wait_group_rw(path: &Path, ceiling: Duration) -> bool {
    let start = Instant::now();
    loop {
        if let Ok(m) = fs::metadata(path) {
            if m.mode() & 0o060 == 0o060 {
                return true;
            }
        }
        if start.elapsed() >= ceiling {
            return false;
        }
        thread::sleep(PERMISSION_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn write_keys(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        path
    }

    #[test]
    fn group_rw_wait_succeeds_and_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("event7");
        fs::write(&file, "").unwrap();

        fs::set_permissions(&file, fs::Permissions::from_mode(0o660)).unwrap();
        assert!(wait_group_rw(&file, Duration::from_millis(50)));

        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(!wait_group_rw(&file, Duration::from_millis(10)));

        // Read-only for the group is not enough.
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();
        assert!(!wait_group_rw(&file, Duration::from_millis(10)));
    }

    #[test]
    fn key_file_events_drive_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n");
        let watcher = FsWatcher::new().unwrap();
        let registry = Mutex::new(PassthroughRegistry::new());

        let created = FsEvent {
            path: file.clone(),
            mask: EventMask::CREATE,
            stat: fs::metadata(&file).ok(),
            added: false,
        };
        handle_key_file_event(&registry, &watcher, &created);
        assert!(registry.lock().contains(30));

        let deleted = FsEvent {
            path: file.canonicalize().unwrap(),
            mask: EventMask::DELETE_SELF,
            stat: None,
            added: false,
        };
        handle_key_file_event(&registry, &watcher, &deleted);
        assert!(!registry.lock().contains(30));
    }

    #[test]
    fn synthetic_events_take_the_gated_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n57\n");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();
        let watcher = FsWatcher::new().unwrap();
        let registry = Mutex::new(PassthroughRegistry::new());

        let synthetic = FsEvent {
            path: file.clone(),
            mask: EventMask::empty(),
            stat: fs::metadata(&file).ok(),
            added: true,
        };
        handle_key_file_event(&registry, &watcher, &synthetic);
        assert!(
            !registry.lock().contains(57),
            "a world-writable file must be refused even at startup"
        );
    }

    #[test]
    fn unrelated_masks_do_not_touch_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n");
        let watcher = FsWatcher::new().unwrap();
        let registry = Mutex::new(PassthroughRegistry::new());

        let moved_away = FsEvent {
            path: file.clone(),
            mask: EventMask::MOVED_FROM,
            stat: fs::metadata(&file).ok(),
            added: false,
        };
        handle_key_file_event(&registry, &watcher, &moved_away);
        assert!(registry.lock().is_empty());
    }
}
