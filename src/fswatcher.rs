//! Filesystem watching for passthrough-key hot-reload and `/dev/input`
//! hot-plug detection.
//!
//! Wraps the kernel inotify API: watched paths are tracked in a pair of
//! inverse maps (path to watch descriptor and back), and a worker thread
//! delivers [`FsEvent`]s to a single callback in kernel order. No coalescing
//! or debouncing happens at this layer.

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// Room for at least ten maximum-length inotify records per kernel read
/// (record header plus NAME_MAX + 1 bytes of name).
const EVENT_BUF_LEN: usize = 10 * (std::mem::size_of::<libc::inotify_event>() + 256);

/// Everything subscribed for every watched path. ATTRIB is included so that
/// a bare `chmod` on a previously refused key file re-triggers the trust
/// gate without requiring a content change.
fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::MODIFY
        | WatchMask::ATTRIB
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("inotify: {0}")]
    Io(#[from] io::Error),
    #[error("watcher worker is already running")]
    AlreadyRunning,
}

/// A filesystem event paired with a best-effort stat snapshot.
#[derive(Debug)]
pub struct FsEvent {
    /// Absolute path of the event target.
    pub path: PathBuf,
    /// Mask as received from the kernel. Empty for synthetic events.
    pub mask: EventMask,
    /// `stat` of the target, taken when the event was processed. `None` if
    /// the target was already gone, so deletions are still observable.
    pub stat: Option<fs::Metadata>,
    /// True for events generated by [`FsWatcher::add_from`] so that initial
    /// directory contents traverse the same path as live changes.
    pub added: bool,
}

impl FsEvent {
    fn live(path: PathBuf, mask: EventMask) -> Self {
        let stat = fs::metadata(&path).ok();
        Self {
            path,
            mask,
            stat,
            added: false,
        }
    }

    fn synthetic(path: PathBuf) -> Self {
        let stat = fs::metadata(&path).ok();
        Self {
            path,
            mask: EventMask::empty(),
            stat,
            added: true,
        }
    }

    /// Whether the event target is (or was, per the kernel mask) a directory.
    pub fn is_dir(&self) -> bool {
        self.mask.contains(EventMask::ISDIR)
            || self.stat.as_ref().map(|m| m.is_dir()).unwrap_or(false)
    }
}

/// The path/watch-descriptor bookkeeping, kept as two inverse maps.
struct WatchMap {
    watches: Watches,
    path_to_wd: HashMap<PathBuf, WatchDescriptor>,
    wd_to_path: HashMap<WatchDescriptor, PathBuf>,
}

impl WatchMap {
    fn add(&mut self, path: &Path) -> Result<(), WatcherError> {
        if self.path_to_wd.contains_key(path) {
            return Ok(());
        }
        let wd = self.watches.add(path, watch_mask())?;
        self.path_to_wd.insert(path.to_path_buf(), wd.clone());
        self.wd_to_path.insert(wd, path.to_path_buf());
        log::debug!("watching {}", path.display());
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<(), WatcherError> {
        if let Some(wd) = self.path_to_wd.remove(path) {
            self.wd_to_path.remove(&wd);
            self.watches.remove(wd)?;
            log::debug!("unwatching {}", path.display());
        }
        Ok(())
    }

    /// Resolve an inotify event to an absolute path. Directory watches
    /// report events about their entries with the entry name attached.
    fn resolve(&self, wd: &WatchDescriptor, name: Option<&OsStr>) -> Option<PathBuf> {
        let base = self.wd_to_path.get(wd)?;
        Some(match name {
            Some(n) if !n.is_empty() => base.join(n),
            _ => base.clone(),
        })
    }

    /// Drop bookkeeping for a watch the kernel has discarded (`IN_IGNORED`).
    fn forget(&mut self, wd: &WatchDescriptor) -> Option<PathBuf> {
        let path = self.wd_to_path.remove(wd)?;
        self.path_to_wd.remove(&path);
        Some(path)
    }
}

struct Shared {
    map: Mutex<WatchMap>,
    watch_dirs: AtomicBool,
    auto_add: AtomicBool,
    running: AtomicBool,
}

/// Inotify-backed filesystem watcher.
///
/// Paths are registered up front with [`add`](Self::add) /
/// [`add_from`](Self::add_from); [`begin`](Self::begin) then spawns a worker
/// that reads kernel events and hands them to the supplied callback.
pub struct FsWatcher {
    reader: Mutex<Option<Inotify>>,
    shared: Arc<Shared>,
}

impl FsWatcher {
    pub fn new() -> Result<Self, WatcherError> {
        let inotify = Inotify::init()?;
        let watches = inotify.watches();
        Ok(Self {
            reader: Mutex::new(Some(inotify)),
            shared: Arc::new(Shared {
                map: Mutex::new(WatchMap {
                    watches,
                    path_to_wd: HashMap::default(),
                    wd_to_path: HashMap::default(),
                }),
                watch_dirs: AtomicBool::new(false),
                auto_add: AtomicBool::new(true),
                running: AtomicBool::new(true),
            }),
        })
    }

    /// Register a single path. Adding an already-watched path is a silent
    /// no-op.
    pub fn add(&self, path: &Path) -> Result<(), WatcherError> {
        self.shared.map.lock().add(path)
    }

    /// Unregister a path. Removing an unwatched path is a silent no-op.
    pub fn remove(&self, path: &Path) -> Result<(), WatcherError> {
        self.shared.map.lock().remove(path)
    }

    /// Register `dir` itself (so later creations inside it are seen) and
    /// every regular file directly contained in it. Subdirectories are not
    /// recursed into. Returns one synthetic event per file added.
    pub fn add_from(&self, dir: &Path) -> Result<Vec<FsEvent>, WatcherError> {
        let mut map = self.shared.map.lock();
        map.add(dir)?;
        let mut added = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            map.add(&path)?;
            added.push(FsEvent::synthetic(path));
        }
        Ok(added)
    }

    /// Unregister `dir` and every watched path directly inside it.
    pub fn remove_from(&self, dir: &Path) -> Result<(), WatcherError> {
        let mut map = self.shared.map.lock();
        let children: Vec<PathBuf> = map
            .path_to_wd
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        for child in children {
            map.remove(&child)?;
        }
        map.remove(dir)
    }

    /// Whether the callback fires for events whose target is a directory.
    pub fn set_watch_dirs(&self, on: bool) {
        self.shared.watch_dirs.store(on, Ordering::Relaxed);
    }

    /// Whether entries created inside a watched directory are themselves
    /// added to the watch. Defaults to on.
    pub fn set_auto_add(&self, on: bool) {
        self.shared.auto_add.store(on, Ordering::Relaxed);
    }

    /// Spawn the worker that reads kernel events and invokes `callback` for
    /// each. Returning `false` from the callback stops the worker. May only
    /// be called once per watcher.
    pub fn begin<F>(&self, mut callback: F) -> Result<thread::JoinHandle<()>, WatcherError>
    where
        F: FnMut(&FsEvent) -> bool + Send + 'static,
    {
        let mut inotify = self
            .reader
            .lock()
            .take()
            .ok_or(WatcherError::AlreadyRunning)?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("fswatcher".into())
            .spawn(move || {
                let mut buf = [0u8; EVENT_BUF_LEN];
                'read: while shared.running.load(Ordering::Relaxed) {
                    let events = match inotify.read_events_blocking(&mut buf) {
                        Ok(events) => events,
                        Err(e) => {
                            log::error!("inotify read failed, watcher is dead: {e}");
                            break;
                        }
                    };
                    for event in events {
                        if event.mask.contains(EventMask::IGNORED) {
                            if let Some(path) = shared.map.lock().forget(&event.wd) {
                                log::trace!("kernel dropped watch on {}", path.display());
                            }
                            continue;
                        }
                        let path = match shared.map.lock().resolve(&event.wd, event.name) {
                            Some(path) => path,
                            None => continue,
                        };
                        let fs_ev = FsEvent::live(path, event.mask);
                        if shared.auto_add.load(Ordering::Relaxed)
                            && event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO)
                            && event.name.is_some()
                            && !event.mask.contains(EventMask::ISDIR)
                        {
                            if let Err(e) = shared.map.lock().add(&fs_ev.path) {
                                log::warn!("cannot watch new file {}: {e}", fs_ev.path.display());
                            }
                        }
                        if fs_ev.is_dir() && !shared.watch_dirs.load(Ordering::Relaxed) {
                            continue;
                        }
                        if !callback(&fs_ev) {
                            shared.running.store(false, Ordering::Relaxed);
                            break 'read;
                        }
                    }
                }
                log::debug!("watcher worker exiting");
            })?;
        Ok(handle)
    }

    /// Request worker termination. Best-effort: the worker blocks in the
    /// kernel read, so it may not observe the request until one more event
    /// arrives.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn is_watched(&self, path: &Path) -> bool {
        self.shared.map.lock().path_to_wd.contains_key(path)
    }

    #[cfg(test)]
    fn watch_count(&self) -> usize {
        self.shared.map.lock().path_to_wd.len()
    }

    #[cfg(test)]
    fn maps_are_inverse(&self) -> bool {
        let map = self.shared.map.lock();
        map.path_to_wd.len() == map.wd_to_path.len()
            && map
                .path_to_wd
                .iter()
                .all(|(p, wd)| map.wd_to_path.get(wd) == Some(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn watcher() -> FsWatcher {
        FsWatcher::new().expect("inotify init")
    }

    #[test]
    fn add_is_idempotent_and_maps_stay_inverse() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.csv");
        fs::write(&file, "key_code\n30\n").unwrap();

        let w = watcher();
        w.add(&file).unwrap();
        w.add(&file).unwrap();
        assert_eq!(w.watch_count(), 1);
        assert!(w.maps_are_inverse());
    }

    #[test]
    fn add_remove_roundtrip_restores_maps() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.csv");
        fs::write(&file, "").unwrap();

        let w = watcher();
        w.add(&file).unwrap();
        w.remove(&file).unwrap();
        assert_eq!(w.watch_count(), 0);
        assert!(w.maps_are_inverse());
        // Removing an unwatched path is a silent no-op.
        w.remove(&file).unwrap();
    }

    #[test]
    fn add_from_reports_files_but_not_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "").unwrap();
        fs::write(dir.path().join("b.csv"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let w = watcher();
        let added = w.add_from(dir.path()).unwrap();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|ev| ev.added && ev.mask.is_empty()));
        assert!(added.iter().all(|ev| ev.stat.is_some()));
        // dir itself plus two files; the subdirectory is not watched
        assert_eq!(w.watch_count(), 3);
        assert!(!w.is_watched(&dir.path().join("sub")));
        assert!(w.maps_are_inverse());
    }

    #[test]
    fn remove_from_drops_dir_and_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "").unwrap();

        let w = watcher();
        w.add_from(dir.path()).unwrap();
        w.remove_from(dir.path()).unwrap();
        assert_eq!(w.watch_count(), 0);
        assert!(w.maps_are_inverse());
    }

    #[test]
    fn worker_delivers_creation_and_auto_adds() {
        let dir = tempfile::tempdir().unwrap();
        let w = watcher();
        w.add_from(dir.path()).unwrap();

        let (tx, rx) = mpsc::channel();
        w.begin(move |ev| tx.send((ev.path.clone(), ev.mask)).is_ok())
            .unwrap();

        let new_file = dir.path().join("new.csv");
        fs::write(&new_file, "key_code\n1\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut saw_create = false;
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok((path, mask)) if path == new_file && mask.contains(EventMask::CREATE) => {
                    saw_create = true;
                    break;
                }
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(e) => panic!("worker hung up: {e}"),
            }
        }
        assert!(saw_create, "no CREATE event for {}", new_file.display());
        assert!(w.is_watched(&new_file));
    }

    #[test]
    fn auto_add_off_still_reports_creation() {
        let dir = tempfile::tempdir().unwrap();
        let w = watcher();
        w.set_auto_add(false);
        w.add_from(dir.path()).unwrap();

        let (tx, rx) = mpsc::channel();
        w.begin(move |ev| tx.send(ev.path.clone()).is_ok()).unwrap();

        let new_file = dir.path().join("n.csv");
        fs::write(&new_file, "").unwrap();

        let path = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("creation event");
        assert_eq!(path, new_file);
        assert!(!w.is_watched(&new_file));
    }

    #[test]
    fn callback_false_stops_worker() {
        let dir = tempfile::tempdir().unwrap();
        let w = watcher();
        w.add_from(dir.path()).unwrap();

        let handle = w.begin(|_| false).unwrap();
        fs::write(dir.path().join("x"), "").unwrap();
        handle.join().expect("worker exits after callback veto");
    }

    #[test]
    fn second_begin_fails() {
        let w = watcher();
        let _h = w.begin(|_| true).unwrap();
        assert!(matches!(
            w.begin(|_| true),
            Err(WatcherError::AlreadyRunning)
        ));
        w.stop();
    }
}
