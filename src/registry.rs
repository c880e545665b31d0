//! The passthrough key registry.
//!
//! Key codes listed here are handed to the macro daemon instead of being
//! forwarded verbatim. The registry is rebuilt from CSV files in the
//! `passthrough_keys` directory as the watcher reports changes; files are
//! only trusted when owned by the daemon's uid with mode 0644.

use crate::fswatcher::{FsEvent, FsWatcher};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
type HashSet<T> = rustc_hash::FxHashSet<T>;

/// Header of the CSV column holding key codes.
const KEY_CODE_COLUMN: &str = "key_code";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("no `{KEY_CODE_COLUMN}` column")]
    MissingColumn,
}

/// The set of passthrough key codes together with the per-file contributions
/// it is the union of.
#[derive(Default)]
pub struct PassthroughRegistry {
    keys: HashSet<u32>,
    sources: HashMap<PathBuf, Vec<u32>>,
}

impl PassthroughRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot-path membership test, called by the dispatcher for every key.
    pub fn contains(&self, code: u32) -> bool {
        self.keys.contains(&code)
    }

    /// Load a key file, replacing any previous contribution of the same
    /// canonical path, and put the file under watch so later edits are
    /// observed. A file that cannot be read or parsed is logged and leaves
    /// the registry unchanged.
    pub fn load(&mut self, watcher: &FsWatcher, path: &Path) {
        let path = match path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("cannot resolve {}: {e}", path.display());
                return;
            }
        };
        let codes = match read_key_codes(&path) {
            Ok(codes) => codes,
            Err(e) => {
                log::warn!("ignoring key file {}: {e}", path.display());
                return;
            }
        };
        self.unload(&path);
        self.keys.extend(codes.iter().copied());
        log::info!(
            "loaded {} passthrough key(s) from {}",
            codes.len(),
            path.display()
        );
        self.sources.insert(path.clone(), codes);
        if let Err(e) = watcher.add(&path) {
            log::warn!("cannot watch key file {}: {e}", path.display());
        }
    }

    /// Trust-gated load from a watcher event: only files owned by the
    /// daemon's real uid with permission bits exactly 0644 are accepted.
    pub fn load_event(&mut self, watcher: &FsWatcher, ev: &FsEvent) {
        let Some(stat) = &ev.stat else {
            // Gone before the event was processed; a DELETE_SELF follows.
            return;
        };
        let mode = stat.mode() & 0o777;
        let uid = unsafe { libc::getuid() };
        if mode != 0o644 || stat.uid() != uid {
            log::warn!(
                "refusing key file {}: mode {:03o} owner uid {} (want mode 644 owned by uid {uid})",
                ev.path.display(),
                mode,
                stat.uid(),
            );
            return;
        }
        self.load(watcher, &ev.path);
    }

    /// Drop a file's contribution and rebuild the set as the union of the
    /// remaining sources.
    pub fn unload(&mut self, path: &Path) {
        if self.sources.remove(path).is_none() {
            return;
        }
        self.keys.clear();
        for codes in self.sources.values() {
            self.keys.extend(codes.iter().copied());
        }
        log::info!("unloaded passthrough keys from {}", path.display());
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

/// Extract the `key_code` column of a CSV file. Cells that do not parse as a
/// signed decimal integer, and negative values, are skipped.
fn read_key_codes(path: &Path) -> Result<Vec<u32>, RegistryError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let col = rdr
        .headers()?
        .iter()
        .position(|h| h == KEY_CODE_COLUMN)
        .ok_or(RegistryError::MissingColumn)?;
    let mut codes = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let Some(cell) = record.get(col) else {
            continue;
        };
        match cell.parse::<i32>() {
            Ok(v) if v >= 0 => codes.push(v as u32),
            _ => {}
        }
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use inotify::EventMask;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_keys(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        path
    }

    fn event_for(path: &Path) -> FsEvent {
        FsEvent {
            path: path.to_path_buf(),
            mask: EventMask::CREATE,
            stat: fs::metadata(path).ok(),
            added: false,
        }
    }

    #[test]
    fn load_and_unload_restore_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n31\n");
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();

        reg.load(&w, &file);
        assert!(reg.contains(30));
        assert!(reg.contains(31));
        assert!(!reg.contains(32));

        reg.unload(&file.canonicalize().unwrap());
        assert!(reg.is_empty());
        assert_eq!(reg.source_count(), 0);
    }

    #[test]
    fn shared_key_survives_unloading_one_source() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_keys(dir.path(), "a.csv", "key_code\n30\n31\n");
        let b = write_keys(dir.path(), "b.csv", "key_code\n31\n32\n");
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();

        reg.load(&w, &a);
        reg.load(&w, &b);
        reg.unload(&a.canonicalize().unwrap());

        assert!(!reg.contains(30));
        assert!(reg.contains(31), "31 is still contributed by b.csv");
        assert!(reg.contains(32));
    }

    #[test]
    fn reload_replaces_a_files_contribution() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n31\n");
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();

        reg.load(&w, &file);
        write_keys(dir.path(), "a.csv", "key_code\n31\n32\n");
        reg.load(&w, &file);

        assert!(!reg.contains(30));
        assert!(reg.contains(31));
        assert!(reg.contains(32));
        assert_eq!(reg.source_count(), 1);
    }

    #[test]
    fn bad_cells_are_skipped_good_ones_kept() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(
            dir.path(),
            "a.csv",
            "name,key_code\nvolume,-5\nplay,164\njunk,xyz\n",
        );
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();

        reg.load(&w, &file);
        assert!(reg.contains(164));
        assert!(!reg.contains(5));
        assert_eq!(reg.source_count(), 1);
    }

    #[test]
    fn missing_column_leaves_registry_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_keys(dir.path(), "a.csv", "key_code\n30\n");
        let bad = write_keys(dir.path(), "b.csv", "code\n31\n");
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();

        reg.load(&w, &good);
        reg.load(&w, &bad);

        assert!(reg.contains(30));
        assert!(!reg.contains(31));
        assert_eq!(reg.source_count(), 1);
    }

    #[test]
    fn malformed_reload_keeps_previous_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n");
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();

        reg.load(&w, &file);
        // The column header disappears; the reload must not drop key 30.
        write_keys(dir.path(), "a.csv", "nothing\nhere\n");
        reg.load(&w, &file);

        assert!(reg.contains(30));
    }

    #[test]
    fn gate_rejects_wrong_mode_and_accepts_0644() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();

        reg.load_event(&w, &event_for(&file));
        assert!(reg.is_empty(), "world-writable file must be refused");

        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
        reg.load_event(&w, &event_for(&file));
        assert!(reg.contains(30));
    }

    #[test]
    fn gate_ignores_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        let w = FsWatcher::new().unwrap();
        let mut reg = PassthroughRegistry::new();
        reg.load_event(
            &w,
            &FsEvent {
                path: dir.path().join("gone.csv"),
                mask: EventMask::CREATE,
                stat: None,
                added: false,
            },
        );
        assert!(reg.is_empty());
    }
}
