//! Per-daemon persistent data store.
//!
//! The store lives at `<data-root>/<addr-hash>` where `addr-hash` is the
//! first 8 hex chars of SHA-256 over the containerd socket path, so two
//! daemons on one host never share state. Everything is plain files:
//!
//! ```text
//! <root>/
//! ├── containers/<namespace>/<id>/   # record dir (also the lock unit)
//! │   ├── config.json                # ContainerRecord
//! │   ├── hosts  resolv.conf  hostname
//! │   ├── logs                       # JSON-lines log
//! │   └── down                       # marker: do not restart
//! ├── names/<namespace>/<name>       # symlink -> id (atomic reservation)
//! ├── volumes/<namespace>/<name>/    # _data + labels.json
//! ├── etchosts/
//! └── networks/
//! ```
//!
//! Writes are temp-file + atomic rename. Concurrent access to one record
//! serializes on an advisory `flock(2)` taken on the record directory.

pub mod record;

pub use record::{
    ContainerRecord, ContainerStatus, NetworkAttachment, PortMapping, Protocol, RestartPolicy,
};

use crate::config::GlobalOptions;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Record file name inside a record directory.
const RECORD_FILE: &str = "config.json";
/// Marker file telling the supervisor not to restart the task.
const DOWN_MARKER: &str = "down";

/// First 8 hex chars of SHA-256 over the containerd socket path.
pub fn addr_hash(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    let mut out = String::with_capacity(8);
    for b in &digest[..4] {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Write `data` to `path` atomically: temp file in the same directory, then
/// rename over the target.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::store(format!("no parent for {}", path.display())))?;
    let tmp = dir.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        path.file_name().and_then(|n| n.to_str()).unwrap_or("f")
    ));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Advisory lock on a record directory. Dropping releases the lock.
pub struct RecordLock {
    file: fs::File,
}

impl RecordLock {
    fn acquire(dir: &Path, exclusive: bool) -> Result<Self> {
        let file = fs::File::open(dir)
            .map_err(|e| Error::store(format!("locking {}: {}", dir.display(), e)))?;
        let op = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(Error::store(format!(
                "flock {}: {}",
                dir.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { file })
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Handle to the per-daemon store, bound to one namespace.
#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
    namespace: String,
}

impl DataStore {
    /// Open (creating on first use) the store for the given global options.
    pub fn open(opts: &GlobalOptions) -> Result<Self> {
        let root = opts.data_root.join(addr_hash(&opts.address));
        for sub in ["containers", "volumes", "names", "etchosts", "networks"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root,
            namespace: opts.namespace.clone(),
        })
    }

    /// Store root (`<data-root>/<addr-hash>`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Namespace this handle is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Record directory for a container ID. The directory is also the lock
    /// namespace for that container.
    pub fn record_dir(&self, id: &str) -> PathBuf {
        self.root.join("containers").join(&self.namespace).join(id)
    }

    /// Volumes directory for this namespace.
    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes").join(&self.namespace)
    }

    fn names_dir(&self) -> PathBuf {
        self.root.join("names").join(&self.namespace)
    }

    /// Take a shared (read) lock on a record.
    pub fn lock_shared(&self, id: &str) -> Result<RecordLock> {
        RecordLock::acquire(&self.record_dir(id), false)
    }

    /// Take an exclusive (write) lock on a record.
    pub fn lock_exclusive(&self, id: &str) -> Result<RecordLock> {
        RecordLock::acquire(&self.record_dir(id), true)
    }

    // --- name index ---------------------------------------------------

    /// Atomically reserve `name` for container `id`.
    ///
    /// Symlink creation is the O_EXCL primitive: of two racing `run`s,
    /// exactly one wins and the loser sees `NameInUse` before any containerd
    /// mutation.
    pub fn reserve_name(&self, name: &str, id: &str) -> Result<()> {
        let dir = self.names_dir();
        fs::create_dir_all(&dir)?;
        match std::os::unix::fs::symlink(id, dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::NameInUse(name.to_string()))
            }
            Err(e) => Err(Error::store(format!("reserving name {:?}: {}", name, e))),
        }
    }

    /// Release a name reservation. Missing entries are fine.
    pub fn release_name(&self, name: &str) {
        let _ = fs::remove_file(self.names_dir().join(name));
    }

    /// Look up the container ID a name points at.
    pub fn lookup_name(&self, name: &str) -> Option<String> {
        fs::read_link(self.names_dir().join(name))
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    /// All `(name, id)` pairs in this namespace.
    pub fn list_names(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(self.names_dir()) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(target) = fs::read_link(entry.path()) {
                out.push((name, target.to_string_lossy().into_owned()));
            }
        }
        out.sort();
        out
    }

    // --- container records --------------------------------------------

    /// Create the record directory and persist an initial record.
    pub fn create_record(&self, record: &ContainerRecord) -> Result<()> {
        let dir = self.record_dir(&record.id);
        fs::create_dir_all(&dir)?;
        let _lock = self.lock_exclusive(&record.id)?;
        self.write_record_locked(record)
    }

    /// Persist a record, taking the exclusive lock.
    pub fn save_record(&self, record: &ContainerRecord) -> Result<()> {
        let dir = self.record_dir(&record.id);
        if !dir.exists() {
            return Err(Error::store(format!(
                "record directory for {} is gone",
                record.short_id()
            )));
        }
        let _lock = self.lock_exclusive(&record.id)?;
        self.write_record_locked(record)
    }

    fn write_record_locked(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_dir(&record.id).join(RECORD_FILE);
        let data = serde_json::to_vec_pretty(record)?;
        atomic_write(&path, &data)
    }

    /// Read-modify-write a record under the exclusive lock.
    pub fn update_record<F>(&self, id: &str, f: F) -> Result<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let _lock = self.lock_exclusive(id)?;
        let path = self.record_dir(id).join(RECORD_FILE);
        let raw = fs::read(&path)
            .map_err(|e| Error::store(format!("reading record for {}: {}", id, e)))?;
        let mut record: ContainerRecord = serde_json::from_slice(&raw)?;
        f(&mut record);
        self.write_record_locked(&record)?;
        Ok(record)
    }

    /// Load a record, if it exists and is fully written.
    pub fn load_record(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let dir = self.record_dir(id);
        if !dir.exists() {
            return Ok(None);
        }
        let _lock = self.lock_shared(id)?;
        let path = dir.join(RECORD_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            // A record directory without config.json is a container mid-create.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::store(format!("reading record for {}: {}", id, e))),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Delete a record directory and free its name.
    pub fn delete_record(&self, id: &str) -> Result<()> {
        if let Ok(Some(record)) = self.load_record(id) {
            if let Some(name) = &record.name {
                self.release_name(name);
            }
        }
        let dir = self.record_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// All readable records in this namespace. Partially populated
    /// directories are skipped, never an error.
    pub fn list_records(&self) -> Result<Vec<ContainerRecord>> {
        let mut out = Vec::new();
        let dir = self.root.join("containers").join(&self.namespace);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(out);
        };
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load_record(&id) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(e) => tracing::debug!(id = %id, error = %e, "skipping unreadable record"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    // --- supervisor markers -------------------------------------------

    /// Mark a container as deliberately stopped so the restart supervisor
    /// lets it stay down.
    pub fn set_down(&self, id: &str) -> Result<()> {
        atomic_write(&self.record_dir(id).join(DOWN_MARKER), b"")
    }

    /// Clear the down marker (a fresh `start` re-arms restart policy).
    pub fn clear_down(&self, id: &str) {
        let _ = fs::remove_file(self.record_dir(id).join(DOWN_MARKER));
    }

    /// Whether the container was deliberately stopped.
    pub fn is_down(&self, id: &str) -> bool {
        self.record_dir(id).join(DOWN_MARKER).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalOptions;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> DataStore {
        let opts = GlobalOptions {
            data_root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        DataStore::open(&opts).unwrap()
    }

    #[test]
    fn test_addr_hash_is_8_hex_and_stable() {
        let h = addr_hash("/run/containerd/containerd.sock");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, addr_hash("/run/containerd/containerd.sock"));
        assert_ne!(h, addr_hash("/run/other.sock"));
    }

    #[test]
    fn test_open_creates_layout() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        for sub in ["containers", "volumes", "names", "etchosts", "networks"] {
            assert!(s.root().join(sub).is_dir(), "missing {}", sub);
        }
    }

    #[test]
    fn test_name_reservation_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        s.reserve_name("web", "aaa").unwrap();
        let err = s.reserve_name("web", "bbb").unwrap_err();
        assert!(matches!(err, Error::NameInUse(n) if n == "web"));
        assert_eq!(s.lookup_name("web").as_deref(), Some("aaa"));

        s.release_name("web");
        assert!(s.lookup_name("web").is_none());
        // Released names are reusable.
        s.reserve_name("web", "bbb").unwrap();
    }

    #[test]
    fn test_record_create_load_delete() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let mut r = ContainerRecord::new("c".repeat(64), "default");
        r.name = Some("app".into());
        s.reserve_name("app", &r.id).unwrap();
        s.create_record(&r).unwrap();

        let loaded = s.load_record(&r.id).unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("app"));

        s.delete_record(&r.id).unwrap();
        assert!(s.load_record(&r.id).unwrap().is_none());
        // Deleting the record frees its name.
        assert!(s.lookup_name("app").is_none());
    }

    #[test]
    fn test_update_record_round_trips() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let r = ContainerRecord::new("d".repeat(64), "default");
        s.create_record(&r).unwrap();

        s.update_record(&r.id, |rec| {
            rec.status = ContainerStatus::Running;
            rec.exit_code = None;
        })
        .unwrap();

        let loaded = s.load_record(&r.id).unwrap().unwrap();
        assert_eq!(loaded.status, ContainerStatus::Running);
    }

    #[test]
    fn test_list_skips_partial_directories() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let r = ContainerRecord::new("e".repeat(64), "default");
        s.create_record(&r).unwrap();
        // A container mid-create: directory exists, no config.json yet.
        std::fs::create_dir_all(s.record_dir(&"f".repeat(64))).unwrap();

        let records = s.list_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, r.id);
    }

    #[test]
    fn test_down_marker() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let r = ContainerRecord::new("1".repeat(64), "default");
        s.create_record(&r).unwrap();

        assert!(!s.is_down(&r.id));
        s.set_down(&r.id).unwrap();
        assert!(s.is_down(&r.id));
        s.clear_down(&r.id);
        assert!(!s.is_down(&r.id));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let opts_a = GlobalOptions {
            data_root: tmp.path().to_path_buf(),
            namespace: "a".into(),
            ..Default::default()
        };
        let opts_b = GlobalOptions {
            namespace: "b".into(),
            ..opts_a.clone()
        };
        let sa = DataStore::open(&opts_a).unwrap();
        let sb = DataStore::open(&opts_b).unwrap();

        sa.reserve_name("web", "aaa").unwrap();
        // Same name is free in another namespace.
        sb.reserve_name("web", "bbb").unwrap();
    }
}
