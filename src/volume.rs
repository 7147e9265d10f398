//! Named and anonymous volume management.
//!
//! A volume is a directory under `<store-root>/volumes/<namespace>/<name>/`
//! with a `_data` subdirectory that gets bind-mounted into containers and a
//! `labels.json` holding user metadata. Anonymous volumes carry a 64-hex
//! name and are listed in the owning container's record so `rm -v` can
//! delete them.

use crate::error::{Error, Result};
use crate::store::{atomic_write, DataStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const DATA_DIR: &str = "_data";
const LABELS_FILE: &str = "labels.json";

/// Inspect view of one volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Host path bind-mounted into containers.
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Volume store bound to one namespace.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    dir: PathBuf,
}

impl VolumeStore {
    pub fn new(store: &DataStore) -> Self {
        Self {
            dir: store.volumes_dir(),
        }
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Host path of a volume's data directory. Does not check existence.
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.volume_dir(name).join(DATA_DIR)
    }

    /// Create a named volume. Creating an existing name returns the
    /// existing volume unchanged, matching `docker volume create`.
    pub fn create(&self, name: &str, labels: BTreeMap<String, String>) -> Result<Volume> {
        validate_name(name)?;
        if let Some(existing) = self.get(name)? {
            return Ok(existing);
        }

        let data = self.mountpoint(name);
        std::fs::create_dir_all(&data)?;
        atomic_write(
            &self.volume_dir(name).join(LABELS_FILE),
            &serde_json::to_vec_pretty(&labels)?,
        )?;
        Ok(Volume {
            name: name.to_string(),
            mountpoint: data,
            labels,
        })
    }

    /// Create an anonymous volume with a fresh 64-hex name.
    pub fn create_anonymous(&self) -> Result<Volume> {
        let name = crate::new_container_id()?;
        self.create(&name, BTreeMap::new())
    }

    /// Load one volume, `None` if it does not exist.
    pub fn get(&self, name: &str) -> Result<Option<Volume>> {
        let dir = self.volume_dir(name);
        if !dir.join(DATA_DIR).is_dir() {
            return Ok(None);
        }
        let labels = match std::fs::read(dir.join(LABELS_FILE)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| Error::Volume(format!("labels for {:?}: {}", name, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Volume {
            name: name.to_string(),
            mountpoint: dir.join(DATA_DIR),
            labels,
        }))
    }

    /// All volumes in this namespace, sorted by name.
    pub fn list(&self) -> Result<Vec<Volume>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(v) = self.get(&name)? {
                out.push(v);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Remove a volume. `in_use` reflects container records still naming
    /// it; a referenced volume is refused.
    pub fn remove(&self, name: &str, in_use: bool) -> Result<()> {
        if self.get(name)?.is_none() {
            return Err(Error::Volume(format!("no such volume: {}", name)));
        }
        if in_use {
            return Err(Error::VolumeInUse(name.to_string()));
        }
        std::fs::remove_dir_all(self.volume_dir(name))?;
        Ok(())
    }
}

/// Volume names share the container-name alphabet; anonymous 64-hex names
/// also pass.
fn validate_name(name: &str) -> Result<()> {
    let ok_first = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let ok_rest = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !ok_first || !ok_rest {
        return Err(Error::invalid(format!(
            "invalid volume name {:?}: must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalOptions;
    use tempfile::TempDir;

    fn volumes(tmp: &TempDir) -> VolumeStore {
        let opts = GlobalOptions {
            data_root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        VolumeStore::new(&DataStore::open(&opts).unwrap())
    }

    #[test]
    fn test_create_get_list() {
        let tmp = TempDir::new().unwrap();
        let vs = volumes(&tmp);
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "db".to_string());

        let v = vs.create("pgdata", labels.clone()).unwrap();
        assert!(v.mountpoint.is_dir());
        assert!(v.mountpoint.ends_with("pgdata/_data"));

        let got = vs.get("pgdata").unwrap().unwrap();
        assert_eq!(got.labels, labels);
        assert_eq!(vs.list().unwrap().len(), 1);
    }

    #[test]
    fn test_create_existing_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let vs = volumes(&tmp);
        let mut labels = BTreeMap::new();
        labels.insert("k".to_string(), "v".to_string());
        vs.create("data", labels.clone()).unwrap();

        // Second create keeps the original labels.
        let again = vs.create("data", BTreeMap::new()).unwrap();
        assert_eq!(again.labels, labels);
    }

    #[test]
    fn test_remove_refuses_in_use() {
        let tmp = TempDir::new().unwrap();
        let vs = volumes(&tmp);
        vs.create("data", BTreeMap::new()).unwrap();

        assert!(matches!(
            vs.remove("data", true),
            Err(Error::VolumeInUse(_))
        ));
        vs.remove("data", false).unwrap();
        assert!(vs.get("data").unwrap().is_none());
        assert!(matches!(vs.remove("data", false), Err(Error::Volume(_))));
    }

    #[test]
    fn test_anonymous_volume_name() {
        let tmp = TempDir::new().unwrap();
        let vs = volumes(&tmp);
        let v = vs.create_anonymous().unwrap();
        assert_eq!(v.name.len(), 64);
        assert!(v.mountpoint.is_dir());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("pg-data_1.0").is_ok());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("").is_err());
    }
}
