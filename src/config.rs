//! Global configuration.
//!
//! Settings come from three layers, weakest first: the TOML config file
//! (`/etc/cradle/cradle.toml` rootful, `~/.config/cradle/cradle.toml`
//! rootless), environment variables (`CONTAINERD_ADDRESS`,
//! `CONTAINERD_NAMESPACE`, `CNI_PATH`, `NETCONFPATH`), and CLI flags.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default containerd socket path.
pub const DEFAULT_ADDRESS: &str = "/run/containerd/containerd.sock";
/// Default containerd namespace.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Default snapshotter.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";
/// Default CNI plugin binary directory.
pub const DEFAULT_CNI_PATH: &str = "/opt/cni/bin";
/// Default CNI network config directory.
pub const DEFAULT_CNI_NETCONFPATH: &str = "/etc/cni/net.d";
/// Default data root.
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/cradle";

/// Cgroup manager choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    /// Delegate to systemd.
    #[default]
    Systemd,
    /// Write cgroupfs directly.
    Cgroupfs,
    /// No cgroup management (rootless on cgroup v1 only).
    None,
}

impl std::str::FromStr for CgroupManager {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "systemd" => Ok(Self::Systemd),
            "cgroupfs" => Ok(Self::Cgroupfs),
            "none" => Ok(Self::None),
            other => Err(Error::invalid(format!(
                "unknown cgroup manager {:?} (expected systemd, cgroupfs, or none)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CgroupManager::Systemd => write!(f, "systemd"),
            CgroupManager::Cgroupfs => write!(f, "cgroupfs"),
            CgroupManager::None => write!(f, "none"),
        }
    }
}

/// On-disk TOML config file. All fields optional; missing fields fall back
/// to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// containerd socket path.
    pub address: Option<String>,
    /// containerd namespace.
    pub namespace: Option<String>,
    /// Snapshotter name.
    pub snapshotter: Option<String>,
    /// CNI plugin binary directory.
    pub cni_path: Option<PathBuf>,
    /// CNI network config directory.
    pub cni_netconfpath: Option<PathBuf>,
    /// Data root directory.
    pub data_root: Option<PathBuf>,
    /// Cgroup manager.
    pub cgroup_manager: Option<CgroupManager>,
    /// Registries to access over plain HTTP.
    #[serde(default)]
    pub insecure_registry: Vec<String>,
}

impl ConfigFile {
    /// Path of the config file for the current user.
    pub fn default_path() -> PathBuf {
        if nix::unistd::geteuid().is_root() {
            PathBuf::from("/etc/cradle/cradle.toml")
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/etc"))
                .join("cradle/cradle.toml")
        }
    }

    /// Load the config file if it exists; a missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Fully resolved global options, passed as an explicit handle through every
/// operation for the duration of one CLI invocation.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    /// containerd socket path.
    pub address: String,
    /// containerd namespace.
    pub namespace: String,
    /// Snapshotter name.
    pub snapshotter: String,
    /// CNI plugin binary directory.
    pub cni_path: PathBuf,
    /// CNI network config directory.
    pub cni_netconfpath: PathBuf,
    /// Data root directory.
    pub data_root: PathBuf,
    /// Cgroup manager.
    pub cgroup_manager: CgroupManager,
    /// Registries to access over plain HTTP.
    pub insecure_registry: Vec<String>,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            cni_path: PathBuf::from(DEFAULT_CNI_PATH),
            cni_netconfpath: PathBuf::from(DEFAULT_CNI_NETCONFPATH),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            cgroup_manager: CgroupManager::default(),
            insecure_registry: Vec::new(),
        }
    }
}

/// CLI-flag layer: `None` means "not given on the command line".
#[derive(Debug, Clone, Default)]
pub struct GlobalFlags {
    pub address: Option<String>,
    pub namespace: Option<String>,
    pub snapshotter: Option<String>,
    pub cni_path: Option<PathBuf>,
    pub cni_netconfpath: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub cgroup_manager: Option<CgroupManager>,
    pub insecure_registry: Vec<String>,
}

impl GlobalOptions {
    /// Resolve options: defaults ← config file ← environment ← CLI flags.
    pub fn resolve(file: &ConfigFile, flags: &GlobalFlags) -> Self {
        let mut opts = Self::default();

        // Config file layer
        if let Some(v) = &file.address {
            opts.address = v.clone();
        }
        if let Some(v) = &file.namespace {
            opts.namespace = v.clone();
        }
        if let Some(v) = &file.snapshotter {
            opts.snapshotter = v.clone();
        }
        if let Some(v) = &file.cni_path {
            opts.cni_path = v.clone();
        }
        if let Some(v) = &file.cni_netconfpath {
            opts.cni_netconfpath = v.clone();
        }
        if let Some(v) = &file.data_root {
            opts.data_root = v.clone();
        }
        if let Some(v) = file.cgroup_manager {
            opts.cgroup_manager = v;
        }
        if !file.insecure_registry.is_empty() {
            opts.insecure_registry = file.insecure_registry.clone();
        }

        // Environment layer
        if let Ok(v) = std::env::var("CONTAINERD_ADDRESS") {
            opts.address = v;
        }
        if let Ok(v) = std::env::var("CONTAINERD_NAMESPACE") {
            opts.namespace = v;
        }
        if let Ok(v) = std::env::var("CNI_PATH") {
            opts.cni_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NETCONFPATH") {
            opts.cni_netconfpath = PathBuf::from(v);
        }

        // CLI flag layer
        if let Some(v) = &flags.address {
            opts.address = v.clone();
        }
        if let Some(v) = &flags.namespace {
            opts.namespace = v.clone();
        }
        if let Some(v) = &flags.snapshotter {
            opts.snapshotter = v.clone();
        }
        if let Some(v) = &flags.cni_path {
            opts.cni_path = v.clone();
        }
        if let Some(v) = &flags.cni_netconfpath {
            opts.cni_netconfpath = v.clone();
        }
        if let Some(v) = &flags.data_root {
            opts.data_root = v.clone();
        }
        if let Some(v) = flags.cgroup_manager {
            opts.cgroup_manager = v;
        }
        if !flags.insecure_registry.is_empty() {
            opts.insecure_registry = flags.insecure_registry.clone();
        }

        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = GlobalOptions::default();
        assert_eq!(opts.address, "/run/containerd/containerd.sock");
        assert_eq!(opts.namespace, "default");
        assert_eq!(opts.snapshotter, "overlayfs");
        assert_eq!(opts.cni_path, PathBuf::from("/opt/cni/bin"));
        assert_eq!(opts.data_root, PathBuf::from("/var/lib/cradle"));
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
            namespace = "builds"
            snapshotter = "stargz"
            insecure_registry = ["registry.local:5000"]
            "#,
        )
        .unwrap();
        let opts = GlobalOptions::resolve(&file, &GlobalFlags::default());
        assert_eq!(opts.namespace, "builds");
        assert_eq!(opts.snapshotter, "stargz");
        assert_eq!(opts.insecure_registry, vec!["registry.local:5000"]);
        // untouched fields keep defaults
        assert_eq!(opts.address, DEFAULT_ADDRESS);
    }

    #[test]
    fn test_flags_override_config_file() {
        let file: ConfigFile = toml::from_str(r#"namespace = "builds""#).unwrap();
        let flags = GlobalFlags {
            namespace: Some("ci".to_string()),
            ..Default::default()
        };
        let opts = GlobalOptions::resolve(&file, &flags);
        assert_eq!(opts.namespace, "ci");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let parsed: std::result::Result<ConfigFile, _> = toml::from_str("no_such_key = 1");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_missing_file_loads_default() {
        let cfg = ConfigFile::load(Path::new("/nonexistent/cradle.toml")).unwrap();
        assert!(cfg.address.is_none());
    }

    #[test]
    fn test_cgroup_manager_from_str() {
        assert_eq!(
            "systemd".parse::<CgroupManager>().unwrap(),
            CgroupManager::Systemd
        );
        assert_eq!(
            "cgroupfs".parse::<CgroupManager>().unwrap(),
            CgroupManager::Cgroupfs
        );
        assert!("v1".parse::<CgroupManager>().is_err());
    }
}
