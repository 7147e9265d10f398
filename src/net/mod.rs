//! CNI-backed network management.
//!
//! Each network is one conflist file in the netconf directory, named
//! `cradle-<network>.conflist` and tagged with `cradle-name`/`cradle-id`
//! fields so managed networks can be told apart from foreign ones. The
//! default `bridge` network is created on first use.

pub mod cni;
pub mod subnet;

pub use cni::{AttachContext, CniRunner};

use crate::error::{Error, Result};
use crate::store::atomic_write;
use crate::store::record::{ContainerRecord, PortMapping};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Name of the network containers join when `--net` is not given.
pub const DEFAULT_NETWORK: &str = "bridge";

/// A parsed network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub name: String,
    /// 64-hex identity; absent for conflists cradle did not create.
    pub id: Option<String>,
    pub labels: std::collections::BTreeMap<String, String>,
    pub file: PathBuf,
    /// Subnets from the host-local ipam sections.
    pub subnets: Vec<String>,
    /// The full conflist document, as fed to the plugins.
    pub doc: Value,
}

impl NetworkConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| Error::network(path.display().to_string(), e.to_string()))?;
        let doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| Error::network(path.display().to_string(), e.to_string()))?;
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::network(path.display().to_string(), "missing name"))?
            .to_string();
        let id = doc
            .get("cradle-id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let labels = doc
            .get("cradle-labels")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let subnets = subnets_of(&doc);
        Ok(Self {
            name,
            id,
            labels,
            file: path.to_path_buf(),
            subnets,
            doc,
        })
    }
}

/// Pull every `ipam.ranges[][].subnet` out of a conflist.
fn subnets_of(doc: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(plugins) = doc.get("plugins").and_then(Value::as_array) else {
        return out;
    };
    for plugin in plugins {
        let Some(ranges) = plugin.pointer("/ipam/ranges").and_then(Value::as_array) else {
            continue;
        };
        for group in ranges.iter().filter_map(Value::as_array) {
            for range in group {
                if let Some(s) = range.get("subnet").and_then(Value::as_str) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

/// Options for `network create`.
#[derive(Debug, Clone, Default)]
pub struct CreateNetworkOpts {
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub labels: std::collections::BTreeMap<String, String>,
}

/// Manages conflist files and drives plugin chains for attachments.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    netconf_dir: PathBuf,
    runner: CniRunner,
}

impl NetworkManager {
    pub fn new(netconf_dir: impl Into<PathBuf>, plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            netconf_dir: netconf_dir.into(),
            runner: CniRunner::new(plugin_dir),
        }
    }

    fn conflist_path(&self, name: &str) -> PathBuf {
        self.netconf_dir.join(format!("cradle-{}.conflist", name))
    }

    /// All conflists in the netconf directory, managed or not, sorted by
    /// name. Unparseable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<NetworkConfig>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.netconf_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conflist") {
                continue;
            }
            match NetworkConfig::from_file(&path) {
                Ok(cfg) => out.push(cfg),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping conflist"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Load one network by name.
    pub fn get(&self, name: &str) -> Result<NetworkConfig> {
        self.list()?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::network(name, "not found"))
    }

    /// Create a network. The subnet is allocated from the pool when not
    /// given; an explicit subnet must not collide with an existing one.
    pub fn create(&self, name: &str, opts: &CreateNetworkOpts) -> Result<NetworkConfig> {
        validate_name(name)?;
        let existing = self.list()?;
        if existing.iter().any(|n| n.name == name) {
            return Err(Error::network(name, "already exists"));
        }
        if opts.gateway.is_some() && opts.subnet.is_none() {
            return Err(Error::invalid("--gateway requires --subnet"));
        }

        let used: Vec<String> = existing.iter().flat_map(|n| n.subnets.clone()).collect();
        let (cidr, gateway) = match &opts.subnet {
            Some(cidr) => {
                let cand = subnet::parse_cidr(cidr)?;
                if cand.1 >= 31 {
                    return Err(Error::invalid(format!(
                        "subnet {} has no usable host address",
                        cidr
                    )));
                }
                for u in &used {
                    if let Ok(parsed) = subnet::parse_cidr(u) {
                        if subnet::overlaps(cand, parsed) {
                            return Err(Error::network(
                                name,
                                format!("subnet {} overlaps existing {}", cidr, u),
                            ));
                        }
                    }
                }
                let gw = match &opts.gateway {
                    Some(g) => g.clone(),
                    None => subnet::default_gateway(cidr)?,
                };
                (cidr.clone(), gw)
            }
            None => {
                let s = subnet::allocate(&used)?;
                (s.cidr, s.gateway)
            }
        };

        let id = crate::new_container_id()?;
        let bridge = next_bridge_name(&existing);
        let doc = conflist(name, &id, &bridge, &cidr, &gateway, &opts.labels);
        std::fs::create_dir_all(&self.netconf_dir)?;
        atomic_write(&self.conflist_path(name), &serde_json::to_vec_pretty(&doc)?)?;
        NetworkConfig::from_file(&self.conflist_path(name))
    }

    /// Remove a managed network. `in_use` names must be gathered by the
    /// caller from container records; a referenced network is refused.
    pub fn remove(&self, name: &str, in_use: bool) -> Result<()> {
        let cfg = self.get(name)?;
        if in_use {
            return Err(Error::NetworkInUse(name.to_string()));
        }
        if cfg.id.is_none() {
            return Err(Error::network(name, "not managed by cradle; refusing to remove"));
        }
        std::fs::remove_file(&cfg.file)?;
        Ok(())
    }

    /// Make sure the default bridge network exists.
    pub fn ensure_default(&self) -> Result<NetworkConfig> {
        match self.get(DEFAULT_NETWORK) {
            Ok(cfg) => Ok(cfg),
            Err(Error::Network(_, _)) => {
                tracing::debug!("creating default bridge network");
                self.create(DEFAULT_NETWORK, &CreateNetworkOpts::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Attach a container to every network named in its record, in order.
    /// Fills in interface addresses on success. A mid-chain failure rolls
    /// back the attachments already made before returning the error.
    pub async fn attach(
        &self,
        record: &mut ContainerRecord,
        pid: u32,
        ports: &[PortMapping],
    ) -> Result<()> {
        let netns = cni::netns_of(pid);
        let mut attached: Vec<usize> = Vec::new();

        for idx in 0..record.networks.len() {
            let name = record.networks[idx].network.clone();
            let cfg = self.get(&name)?;
            let ctx = AttachContext {
                container_id: record.id.clone(),
                netns: netns.clone(),
                ifname: record.networks[idx].interface.clone(),
            };

            match self.runner.add(&cfg.doc, &ctx, ports).await {
                Ok(result) => {
                    if let Some((iface, ip)) = result.sandbox_interface() {
                        record.networks[idx].mac = iface.mac.clone();
                        record.networks[idx].ip = ip
                            .and_then(|i| i.address.split('/').next())
                            .and_then(|a| a.parse().ok());
                    }
                    attached.push(idx);
                }
                Err(e) => {
                    for &done in attached.iter().rev() {
                        let name = &record.networks[done].network;
                        if let Ok(cfg) = self.get(name) {
                            let ctx = AttachContext {
                                container_id: record.id.clone(),
                                netns: netns.clone(),
                                ifname: record.networks[done].interface.clone(),
                            };
                            let _ = self.runner.del(&cfg.doc, &ctx, ports).await;
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Detach a container from its networks, best effort. The netns may
    /// already be gone; plugins tolerate that on DEL.
    pub async fn detach(&self, record: &ContainerRecord, pid: Option<u32>, ports: &[PortMapping]) {
        let netns = pid.map(cni::netns_of).unwrap_or_default();
        for attachment in record.networks.iter().rev() {
            let cfg = match self.get(&attachment.network) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(network = %attachment.network, error = %e, "skipping detach");
                    continue;
                }
            };
            let ctx = AttachContext {
                container_id: record.id.clone(),
                netns: netns.clone(),
                ifname: attachment.interface.clone(),
            };
            if let Err(e) = self.runner.del(&cfg.doc, &ctx, ports).await {
                tracing::warn!(network = %attachment.network, error = %e, "detach failed");
            }
        }
    }
}

/// Network names share the container-name alphabet.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let ok_first = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let ok_rest = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !ok_first || !ok_rest {
        return Err(Error::invalid(format!(
            "invalid network name {:?}: must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
            name
        )));
    }
    Ok(())
}

/// Lowest free `cradle<N>` bridge device name.
fn next_bridge_name(existing: &[NetworkConfig]) -> String {
    let used: std::collections::BTreeSet<u32> = existing
        .iter()
        .filter_map(|n| {
            n.doc
                .pointer("/plugins/0/bridge")
                .and_then(Value::as_str)
                .and_then(|b| b.strip_prefix("cradle"))
                .and_then(|n| n.parse().ok())
        })
        .collect();
    let mut n = 0;
    while used.contains(&n) {
        n += 1;
    }
    format!("cradle{}", n)
}

/// Build the conflist document for a managed bridge network.
fn conflist(
    name: &str,
    id: &str,
    bridge: &str,
    cidr: &str,
    gateway: &str,
    labels: &std::collections::BTreeMap<String, String>,
) -> Value {
    json!({
        "cniVersion": cni::CNI_VERSION,
        "name": name,
        "cradle-name": name,
        "cradle-id": id,
        "cradle-labels": labels,
        "plugins": [
            {
                "type": "bridge",
                "bridge": bridge,
                "isGateway": true,
                "ipMasq": true,
                "hairpinMode": true,
                "ipam": {
                    "type": "host-local",
                    "routes": [{ "dst": "0.0.0.0/0" }],
                    "ranges": [[{ "subnet": cidr, "gateway": gateway }]]
                }
            },
            {
                "type": "portmap",
                "capabilities": { "portMappings": true }
            },
            {
                "type": "firewall"
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, NetworkManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = NetworkManager::new(dir.path(), "/opt/cni/bin");
        (dir, mgr)
    }

    #[test]
    fn test_create_and_list() {
        let (_dir, mgr) = manager();
        let cfg = mgr.create("web", &CreateNetworkOpts::default()).unwrap();
        assert_eq!(cfg.name, "web");
        assert_eq!(cfg.subnets, vec!["10.4.0.0/24"]);
        assert_eq!(cfg.id.as_ref().unwrap().len(), 64);
        assert!(cfg.file.ends_with("cradle-web.conflist"));

        let all = mgr.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "web");
    }

    #[test]
    fn test_create_allocates_distinct_subnets() {
        let (_dir, mgr) = manager();
        mgr.create("a", &CreateNetworkOpts::default()).unwrap();
        let b = mgr.create("b", &CreateNetworkOpts::default()).unwrap();
        assert_eq!(b.subnets, vec!["10.4.1.0/24"]);
    }

    #[test]
    fn test_create_rejects_duplicate_and_overlap() {
        let (_dir, mgr) = manager();
        mgr.create("a", &CreateNetworkOpts::default()).unwrap();
        assert!(mgr.create("a", &CreateNetworkOpts::default()).is_err());

        let opts = CreateNetworkOpts {
            subnet: Some("10.4.0.0/16".to_string()),
            ..Default::default()
        };
        assert!(mgr.create("big", &opts).is_err());
    }

    #[test]
    fn test_create_explicit_subnet_and_gateway() {
        let (_dir, mgr) = manager();
        let opts = CreateNetworkOpts {
            subnet: Some("192.168.7.0/24".to_string()),
            gateway: Some("192.168.7.254".to_string()),
            ..Default::default()
        };
        let cfg = mgr.create("lan", &opts).unwrap();
        assert_eq!(cfg.subnets, vec!["192.168.7.0/24"]);
        let gw = cfg.doc["plugins"][0]["ipam"]["ranges"][0][0]["gateway"].clone();
        assert_eq!(gw, "192.168.7.254");
    }

    #[test]
    fn test_create_rejects_host_route_subnets() {
        let (_dir, mgr) = manager();
        for cidr in ["10.9.0.0/31", "10.9.0.1/32", "255.255.255.255/32"] {
            let opts = CreateNetworkOpts {
                subnet: Some(cidr.to_string()),
                ..Default::default()
            };
            assert!(mgr.create("tiny", &opts).is_err(), "{} accepted", cidr);
        }
    }

    #[test]
    fn test_gateway_requires_subnet() {
        let (_dir, mgr) = manager();
        let opts = CreateNetworkOpts {
            gateway: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            mgr.create("x", &opts),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_refuses_in_use() {
        let (_dir, mgr) = manager();
        mgr.create("web", &CreateNetworkOpts::default()).unwrap();
        assert!(matches!(
            mgr.remove("web", true),
            Err(Error::NetworkInUse(_))
        ));
        mgr.remove("web", false).unwrap();
        assert!(mgr.get("web").is_err());
    }

    #[test]
    fn test_remove_refuses_unmanaged() {
        let (dir, mgr) = manager();
        let foreign = json!({ "cniVersion": "1.0.0", "name": "ext", "plugins": [] });
        std::fs::write(
            dir.path().join("ext.conflist"),
            serde_json::to_vec(&foreign).unwrap(),
        )
        .unwrap();
        assert!(mgr.remove("ext", false).is_err());
        // still listed though
        assert!(mgr.list().unwrap().iter().any(|n| n.name == "ext"));
    }

    #[test]
    fn test_ensure_default_is_idempotent() {
        let (_dir, mgr) = manager();
        let a = mgr.ensure_default().unwrap();
        let b = mgr.ensure_default().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, DEFAULT_NETWORK);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web-1").is_ok());
        assert!(validate_name("-web").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn test_bridge_names_count_up() {
        let (_dir, mgr) = manager();
        let a = mgr.create("a", &CreateNetworkOpts::default()).unwrap();
        let b = mgr.create("b", &CreateNetworkOpts::default()).unwrap();
        assert_eq!(a.doc["plugins"][0]["bridge"], "cradle0");
        assert_eq!(b.doc["plugins"][0]["bridge"], "cradle1");
    }
}
