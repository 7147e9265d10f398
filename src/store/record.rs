//! Per-container record types.
//!
//! A record holds everything containerd does not itself remember about a
//! container: the user-assigned name, port mappings, network attachments,
//! log location, restart policy, and cid/pid file paths. One record is one
//! `config.json` under the container's record directory.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(Error::invalid(format!("unknown protocol {:?}", other))),
        }
    }
}

/// A single published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host IP the port is bound on.
    pub host_ip: IpAddr,
    /// Host port.
    pub host_port: u16,
    /// Container port.
    pub container_port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl PortMapping {
    /// Parse a `-p` specification: `[host-ip:]host-port:container-port[/proto]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (ports, protocol) = match spec.rsplit_once('/') {
            Some((p, proto)) => (p, proto.parse()?),
            None => (spec, Protocol::Tcp),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [host, cont] => ("0.0.0.0", *host, *cont),
            [ip, host, cont] => (*ip, *host, *cont),
            _ => {
                return Err(Error::invalid(format!(
                    "invalid port specification {:?}: expected [ip:]host:container[/proto]",
                    spec
                )))
            }
        };

        let host_ip: IpAddr = host_ip
            .parse()
            .map_err(|_| Error::invalid(format!("invalid host ip {:?}", host_ip)))?;
        let host_port: u16 = host_port
            .parse()
            .map_err(|_| Error::invalid(format!("invalid host port {:?}", host_port)))?;
        let container_port: u16 = container_port
            .parse()
            .map_err(|_| Error::invalid(format!("invalid container port {:?}", container_port)))?;

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} -> {}:{}",
            self.container_port, self.protocol, self.host_ip, self.host_port
        )
    }
}

/// One CNI network the container is attached to, with the result CNI chose
/// at attach time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network name (selector the user gave).
    pub network: String,
    /// Interface name inside the container (`eth0` first).
    pub interface: String,
    /// IP assigned by IPAM, if any.
    pub ip: Option<IpAddr>,
    /// MAC address, if reported.
    pub mac: Option<String>,
}

/// Restart policy. `on-failure` and `unless-stopped` are deliberately not
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
}

impl std::str::FromStr for RestartPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            other => Err(Error::invalid(format!(
                "unsupported restart policy {:?} (expected no or always)",
                other
            ))),
        }
    }
}

/// Coarse lifecycle state mirrored into the record for `ps` and `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    #[default]
    Created,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Auxiliary per-container state, persisted as `config.json` in the record
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// 64-hex container ID.
    pub id: String,
    /// containerd namespace the container lives in.
    pub namespace: String,
    /// User-assigned name, unique within the namespace.
    pub name: Option<String>,
    /// Hostname (defaults to the first 12 ID chars).
    pub hostname: String,
    /// Image reference, unless running from `--rootfs`.
    pub image: Option<String>,
    /// Raw rootfs path, if `--rootfs` was used.
    pub rootfs: Option<PathBuf>,
    /// Restart policy.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Path the container ID is written to, if requested.
    #[serde(default)]
    pub cid_file: Option<PathBuf>,
    /// Path the task PID is written to, if requested.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Published ports, in the order given.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Network attachments, in selector order.
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Combined stdout/stderr log file, absent for foreground TTY containers.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Task gets a PTY (`-t`).
    #[serde(default)]
    pub tty: bool,
    /// Task stdin is kept open (`-i`).
    #[serde(default)]
    pub stdin_open: bool,
    /// Stop signal from the image config; SIGTERM when absent.
    #[serde(default)]
    pub stop_signal: Option<String>,
    /// Anonymous volumes owned by this container, removed by `rm -v`.
    #[serde(default)]
    pub anonymous_volumes: Vec<String>,
    /// Named volumes this container mounts, for in-use checks.
    #[serde(default)]
    pub named_volumes: Vec<String>,
    /// Mirrored lifecycle state.
    #[serde(default)]
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ContainerRecord {
    /// Create a fresh record in the `created` state.
    pub fn new(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        let id = id.into();
        let hostname = id.chars().take(12).collect();
        Self {
            id,
            namespace: namespace.into(),
            name: None,
            hostname,
            image: None,
            rootfs: None,
            restart_policy: RestartPolicy::No,
            cid_file: None,
            pid_file: None,
            ports: Vec::new(),
            networks: Vec::new(),
            labels: BTreeMap::new(),
            log_path: None,
            tty: false,
            stdin_open: false,
            stop_signal: None,
            anonymous_volumes: Vec::new(),
            named_volumes: Vec::new(),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
        }
    }

    /// Short (12-char) form of the ID, used for display and the default
    /// hostname.
    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }

    /// Names of CNI-backed networks this record references (`host`/`none`
    /// never appear as attachments).
    pub fn network_names(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().map(|n| n.network.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_port_parse_host_container() {
        let p = PortMapping::parse("8080:80").unwrap();
        assert_eq!(p.host_ip.to_string(), "0.0.0.0");
        assert_eq!(p.host_port, 8080);
        assert_eq!(p.container_port, 80);
        assert_eq!(p.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_port_parse_with_ip_and_proto() {
        let p = PortMapping::parse("127.0.0.1:53:53/udp").unwrap();
        assert_eq!(p.host_ip.to_string(), "127.0.0.1");
        assert_eq!(p.protocol, Protocol::Udp);
    }

    #[test]
    fn test_port_parse_rejects_garbage() {
        assert!(PortMapping::parse("80").is_err());
        assert!(PortMapping::parse("a:b").is_err());
        assert!(PortMapping::parse("1:2:3:4").is_err());
        assert!(PortMapping::parse("8080:80/icmp").is_err());
    }

    #[test]
    fn test_port_display_matches_docker() {
        let p = PortMapping::parse("8080:80").unwrap();
        assert_eq!(p.to_string(), "80/tcp -> 0.0.0.0:8080");
    }

    #[test]
    fn test_restart_policy_rejects_unsupported() {
        assert!(RestartPolicy::from_str("always").is_ok());
        assert!(RestartPolicy::from_str("no").is_ok());
        assert!(RestartPolicy::from_str("on-failure").is_err());
        assert!(RestartPolicy::from_str("unless-stopped").is_err());
    }

    #[test]
    fn test_record_defaults() {
        let r = ContainerRecord::new(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            "default",
        );
        assert_eq!(r.hostname, "0123456789ab");
        assert_eq!(r.short_id(), "0123456789ab");
        assert_eq!(r.status, ContainerStatus::Created);
        assert!(r.name.is_none());
    }

    #[test]
    fn test_record_roundtrip() {
        let mut r = ContainerRecord::new("a".repeat(64), "default");
        r.name = Some("web".into());
        r.ports.push(PortMapping::parse("8080:80").unwrap());
        r.networks.push(NetworkAttachment {
            network: "bridge".into(),
            interface: "eth0".into(),
            ip: Some("10.4.0.2".parse().unwrap()),
            mac: Some("de:ad:be:ef:00:01".into()),
        });

        let json = serde_json::to_string(&r).unwrap();
        let back: ContainerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, r.name);
        assert_eq!(back.ports, r.ports);
        assert_eq!(back.networks, r.networks);
    }

    #[test]
    fn test_record_tolerates_old_fields_missing() {
        // A record written before a field existed must still load.
        let json = r#"{
            "id": "00",
            "namespace": "default",
            "name": null,
            "hostname": "00",
            "image": "alpine",
            "rootfs": null,
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let r: ContainerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.restart_policy, RestartPolicy::No);
        assert!(r.ports.is_empty());
    }
}
