//! Cgroup and resource-limit transforms.

use super::SpecInput;
use crate::config::CgroupManager;
use crate::error::{Error, Result};
use oci_spec::runtime::{
    LinuxCpuBuilder, LinuxMemoryBuilder, LinuxPidsBuilder, LinuxResources, LinuxResourcesBuilder,
    Spec,
};

/// CFS period used for `--cpus` math.
pub const CFS_PERIOD: u64 = 100_000;

/// Cgroup namespace mode (`--cgroupns`); only these two values exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CgroupnsMode {
    #[default]
    Private,
    Host,
}

impl std::str::FromStr for CgroupnsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Self::Private),
            "host" => Ok(Self::Host),
            other => Err(Error::invalid(format!(
                "unknown cgroupns mode {:?} (expected private or host)",
                other
            ))),
        }
    }
}

/// Pick the default cgroup manager for this host: systemd on cgroup v2,
/// cgroupfs on v1 rootful, none on v1 rootless.
pub fn default_cgroup_manager() -> CgroupManager {
    let v2 = std::path::Path::new("/sys/fs/cgroup/cgroup.controllers").exists();
    let rootful = nix::unistd::geteuid().is_root();
    match (v2, rootful) {
        (true, _) => CgroupManager::Systemd,
        (false, true) => CgroupManager::Cgroupfs,
        (false, false) => CgroupManager::None,
    }
}

/// Validate the manager choice against the current privilege level.
pub fn validate_cgroup_manager(manager: CgroupManager) -> Result<()> {
    if manager == CgroupManager::None && nix::unistd::geteuid().is_root() {
        return Err(Error::invalid(
            "cgroup manager \"none\" is only supported rootless",
        ));
    }
    Ok(())
}

/// Parse a byte quantity with binary-unit suffixes (`512m`, `1g`, `64k`,
/// `128mi`, plain bytes otherwise).
pub fn parse_bytes(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::invalid("empty size"));
    }
    let lower = s.to_ascii_lowercase();
    let (num, shift) = if let Some(n) = strip_size_suffix(&lower, 'k') {
        (n, 10)
    } else if let Some(n) = strip_size_suffix(&lower, 'm') {
        (n, 20)
    } else if let Some(n) = strip_size_suffix(&lower, 'g') {
        (n, 30)
    } else if let Some(n) = strip_size_suffix(&lower, 't') {
        (n, 40)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n.to_string(), 0)
    } else {
        (lower.clone(), 0)
    };

    let value: f64 = num
        .parse()
        .map_err(|_| Error::invalid(format!("invalid size {:?}", s)))?;
    if value < 0.0 {
        return Err(Error::invalid(format!("negative size {:?}", s)));
    }
    Ok((value * (1u64 << shift) as f64) as i64)
}

/// Accept `512m`, `512mb`, and `512mi` alike.
fn strip_size_suffix(s: &str, unit: char) -> Option<String> {
    for suffix in [format!("{}ib", unit), format!("{}i", unit), format!("{}b", unit), unit.to_string()] {
        if let Some(n) = s.strip_suffix(&suffix) {
            return Some(n.to_string());
        }
    }
    None
}

/// Build the resources section from the input flags. Returns `None` when no
/// resource flag was given.
fn build_resources(input: &SpecInput) -> Result<Option<LinuxResources>> {
    let has_any = input.cpus.is_some()
        || input.cpu_shares.is_some()
        || input.cpuset_cpus.is_some()
        || input.memory.is_some()
        || input.pids_limit.is_some();
    if !has_any {
        return Ok(None);
    }

    let mut builder = LinuxResourcesBuilder::default();

    if input.cpus.is_some() || input.cpu_shares.is_some() || input.cpuset_cpus.is_some() {
        let mut cpu = LinuxCpuBuilder::default();
        if let Some(f) = input.cpus {
            if f <= 0.0 {
                return Err(Error::invalid(format!("invalid --cpus value {}", f)));
            }
            cpu = cpu
                .quota((f * CFS_PERIOD as f64) as i64)
                .period(CFS_PERIOD);
        }
        if let Some(shares) = input.cpu_shares {
            cpu = cpu.shares(shares);
        }
        if let Some(set) = &input.cpuset_cpus {
            // passed through verbatim; the kernel validates the mask
            cpu = cpu.cpus(set.clone());
        }
        builder = builder.cpu(cpu.build().map_err(|e| Error::spec(e.to_string()))?);
    }

    if let Some(mem) = &input.memory {
        let limit = parse_bytes(mem)?;
        let memory = LinuxMemoryBuilder::default()
            .limit(limit)
            .build()
            .map_err(|e| Error::spec(e.to_string()))?;
        builder = builder.memory(memory);
    }

    if let Some(limit) = input.pids_limit {
        let pids = LinuxPidsBuilder::default()
            .limit(limit)
            .build()
            .map_err(|e| Error::spec(e.to_string()))?;
        builder = builder.pids(pids);
    }

    Ok(Some(
        builder.build().map_err(|e| Error::spec(e.to_string()))?,
    ))
}

/// Apply cgroup manager choice and resource limits.
pub fn apply(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    validate_cgroup_manager(input.cgroup_manager)?;

    let mut linux = spec.linux().clone().unwrap_or_default();

    match input.cgroup_manager {
        CgroupManager::None => {
            // No cgroup to account against: resource flags cannot be honored.
            if build_resources(input)?.is_some() {
                tracing::warn!(
                    "cgroup manager is \"none\"; discarding cpu/memory/pids limits"
                );
            }
            linux.set_cgroups_path(None);
        }
        CgroupManager::Systemd => {
            linux.set_cgroups_path(Some(
                format!("system.slice:cradle:{}", input.id).into(),
            ));
            linux.set_resources(build_resources(input)?);
        }
        CgroupManager::Cgroupfs => {
            linux.set_cgroups_path(Some(format!("/cradle/{}", input.id).into()));
            linux.set_resources(build_resources(input)?);
        }
    }

    spec.set_linux(Some(linux));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocispec::{assemble, SpecInput};
    use std::str::FromStr;

    #[test]
    fn test_parse_bytes_suffixes() {
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_bytes("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_bytes("512m").unwrap(), 512 << 20);
        assert_eq!(parse_bytes("1g").unwrap(), 1 << 30);
        assert_eq!(parse_bytes("2t").unwrap(), 2u64 as i64 * (1 << 40));
        assert_eq!(parse_bytes("1gb").unwrap(), 1 << 30);
        assert_eq!(parse_bytes("1gi").unwrap(), 1 << 30);
        assert_eq!(parse_bytes("1.5g").unwrap(), (1.5 * (1u64 << 30) as f64) as i64);
    }

    #[test]
    fn test_parse_bytes_rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("-5m").is_err());
    }

    #[test]
    fn test_cpus_to_cfs_quota() {
        let mut input = SpecInput::new("a".repeat(64));
        input.cpus = Some(1.5);
        input.cgroup_manager = crate::config::CgroupManager::Cgroupfs;
        let spec = assemble(&input).unwrap();
        let linux = spec.linux().as_ref().unwrap();
        let cpu = linux.resources().as_ref().unwrap().cpu().as_ref().unwrap();
        assert_eq!(cpu.quota(), Some(150_000));
        assert_eq!(cpu.period(), Some(100_000));
    }

    #[test]
    fn test_memory_limit_bytes() {
        let mut input = SpecInput::new("b".repeat(64));
        input.memory = Some("512m".to_string());
        input.cgroup_manager = crate::config::CgroupManager::Cgroupfs;
        let spec = assemble(&input).unwrap();
        let linux = spec.linux().as_ref().unwrap();
        let mem = linux
            .resources()
            .as_ref()
            .unwrap()
            .memory()
            .as_ref()
            .unwrap();
        assert_eq!(mem.limit(), Some(512 << 20));
    }

    #[test]
    fn test_cgroupfs_path_contains_id() {
        let mut input = SpecInput::new("c".repeat(64));
        input.cgroup_manager = crate::config::CgroupManager::Cgroupfs;
        let spec = assemble(&input).unwrap();
        let path = spec.linux().as_ref().unwrap().cgroups_path().clone().unwrap();
        assert!(path.to_string_lossy().contains(&"c".repeat(64)));
    }

    #[test]
    fn test_cgroupns_mode_parse() {
        assert_eq!(
            CgroupnsMode::from_str("private").unwrap(),
            CgroupnsMode::Private
        );
        assert_eq!(CgroupnsMode::from_str("host").unwrap(), CgroupnsMode::Host);
        assert!(CgroupnsMode::from_str("container:x").is_err());
    }
}
