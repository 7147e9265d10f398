//! Capabilities, seccomp/AppArmor, ulimits, and the privileged switch.

use super::SpecInput;
use crate::error::{Error, Result};
use oci_spec::runtime::{
    Capability, LinuxCapabilitiesBuilder, LinuxDeviceCgroupBuilder, LinuxSeccomp, PosixRlimit,
    PosixRlimitBuilder, PosixRlimitType, Spec,
};
use std::collections::HashSet;

/// The OCI default capability set `--cap-add`/`--cap-drop` operate on.
pub const DEFAULT_CAPS: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Every capability, for `--privileged` and `--cap-add=ALL`.
const ALL_CAPS: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

/// Paths masked from the container unless privileged.
const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
    "/sys/devices/virtual/powercap",
];

/// Paths made read-only unless privileged.
const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Parse a capability name; accepts `SYS_ADMIN`, `sys_admin`, or
/// `CAP_SYS_ADMIN`.
pub fn parse_capability(name: &str) -> Result<Capability> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    // The enum's serde names are the canonical CAP_ strings.
    serde_json::from_value(serde_json::Value::String(full.clone()))
        .map_err(|_| Error::invalid(format!("unknown capability {:?}", name)))
}

/// Compute the effective capability set from the default set and the
/// add/drop flags. `ALL` is accepted on both sides. Drops apply before
/// adds, so an explicit add survives `--cap-drop ALL`.
pub fn effective_caps(add: &[String], drop: &[String]) -> Result<HashSet<Capability>> {
    let mut names: HashSet<String> = DEFAULT_CAPS.iter().map(|c| c.to_string()).collect();

    for cap in drop {
        if cap.eq_ignore_ascii_case("all") {
            names.clear();
        } else {
            parse_capability(cap)?;
            names.remove(&canonical_cap_name(cap));
        }
    }
    for cap in add {
        if cap.eq_ignore_ascii_case("all") {
            names.extend(ALL_CAPS.iter().map(|c| c.to_string()));
        } else {
            parse_capability(cap)?;
            names.insert(canonical_cap_name(cap));
        }
    }

    names.iter().map(|n| parse_capability(n)).collect()
}

fn canonical_cap_name(cap: &str) -> String {
    let upper = cap.to_ascii_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    }
}

/// Parse a `--ulimit NAME=SOFT[:HARD]` specification.
pub fn parse_ulimit(spec: &str) -> Result<PosixRlimit> {
    let (name, values) = spec
        .split_once('=')
        .ok_or_else(|| Error::invalid(format!("invalid ulimit {:?}: expected NAME=SOFT[:HARD]", spec)))?;

    let (soft_s, hard_s) = match values.split_once(':') {
        Some((s, h)) => (s, h),
        None => (values, values),
    };
    let soft: u64 = soft_s
        .parse()
        .map_err(|_| Error::invalid(format!("invalid ulimit soft value {:?}", soft_s)))?;
    let hard: u64 = hard_s
        .parse()
        .map_err(|_| Error::invalid(format!("invalid ulimit hard value {:?}", hard_s)))?;
    if soft > hard {
        return Err(Error::invalid(format!(
            "ulimit {:?}: soft {} exceeds hard {}",
            name, soft, hard
        )));
    }

    let typ_name = format!("RLIMIT_{}", name.to_ascii_uppercase());
    let typ: PosixRlimitType =
        serde_json::from_value(serde_json::Value::String(typ_name.clone()))
            .map_err(|_| Error::invalid(format!("unknown ulimit type {:?}", name)))?;

    PosixRlimitBuilder::default()
        .typ(typ)
        .soft(soft)
        .hard(hard)
        .build()
        .map_err(|e| Error::spec(e.to_string()))
}

/// Apply the security transform: capabilities, rlimits, no-new-privileges,
/// seccomp, AppArmor, masked/readonly paths, and the privileged override.
pub fn apply(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    let mut process = spec.process().clone().unwrap_or_default();
    let mut linux = spec.linux().clone().unwrap_or_default();

    // Capabilities: privileged unconditionally replaces the set with all.
    let caps: HashSet<Capability> = if input.privileged {
        ALL_CAPS
            .iter()
            .map(|c| parse_capability(c))
            .collect::<Result<_>>()?
    } else {
        effective_caps(&input.cap_add, &input.cap_drop)?
    };
    let capabilities = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .permitted(caps)
        .build()
        .map_err(|e| Error::spec(e.to_string()))?;
    process.set_capabilities(Some(capabilities));

    if input.no_new_privileges {
        process.set_no_new_privileges(Some(true));
    }

    if !input.ulimits.is_empty() {
        let rlimits: Vec<PosixRlimit> = input
            .ulimits
            .iter()
            .map(|u| parse_ulimit(u))
            .collect::<Result<_>>()?;
        process.set_rlimits(Some(rlimits));
    }

    if input.privileged {
        // Privileged disables seccomp and AppArmor and unmasks everything.
        if input.seccomp_profile.is_some() || input.apparmor_profile.is_some() {
            return Err(Error::invalid(
                "--privileged cannot be combined with seccomp or apparmor profiles",
            ));
        }
        linux.set_seccomp(None);
        linux.set_masked_paths(None);
        linux.set_readonly_paths(None);
        process.set_apparmor_profile(None);

        // Device cgroup: allow everything.
        let mut resources = linux.resources().clone().unwrap_or_default();
        let allow_all = LinuxDeviceCgroupBuilder::default()
            .allow(true)
            .access("rwm")
            .build()
            .map_err(|e| Error::spec(e.to_string()))?;
        resources.set_devices(Some(vec![allow_all]));
        linux.set_resources(Some(resources));
    } else {
        linux.set_masked_paths(Some(
            MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
        ));
        linux.set_readonly_paths(Some(
            READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
        ));

        if let Some(path) = &input.seccomp_profile {
            let raw = std::fs::read(path).map_err(|e| {
                Error::invalid(format!("seccomp profile {}: {}", path.display(), e))
            })?;
            let profile: LinuxSeccomp = serde_json::from_slice(&raw).map_err(|e| {
                Error::invalid(format!("seccomp profile {}: {}", path.display(), e))
            })?;
            linux.set_seccomp(Some(profile));
        }
        if let Some(profile) = &input.apparmor_profile {
            // The profile must already be loaded in the kernel.
            process.set_apparmor_profile(Some(profile.clone()));
        }
    }

    spec.set_process(Some(process));
    spec.set_linux(Some(linux));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocispec::{assemble, SpecInput};

    #[test]
    fn test_parse_capability_forms() {
        assert!(parse_capability("SYS_ADMIN").is_ok());
        assert!(parse_capability("sys_admin").is_ok());
        assert!(parse_capability("CAP_SYS_ADMIN").is_ok());
        assert!(parse_capability("FLY").is_err());
    }

    #[test]
    fn test_effective_caps_default() {
        let caps = effective_caps(&[], &[]).unwrap();
        assert_eq!(caps.len(), DEFAULT_CAPS.len());
        assert!(caps.contains(&parse_capability("NET_RAW").unwrap()));
        assert!(!caps.contains(&parse_capability("SYS_ADMIN").unwrap()));
    }

    #[test]
    fn test_effective_caps_add_drop() {
        let caps =
            effective_caps(&["SYS_ADMIN".into()], &["NET_RAW".into(), "CHOWN".into()]).unwrap();
        assert!(caps.contains(&parse_capability("SYS_ADMIN").unwrap()));
        assert!(!caps.contains(&parse_capability("NET_RAW").unwrap()));
        assert!(!caps.contains(&parse_capability("CHOWN").unwrap()));
    }

    #[test]
    fn test_effective_caps_add_survives_drop_all() {
        let caps = effective_caps(&["SYS_PTRACE".into()], &["ALL".into()]).unwrap();
        assert_eq!(caps.len(), 1);
        assert!(caps.contains(&parse_capability("SYS_PTRACE").unwrap()));
    }

    #[test]
    fn test_effective_caps_drop_all_alone_is_empty() {
        let caps = effective_caps(&[], &["ALL".into()]).unwrap();
        assert!(caps.is_empty());
    }

    #[test]
    fn test_parse_ulimit() {
        let r = parse_ulimit("nofile=1024:2048").unwrap();
        assert_eq!(r.soft(), 1024);
        assert_eq!(r.hard(), 2048);

        let r = parse_ulimit("nproc=100").unwrap();
        assert_eq!(r.soft(), 100);
        assert_eq!(r.hard(), 100);
    }

    #[test]
    fn test_parse_ulimit_rejects_bad() {
        assert!(parse_ulimit("nofile").is_err());
        assert!(parse_ulimit("nofile=a").is_err());
        assert!(parse_ulimit("nofile=2048:1024").is_err());
        assert!(parse_ulimit("nosuchlimit=1").is_err());
    }

    #[test]
    fn test_privileged_grants_all_and_unmasks() {
        let mut input = SpecInput::new("a".repeat(64));
        input.privileged = true;
        let spec = assemble(&input).unwrap();

        let process = spec.process().as_ref().unwrap();
        let caps = process.capabilities().as_ref().unwrap();
        assert_eq!(caps.bounding().as_ref().unwrap().len(), ALL_CAPS.len());

        let linux = spec.linux().as_ref().unwrap();
        assert!(linux.seccomp().is_none());
        assert!(linux.masked_paths().is_none());
    }

    #[test]
    fn test_unprivileged_masks_proc_paths() {
        let input = SpecInput::new("b".repeat(64));
        let spec = assemble(&input).unwrap();
        let linux = spec.linux().as_ref().unwrap();
        let masked = linux.masked_paths().clone().unwrap();
        assert!(masked.contains(&"/proc/kcore".to_string()));
    }

    #[test]
    fn test_no_new_privileges_flag() {
        let mut input = SpecInput::new("c".repeat(64));
        input.no_new_privileges = true;
        let spec = assemble(&input).unwrap();
        assert_eq!(
            spec.process().as_ref().unwrap().no_new_privileges(),
            Some(true)
        );
    }

    #[test]
    fn test_privileged_rejects_seccomp_profile() {
        let mut input = SpecInput::new("d".repeat(64));
        input.privileged = true;
        input.apparmor_profile = Some("docker-default".into());
        assert!(assemble(&input).is_err());
    }
}
