//! OCI runtime spec assembly.
//!
//! `run`/`create` flags land in a [`SpecInput`]; [`assemble`] turns that
//! into a complete OCI runtime spec by applying an ordered list of pure
//! transforms. Order is significant: namespaces (including the cgroup ns)
//! are set before resources and devices, mounts before the record-dir etc
//! files, security last so `--privileged` can override everything.

pub mod devices;
pub mod mounts;
pub mod resources;
pub mod security;
pub mod user;

pub use mounts::MountSpec;
pub use resources::CgroupnsMode;

use crate::config::CgroupManager;
use crate::error::{Error, Result};
use oci_spec::runtime::{
    LinuxBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, ProcessBuilder, RootBuilder, Spec,
    SpecBuilder,
};
use std::path::PathBuf;

/// Network namespace disposition chosen from the `--net` selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetnsMode {
    /// Private netns; CNI attaches into it.
    #[default]
    Private,
    /// Share the host's network namespace.
    Host,
}

/// Everything the assembler needs, already parsed and resolved.
#[derive(Debug, Clone)]
pub struct SpecInput {
    pub id: String,
    pub hostname: String,
    /// Record directory; source of the hosts/resolv.conf/hostname mounts.
    pub record_dir: PathBuf,
    /// Fully resolved argv (entrypoint + cmd).
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE`, image env first.
    pub env: Vec<String>,
    pub cwd: String,
    pub terminal: bool,
    /// `<name|uid>[:<group|gid>]`, if given.
    pub user: Option<String>,
    /// Raw rootfs path for `--rootfs` mode; otherwise the snapshotter
    /// provides the rootfs and `root.path` stays relative.
    pub rootfs: Option<PathBuf>,
    pub read_only: bool,

    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub no_new_privileges: bool,
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor_profile: Option<String>,
    pub ulimits: Vec<String>,
    pub devices: Vec<String>,

    pub mounts: Vec<MountSpec>,
    pub tmpfs: Vec<String>,

    pub cgroup_manager: CgroupManager,
    pub cgroupns: CgroupnsMode,
    pub cpus: Option<f64>,
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub memory: Option<String>,
    pub pids_limit: Option<i64>,

    pub pid_host: bool,
    pub netns: NetnsMode,
}

impl SpecInput {
    /// A minimal input for the given container.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let hostname = id.chars().take(12).collect();
        Self {
            id,
            hostname,
            record_dir: PathBuf::new(),
            args: vec!["/bin/sh".to_string()],
            env: vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ],
            cwd: "/".to_string(),
            terminal: false,
            user: None,
            rootfs: None,
            read_only: false,
            privileged: false,
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            no_new_privileges: false,
            seccomp_profile: None,
            apparmor_profile: None,
            ulimits: Vec::new(),
            devices: Vec::new(),
            mounts: Vec::new(),
            tmpfs: Vec::new(),
            cgroup_manager: CgroupManager::Systemd,
            cgroupns: CgroupnsMode::Private,
            cpus: None,
            cpu_shares: None,
            cpuset_cpus: None,
            memory: None,
            pids_limit: None,
            pid_host: false,
            netns: NetnsMode::Private,
        }
    }
}

/// One step of the assembly pipeline.
type Transform = fn(&mut Spec, &SpecInput) -> Result<()>;

/// The ordered pipeline. Later transforms depend on earlier ones.
const PIPELINE: &[(&str, Transform)] = &[
    ("process", apply_process),
    ("hostname", apply_hostname),
    ("namespaces", apply_namespaces),
    ("resources", resources::apply),
    ("mounts", mounts::apply),
    ("devices", devices::apply),
    ("user", user::apply),
    ("security", security::apply),
];

/// Assemble a complete OCI runtime spec from the input.
pub fn assemble(input: &SpecInput) -> Result<Spec> {
    let root_path = input
        .rootfs
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "rootfs".to_string());

    let root = RootBuilder::default()
        .path(root_path)
        .readonly(input.read_only)
        .build()
        .map_err(|e| Error::spec(e.to_string()))?;

    let mut spec = SpecBuilder::default()
        .version("1.1.0".to_string())
        .root(root)
        .build()
        .map_err(|e| Error::spec(e.to_string()))?;

    for (name, transform) in PIPELINE {
        transform(&mut spec, input)
            .map_err(|e| Error::spec(format!("{} transform: {}", name, e)))?;
    }

    Ok(spec)
}

fn apply_process(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    let mut env = input.env.clone();
    if input.terminal && !env.iter().any(|e| e.starts_with("TERM=")) {
        env.push("TERM=xterm".to_string());
    }

    let process = ProcessBuilder::default()
        .terminal(input.terminal)
        .args(input.args.clone())
        .env(env)
        .cwd(input.cwd.clone())
        .build()
        .map_err(|e| Error::spec(e.to_string()))?;

    spec.set_process(Some(process));
    Ok(())
}

fn apply_hostname(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    spec.set_hostname(Some(input.hostname.clone()));
    Ok(())
}

fn apply_namespaces(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    let mut namespaces = Vec::new();
    let mut add = |typ: LinuxNamespaceType| -> Result<()> {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(typ)
                .build()
                .map_err(|e| Error::spec(e.to_string()))?,
        );
        Ok(())
    };

    if !input.pid_host {
        add(LinuxNamespaceType::Pid)?;
    }
    add(LinuxNamespaceType::Ipc)?;
    add(LinuxNamespaceType::Uts)?;
    add(LinuxNamespaceType::Mount)?;
    if input.netns == NetnsMode::Private {
        // No path: the runtime creates a fresh netns; CNI attaches into it
        // between task create and task start.
        add(LinuxNamespaceType::Network)?;
    }
    if input.cgroupns == CgroupnsMode::Private {
        add(LinuxNamespaceType::Cgroup)?;
    }

    let linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .build()
        .map_err(|e| Error::spec(e.to_string()))?;
    spec.set_linux(Some(linux));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_minimal() {
        let input = SpecInput::new("a".repeat(64));
        let spec = assemble(&input).unwrap();

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.args().as_ref().unwrap(), &vec!["/bin/sh"]);
        assert!(!process.terminal().unwrap_or(false));
        assert_eq!(spec.hostname().as_deref(), Some("aaaaaaaaaaaa"));
        assert_eq!(spec.root().as_ref().unwrap().path().to_str(), Some("rootfs"));
    }

    #[test]
    fn test_terminal_adds_term_env() {
        let mut input = SpecInput::new("b".repeat(64));
        input.terminal = true;
        let spec = assemble(&input).unwrap();
        let env = spec.process().as_ref().unwrap().env().clone().unwrap();
        assert!(env.iter().any(|e| e == "TERM=xterm"));
    }

    #[test]
    fn test_pid_host_drops_pid_namespace() {
        let mut input = SpecInput::new("c".repeat(64));
        input.pid_host = true;
        let spec = assemble(&input).unwrap();
        let namespaces = spec.linux().as_ref().unwrap().namespaces().clone().unwrap();
        assert!(!namespaces
            .iter()
            .any(|n| n.typ() == LinuxNamespaceType::Pid));
    }

    #[test]
    fn test_host_net_drops_network_namespace() {
        let mut input = SpecInput::new("d".repeat(64));
        input.netns = NetnsMode::Host;
        let spec = assemble(&input).unwrap();
        let namespaces = spec.linux().as_ref().unwrap().namespaces().clone().unwrap();
        assert!(!namespaces
            .iter()
            .any(|n| n.typ() == LinuxNamespaceType::Network));
    }

    #[test]
    fn test_cgroupns_host_drops_cgroup_namespace() {
        let mut input = SpecInput::new("e".repeat(64));
        input.cgroupns = CgroupnsMode::Host;
        let spec = assemble(&input).unwrap();
        let namespaces = spec.linux().as_ref().unwrap().namespaces().clone().unwrap();
        assert!(!namespaces
            .iter()
            .any(|n| n.typ() == LinuxNamespaceType::Cgroup));
    }

    #[test]
    fn test_rootfs_mode_sets_absolute_root() {
        let mut input = SpecInput::new("f".repeat(64));
        input.rootfs = Some(PathBuf::from("/srv/rootfs"));
        let spec = assemble(&input).unwrap();
        assert_eq!(
            spec.root().as_ref().unwrap().path().to_str(),
            Some("/srv/rootfs")
        );
    }
}
