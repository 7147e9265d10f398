//! Container flag surface shared by `run` and `create`.

use clap::Args;
use cradle::error::{Error, Result};
use cradle::lifecycle::CreateOpts;
use cradle::store::record::PortMapping;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug, Default)]
pub struct ContainerFlags {
    /// Assign a name to the container.
    #[arg(long)]
    pub name: Option<String>,

    /// Container hostname (defaults to the short ID).
    #[arg(long)]
    pub hostname: Option<String>,

    /// Set an environment variable (KEY=VALUE).
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Read environment variables from a file.
    #[arg(long = "env-file")]
    pub env_file: Vec<PathBuf>,

    /// Working directory inside the container.
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// User (name or uid, optionally :group).
    #[arg(short, long)]
    pub user: Option<String>,

    /// Set a label (key=value).
    #[arg(short = 'l', long = "label")]
    pub label: Vec<String>,

    /// Publish a port ([ip:]host:container[/proto]).
    #[arg(short, long = "publish")]
    pub publish: Vec<String>,

    /// Connect to a network (name, `host`, or `none`).
    #[arg(long = "net", alias = "network")]
    pub net: Vec<String>,

    /// DNS server for the container's resolv.conf.
    #[arg(long)]
    pub dns: Vec<String>,

    /// Add a hosts file entry (host:ip).
    #[arg(long = "add-host")]
    pub add_host: Vec<String>,

    /// Bind mount a volume (src:dst[:opts]).
    #[arg(short = 'v', long = "volume")]
    pub volume: Vec<String>,

    /// Mount a tmpfs (dst[:opts]).
    #[arg(long)]
    pub tmpfs: Vec<String>,

    /// Restart policy (no or always).
    #[arg(long, default_value = "no")]
    pub restart: String,

    /// When to pull the image (always, missing, never).
    #[arg(long, default_value = "missing")]
    pub pull: String,

    /// Override the image entrypoint.
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Run from a rootfs directory instead of an image.
    #[arg(long)]
    pub rootfs: bool,

    /// Mount the root filesystem read-only.
    #[arg(long = "read-only")]
    pub read_only: bool,

    /// Allocate a pseudo-TTY.
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Keep stdin open.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Write the container ID to a file.
    #[arg(long)]
    pub cidfile: Option<PathBuf>,

    /// Write the task PID to a file.
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Give extended privileges to the container.
    #[arg(long)]
    pub privileged: bool,

    /// Add a Linux capability.
    #[arg(long = "cap-add")]
    pub cap_add: Vec<String>,

    /// Drop a Linux capability.
    #[arg(long = "cap-drop")]
    pub cap_drop: Vec<String>,

    /// Security option (no-new-privileges, seccomp=PATH, apparmor=NAME).
    #[arg(long = "security-opt")]
    pub security_opt: Vec<String>,

    /// Ulimit (NAME=SOFT[:HARD]).
    #[arg(long)]
    pub ulimit: Vec<String>,

    /// Expose a host device (path[:rwm]).
    #[arg(long)]
    pub device: Vec<String>,

    /// Cgroup namespace mode (private or host).
    #[arg(long)]
    pub cgroupns: Option<String>,

    /// CPU quota in cores.
    #[arg(long)]
    pub cpus: Option<f64>,

    /// CPU shares (relative weight).
    #[arg(long = "cpu-shares")]
    pub cpu_shares: Option<u64>,

    /// CPUs the container may run on (e.g. 0-2,4).
    #[arg(long = "cpuset-cpus")]
    pub cpuset_cpus: Option<String>,

    /// Memory limit (e.g. 512m, 2g).
    #[arg(short = 'm', long)]
    pub memory: Option<String>,

    /// Limit the number of processes.
    #[arg(long = "pids-limit")]
    pub pids_limit: Option<i64>,

    /// PID namespace mode (`host` only).
    #[arg(long)]
    pub pid: Option<String>,
}

impl ContainerFlags {
    /// Convert parsed flags plus the image/command positionals into engine
    /// options. All value validation happens here so a bad flag fails
    /// before any state is touched.
    pub fn to_create_opts(&self, image: &str, args: &[String], detach: bool) -> Result<CreateOpts> {
        let mut labels = BTreeMap::new();
        for item in &self.label {
            let (k, v) = item
                .split_once('=')
                .ok_or_else(|| Error::invalid(format!("invalid label {:?}: expected key=value", item)))?;
            labels.insert(k.to_string(), v.to_string());
        }

        let mut ports = Vec::new();
        for spec in &self.publish {
            ports.push(PortMapping::parse(spec)?);
        }

        let mut no_new_privileges = false;
        let mut seccomp_profile = None;
        let mut apparmor_profile = None;
        for opt in &self.security_opt {
            match opt.split_once('=') {
                None if opt == "no-new-privileges" => no_new_privileges = true,
                Some(("seccomp", path)) => seccomp_profile = Some(PathBuf::from(path)),
                Some(("apparmor", name)) => apparmor_profile = Some(name.to_string()),
                _ => {
                    return Err(Error::invalid(format!(
                        "unknown --security-opt {:?}",
                        opt
                    )))
                }
            }
        }

        let pid_host = match self.pid.as_deref() {
            None => false,
            Some("host") => true,
            Some(other) => {
                return Err(Error::invalid(format!(
                    "unsupported --pid mode {:?} (only host)",
                    other
                )))
            }
        };

        let (image_ref, rootfs) = if self.rootfs {
            (String::new(), Some(PathBuf::from(image)))
        } else {
            (image.to_string(), None)
        };

        Ok(CreateOpts {
            image: image_ref,
            rootfs,
            args: args.to_vec(),
            entrypoint: self.entrypoint.clone().map(|e| vec![e]),
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            env: self.env.clone(),
            env_files: self.env_file.clone(),
            workdir: self.workdir.clone(),
            user: self.user.clone(),
            labels,
            ports,
            networks: self.net.clone(),
            dns: self.dns.clone(),
            add_hosts: self.add_host.clone(),
            volumes: self.volume.clone(),
            tmpfs: self.tmpfs.clone(),
            restart: self.restart.parse()?,
            pull: self.pull.parse()?,
            read_only: self.read_only,
            tty: self.tty,
            interactive: self.interactive,
            detach,
            cid_file: self.cidfile.clone(),
            pid_file: self.pidfile.clone(),
            privileged: self.privileged,
            cap_add: self.cap_add.clone(),
            cap_drop: self.cap_drop.clone(),
            no_new_privileges,
            seccomp_profile,
            apparmor_profile,
            ulimits: self.ulimit.clone(),
            devices: self.device.clone(),
            cgroupns: self.cgroupns.as_deref().map(str::parse).transpose()?,
            cpus: self.cpus,
            cpu_shares: self.cpu_shares,
            cpuset_cpus: self.cpuset_cpus.clone(),
            memory: self.memory.clone(),
            pids_limit: self.pids_limit,
            pid_host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle::ocispec::CgroupnsMode;
    use cradle::runtime::image::PullMode;
    use cradle::store::record::RestartPolicy;

    fn flags() -> ContainerFlags {
        ContainerFlags {
            restart: "no".to_string(),
            pull: "missing".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_map_through() {
        let opts = flags()
            .to_create_opts("alpine", &["sh".to_string()], false)
            .unwrap();
        assert_eq!(opts.image, "alpine");
        assert_eq!(opts.args, vec!["sh"]);
        assert_eq!(opts.restart, RestartPolicy::No);
        assert_eq!(opts.pull, PullMode::Missing);
        assert!(!opts.detach);
        assert!(opts.rootfs.is_none());
    }

    #[test]
    fn test_security_opt_parsing() {
        let mut f = flags();
        f.security_opt = vec![
            "no-new-privileges".to_string(),
            "seccomp=/etc/profile.json".to_string(),
            "apparmor=myprofile".to_string(),
        ];
        let opts = f.to_create_opts("alpine", &[], false).unwrap();
        assert!(opts.no_new_privileges);
        assert_eq!(opts.seccomp_profile, Some(PathBuf::from("/etc/profile.json")));
        assert_eq!(opts.apparmor_profile, Some("myprofile".to_string()));

        let mut f = flags();
        f.security_opt = vec!["selinux=disabled".to_string()];
        assert!(f.to_create_opts("alpine", &[], false).is_err());
    }

    #[test]
    fn test_pid_mode() {
        let mut f = flags();
        f.pid = Some("host".to_string());
        assert!(f.to_create_opts("alpine", &[], false).unwrap().pid_host);

        f.pid = Some("container:x".to_string());
        assert!(f.to_create_opts("alpine", &[], false).is_err());
    }

    #[test]
    fn test_rootfs_mode_swaps_positional() {
        let mut f = flags();
        f.rootfs = true;
        let opts = f.to_create_opts("/var/lib/roots/web", &[], false).unwrap();
        assert!(opts.image.is_empty());
        assert_eq!(opts.rootfs, Some(PathBuf::from("/var/lib/roots/web")));
    }

    #[test]
    fn test_bad_label_rejected() {
        let mut f = flags();
        f.label = vec!["nokey".to_string()];
        assert!(f.to_create_opts("alpine", &[], false).is_err());
    }

    #[test]
    fn test_cgroupns_parse() {
        let mut f = flags();
        f.cgroupns = Some("host".to_string());
        let opts = f.to_create_opts("alpine", &[], false).unwrap();
        assert_eq!(opts.cgroupns, Some(CgroupnsMode::Host));
    }
}
