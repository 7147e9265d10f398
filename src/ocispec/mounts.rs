//! Mount parsing and the mount transform.

use super::SpecInput;
use crate::error::{Error, Result};
use oci_spec::runtime::{Mount, MountBuilder, Spec};
use std::path::Path;

/// Options accepted in a bind-mount specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOption {
    Rw,
    Ro,
    /// Recursive read-only; degrades to `ro` on kernels without support.
    Rro,
    Shared,
    Slave,
    Private,
    Rshared,
    Rslave,
    Rprivate,
}

impl MountOption {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "rw" => Ok(Self::Rw),
            "ro" => Ok(Self::Ro),
            "rro" => Ok(Self::Rro),
            "shared" => Ok(Self::Shared),
            "slave" => Ok(Self::Slave),
            "private" => Ok(Self::Private),
            "rshared" => Ok(Self::Rshared),
            "rslave" => Ok(Self::Rslave),
            "rprivate" => Ok(Self::Rprivate),
            other => Err(Error::invalid(format!("unknown mount option {:?}", other))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Rw => "rw",
            Self::Ro => "ro",
            Self::Rro => "rro",
            Self::Shared => "shared",
            Self::Slave => "slave",
            Self::Private => "private",
            Self::Rshared => "rshared",
            Self::Rslave => "rslave",
            Self::Rprivate => "rprivate",
        }
    }
}

/// A parsed `-v`/`--volume` specification. The source may be a host path
/// (bind mount) or a named-volume reference; the lifecycle engine resolves
/// volume names to their `_data` directories before spec assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path or volume name, as given.
    pub source: String,
    /// Absolute destination inside the container.
    pub destination: String,
    /// Parsed options.
    pub options: Vec<MountOption>,
}

impl MountSpec {
    /// Parse `src:dst[:opts]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, destination, raw_opts) = match parts.as_slice() {
            [src, dst] => (*src, *dst, ""),
            [src, dst, opts] => (*src, *dst, *opts),
            _ => {
                return Err(Error::invalid(format!(
                    "invalid mount specification {:?}: expected src:dst[:opts]",
                    spec
                )))
            }
        };

        if source.is_empty() || destination.is_empty() {
            return Err(Error::invalid(format!(
                "invalid mount specification {:?}: empty source or destination",
                spec
            )));
        }
        if !destination.starts_with('/') {
            return Err(Error::invalid(format!(
                "mount destination {:?} must be absolute",
                destination
            )));
        }

        let mut options = Vec::new();
        if !raw_opts.is_empty() {
            for opt in raw_opts.split(',') {
                options.push(MountOption::parse(opt)?);
            }
        }

        Ok(Self {
            source: source.to_string(),
            destination: destination.to_string(),
            options,
        })
    }

    /// Whether the source names a volume rather than a host path.
    pub fn is_named_volume(&self) -> bool {
        !self.source.starts_with('/')
    }

    /// Render as an OCI bind mount rooted at `source_path`.
    pub fn to_oci(&self, source_path: &Path) -> Result<Mount> {
        let mut opts: Vec<String> = vec!["rbind".to_string()];
        let mut saw_propagation = false;
        for opt in &self.options {
            match opt {
                MountOption::Rro if !kernel_supports_rro() => {
                    tracing::warn!(
                        dest = %self.destination,
                        "kernel lacks recursive-readonly mounts; degrading rro to ro"
                    );
                    opts.push("ro".to_string());
                }
                MountOption::Shared
                | MountOption::Slave
                | MountOption::Private
                | MountOption::Rshared
                | MountOption::Rslave
                | MountOption::Rprivate => {
                    saw_propagation = true;
                    opts.push(opt.as_str().to_string());
                }
                other => opts.push(other.as_str().to_string()),
            }
        }
        if !saw_propagation {
            opts.push("rprivate".to_string());
        }

        MountBuilder::default()
            .destination(self.destination.clone())
            .typ("bind")
            .source(source_path.to_path_buf())
            .options(opts)
            .build()
            .map_err(|e| Error::spec(e.to_string()))
    }
}

/// Parse a `--tmpfs` specification: `dst[:opts]` where opts may carry
/// `size=…` and standard tmpfs flags.
pub fn parse_tmpfs(spec: &str) -> Result<Mount> {
    let (destination, raw_opts) = match spec.split_once(':') {
        Some((d, o)) => (d, o),
        None => (spec, ""),
    };
    if !destination.starts_with('/') {
        return Err(Error::invalid(format!(
            "tmpfs destination {:?} must be absolute",
            destination
        )));
    }

    let mut options = vec![
        "nosuid".to_string(),
        "nodev".to_string(),
        "mode=1777".to_string(),
    ];
    if !raw_opts.is_empty() {
        for opt in raw_opts.split(',') {
            options.push(opt.to_string());
        }
    }

    MountBuilder::default()
        .destination(destination)
        .typ("tmpfs")
        .source("tmpfs")
        .options(options)
        .build()
        .map_err(|e| Error::spec(e.to_string()))
}

/// Recursive-readonly bind mounts need mount_setattr(2), kernel 5.12+.
fn kernel_supports_rro() -> bool {
    let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") else {
        return false;
    };
    let mut parts = release.trim().split(['.', '-']);
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor) >= (5, 12)
}

/// The standard mount set every container gets.
fn default_mounts() -> Result<Vec<Mount>> {
    let specs: &[(&str, &str, &str, &[&str])] = &[
        ("/proc", "proc", "proc", &[]),
        (
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        (
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        (
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        (
            "/dev/mqueue",
            "mqueue",
            "mqueue",
            &["nosuid", "noexec", "nodev"],
        ),
        ("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        (
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
    ];

    let mut mounts = Vec::with_capacity(specs.len());
    for (dst, typ, src, opts) in specs {
        mounts.push(
            MountBuilder::default()
                .destination(*dst)
                .typ(*typ)
                .source(*src)
                .options(opts.iter().map(|o| o.to_string()).collect::<Vec<_>>())
                .build()
                .map_err(|e| Error::spec(e.to_string()))?,
        );
    }
    Ok(mounts)
}

/// Bind one record-dir file over an /etc path.
fn etc_bind(record_dir: &Path, file: &str, destination: &str) -> Result<Mount> {
    MountBuilder::default()
        .destination(destination)
        .typ("bind")
        .source(record_dir.join(file))
        .options(vec![
            "bind".to_string(),
            "rprivate".to_string(),
            "rw".to_string(),
        ])
        .build()
        .map_err(|e| Error::spec(e.to_string()))
}

/// Apply default mounts, the record-dir /etc binds, user binds, and tmpfs.
pub fn apply(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    let mut mounts = default_mounts()?;

    // hosts/resolv.conf/hostname live in the record dir so the network
    // manager can rewrite them after attach.
    if input.record_dir.as_os_str().len() > 0 {
        mounts.push(etc_bind(&input.record_dir, "hosts", "/etc/hosts")?);
        mounts.push(etc_bind(
            &input.record_dir,
            "resolv.conf",
            "/etc/resolv.conf",
        )?);
        mounts.push(etc_bind(&input.record_dir, "hostname", "/etc/hostname")?);
    }

    for m in &input.mounts {
        // Named volumes must be resolved before assembly.
        if m.is_named_volume() {
            return Err(Error::spec(format!(
                "unresolved volume source {:?}",
                m.source
            )));
        }
        mounts.push(m.to_oci(Path::new(&m.source))?);
    }

    for t in &input.tmpfs {
        mounts.push(parse_tmpfs(t)?);
    }

    spec.set_mounts(Some(mounts));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocispec::{assemble, SpecInput};

    #[test]
    fn test_parse_bind() {
        let m = MountSpec::parse("/data:/srv:ro").unwrap();
        assert_eq!(m.source, "/data");
        assert_eq!(m.destination, "/srv");
        assert_eq!(m.options, vec![MountOption::Ro]);
        assert!(!m.is_named_volume());
    }

    #[test]
    fn test_parse_named_volume() {
        let m = MountSpec::parse("mydata:/srv").unwrap();
        assert!(m.is_named_volume());
    }

    #[test]
    fn test_parse_rejects_bad_specs() {
        assert!(MountSpec::parse("/only-src").is_err());
        assert!(MountSpec::parse("/a:relative").is_err());
        assert!(MountSpec::parse("/a:/b:nosuchopt").is_err());
        assert!(MountSpec::parse(":/b").is_err());
        assert!(MountSpec::parse("/a:/b:ro:extra").is_err());
    }

    #[test]
    fn test_parse_propagation_options() {
        let m = MountSpec::parse("/a:/b:rshared,rw").unwrap();
        assert_eq!(m.options, vec![MountOption::Rshared, MountOption::Rw]);
    }

    #[test]
    fn test_to_oci_defaults_to_rprivate() {
        let m = MountSpec::parse("/a:/b:rw").unwrap();
        let oci = m.to_oci(Path::new("/a")).unwrap();
        let opts = oci.options().clone().unwrap();
        assert!(opts.contains(&"rbind".to_string()));
        assert!(opts.contains(&"rprivate".to_string()));
    }

    #[test]
    fn test_to_oci_keeps_explicit_propagation() {
        let m = MountSpec::parse("/a:/b:rslave").unwrap();
        let oci = m.to_oci(Path::new("/a")).unwrap();
        let opts = oci.options().clone().unwrap();
        assert!(opts.contains(&"rslave".to_string()));
        assert!(!opts.contains(&"rprivate".to_string()));
    }

    #[test]
    fn test_tmpfs_with_size() {
        let m = parse_tmpfs("/scratch:size=64m").unwrap();
        assert_eq!(m.typ().as_deref(), Some("tmpfs"));
        assert!(m
            .options()
            .clone()
            .unwrap()
            .contains(&"size=64m".to_string()));
    }

    #[test]
    fn test_tmpfs_rejects_relative_destination() {
        assert!(parse_tmpfs("scratch").is_err());
    }

    #[test]
    fn test_apply_includes_defaults_and_etc_binds() {
        let mut input = SpecInput::new("a".repeat(64));
        input.record_dir = std::path::PathBuf::from("/var/lib/cradle/x/containers/default/aa");
        let spec = assemble(&input).unwrap();
        let mounts = spec.mounts().clone().unwrap();

        let dests: Vec<String> = mounts
            .iter()
            .map(|m| m.destination().display().to_string())
            .collect();
        assert!(dests.contains(&"/proc".to_string()));
        assert!(dests.contains(&"/etc/hosts".to_string()));
        assert!(dests.contains(&"/etc/resolv.conf".to_string()));
        assert!(dests.contains(&"/etc/hostname".to_string()));
    }

    #[test]
    fn test_apply_rejects_unresolved_volume() {
        let mut input = SpecInput::new("b".repeat(64));
        input.mounts = vec![MountSpec::parse("data:/srv").unwrap()];
        assert!(assemble(&input).is_err());
    }
}
