//! Host device passthrough (`--device`).

use super::SpecInput;
use crate::error::{Error, Result};
use oci_spec::runtime::{
    LinuxDeviceBuilder, LinuxDeviceCgroupBuilder, LinuxDeviceType, Spec,
};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

/// A parsed `--device` specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Host device path (container path is constrained to be the same).
    pub path: String,
    /// Access mode, a combination of `r`, `w`, `m`.
    pub mode: String,
}

impl DeviceSpec {
    /// Parse `host[:container[:mode]]`. A container path different from the
    /// host path is rejected.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (host, container, mode) = match parts.as_slice() {
            [h] => (*h, *h, "rwm"),
            [h, c] if c.starts_with('/') => (*h, *c, "rwm"),
            // two segments where the second is a mode: /dev/sda:r
            [h, m] => (*h, *h, *m),
            [h, c, m] => (*h, *c, *m),
            _ => {
                return Err(Error::invalid(format!(
                    "invalid device specification {:?}: expected host[:container[:mode]]",
                    spec
                )))
            }
        };

        if !host.starts_with('/') {
            return Err(Error::invalid(format!(
                "device path {:?} must be absolute",
                host
            )));
        }
        if host != container {
            return Err(Error::invalid(format!(
                "device container path {:?} must equal the host path {:?}",
                container, host
            )));
        }
        if mode.is_empty()
            || !mode.chars().all(|c| matches!(c, 'r' | 'w' | 'm'))
        {
            return Err(Error::invalid(format!(
                "invalid device mode {:?}: must combine r, w, m",
                mode
            )));
        }

        Ok(Self {
            path: host.to_string(),
            mode: mode.to_string(),
        })
    }
}

/// Split a Linux `dev_t` into (major, minor).
fn split_dev(rdev: u64) -> (i64, i64) {
    let major = ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff);
    let minor = ((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff);
    (major as i64, minor as i64)
}

/// Apply `--device` entries: a device node plus a matching cgroup allow
/// rule for each.
pub fn apply(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    if input.devices.is_empty() {
        return Ok(());
    }

    let mut linux = spec.linux().clone().unwrap_or_default();
    let mut nodes = linux.devices().clone().unwrap_or_default();
    let mut resources = linux.resources().clone().unwrap_or_default();
    let mut rules = resources.devices().clone().unwrap_or_default();

    for raw in &input.devices {
        let dev = DeviceSpec::parse(raw)?;
        let meta = std::fs::metadata(Path::new(&dev.path))
            .map_err(|e| Error::invalid(format!("device {:?}: {}", dev.path, e)))?;

        let typ = if meta.file_type().is_char_device() {
            LinuxDeviceType::C
        } else if meta.file_type().is_block_device() {
            LinuxDeviceType::B
        } else {
            return Err(Error::invalid(format!(
                "device {:?} is not a character or block device",
                dev.path
            )));
        };
        let (major, minor) = split_dev(meta.rdev());

        nodes.push(
            LinuxDeviceBuilder::default()
                .path(dev.path.clone())
                .typ(typ)
                .major(major)
                .minor(minor)
                .file_mode(meta.mode() & 0o777)
                .build()
                .map_err(|e| Error::spec(e.to_string()))?,
        );
        rules.push(
            LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(typ)
                .major(major)
                .minor(minor)
                .access(dev.mode.clone())
                .build()
                .map_err(|e| Error::spec(e.to_string()))?,
        );
    }

    resources.set_devices(Some(rules));
    linux.set_resources(Some(resources));
    linux.set_devices(Some(nodes));
    spec.set_linux(Some(linux));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocispec::{assemble, SpecInput};

    #[test]
    fn test_parse_single_segment() {
        let d = DeviceSpec::parse("/dev/null").unwrap();
        assert_eq!(d.path, "/dev/null");
        assert_eq!(d.mode, "rwm");
    }

    #[test]
    fn test_parse_with_mode() {
        let d = DeviceSpec::parse("/dev/null:r").unwrap();
        assert_eq!(d.mode, "r");
        let d = DeviceSpec::parse("/dev/null:/dev/null:rw").unwrap();
        assert_eq!(d.mode, "rw");
    }

    #[test]
    fn test_parse_rejects_different_container_path() {
        let err = DeviceSpec::parse("/dev/sda:/dev/xvda").unwrap_err();
        assert!(err.to_string().contains("must equal"));
        assert!(DeviceSpec::parse("/dev/sda:/dev/xvda:rwm").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_mode() {
        assert!(DeviceSpec::parse("/dev/null:/dev/null:rx").is_err());
        assert!(DeviceSpec::parse("/dev/null:/dev/null:").is_err());
        assert!(DeviceSpec::parse("relative").is_err());
    }

    #[test]
    fn test_split_dev_null() {
        // /dev/null is 1:3; dev_t encodes it as (1 << 8) | 3.
        assert_eq!(split_dev((1 << 8) | 3), (1, 3));
    }

    #[test]
    fn test_apply_dev_null() {
        let mut input = SpecInput::new("a".repeat(64));
        input.devices = vec!["/dev/null:rw".to_string()];
        let spec = assemble(&input).unwrap();

        let linux = spec.linux().as_ref().unwrap();
        let nodes = linux.devices().clone().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].path().to_str(), Some("/dev/null"));
        assert_eq!(nodes[0].major(), 1);
        assert_eq!(nodes[0].minor(), 3);

        let rules = linux
            .resources()
            .as_ref()
            .unwrap()
            .devices()
            .clone()
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].access().as_deref(), Some("rw"));
    }
}
