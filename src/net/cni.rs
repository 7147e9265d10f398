//! CNI plugin execution.
//!
//! Plugins are standalone binaries driven by environment variables and a
//! JSON network configuration on stdin. A conflist is executed as a chain:
//! each plugin receives the previous plugin's result as `prevResult`, and
//! deletion walks the chain in reverse.

use crate::error::{Error, Result};
use crate::store::record::PortMapping;
use serde::Deserialize;
use serde_json::{json, Value};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// CNI spec version written into generated configurations.
pub const CNI_VERSION: &str = "1.0.0";

/// Result of one ADD chain, reduced to what the attachment needs.
#[derive(Debug, Clone, Deserialize)]
pub struct CniResult {
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    #[serde(default)]
    pub ips: Vec<CniIp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(default)]
    pub mac: Option<String>,
    /// Netns path; set for the container-side interface, absent for the
    /// host-side bridge and veth ends.
    #[serde(default)]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CniIp {
    /// CIDR notation, e.g. `10.4.0.5/24`.
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
    /// Index into `interfaces`.
    #[serde(default)]
    pub interface: Option<usize>,
}

impl CniResult {
    /// The container-side interface and its address, if present.
    pub fn sandbox_interface(&self) -> Option<(&CniInterface, Option<&CniIp>)> {
        let (idx, iface) = self
            .interfaces
            .iter()
            .enumerate()
            .find(|(_, i)| i.sandbox.is_some())?;
        let ip = self
            .ips
            .iter()
            .find(|ip| ip.interface == Some(idx) || ip.interface.is_none());
        Some((iface, ip))
    }
}

/// Error payload plugins print on failure.
#[derive(Debug, Deserialize)]
struct CniErrorBody {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    msg: String,
}

/// Identity of one attachment operation.
#[derive(Debug, Clone)]
pub struct AttachContext {
    pub container_id: String,
    pub netns: PathBuf,
    pub ifname: String,
}

/// Executes CNI plugin chains against a plugin directory.
#[derive(Debug, Clone)]
pub struct CniRunner {
    plugin_dir: PathBuf,
}

impl CniRunner {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
        }
    }

    /// Run the ADD chain for a conflist. Returns the final chain result.
    pub async fn add(
        &self,
        conflist: &Value,
        ctx: &AttachContext,
        ports: &[PortMapping],
    ) -> Result<CniResult> {
        let (name, plugins) = split_conflist(conflist)?;
        let mut prev_result: Option<Value> = None;

        for plugin in &plugins {
            let conf = self.plugin_conf(name, plugin, ports, prev_result.as_ref())?;
            let stdout = self.invoke("ADD", plugin, &conf, ctx).await?;
            prev_result = Some(serde_json::from_slice(&stdout).map_err(|e| Error::Cni {
                plugin: plugin_type(plugin).to_string(),
                message: format!("unparseable result: {}", e),
            })?);
        }

        let result = prev_result.ok_or_else(|| Error::Cni {
            plugin: "chain".to_string(),
            message: format!("network {:?} has no plugins", name),
        })?;
        serde_json::from_value(result).map_err(|e| Error::Cni {
            plugin: "chain".to_string(),
            message: format!("unparseable result: {}", e),
        })
    }

    /// Run the DEL chain in reverse order. Individual plugin failures are
    /// collected but do not stop the walk.
    pub async fn del(
        &self,
        conflist: &Value,
        ctx: &AttachContext,
        ports: &[PortMapping],
    ) -> Result<()> {
        let (name, plugins) = split_conflist(conflist)?;
        let mut first_err = None;

        for plugin in plugins.iter().rev() {
            let conf = self.plugin_conf(name, plugin, ports, None)?;
            if let Err(e) = self.invoke("DEL", plugin, &conf, ctx).await {
                tracing::warn!(
                    plugin = plugin_type(plugin),
                    error = %e,
                    "cni delete failed; continuing"
                );
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Build the per-plugin stdin document: the plugin config plus the
    /// chain-level fields and, where the plugin declares the capability,
    /// the runtime port mappings.
    fn plugin_conf(
        &self,
        name: &str,
        plugin: &Value,
        ports: &[PortMapping],
        prev_result: Option<&Value>,
    ) -> Result<Value> {
        let mut conf = plugin.clone();
        let obj = conf
            .as_object_mut()
            .ok_or_else(|| Error::network(name, "plugin entry is not an object"))?;
        obj.insert("cniVersion".to_string(), json!(CNI_VERSION));
        obj.insert("name".to_string(), json!(name));

        let wants_ports = plugin
            .pointer("/capabilities/portMappings")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if wants_ports && !ports.is_empty() {
            let mappings: Vec<Value> = ports
                .iter()
                .map(|p| {
                    json!({
                        "hostPort": p.host_port,
                        "containerPort": p.container_port,
                        "protocol": p.protocol.to_string(),
                        "hostIP": p.host_ip,
                    })
                })
                .collect();
            obj.insert(
                "runtimeConfig".to_string(),
                json!({ "portMappings": mappings }),
            );
        }

        if let Some(prev) = prev_result {
            obj.insert("prevResult".to_string(), prev.clone());
        }
        Ok(conf)
    }

    /// The full `CNI_*` variable set plugins expect. `CNI_ARGS` is part of
    /// the ABI and must be present even when empty.
    fn plugin_env(&self, command: &str, ctx: &AttachContext) -> Vec<(&'static str, OsString)> {
        vec![
            ("CNI_COMMAND", OsString::from(command)),
            ("CNI_CONTAINERID", OsString::from(&ctx.container_id)),
            ("CNI_NETNS", ctx.netns.clone().into_os_string()),
            ("CNI_IFNAME", OsString::from(&ctx.ifname)),
            ("CNI_PATH", self.plugin_dir.clone().into_os_string()),
            ("CNI_ARGS", OsString::new()),
        ]
    }

    async fn invoke(
        &self,
        command: &str,
        plugin: &Value,
        conf: &Value,
        ctx: &AttachContext,
    ) -> Result<Vec<u8>> {
        let typ = plugin_type(plugin);
        let binary = self.plugin_dir.join(typ);
        if !binary.exists() {
            return Err(Error::Cni {
                plugin: typ.to_string(),
                message: format!("plugin binary not found in {}", self.plugin_dir.display()),
            });
        }

        let mut child = Command::new(&binary)
            .envs(self.plugin_env(command, ctx))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Cni {
                plugin: typ.to_string(),
                message: format!("spawn failed: {}", e),
            })?;

        let payload = serde_json::to_vec(conf)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let output = child.wait_with_output().await.map_err(|e| Error::Cni {
            plugin: typ.to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let message = match serde_json::from_slice::<CniErrorBody>(&output.stdout) {
                Ok(body) => match body.code {
                    Some(code) => format!("{} (code {})", body.msg, code),
                    None => body.msg,
                },
                Err(_) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            return Err(Error::Cni {
                plugin: typ.to_string(),
                message,
            });
        }
        Ok(output.stdout)
    }
}

fn plugin_type(plugin: &Value) -> &str {
    plugin
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

fn split_conflist(conflist: &Value) -> Result<(&str, Vec<Value>)> {
    let name = conflist
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::network("?", "conflist missing name"))?;
    let plugins = conflist
        .get("plugins")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| Error::network(name, "conflist missing plugins"))?;
    Ok((name, plugins))
}

/// Path to a process's network namespace.
pub fn netns_of(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/net", pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::Protocol;

    fn sample_conflist() -> Value {
        json!({
            "cniVersion": CNI_VERSION,
            "name": "bridge",
            "plugins": [
                { "type": "bridge", "bridge": "br-abc", "ipam": { "type": "host-local" } },
                { "type": "portmap", "capabilities": { "portMappings": true } },
                { "type": "firewall" }
            ]
        })
    }

    #[test]
    fn test_plugin_conf_injects_chain_fields() {
        let runner = CniRunner::new("/opt/cni/bin");
        let conflist = sample_conflist();
        let (name, plugins) = split_conflist(&conflist).unwrap();
        let conf = runner.plugin_conf(name, &plugins[0], &[], None).unwrap();
        assert_eq!(conf["cniVersion"], CNI_VERSION);
        assert_eq!(conf["name"], "bridge");
        assert!(conf.get("runtimeConfig").is_none());
    }

    #[test]
    fn test_plugin_conf_port_mappings_only_with_capability() {
        let runner = CniRunner::new("/opt/cni/bin");
        let conflist = sample_conflist();
        let (name, plugins) = split_conflist(&conflist).unwrap();
        let ports = vec![PortMapping {
            host_ip: "0.0.0.0".parse().unwrap(),
            host_port: 8080,
            container_port: 80,
            protocol: Protocol::Tcp,
        }];

        let bridge = runner.plugin_conf(name, &plugins[0], &ports, None).unwrap();
        assert!(bridge.get("runtimeConfig").is_none());

        let portmap = runner.plugin_conf(name, &plugins[1], &ports, None).unwrap();
        let mappings = &portmap["runtimeConfig"]["portMappings"];
        assert_eq!(mappings[0]["hostPort"], 8080);
        assert_eq!(mappings[0]["containerPort"], 80);
        assert_eq!(mappings[0]["protocol"], "tcp");
    }

    #[test]
    fn test_plugin_conf_prev_result() {
        let runner = CniRunner::new("/opt/cni/bin");
        let conflist = sample_conflist();
        let (name, plugins) = split_conflist(&conflist).unwrap();
        let prev = json!({ "ips": [{ "address": "10.4.0.5/24" }] });
        let conf = runner
            .plugin_conf(name, &plugins[2], &[], Some(&prev))
            .unwrap();
        assert_eq!(conf["prevResult"]["ips"][0]["address"], "10.4.0.5/24");
    }

    #[test]
    fn test_sandbox_interface_selection() {
        let result: CniResult = serde_json::from_value(json!({
            "interfaces": [
                { "name": "br-abc" },
                { "name": "veth1234" },
                { "name": "eth0", "mac": "aa:bb:cc:dd:ee:ff", "sandbox": "/proc/42/ns/net" }
            ],
            "ips": [
                { "address": "10.4.0.5/24", "gateway": "10.4.0.1", "interface": 2 }
            ]
        }))
        .unwrap();

        let (iface, ip) = result.sandbox_interface().unwrap();
        assert_eq!(iface.name, "eth0");
        assert_eq!(ip.unwrap().address, "10.4.0.5/24");
    }

    #[test]
    fn test_plugin_env_covers_abi_variables() {
        let runner = CniRunner::new("/opt/cni/bin");
        let ctx = AttachContext {
            container_id: "c1".to_string(),
            netns: PathBuf::from("/proc/42/ns/net"),
            ifname: "eth0".to_string(),
        };
        let env = runner.plugin_env("ADD", &ctx);
        let names: Vec<&str> = env.iter().map(|(k, _)| *k).collect();
        for want in [
            "CNI_COMMAND",
            "CNI_CONTAINERID",
            "CNI_NETNS",
            "CNI_IFNAME",
            "CNI_PATH",
            "CNI_ARGS",
        ] {
            assert!(names.contains(&want), "{} not exported", want);
        }
        assert_eq!(env[0].1, OsString::from("ADD"));
    }

    #[test]
    fn test_netns_of() {
        assert_eq!(netns_of(42), PathBuf::from("/proc/42/ns/net"));
    }
}
