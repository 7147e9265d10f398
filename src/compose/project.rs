//! Compose file model.
//!
//! A project is a parsed, validated compose file with its services ordered
//! by `depends_on`. All names the project creates on the host are prefixed
//! `<project>_` so several projects coexist in one namespace.

use crate::error::{Error, Result};
use crate::store::record::RestartPolicy;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// The network every service joins when it names none.
pub const DEFAULT_SERVICE_NETWORK: &str = "default";

/// Raw compose file as written.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComposeFile {
    /// Legacy schema version marker, accepted and ignored.
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
    #[serde(default)]
    name: Option<String>,
    services: BTreeMap<String, RawService>,
    #[serde(default)]
    volumes: BTreeMap<String, Option<serde_yaml::Value>>,
    #[serde(default)]
    networks: BTreeMap<String, Option<serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    image: Option<String>,
    build: Option<serde_yaml::Value>,
    #[serde(default)]
    command: Option<Command>,
    #[serde(default)]
    entrypoint: Option<Command>,
    #[serde(default)]
    environment: Option<Environment>,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    networks: Vec<String>,
    #[serde(default)]
    depends_on: Option<DependsOn>,
    #[serde(default)]
    restart: Option<String>,
    #[serde(default)]
    labels: Option<Labels>,
}

/// `command`/`entrypoint` in either string or list form. The string form is
/// split on whitespace; quoting needs the list form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Command {
    Line(String),
    Argv(Vec<String>),
}

impl Command {
    fn into_argv(self) -> Vec<String> {
        match self {
            Command::Line(s) => s.split_whitespace().map(str::to_string).collect(),
            Command::Argv(v) => v,
        }
    }
}

/// `environment` as a map or a `KEY=VALUE` list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Environment {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl Environment {
    fn into_pairs(self) -> Vec<String> {
        match self {
            Environment::Map(m) => m.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            Environment::List(v) => v,
        }
    }
}

/// `depends_on` as a list or the long map form (conditions are ignored).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl DependsOn {
    fn into_names(self) -> Vec<String> {
        match self {
            DependsOn::List(v) => v,
            DependsOn::Map(m) => m.into_keys().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Labels {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl Labels {
    fn into_map(self) -> Result<BTreeMap<String, String>> {
        match self {
            Labels::Map(m) => Ok(m),
            Labels::List(v) => v
                .into_iter()
                .map(|item| {
                    item.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .ok_or_else(|| {
                            Error::Compose(format!("invalid label {:?}: expected key=value", item))
                        })
                })
                .collect(),
        }
    }
}

/// One validated service.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub environment: Vec<String>,
    /// Raw `-p` style specifications.
    pub ports: Vec<String>,
    /// Raw `-v` style specifications, volume names already prefixed.
    pub volumes: Vec<String>,
    /// Network keys as written in the file (unprefixed).
    pub networks: Vec<String>,
    pub depends_on: Vec<String>,
    pub restart: RestartPolicy,
    pub labels: BTreeMap<String, String>,
}

/// A loaded project with services in dependency order.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    /// Topologically ordered: dependencies before dependents.
    pub services: Vec<ServiceConfig>,
    /// Top-level volume keys, unprefixed.
    pub volumes: Vec<String>,
    /// Top-level network keys, unprefixed, `default` always present.
    pub networks: Vec<String>,
}

impl Project {
    /// Parse and validate a compose file. The project name comes from the
    /// override, the file's `name:`, or the file's directory, in that order.
    pub fn load(path: &Path, name_override: Option<&str>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Compose(format!("reading {}: {}", path.display(), e)))?;
        let file: ComposeFile = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Compose(format!("parsing {}: {}", path.display(), e)))?;

        let name = name_override
            .map(str::to_string)
            .or_else(|| file.name.clone())
            .or_else(|| {
                path.parent()
                    .and_then(Path::file_name)
                    .map(|d| d.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "default".to_string());
        let name = sanitize_project_name(&name)?;

        let mut networks: Vec<String> = file.networks.keys().cloned().collect();
        if !networks.contains(&DEFAULT_SERVICE_NETWORK.to_string()) {
            networks.push(DEFAULT_SERVICE_NETWORK.to_string());
        }
        let volumes: Vec<String> = file.volumes.keys().cloned().collect();
        let volume_set: BTreeSet<&str> = volumes.iter().map(String::as_str).collect();
        let network_set: BTreeSet<&str> = networks.iter().map(String::as_str).collect();

        if file.services.is_empty() {
            return Err(Error::Compose("no services defined".to_string()));
        }

        let mut services = Vec::new();
        for (svc_name, raw) in file.services {
            if raw.build.is_some() {
                return Err(Error::Compose(format!(
                    "service {:?}: build is not supported, specify an image",
                    svc_name
                )));
            }
            let image = raw.image.ok_or_else(|| {
                Error::Compose(format!("service {:?}: no image specified", svc_name))
            })?;

            let svc_networks = if raw.networks.is_empty() {
                vec![DEFAULT_SERVICE_NETWORK.to_string()]
            } else {
                raw.networks
            };
            for net in &svc_networks {
                if !network_set.contains(net.as_str()) {
                    return Err(Error::Compose(format!(
                        "service {:?}: network {:?} is not declared",
                        svc_name, net
                    )));
                }
            }

            // Named volume sources must be declared and get the prefix here
            // so the lifecycle sees the on-host name.
            let mut svc_volumes = Vec::new();
            for spec in raw.volumes {
                let source = spec.split(':').next().unwrap_or(&spec);
                if source.starts_with('/') || source.starts_with('.') {
                    if source.starts_with('.') {
                        return Err(Error::Compose(format!(
                            "service {:?}: relative bind paths are not supported ({:?})",
                            svc_name, spec
                        )));
                    }
                    svc_volumes.push(spec);
                } else {
                    if !volume_set.contains(source) {
                        return Err(Error::Compose(format!(
                            "service {:?}: volume {:?} is not declared",
                            svc_name, source
                        )));
                    }
                    svc_volumes.push(format!("{}_{}", name, spec));
                }
            }

            let restart = match raw.restart.as_deref() {
                None => RestartPolicy::No,
                Some(s) => s.parse().map_err(|_| {
                    Error::Compose(format!(
                        "service {:?}: unsupported restart policy {:?}",
                        svc_name, s
                    ))
                })?,
            };

            services.push(ServiceConfig {
                name: svc_name,
                image,
                command: raw.command.map(Command::into_argv).unwrap_or_default(),
                entrypoint: raw.entrypoint.map(Command::into_argv),
                environment: raw
                    .environment
                    .map(Environment::into_pairs)
                    .unwrap_or_default(),
                ports: raw.ports,
                volumes: svc_volumes,
                networks: svc_networks,
                depends_on: raw
                    .depends_on
                    .map(DependsOn::into_names)
                    .unwrap_or_default(),
                restart,
                labels: raw.labels.map(Labels::into_map).transpose()?.unwrap_or_default(),
            });
        }

        let services = topo_sort(services)?;
        Ok(Self {
            name,
            services,
            volumes,
            networks,
        })
    }

    pub fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::Compose(format!("no such service: {}", name)))
    }

    /// Container name of replica `index` (1-based) of a service.
    pub fn container_name(&self, service: &str, index: usize) -> String {
        format!("{}_{}_{}", self.name, service, index)
    }

    /// On-host name of a project network.
    pub fn network_name(&self, key: &str) -> String {
        format!("{}_{}", self.name, key)
    }

    /// On-host name of a project volume.
    pub fn volume_name(&self, key: &str) -> String {
        format!("{}_{}", self.name, key)
    }

    /// Content hash of one service's normalized configuration.
    pub fn service_hash(&self, service: &str) -> Result<String> {
        let svc = self.service(service)?;
        // serde_json maps are sorted, so the encoding is canonical.
        let normalized = serde_json::to_vec(svc)?;
        let digest = Sha256::digest(&normalized);
        let mut hex = String::with_capacity(64);
        use std::fmt::Write;
        for b in digest {
            let _ = write!(hex, "{:02x}", b);
        }
        Ok(hex)
    }
}

/// Project names share the container-name alphabet, lowercased.
fn sanitize_project_name(name: &str) -> Result<String> {
    let name = name.to_ascii_lowercase();
    let ok = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !ok {
        return Err(Error::Compose(format!("invalid project name {:?}", name)));
    }
    Ok(name)
}

/// Kahn's algorithm over `depends_on`, deterministic by service name.
/// Dependencies come before dependents; cycles are an error.
fn topo_sort(services: Vec<ServiceConfig>) -> Result<Vec<ServiceConfig>> {
    let names: BTreeSet<String> = services.iter().map(|s| s.name.clone()).collect();
    for svc in &services {
        for dep in &svc.depends_on {
            if !names.contains(dep) {
                return Err(Error::Compose(format!(
                    "service {:?} depends on undefined service {:?}",
                    svc.name, dep
                )));
            }
        }
    }

    let mut remaining: BTreeMap<String, ServiceConfig> =
        services.into_iter().map(|s| (s.name.clone(), s)).collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut placed: BTreeSet<String> = BTreeSet::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .values()
            .filter(|s| s.depends_on.iter().all(|d| placed.contains(d)))
            .map(|s| s.name.clone())
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = remaining.keys().map(String::as_str).collect();
            return Err(Error::Compose(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }
        for name in ready {
            let svc = remaining.remove(&name).expect("ready service present");
            placed.insert(name);
            ordered.push(svc);
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(yaml: &str) -> Result<Project> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        Project::load(&path, Some("demo"))
    }

    #[test]
    fn test_minimal_project() {
        let p = load("services:\n  web:\n    image: nginx:alpine\n").unwrap();
        assert_eq!(p.name, "demo");
        assert_eq!(p.services.len(), 1);
        assert_eq!(p.services[0].image, "nginx:alpine");
        assert_eq!(p.services[0].networks, vec!["default"]);
        assert_eq!(p.container_name("web", 1), "demo_web_1");
        assert_eq!(p.network_name("default"), "demo_default");
    }

    #[test]
    fn test_depends_on_orders_services() {
        let p = load(
            "services:\n\
             \x20 web:\n\
             \x20   image: nginx\n\
             \x20   depends_on: [db, cache]\n\
             \x20 cache:\n\
             \x20   image: redis\n\
             \x20   depends_on: [db]\n\
             \x20 db:\n\
             \x20   image: postgres\n",
        )
        .unwrap();
        let order: Vec<&str> = p.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["db", "cache", "web"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = load(
            "services:\n\
             \x20 a:\n\
             \x20   image: x\n\
             \x20   depends_on: [b]\n\
             \x20 b:\n\
             \x20   image: y\n\
             \x20   depends_on: [a]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_undeclared_volume_and_network_rejected() {
        let err = load(
            "services:\n\
             \x20 db:\n\
             \x20   image: postgres\n\
             \x20   volumes: [\"pgdata:/var/lib/postgresql/data\"]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("not declared"));

        let err = load(
            "services:\n\
             \x20 db:\n\
             \x20   image: postgres\n\
             \x20   networks: [backend]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }

    #[test]
    fn test_named_volume_gets_project_prefix() {
        let p = load(
            "services:\n\
             \x20 db:\n\
             \x20   image: postgres\n\
             \x20   volumes:\n\
             \x20     - pgdata:/var/lib/postgresql/data\n\
             \x20     - /host/path:/container/path\n\
             volumes:\n\
             \x20 pgdata:\n",
        )
        .unwrap();
        assert_eq!(
            p.services[0].volumes,
            vec![
                "demo_pgdata:/var/lib/postgresql/data",
                "/host/path:/container/path"
            ]
        );
    }

    #[test]
    fn test_command_and_environment_forms() {
        let p = load(
            "services:\n\
             \x20 a:\n\
             \x20   image: x\n\
             \x20   command: sleep 5\n\
             \x20   environment:\n\
             \x20     FOO: bar\n\
             \x20 b:\n\
             \x20   image: y\n\
             \x20   command: [\"sleep\", \"5\"]\n\
             \x20   environment:\n\
             \x20     - BAZ=qux\n",
        )
        .unwrap();
        assert_eq!(p.service("a").unwrap().command, vec!["sleep", "5"]);
        assert_eq!(p.service("a").unwrap().environment, vec!["FOO=bar"]);
        assert_eq!(p.service("b").unwrap().command, vec!["sleep", "5"]);
        assert_eq!(p.service("b").unwrap().environment, vec!["BAZ=qux"]);
    }

    #[test]
    fn test_build_is_rejected() {
        let err = load(
            "services:\n\
             \x20 app:\n\
             \x20   build: .\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("build is not supported"));
    }

    #[test]
    fn test_service_hash_is_stable_and_sensitive() {
        let yaml = "services:\n  web:\n    image: nginx\n";
        let a = load(yaml).unwrap().service_hash("web").unwrap();
        let b = load(yaml).unwrap().service_hash("web").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = load("services:\n  web:\n    image: nginx:alpine\n")
            .unwrap()
            .service_hash("web")
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_restart_policy_validation() {
        let p = load(
            "services:\n\
             \x20 a:\n\
             \x20   image: x\n\
             \x20   restart: always\n",
        )
        .unwrap();
        assert_eq!(p.services[0].restart, RestartPolicy::Always);

        assert!(load(
            "services:\n\
             \x20 a:\n\
             \x20   image: x\n\
             \x20   restart: on-failure\n",
        )
        .is_err());
    }
}
