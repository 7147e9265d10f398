//! Compose driver: multi-container projects from a YAML file.
//!
//! The driver is a thin orchestration layer over the lifecycle engine; a
//! project container is an ordinary container whose name and labels tie it
//! back to the project and service that created it.

pub mod project;

pub use project::{Project, ServiceConfig};

use crate::error::{Error, Result};
use crate::lifecycle::{CreateOpts, Engine};
use crate::logging::{self, FollowEvent, ReadOpts};
use crate::net::CreateNetworkOpts;
use crate::runtime::image::PullMode;
use crate::store::record::{ContainerRecord, ContainerStatus, PortMapping};
use std::collections::BTreeMap;

/// Label carrying the owning project name.
pub const PROJECT_LABEL: &str = "cradle.compose.project";
/// Label carrying the service name within the project.
pub const SERVICE_LABEL: &str = "cradle.compose.service";

/// One project bound to an engine.
pub struct Driver<'a> {
    engine: &'a Engine,
    pub project: Project,
}

impl<'a> Driver<'a> {
    pub fn new(engine: &'a Engine, project: Project) -> Self {
        Self { engine, project }
    }

    /// Containers belonging to this project, in service dependency order,
    /// replicas sorted by name within a service.
    pub fn containers(&self) -> Result<Vec<ContainerRecord>> {
        let records = self.engine.store.list_records()?;
        let mut out = Vec::new();
        for svc in &self.project.services {
            let mut replicas: Vec<ContainerRecord> = records
                .iter()
                .filter(|r| {
                    r.labels.get(PROJECT_LABEL) == Some(&self.project.name)
                        && r.labels.get(SERVICE_LABEL) == Some(&svc.name)
                })
                .cloned()
                .collect();
            replicas.sort_by(|a, b| a.name.cmp(&b.name));
            out.extend(replicas);
        }
        Ok(out)
    }

    /// Create project networks and volumes that do not exist yet.
    fn ensure_resources(&self) -> Result<()> {
        for key in &self.project.networks {
            let name = self.project.network_name(key);
            if self.engine.networks.get(&name).is_err() {
                let mut labels = BTreeMap::new();
                labels.insert(PROJECT_LABEL.to_string(), self.project.name.clone());
                self.engine.networks.create(
                    &name,
                    &CreateNetworkOpts {
                        labels,
                        ..Default::default()
                    },
                )?;
                println!("Created network {}", name);
            }
        }
        for key in &self.project.volumes {
            let name = self.project.volume_name(key);
            self.engine.volumes.create(&name, BTreeMap::new())?;
        }
        Ok(())
    }

    /// Bring the project up: resources, then create and start every
    /// replica in dependency order.
    pub async fn up(&self, scale: &BTreeMap<String, usize>) -> Result<()> {
        for svc in scale.keys() {
            self.project.service(svc)?;
        }
        self.ensure_resources()?;

        for svc in &self.project.services {
            let replicas = scale.get(&svc.name).copied().unwrap_or(1);
            for index in 1..=replicas {
                self.up_one(svc, index).await?;
            }
        }
        Ok(())
    }

    async fn up_one(&self, svc: &ServiceConfig, index: usize) -> Result<()> {
        let name = self.project.container_name(&svc.name, index);

        // An existing replica is reused: started if stopped, left alone if
        // already running.
        if let Some(id) = self.engine.store.lookup_name(&name) {
            let record = self
                .engine
                .store
                .load_record(&id)?
                .ok_or_else(|| Error::ContainerNotFound(id.clone()))?;
            match record.status {
                ContainerStatus::Running | ContainerStatus::Paused => {
                    println!("{} is already running", name);
                }
                _ => {
                    self.engine.start_detached(&id).await?;
                    println!("Started {}", name);
                }
            }
            return Ok(());
        }

        let mut labels = svc.labels.clone();
        labels.insert(PROJECT_LABEL.to_string(), self.project.name.clone());
        labels.insert(SERVICE_LABEL.to_string(), svc.name.clone());

        let mut ports = Vec::new();
        for spec in &svc.ports {
            ports.push(PortMapping::parse(spec)?);
        }

        let opts = CreateOpts {
            image: svc.image.clone(),
            args: svc.command.clone(),
            entrypoint: svc.entrypoint.clone(),
            name: Some(name.clone()),
            env: svc.environment.clone(),
            labels,
            ports,
            networks: svc
                .networks
                .iter()
                .map(|key| self.project.network_name(key))
                .collect(),
            volumes: svc.volumes.clone(),
            restart: svc.restart,
            pull: PullMode::Missing,
            detach: true,
            ..Default::default()
        };

        let record = self.engine.create(&opts).await?;
        println!("Created {}", name);
        self.engine.start_detached(&record.id).await?;
        println!("Started {}", name);
        Ok(())
    }

    /// Take the project down: stop and remove every replica in reverse
    /// dependency order, then remove project networks (and volumes with
    /// `remove_volumes`).
    pub async fn down(&self, remove_volumes: bool) -> Result<()> {
        let mut containers = self.containers()?;
        containers.reverse();

        for record in &containers {
            if record.status == ContainerStatus::Running
                || record.status == ContainerStatus::Paused
            {
                if let Err(e) = self.engine.stop(&record.id, 10).await {
                    tracing::warn!(id = %record.short_id(), error = %e, "stop failed");
                }
            }
            self.engine.remove(&record.id, true, remove_volumes).await?;
            println!("Removed {}", record.name.as_deref().unwrap_or(record.short_id()));
        }

        for key in &self.project.networks {
            let name = self.project.network_name(key);
            match self.engine.networks.remove(&name, false) {
                Ok(()) => println!("Removed network {}", name),
                Err(Error::Network(_, ref msg)) if msg == "not found" => {}
                Err(e) => return Err(e),
            }
        }

        if remove_volumes {
            for key in &self.project.volumes {
                let name = self.project.volume_name(key);
                match self.engine.volumes.remove(&name, false) {
                    Ok(()) => println!("Removed volume {}", name),
                    Err(Error::Volume(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Pull every service image.
    pub async fn pull(&self) -> Result<()> {
        for svc in &self.project.services {
            println!("Pulling {} ({})", svc.name, svc.image);
            self.engine.runtime.pull_image(&svc.image).await?;
        }
        Ok(())
    }

    /// Push every service image to its registry. Shared images are pushed
    /// once.
    pub async fn push(&self) -> Result<()> {
        let mut pushed: Vec<&str> = Vec::new();
        for svc in &self.project.services {
            if pushed.contains(&svc.image.as_str()) {
                continue;
            }
            println!("Pushing {} ({})", svc.name, svc.image);
            self.engine.runtime.push_image(&svc.image).await?;
            pushed.push(&svc.image);
        }
        Ok(())
    }

    /// Send a signal to every running replica.
    pub async fn kill(&self, signal: &str) -> Result<()> {
        for record in self.containers()? {
            if record.status != ContainerStatus::Running {
                continue;
            }
            self.engine.kill(&record.id, signal).await?;
        }
        Ok(())
    }

    /// Print project logs, one service-name prefix per line unless
    /// suppressed. With `follow`, streams until interrupted.
    pub async fn logs(
        &self,
        opts: ReadOpts,
        follow: bool,
        timestamps: bool,
        no_prefix: bool,
    ) -> Result<()> {
        let containers = self.containers()?;
        let width = containers
            .iter()
            .filter_map(|r| r.name.as_ref().map(String::len))
            .max()
            .unwrap_or(0);

        // Backlog first, merged across containers by timestamp.
        let mut backlog = Vec::new();
        for record in &containers {
            let Some(path) = &record.log_path else {
                continue;
            };
            if !path.exists() {
                continue;
            }
            let name = record.name.clone().unwrap_or_else(|| record.short_id().to_string());
            for entry in logging::read_entries(path, &opts)? {
                backlog.push((name.clone(), entry));
            }
        }
        backlog.sort_by_key(|(_, e)| e.time);
        for (name, entry) in &backlog {
            print_line(name, entry, timestamps, no_prefix, width);
        }

        if !follow {
            return Ok(());
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        for record in &containers {
            let Some(path) = &record.log_path else {
                continue;
            };
            let offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            let mut events = logging::follow(path, offset, opts.clone())?;
            let name = record.name.clone().unwrap_or_else(|| record.short_id().to_string());
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tx.send((name.clone(), event)).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(tx);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                event = rx.recv() => match event {
                    None => return Ok(()),
                    Some((name, FollowEvent::Entry(entry))) => {
                        print_line(&name, &entry, timestamps, no_prefix, width);
                    }
                    Some((name, FollowEvent::Lost(msg))) => {
                        tracing::warn!(container = %name, error = %msg, "log follow lost");
                    }
                },
            }
        }
    }

    /// Render the validated project, or per-service config hashes.
    pub fn config(&self, hash: bool) -> Result<String> {
        if hash {
            let mut out = String::new();
            for svc in &self.project.services {
                out.push_str(&format!("{} {}\n", svc.name, self.project.service_hash(&svc.name)?));
            }
            return Ok(out);
        }

        let mut services = BTreeMap::new();
        for svc in &self.project.services {
            services.insert(svc.name.clone(), svc.clone());
        }
        #[derive(serde::Serialize)]
        struct View<'a> {
            name: &'a str,
            services: BTreeMap<String, ServiceConfig>,
            volumes: &'a [String],
            networks: &'a [String],
        }
        let view = View {
            name: &self.project.name,
            services,
            volumes: &self.project.volumes,
            networks: &self.project.networks,
        };
        serde_yaml::to_string(&view).map_err(|e| Error::Compose(e.to_string()))
    }
}

fn print_line(
    name: &str,
    entry: &logging::LogEntry,
    timestamps: bool,
    no_prefix: bool,
    width: usize,
) {
    let text = logging::render(entry, timestamps);
    if no_prefix {
        println!("{}", text);
    } else {
        println!("{:width$} | {}", name, text, width = width);
    }
}
