//! Container lifecycle engine.
//!
//! States: created → running → (paused ↔ running) → stopped → removed.
//! `run` is create + start. The engine owns the ordering contracts: name
//! reservation before any containerd mutation, network attach between task
//! create and task start, reverse-order rollback on mid-flight failure.

pub mod stdio;
pub mod supervisor;

use crate::config::GlobalOptions;
use crate::error::{Error, Result};
use crate::net::{NetworkManager, DEFAULT_NETWORK};
use crate::ocispec::{self, CgroupnsMode, MountSpec, NetnsMode, SpecInput};
use crate::resolver;
use crate::runtime::image::PullMode;
use crate::runtime::task::{StdioPaths, TaskStatus};
use crate::runtime::{spec_to_any, Runtime, RUNC_RUNTIME};
use crate::store::record::{
    ContainerRecord, ContainerStatus, NetworkAttachment, PortMapping, RestartPolicy,
};
use crate::store::DataStore;
use crate::volume::VolumeStore;
use chrono::Utc;
use containerd_client::services::v1::{container, Container};
use containerd_client::types::Mount;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// How long `start -d` waits for the supervisor to report the task up.
const DETACH_START_DEADLINE: Duration = Duration::from_secs(30);

/// Everything a CLI invocation needs to drive containers.
pub struct Engine {
    pub opts: GlobalOptions,
    pub store: DataStore,
    pub volumes: VolumeStore,
    pub networks: NetworkManager,
    pub runtime: Runtime,
}

impl Engine {
    /// Open the store and connect to containerd.
    pub async fn connect(opts: GlobalOptions) -> Result<Self> {
        let store = DataStore::open(&opts)?;
        let volumes = VolumeStore::new(&store);
        let networks = NetworkManager::new(&opts.cni_netconfpath, &opts.cni_path);
        let runtime = Runtime::connect(&opts).await?;
        Ok(Self {
            opts,
            store,
            volumes,
            networks,
            runtime,
        })
    }

    /// Resolve a user token to a container record.
    pub fn resolve(&self, token: &str) -> Result<ContainerRecord> {
        resolver::resolve_container(&self.store, token)
    }
}

/// Parsed flag surface of `run`/`create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// Image reference; ignored in `--rootfs` mode.
    pub image: String,
    /// Run from a raw rootfs directory instead of an image.
    pub rootfs: Option<PathBuf>,
    /// Command (overrides the image cmd).
    pub args: Vec<String>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// `--net` selectors, in order.
    pub networks: Vec<String>,
    pub dns: Vec<String>,
    /// `--add-host host:ip` entries.
    pub add_hosts: Vec<String>,
    /// Raw `-v` specifications.
    pub volumes: Vec<String>,
    pub tmpfs: Vec<String>,
    pub restart: RestartPolicy,
    pub pull: PullMode,
    pub read_only: bool,
    pub tty: bool,
    pub interactive: bool,
    /// Affects where stdio goes and whether a log file exists.
    pub detach: bool,
    pub cid_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,

    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub no_new_privileges: bool,
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor_profile: Option<String>,
    pub ulimits: Vec<String>,
    pub devices: Vec<String>,

    pub cgroupns: Option<CgroupnsMode>,
    pub cpus: Option<f64>,
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub memory: Option<String>,
    pub pids_limit: Option<i64>,
    pub pid_host: bool,
}

impl Engine {
    // --- create --------------------------------------------------------

    /// Create a container: reserve the name, materialize the rootfs,
    /// assemble the OCI spec, register with containerd, persist the record.
    /// Any failure rolls back everything done so far.
    pub async fn create(&self, o: &CreateOpts) -> Result<ContainerRecord> {
        let id = crate::new_container_id()?;
        let mut record = ContainerRecord::new(&id, self.store.namespace());

        let (netns, attachments) = self.plan_networks(&o.networks)?;
        record.networks = attachments;
        record.ports = o.ports.clone();
        record.labels = o.labels.clone();
        record.restart_policy = o.restart;
        record.cid_file = o.cid_file.clone();
        record.pid_file = o.pid_file.clone();
        record.tty = o.tty;
        record.stdin_open = o.interactive;
        if let Some(h) = &o.hostname {
            record.hostname = h.clone();
        }
        // Foreground output goes straight to the terminal; only detached
        // containers get a log file (the supervisor writes it).
        record.log_path = if o.detach {
            Some(self.store.record_dir(&id).join("logs"))
        } else {
            None
        };

        if let Some(name) = &o.name {
            self.store.reserve_name(name, &id)?;
            record.name = Some(name.clone());
        }

        match self.create_inner(&mut record, o, netns).await {
            Ok(()) => Ok(record),
            Err(e) => {
                self.rollback_create(&record).await;
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        record: &mut ContainerRecord,
        o: &CreateOpts,
        netns: NetnsMode,
    ) -> Result<()> {
        let mut input = SpecInput::new(record.id.clone());
        input.hostname = record.hostname.clone();
        input.record_dir = self.store.record_dir(&record.id);
        input.terminal = o.tty;
        input.read_only = o.read_only;
        input.privileged = o.privileged;
        input.cap_add = o.cap_add.clone();
        input.cap_drop = o.cap_drop.clone();
        input.no_new_privileges = o.no_new_privileges;
        input.seccomp_profile = o.seccomp_profile.clone();
        input.apparmor_profile = o.apparmor_profile.clone();
        input.ulimits = o.ulimits.clone();
        input.devices = o.devices.clone();
        input.tmpfs = o.tmpfs.clone();
        input.cgroup_manager = self.opts.cgroup_manager;
        input.cgroupns = o.cgroupns.unwrap_or_default();
        input.cpus = o.cpus;
        input.cpu_shares = o.cpu_shares;
        input.cpuset_cpus = o.cpuset_cpus.clone();
        input.memory = o.memory.clone();
        input.pids_limit = o.pids_limit;
        input.pid_host = o.pid_host;
        input.netns = netns;
        input.user = o.user.clone();

        let mut mounts: Vec<MountSpec> = Vec::new();
        for raw in &o.volumes {
            mounts.push(MountSpec::parse(raw)?);
        }

        // Image config feeds argv, env, cwd, user, stop signal, volumes.
        let image_volumes: Vec<String>;
        if let Some(rootfs) = &o.rootfs {
            if !rootfs.is_absolute() {
                return Err(Error::invalid("--rootfs path must be absolute"));
            }
            record.rootfs = Some(rootfs.clone());
            input.rootfs = Some(rootfs.clone());
            let argv = merged_argv(&o.entrypoint, &o.args, &[], &[])?;
            input.args = argv;
            input.env = merged_env(&[], &o.env_files, &o.env)?;
            input.cwd = o.workdir.clone().unwrap_or_else(|| "/".to_string());
            image_volumes = Vec::new();
        } else {
            let reference = self.runtime.ensure_image(&o.image, o.pull).await?;
            let (config, chain_id) = self.runtime.image_config(&reference).await?;
            record.image = Some(reference.clone());

            let img = config.config().clone().unwrap_or_default();
            let argv = merged_argv(
                &o.entrypoint,
                &o.args,
                img.entrypoint().as_deref().unwrap_or_default(),
                img.cmd().as_deref().unwrap_or_default(),
            )?;
            input.args = argv;
            input.env = merged_env(
                img.env().as_deref().unwrap_or_default(),
                &o.env_files,
                &o.env,
            )?;
            input.cwd = o
                .workdir
                .clone()
                .or_else(|| img.working_dir().clone().filter(|w| !w.is_empty()))
                .unwrap_or_else(|| "/".to_string());
            if input.user.is_none() {
                input.user = img.user().clone().filter(|u| !u.is_empty());
            }
            record.stop_signal = img.stop_signal().clone();
            image_volumes = img
                .volumes()
                .clone()
                .map(|v| v.into_iter().collect())
                .unwrap_or_default();

            self.runtime
                .prepare_snapshot(&record.id, &chain_id)
                .await?;
        }

        // Anonymous volumes for image volume paths no user mount covers.
        for dest in &image_volumes {
            if mounts.iter().any(|m| &m.destination == dest) {
                continue;
            }
            let vol = self.volumes.create_anonymous()?;
            record.anonymous_volumes.push(vol.name.clone());
            mounts.push(MountSpec {
                source: vol.mountpoint.display().to_string(),
                destination: dest.clone(),
                options: Vec::new(),
            });
        }

        // Named volumes are auto-created and resolved to their data dirs.
        for m in &mut mounts {
            if m.is_named_volume() {
                let vol = self.volumes.create(&m.source, BTreeMap::new())?;
                record.named_volumes.push(vol.name.clone());
                m.source = vol.mountpoint.display().to_string();
            }
        }
        input.mounts = mounts;

        std::fs::create_dir_all(self.store.record_dir(&record.id))?;
        self.write_etc_files(record, &o.dns, &o.add_hosts)?;

        let spec = ocispec::assemble(&input)?;
        let container = Container {
            id: record.id.clone(),
            image: record.image.clone().unwrap_or_default(),
            runtime: Some(container::Runtime {
                name: RUNC_RUNTIME.to_string(),
                options: None,
            }),
            spec: Some(spec_to_any(&spec)?),
            snapshotter: if record.rootfs.is_some() {
                String::new()
            } else {
                self.runtime.snapshotter.clone()
            },
            snapshot_key: if record.rootfs.is_some() {
                String::new()
            } else {
                record.id.clone()
            },
            labels: record.labels.clone().into_iter().collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        self.runtime.create_container(container).await?;

        self.store.create_record(record)?;
        Ok(())
    }

    /// Undo a partial create, reverse order, best effort.
    async fn rollback_create(&self, record: &ContainerRecord) {
        let _ = self.runtime.delete_container(&record.id).await;
        if record.rootfs.is_none() {
            self.runtime.remove_snapshot(&record.id).await;
        }
        for vol in &record.anonymous_volumes {
            let _ = self.volumes.remove(vol, false);
        }
        let _ = self.store.delete_record(&record.id);
        if let Some(name) = &record.name {
            self.store.release_name(name);
        }
    }

    /// Map `--net` selectors to a netns mode and the attachment list.
    fn plan_networks(
        &self,
        selectors: &[String],
    ) -> Result<(NetnsMode, Vec<NetworkAttachment>)> {
        let selectors: Vec<&str> = if selectors.is_empty() {
            vec![DEFAULT_NETWORK]
        } else {
            selectors.iter().map(|s| s.as_str()).collect()
        };

        if selectors.iter().any(|s| *s == "host" || *s == "none") {
            if selectors.len() > 1 {
                return Err(Error::invalid(
                    "network \"host\" or \"none\" cannot be combined with other networks",
                ));
            }
            return match selectors[0] {
                "host" => Ok((NetnsMode::Host, Vec::new())),
                _ => Ok((NetnsMode::Private, Vec::new())),
            };
        }

        let mut attachments = Vec::new();
        for (i, name) in selectors.iter().enumerate() {
            if *name == DEFAULT_NETWORK {
                self.networks.ensure_default()?;
            } else {
                self.networks.get(name)?;
            }
            attachments.push(NetworkAttachment {
                network: name.to_string(),
                interface: format!("eth{}", i),
                ip: None,
                mac: None,
            });
        }
        Ok((NetnsMode::Private, attachments))
    }

    /// Write the hosts/resolv.conf/hostname files that get bind-mounted
    /// into the container. The hosts file is extended after network attach.
    fn write_etc_files(
        &self,
        record: &ContainerRecord,
        dns: &[String],
        add_hosts: &[String],
    ) -> Result<()> {
        let dir = self.store.record_dir(&record.id);

        std::fs::write(dir.join("hostname"), format!("{}\n", record.hostname))?;

        let mut hosts = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n");
        for entry in add_hosts {
            let (host, ip) = entry.split_once(':').ok_or_else(|| {
                Error::invalid(format!("invalid --add-host {:?}: expected host:ip", entry))
            })?;
            let ip: std::net::IpAddr = ip
                .parse()
                .map_err(|_| Error::invalid(format!("invalid --add-host ip {:?}", ip)))?;
            hosts.push_str(&format!("{}\t{}\n", ip, host));
        }
        std::fs::write(dir.join("hosts"), hosts)?;

        let resolv = if dns.is_empty() {
            std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default()
        } else {
            let mut s = String::new();
            for server in dns {
                let ip: std::net::IpAddr = server
                    .parse()
                    .map_err(|_| Error::invalid(format!("invalid --dns address {:?}", server)))?;
                s.push_str(&format!("nameserver {}\n", ip));
            }
            s
        };
        std::fs::write(dir.join("resolv.conf"), resolv)?;
        Ok(())
    }

    /// Append the container's own address to its hosts file once known.
    fn extend_hosts(&self, record: &ContainerRecord) -> Result<()> {
        let Some(ip) = record.networks.iter().find_map(|n| n.ip) else {
            return Ok(());
        };
        let path = self.store.record_dir(&record.id).join("hosts");
        let mut hosts = std::fs::read_to_string(&path).unwrap_or_default();
        hosts.push_str(&format!("{}\t{}", ip, record.hostname));
        if let Some(name) = &record.name {
            hosts.push_str(&format!(" {}", name));
        }
        hosts.push('\n');
        std::fs::write(path, hosts)?;
        Ok(())
    }

    // --- task bring-up shared by foreground start and the supervisor ---

    /// Rootfs mounts for task creation.
    pub(crate) async fn rootfs_mounts(&self, record: &ContainerRecord) -> Result<Vec<Mount>> {
        match &record.rootfs {
            Some(path) => Ok(vec![Mount {
                r#type: "bind".to_string(),
                source: path.display().to_string(),
                target: String::new(),
                options: vec!["rbind".to_string(), "rw".to_string()],
            }]),
            None => self.runtime.snapshot_mounts(&record.id).await,
        }
    }

    /// Create the task, attach networks into its netns, finish the etc
    /// files, write cid/pid files. The task is created but not started;
    /// attach must complete first. Returns the init PID.
    pub(crate) async fn bring_up(
        &self,
        record: &mut ContainerRecord,
        stdio: &StdioPaths,
    ) -> Result<u32> {
        let mounts = self.rootfs_mounts(record).await?;
        let pid = self.runtime.create_task(&record.id, mounts, stdio).await?;

        if !record.networks.is_empty() {
            let ports = record.ports.clone();
            if let Err(e) = self.networks.attach(record, pid, &ports).await {
                let _ = self.runtime.delete_task(&record.id).await;
                return Err(e);
            }
            self.extend_hosts(record)?;
        }

        if let Some(cid_file) = &record.cid_file {
            std::fs::write(cid_file, &record.id)?;
        }
        if let Some(pid_file) = &record.pid_file {
            std::fs::write(pid_file, pid.to_string())?;
        }
        Ok(pid)
    }

    /// Mark the record started and kick off the task.
    pub(crate) async fn start_task(&self, record: &ContainerRecord) -> Result<()> {
        self.runtime.start_task(&record.id, "").await?;
        self.store.update_record(&record.id, |r| {
            r.status = ContainerStatus::Running;
            r.started_at = Some(Utc::now());
            r.finished_at = None;
            r.exit_code = None;
        })?;
        Ok(())
    }

    /// Record an exit and release the task and its networks.
    pub(crate) async fn tear_down(&self, record: &ContainerRecord, exit_status: u32) {
        let _ = self.store.update_record(&record.id, |r| {
            r.status = ContainerStatus::Stopped;
            r.finished_at = Some(Utc::now());
            r.exit_code = Some(exit_status as i32);
        });
        // The netns died with the task; DEL runs without it.
        self.networks.detach(record, None, &record.ports).await;
        let _ = self.runtime.delete_task(&record.id).await;
        if let Some(pid_file) = &record.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
    }

    // --- start ---------------------------------------------------------

    /// Start a container and attach the terminal. Returns the exit code,
    /// or `None` if the user detached.
    pub async fn start_foreground(&self, token: &str, rm: bool) -> Result<Option<i32>> {
        let mut record = self.resolve(token)?;
        self.ensure_startable(&record).await?;
        self.store.clear_down(&record.id);

        let fifos = stdio::create_fifos(
            &self.store.record_dir(&record.id),
            record.stdin_open,
            record.tty,
        )?;
        self.bring_up(&mut record, &fifos).await?;
        self.store.save_record(&record)?;

        let raw = if record.tty {
            stdio::RawMode::enable()?
        } else {
            None
        };
        self.start_task(&record).await?;

        // Without a PTY the terminal's Ctrl-C must reach the task.
        let sigint_forwarder = if !record.tty {
            let runtime = self.runtime.clone();
            let id = record.id.clone();
            Some(tokio::spawn(async move {
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    let _ = runtime.kill_task(&id, libc::SIGINT, false).await;
                }
            }))
        } else {
            None
        };

        let outcome = stdio::attach(&self.runtime, &record.id, "", &fifos).await?;
        drop(raw);
        if let Some(t) = sigint_forwarder {
            t.abort();
        }

        if outcome == stdio::AttachOutcome::Detached {
            return Ok(None);
        }

        let exit_status = self.runtime.wait_task(&record.id, "").await?;
        self.tear_down(&record, exit_status).await;
        if rm {
            self.remove(&record.id, false, true).await?;
        }
        Ok(Some(exit_status as i32))
    }

    /// Start a container detached: hand it to a background supervisor
    /// process and wait until the record reports the task up.
    pub async fn start_detached(&self, token: &str) -> Result<ContainerRecord> {
        let record = self.resolve(token)?;
        self.ensure_startable(&record).await?;
        self.store.clear_down(&record.id);

        supervisor::spawn(&self.opts, &record.id)?;

        // The ID is only printed once the start actually happened.
        let deadline = tokio::time::Instant::now() + DETACH_START_DEADLINE;
        loop {
            if let Some(r) = self.store.load_record(&record.id)? {
                if r.started_at > record.started_at {
                    return Ok(r);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::containerd(
                    format!("starting {}", record.short_id()),
                    "supervisor did not report the task running",
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn ensure_startable(&self, record: &ContainerRecord) -> Result<()> {
        if let Some(state) = self.runtime.task_state(&record.id).await? {
            if state.status != TaskStatus::Stopped {
                return Err(Error::InvalidState {
                    id: record.short_id().to_string(),
                    expected: "created or stopped".to_string(),
                    actual: format!("{:?}", state.status).to_lowercase(),
                });
            }
            // Leftover task from a previous run.
            let _ = self.runtime.delete_task(&record.id).await;
        }
        Ok(())
    }

    // --- stop / kill / pause -------------------------------------------

    /// Stop a container: stop signal, then SIGKILL after the timeout.
    /// `timeout` of zero goes straight to SIGKILL.
    pub async fn stop(&self, token: &str, timeout: u64) -> Result<()> {
        let record = self.resolve(token)?;
        self.require_running(&record).await?;
        self.store.set_down(&record.id)?;

        if timeout == 0 {
            self.runtime
                .kill_task(&record.id, libc::SIGKILL, true)
                .await?;
            let _ = self.runtime.wait_task(&record.id, "").await;
            return Ok(());
        }

        let signal = match &record.stop_signal {
            Some(name) => parse_signal(name)?,
            None => libc::SIGTERM,
        };
        self.runtime.kill_task(&record.id, signal, false).await?;

        let wait = self.runtime.wait_task(&record.id, "");
        if tokio::time::timeout(Duration::from_secs(timeout), wait)
            .await
            .is_err()
        {
            tracing::warn!(id = %record.short_id(), timeout, "stop timeout; sending SIGKILL");
            self.runtime
                .kill_task(&record.id, libc::SIGKILL, true)
                .await?;
            let _ = self.runtime.wait_task(&record.id, "").await;
        }
        Ok(())
    }

    /// Send one signal, no escalation.
    pub async fn kill(&self, token: &str, signal: &str) -> Result<()> {
        let record = self.resolve(token)?;
        self.require_running(&record).await?;
        let signal = parse_signal(signal)?;
        self.store.set_down(&record.id)?;
        self.runtime.kill_task(&record.id, signal, false).await
    }

    pub async fn pause(&self, token: &str) -> Result<()> {
        let record = self.resolve(token)?;
        self.require_running(&record).await?;
        self.runtime.pause_task(&record.id).await?;
        self.store.update_record(&record.id, |r| {
            r.status = ContainerStatus::Paused;
        })?;
        Ok(())
    }

    pub async fn unpause(&self, token: &str) -> Result<()> {
        let record = self.resolve(token)?;
        let state = self.runtime.task_state(&record.id).await?;
        match state.map(|s| s.status) {
            Some(TaskStatus::Paused) => {}
            other => {
                return Err(Error::InvalidState {
                    id: record.short_id().to_string(),
                    expected: "paused".to_string(),
                    actual: status_name(other),
                })
            }
        }
        self.runtime.resume_task(&record.id).await?;
        self.store.update_record(&record.id, |r| {
            r.status = ContainerStatus::Running;
        })?;
        Ok(())
    }

    async fn require_running(&self, record: &ContainerRecord) -> Result<()> {
        let state = self.runtime.task_state(&record.id).await?;
        match state.map(|s| s.status) {
            Some(TaskStatus::Running) => Ok(()),
            other => Err(Error::InvalidState {
                id: record.short_id().to_string(),
                expected: "running".to_string(),
                actual: status_name(other),
            }),
        }
    }

    // --- remove --------------------------------------------------------

    /// Remove a container. Running containers are refused unless `force`,
    /// which SIGKILLs first. `volumes` also removes anonymous volumes.
    pub async fn remove(&self, token: &str, force: bool, volumes: bool) -> Result<()> {
        let record = self.resolve(token)?;
        let _ = self.store.set_down(&record.id);

        if let Some(state) = self.runtime.task_state(&record.id).await? {
            if state.status == TaskStatus::Running || state.status == TaskStatus::Paused {
                if !force {
                    return Err(Error::InvalidState {
                        id: record.short_id().to_string(),
                        expected: "stopped (or pass --force)".to_string(),
                        actual: status_name(Some(state.status)),
                    });
                }
                self.runtime
                    .kill_task(&record.id, libc::SIGKILL, true)
                    .await?;
                let _ = self.runtime.wait_task(&record.id, "").await;
            }
            let _ = self.runtime.delete_task(&record.id).await;
        }

        self.networks.detach(&record, None, &record.ports).await;
        let _ = self.runtime.delete_container(&record.id).await;
        if record.rootfs.is_none() {
            self.runtime.remove_snapshot(&record.id).await;
        }
        if let Some(cid_file) = &record.cid_file {
            let _ = std::fs::remove_file(cid_file);
        }
        if let Some(pid_file) = &record.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
        if volumes {
            for vol in &record.anonymous_volumes {
                if let Err(e) = self.volumes.remove(vol, false) {
                    tracing::warn!(volume = %vol, error = %e, "anonymous volume removal failed");
                }
            }
        }
        self.store.delete_record(&record.id)
    }

    // --- wait / exec ---------------------------------------------------

    /// Block until the container exits; returns its exit code.
    pub async fn wait(&self, token: &str) -> Result<i32> {
        let record = self.resolve(token)?;
        match self.runtime.task_state(&record.id).await? {
            Some(_) => Ok(self.runtime.wait_task(&record.id, "").await? as i32),
            None => record.exit_code.ok_or_else(|| Error::InvalidState {
                id: record.short_id().to_string(),
                expected: "started at least once".to_string(),
                actual: "created".to_string(),
            }),
        }
    }

    /// Run a subordinate process inside a running container. Returns its
    /// exit code; start failures map to 126/127 per the exec contract.
    pub async fn exec(&self, token: &str, o: &ExecOpts) -> Result<i32> {
        let record = self.resolve(token)?;
        self.require_running(&record).await?;
        if o.args.is_empty() {
            return Err(Error::invalid("exec requires a command"));
        }

        // Base the process on the container's own spec for env and cwd.
        let container = self.runtime.get_container(&record.id).await?;
        let spec: oci_spec::runtime::Spec = container
            .spec
            .as_ref()
            .map(|any| serde_json::from_slice(&any.value))
            .transpose()?
            .ok_or_else(|| Error::containerd(format!("container {}", record.short_id()), "no spec"))?;
        let base = spec.process().clone().unwrap_or_default();

        let mut env = base.env().clone().unwrap_or_default();
        env.extend(o.env.iter().cloned());
        let cwd = o
            .workdir
            .clone()
            .unwrap_or_else(|| base.cwd().display().to_string());

        let mut process = base;
        process.set_args(Some(o.args.clone()));
        process.set_env(Some(env));
        process.set_cwd(cwd.into());
        process.set_terminal(Some(o.tty));
        if let Some(user) = &o.user {
            let resolved = ocispec::user::resolve(
                user,
                record.rootfs.as_deref().unwrap_or(std::path::Path::new("/nonexistent")),
            )?;
            let mut u = process.user().clone();
            u.set_uid(resolved.uid);
            u.set_gid(resolved.gid);
            process.set_user(u);
        }

        let exec_id = format!("exec-{}", &crate::new_container_id()?[..8]);
        let fifo_dir = std::env::temp_dir().join(format!("cradle-{}", exec_id));
        std::fs::create_dir_all(&fifo_dir)?;
        let fifos = stdio::create_fifos(&fifo_dir, o.interactive, o.tty)?;

        let result = self
            .exec_attached(&record, &exec_id, &process, &fifos)
            .await;
        let _ = std::fs::remove_dir_all(&fifo_dir);
        result
    }

    async fn exec_attached(
        &self,
        record: &ContainerRecord,
        exec_id: &str,
        process: &oci_spec::runtime::Process,
        fifos: &StdioPaths,
    ) -> Result<i32> {
        self.runtime
            .exec_process(&record.id, exec_id, process, fifos)
            .await?;

        let raw = if fifos.terminal {
            stdio::RawMode::enable()?
        } else {
            None
        };
        if let Err(e) = self.runtime.start_task(&record.id, exec_id).await {
            drop(raw);
            let args0 = process
                .args()
                .as_ref()
                .and_then(|a| a.first())
                .cloned()
                .unwrap_or_default();
            return Err(map_exec_error(e, &args0));
        }

        let _ = stdio::attach(&self.runtime, &record.id, exec_id, fifos).await?;
        drop(raw);
        let status = self.runtime.wait_task(&record.id, exec_id).await?;
        Ok(status as i32)
    }
}

/// Parsed flag surface of `exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub interactive: bool,
}

/// Map a start failure to the 126/127 exec contract when the runtime's
/// message identifies the cause.
fn map_exec_error(e: Error, arg0: &str) -> Error {
    let msg = e.to_string();
    if msg.contains("executable file not found") || msg.contains("no such file") {
        Error::ExecNotFound(arg0.to_string())
    } else if msg.contains("permission denied") {
        Error::ExecNotExecutable(arg0.to_string())
    } else {
        e
    }
}

fn status_name(status: Option<TaskStatus>) -> String {
    match status {
        None => "not created".to_string(),
        Some(s) => format!("{:?}", s).to_lowercase(),
    }
}

/// Parse a signal given as a number, `TERM`, or `SIGTERM`.
pub fn parse_signal(s: &str) -> Result<i32> {
    if let Ok(n) = s.parse::<i32>() {
        if n > 0 {
            return Ok(n);
        }
    }
    let upper = s.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    use std::str::FromStr;
    nix::sys::signal::Signal::from_str(&full)
        .map(|sig| sig as i32)
        .map_err(|_| Error::invalid(format!("unknown signal {:?}", s)))
}

/// Resolve entrypoint/cmd overrides against the image config.
fn merged_argv(
    entrypoint_override: &Option<Vec<String>>,
    cmd_override: &[String],
    image_entrypoint: &[String],
    image_cmd: &[String],
) -> Result<Vec<String>> {
    let entrypoint = match entrypoint_override {
        Some(e) => e.clone(),
        None => image_entrypoint.to_vec(),
    };
    let cmd = if !cmd_override.is_empty() {
        cmd_override.to_vec()
    } else if entrypoint_override.is_some() {
        // An explicit entrypoint discards the image cmd.
        Vec::new()
    } else {
        image_cmd.to_vec()
    };

    let mut argv = entrypoint;
    argv.extend(cmd);
    if argv.is_empty() {
        return Err(Error::invalid(
            "no command specified and the image defines none",
        ));
    }
    Ok(argv)
}

/// Environment: image env first, then env files, then `-e`, later wins by
/// position (the OCI runtime applies the last occurrence of a key).
fn merged_env(
    image_env: &[String],
    env_files: &[PathBuf],
    env_flags: &[String],
) -> Result<Vec<String>> {
    let mut env: Vec<String> = image_env.to_vec();
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.push(
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        );
    }

    for file in env_files {
        let data = std::fs::read_to_string(file)
            .map_err(|e| Error::invalid(format!("--env-file {}: {}", file.display(), e)))?;
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !line.contains('=') {
                return Err(Error::invalid(format!(
                    "--env-file {}: invalid line {:?}",
                    file.display(),
                    line
                )));
            }
            env.push(line.to_string());
        }
    }

    for e in env_flags {
        if !e.contains('=') {
            return Err(Error::invalid(format!(
                "invalid -e value {:?}: expected KEY=VALUE",
                e
            )));
        }
        env.push(e.clone());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("9").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("KILL").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("SIGKILL").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("term").unwrap(), libc::SIGTERM);
        assert!(parse_signal("SIGBOGUS").is_err());
        assert!(parse_signal("-1").is_err());
    }

    #[test]
    fn test_merged_argv_image_defaults() {
        let argv = merged_argv(&None, &[], &["/entry".into()], &["serve".into()]).unwrap();
        assert_eq!(argv, vec!["/entry", "serve"]);
    }

    #[test]
    fn test_merged_argv_cmd_override() {
        let argv =
            merged_argv(&None, &["sh".to_string()], &["/entry".into()], &["serve".into()])
                .unwrap();
        assert_eq!(argv, vec!["/entry", "sh"]);
    }

    #[test]
    fn test_merged_argv_entrypoint_override_drops_image_cmd() {
        let argv = merged_argv(
            &Some(vec!["/bin/sh".to_string()]),
            &[],
            &["/entry".into()],
            &["serve".into()],
        )
        .unwrap();
        assert_eq!(argv, vec!["/bin/sh"]);
    }

    #[test]
    fn test_merged_argv_empty_is_error() {
        assert!(merged_argv(&None, &[], &[], &[]).is_err());
    }

    #[test]
    fn test_merged_env_order_and_path_default() {
        let env = merged_env(&[], &[], &["A=1".to_string()]).unwrap();
        assert!(env.iter().any(|e| e.starts_with("PATH=")));
        assert_eq!(env.last().unwrap(), "A=1");

        let env = merged_env(&["PATH=/custom".to_string()], &[], &[]).unwrap();
        assert_eq!(env, vec!["PATH=/custom"]);
    }

    #[test]
    fn test_merged_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "FOO=bar").unwrap();
        writeln!(file).unwrap();
        let env = merged_env(&[], &[file.path().to_path_buf()], &[]).unwrap();
        assert!(env.contains(&"FOO=bar".to_string()));
    }

    #[test]
    fn test_merged_env_rejects_bad_values() {
        assert!(merged_env(&[], &[], &["NOEQUALS".to_string()]).is_err());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "BAD LINE").unwrap();
        assert!(merged_env(&[], &[file.path().to_path_buf()], &[]).is_err());
    }

    #[test]
    fn test_map_exec_error() {
        let e = Error::containerd(
            "starting task",
            "exec: \"nope\": executable file not found in $PATH",
        );
        assert!(matches!(map_exec_error(e, "nope"), Error::ExecNotFound(_)));

        let e = Error::containerd("starting task", "exec: \"/x\": permission denied");
        assert!(matches!(
            map_exec_error(e, "/x"),
            Error::ExecNotExecutable(_)
        ));

        let e = Error::Deadline("starting task".to_string());
        assert!(matches!(map_exec_error(e, "x"), Error::Deadline(_)));
    }
}
