//! Background supervisor for detached containers.
//!
//! `start -d` does not keep the CLI process around, so a separate
//! long-lived process owns the task: it drains the stdio FIFOs into the
//! JSON log, waits for the exit, and applies the restart policy. The
//! supervisor is this same binary re-invoked with the hidden
//! `internal supervise` subcommand.

use super::{stdio, Engine};
use crate::config::GlobalOptions;
use crate::error::{Error, Result};
use crate::logging::{LogWriter, Stream};
use crate::store::record::RestartPolicy;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Initial restart delay.
const BACKOFF_START: Duration = Duration::from_millis(100);
/// Restart delay ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// A run at least this long resets the backoff.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(10);

/// Launch a detached supervisor process for `id`. The child is put in its
/// own process group so terminal signals to the CLI never reach it.
pub fn spawn(opts: &GlobalOptions, id: &str) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--address")
        .arg(&opts.address)
        .arg("--namespace")
        .arg(&opts.namespace)
        .arg("--snapshotter")
        .arg(&opts.snapshotter)
        .arg("--cni-path")
        .arg(&opts.cni_path)
        .arg("--cni-netconfpath")
        .arg(&opts.cni_netconfpath)
        .arg("--data-root")
        .arg(&opts.data_root)
        .arg("--cgroup-manager")
        .arg(opts.cgroup_manager.to_string());
    for registry in &opts.insecure_registry {
        cmd.arg("--insecure-registry").arg(registry);
    }
    cmd.arg("internal")
        .arg("supervise")
        .arg(id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    cmd.spawn()
        .map_err(|e| Error::containerd("spawning supervisor", e.to_string()))?;
    Ok(())
}

/// Supervisor main loop: run the task, drain its logs, restart per policy.
/// Returns once the container is down for good.
pub async fn supervise(engine: &Engine, id: &str) -> Result<()> {
    let mut backoff = BACKOFF_START;

    loop {
        if engine.store.is_down(id) {
            return Ok(());
        }
        let mut record = engine
            .store
            .load_record(id)?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        let started = tokio::time::Instant::now();
        match run_once(engine, &mut record).await {
            Ok(status) => {
                tracing::info!(id = %record.short_id(), status, "task exited");
            }
            Err(e) => {
                tracing::error!(id = %record.short_id(), error = %e, "task run failed");
                engine.tear_down(&record, 255).await;
            }
        }

        if record.restart_policy != RestartPolicy::Always || engine.store.is_down(id) {
            return Ok(());
        }
        if started.elapsed() >= BACKOFF_RESET_AFTER {
            backoff = BACKOFF_START;
        }
        tracing::info!(id = %record.short_id(), delay_ms = backoff.as_millis() as u64, "restarting");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// One run of the task: FIFOs, bring-up, log drain, wait, tear-down.
async fn run_once(engine: &Engine, record: &mut crate::store::record::ContainerRecord) -> Result<u32> {
    let record_dir = engine.store.record_dir(&record.id);
    let fifos = stdio::create_fifos(&record_dir, record.stdin_open, record.tty)?;
    engine.bring_up(record, &fifos).await?;
    // A container created for the foreground has no log path yet.
    let log_path = record
        .log_path
        .get_or_insert_with(|| record_dir.join("logs"))
        .clone();
    engine.store.save_record(record)?;

    // Open the read ends before start so no early output is lost. The shim
    // holds the write ends, so these opens return immediately.
    let writer = Arc::new(Mutex::new(LogWriter::open(&log_path)?));

    let out_drain = spawn_drain(&fifos.stdout, Stream::Stdout, writer.clone()).await?;
    let err_drain = if fifos.stderr.is_empty() {
        None
    } else {
        Some(spawn_drain(&fifos.stderr, Stream::Stderr, writer.clone()).await?)
    };

    engine.start_task(record).await?;
    let status = engine.runtime.wait_task(&record.id, "").await?;
    engine.tear_down(record, status).await;

    // FIFO write ends close with the shim, so the drains hit EOF.
    let mut drains = vec![out_drain];
    drains.extend(err_drain);
    futures::future::join_all(drains).await;
    Ok(status)
}

async fn spawn_drain(
    path: &str,
    stream: Stream,
    writer: Arc<Mutex<LogWriter>>,
) -> Result<tokio::task::JoinHandle<()>> {
    let fifo = tokio::fs::File::open(Path::new(path)).await?;
    Ok(tokio::spawn(async move {
        if let Err(e) = crate::logging::drain(fifo, stream, writer).await {
            tracing::warn!(error = %e, "log drain ended with error");
        }
    }))
}
