//! Task operations: the running side of a container.

use super::Runtime;
use crate::error::{Error, Result};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    CreateTaskRequest, DeleteTaskRequest, ExecProcessRequest, GetRequest, KillRequest,
    PauseTaskRequest, ResizePtyRequest, ResumeTaskRequest, StartRequest, WaitRequest,
};
use containerd_client::types::Mount;
use containerd_client::with_namespace;
use tonic::Request;

/// Where a task's three standard streams go.
#[derive(Debug, Clone, Default)]
pub struct StdioPaths {
    /// FIFO the task reads stdin from; empty for no stdin.
    pub stdin: String,
    /// FIFO the task writes stdout to.
    pub stdout: String,
    /// FIFO the task writes stderr to; ignored when `terminal` is set.
    pub stderr: String,
    /// Allocate a PTY inside the runtime.
    pub terminal: bool,
}

/// containerd task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
    Unknown,
}

impl TaskStatus {
    fn from_wire(status: i32) -> Self {
        match status {
            1 => TaskStatus::Created,
            2 => TaskStatus::Running,
            3 => TaskStatus::Stopped,
            4 => TaskStatus::Paused,
            5 => TaskStatus::Pausing,
            _ => TaskStatus::Unknown,
        }
    }
}

/// Status and exit data of a task or exec process.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub status: TaskStatus,
    pub pid: u32,
    pub exit_status: u32,
}

impl Runtime {
    /// Create a task for a container; returns the init PID. The task is not
    /// started, which leaves a window to attach networks against its netns.
    pub async fn create_task(
        &self,
        id: &str,
        rootfs: Vec<Mount>,
        stdio: &StdioPaths,
    ) -> Result<u32> {
        let mut client = TasksClient::new(self.channel());
        let req = CreateTaskRequest {
            container_id: id.to_string(),
            rootfs,
            stdin: stdio.stdin.clone(),
            stdout: stdio.stdout.clone(),
            stderr: stdio.stderr.clone(),
            terminal: stdio.terminal,
            checkpoint: None,
            options: None,
            runtime_path: String::new(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self
            .rpc(&format!("creating task for {}", id), client.create(req))
            .await?;
        Ok(resp.pid)
    }

    /// Start a created task (or an exec process when `exec_id` is set).
    pub async fn start_task(&self, id: &str, exec_id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel());
        let req = StartRequest {
            container_id: id.to_string(),
            exec_id: exec_id.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self
            .rpc(&format!("starting task for {}", id), client.start(req))
            .await?;
        Ok(resp.pid)
    }

    /// Send a signal to the task (or to everything in it with `all`).
    pub async fn kill_task(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        let mut client = TasksClient::new(self.channel());
        let req = KillRequest {
            container_id: id.to_string(),
            exec_id: String::new(),
            signal: signal as u32,
            all,
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(
            &format!("signaling {} with {}", id, signal),
            client.kill(req),
        )
        .await?;
        Ok(())
    }

    /// Block until the task (or exec process) exits; returns the exit status.
    pub async fn wait_task(&self, id: &str, exec_id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel());
        let req = WaitRequest {
            container_id: id.to_string(),
            exec_id: exec_id.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self
            .rpc_unbounded(&format!("waiting for {}", id), client.wait(req))
            .await?;
        Ok(resp.exit_status)
    }

    /// Delete a finished task; returns its exit status if containerd still
    /// has it.
    pub async fn delete_task(&self, id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel());
        let req = DeleteTaskRequest {
            container_id: id.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self
            .rpc(&format!("deleting task for {}", id), client.delete(req))
            .await?;
        Ok(resp.exit_status)
    }

    /// Current task state, or `None` when no task exists.
    pub async fn task_state(&self, id: &str) -> Result<Option<ProcessState>> {
        let mut client = TasksClient::new(self.channel());
        let req = GetRequest {
            container_id: id.to_string(),
            exec_id: String::new(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        match tokio::time::timeout(std::time::Duration::from_secs(30), client.get(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner().process.map(|p| ProcessState {
                status: TaskStatus::from_wire(p.status),
                pid: p.pid,
                exit_status: p.exit_status,
            })),
            Ok(Err(status)) if status.code() == tonic::Code::NotFound => Ok(None),
            Ok(Err(status)) => Err(Error::containerd(
                format!("getting task for {}", id),
                status.message(),
            )),
            Err(_) => Err(Error::Deadline(format!("getting task for {}", id))),
        }
    }

    /// Freeze the task via its cgroup.
    pub async fn pause_task(&self, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel());
        let req = PauseTaskRequest {
            container_id: id.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(&format!("pausing {}", id), client.pause(req))
            .await?;
        Ok(())
    }

    /// Thaw a paused task.
    pub async fn resume_task(&self, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel());
        let req = ResumeTaskRequest {
            container_id: id.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(&format!("unpausing {}", id), client.resume(req))
            .await?;
        Ok(())
    }

    /// Forward a terminal size change to the task's PTY.
    pub async fn resize_pty(&self, id: &str, exec_id: &str, width: u32, height: u32) -> Result<()> {
        let mut client = TasksClient::new(self.channel());
        let req = ResizePtyRequest {
            container_id: id.to_string(),
            exec_id: exec_id.to_string(),
            width,
            height,
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(&format!("resizing pty for {}", id), client.resize_pty(req))
            .await?;
        Ok(())
    }

    /// Register an exec process inside a running task. Start it with
    /// [`Runtime::start_task`] passing the same `exec_id`.
    pub async fn exec_process(
        &self,
        id: &str,
        exec_id: &str,
        process: &oci_spec::runtime::Process,
        stdio: &StdioPaths,
    ) -> Result<()> {
        let mut client = TasksClient::new(self.channel());
        let req = ExecProcessRequest {
            container_id: id.to_string(),
            exec_id: exec_id.to_string(),
            stdin: stdio.stdin.clone(),
            stdout: stdio.stdout.clone(),
            stderr: stdio.stderr.clone(),
            terminal: stdio.terminal,
            spec: Some(super::process_to_any(process)?),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(&format!("registering exec in {}", id), client.exec(req))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_mapping() {
        assert_eq!(TaskStatus::from_wire(1), TaskStatus::Created);
        assert_eq!(TaskStatus::from_wire(2), TaskStatus::Running);
        assert_eq!(TaskStatus::from_wire(3), TaskStatus::Stopped);
        assert_eq!(TaskStatus::from_wire(4), TaskStatus::Paused);
        assert_eq!(TaskStatus::from_wire(0), TaskStatus::Unknown);
    }
}
