//! containerd wire layer.
//!
//! A [`Runtime`] is an explicit handle to one containerd daemon, created per
//! CLI invocation and passed through every operation. All RPCs carry a
//! deadline; only `wait` (which legitimately blocks for the container's
//! lifetime) goes out without one.

pub mod image;
pub mod task;

use crate::config::GlobalOptions;
use crate::error::{Error, Result};
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, DeleteContainerRequest, GetContainerRequest,
    ListContainersRequest,
};
use containerd_client::with_namespace;
use std::future::Future;
use std::time::Duration;
use tonic::transport::Channel;
use tonic::Request;

/// containerd runtime name for OCI containers.
pub const RUNC_RUNTIME: &str = "io.containerd.runc.v2";

/// Type URL containerd expects for an OCI runtime spec payload.
pub const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
/// Type URL for an exec process payload.
pub const PROCESS_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";

/// Default RPC deadline.
const RPC_DEADLINE: Duration = Duration::from_secs(30);

/// Handle to a containerd daemon, scoped to one namespace.
#[derive(Debug, Clone)]
pub struct Runtime {
    channel: Channel,
    /// containerd namespace all requests are issued in.
    pub namespace: String,
    /// Snapshotter used for container rootfs preparation.
    pub snapshotter: String,
    deadline: Duration,
}

impl Runtime {
    /// Connect to containerd at the configured socket.
    pub async fn connect(opts: &GlobalOptions) -> Result<Self> {
        let channel = containerd_client::connect(&opts.address).await.map_err(|e| {
            Error::containerd(
                format!("connecting to {} (is containerd running?)", opts.address),
                e,
            )
        })?;
        Ok(Self {
            channel,
            namespace: opts.namespace.clone(),
            snapshotter: opts.snapshotter.clone(),
            deadline: RPC_DEADLINE,
        })
    }

    /// The underlying gRPC channel, for service clients.
    pub(crate) fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Run an RPC future under the standard deadline, mapping both transport
    /// errors and timeouts into crate errors carrying `context`.
    pub(crate) async fn rpc<T, F>(&self, context: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(Error::containerd(context, status.message())),
            Err(_) => Err(Error::Deadline(context.to_string())),
        }
    }

    /// Like [`Self::rpc`] but without a deadline, for waits that block for
    /// the container's lifetime.
    pub(crate) async fn rpc_unbounded<T, F>(&self, context: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        fut.await
            .map(|r| r.into_inner())
            .map_err(|status| Error::containerd(context, status.message()))
    }

    // --- container objects --------------------------------------------

    /// Create a containerd container object.
    pub async fn create_container(&self, container: Container) -> Result<()> {
        let id = container.id.clone();
        let mut client = ContainersClient::new(self.channel());
        let req = CreateContainerRequest {
            container: Some(container),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(&format!("creating container {}", id), client.create(req))
            .await?;
        Ok(())
    }

    /// Fetch a containerd container object.
    pub async fn get_container(&self, id: &str) -> Result<Container> {
        let mut client = ContainersClient::new(self.channel());
        let req = GetContainerRequest { id: id.to_string() };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self
            .rpc(&format!("getting container {}", id), client.get(req))
            .await?;
        resp.container
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    /// List containerd container objects in this namespace.
    pub async fn list_containers(&self) -> Result<Vec<Container>> {
        let mut client = ContainersClient::new(self.channel());
        let req = ListContainersRequest { filters: vec![] };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self.rpc("listing containers", client.list(req)).await?;
        Ok(resp.containers)
    }

    /// Delete a containerd container object.
    pub async fn delete_container(&self, id: &str) -> Result<()> {
        let mut client = ContainersClient::new(self.channel());
        let req = DeleteContainerRequest { id: id.to_string() };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(&format!("deleting container {}", id), client.delete(req))
            .await?;
        Ok(())
    }
}

/// Wrap a serialized OCI runtime spec for the container create request.
pub fn spec_to_any(spec: &oci_spec::runtime::Spec) -> Result<prost_types::Any> {
    let value = serde_json::to_vec(spec)?;
    Ok(prost_types::Any {
        type_url: SPEC_TYPE_URL.to_string(),
        value,
    })
}

/// Wrap a serialized OCI process for an exec request.
pub fn process_to_any(process: &oci_spec::runtime::Process) -> Result<prost_types::Any> {
    let value = serde_json::to_vec(process)?;
    Ok(prost_types::Any {
        type_url: PROCESS_TYPE_URL.to_string(),
        value,
    })
}
