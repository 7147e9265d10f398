//! Image operations: pull, list, tag, remove, config reads, snapshots.
//!
//! Images are authoritative in containerd's metadata and content stores; the
//! CLI treats them read-only except during pull/tag/rmi.

use super::Runtime;
use crate::error::{Error, Result};
use crate::resolver::ImageRef;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
};
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    content_client::ContentClient, CreateImageRequest, DeleteImageRequest, GetImageRequest, Image,
    ListImagesRequest, ReadContentRequest, TransferRequest,
};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::{Mount, Platform};
use containerd_client::{to_any, with_namespace};
use oci_spec::image::ImageConfiguration;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tonic::Request;

/// Pull behavior for `run`/`create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullMode {
    /// Pull only when the image is absent.
    #[default]
    Missing,
    /// Always pull.
    Always,
    /// Never pull; absence is a precondition failure.
    Never,
}

impl std::str::FromStr for PullMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "missing" => Ok(Self::Missing),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(Error::invalid(format!(
                "unknown pull mode {:?} (expected always, missing, or never)",
                other
            ))),
        }
    }
}

/// OCI platform for the running host.
fn host_platform() -> Platform {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        arch => arch,
    }
    .to_string();
    Platform {
        os: "linux".to_string(),
        architecture: arch,
        variant: String::new(),
        os_version: String::new(),
    }
}

impl Runtime {
    /// List images as `(name, digest)` pairs for the resolver.
    pub async fn list_images(&self) -> Result<Vec<ImageRef>> {
        let mut client = ImagesClient::new(self.channel());
        let req = ListImagesRequest { filters: vec![] };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self.rpc("listing images", client.list(req)).await?;
        Ok(resp
            .images
            .into_iter()
            .map(|img| ImageRef {
                digest: img.target.map(|t| t.digest).unwrap_or_default(),
                name: img.name,
            })
            .collect())
    }

    /// Fetch one image record, or `None` if absent.
    pub async fn get_image(&self, name: &str) -> Result<Option<Image>> {
        let mut client = ImagesClient::new(self.channel());
        let req = GetImageRequest {
            name: name.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        match tokio::time::timeout(std::time::Duration::from_secs(30), client.get(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner().image),
            Ok(Err(status)) if status.code() == tonic::Code::NotFound => Ok(None),
            Ok(Err(status)) => Err(Error::containerd(
                format!("getting image {}", name),
                status.message(),
            )),
            Err(_) => Err(Error::Deadline(format!("getting image {}", name))),
        }
    }

    /// Pull an image from its registry and unpack it for the configured
    /// snapshotter, via containerd's transfer service.
    pub async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut client = TransferClient::new(self.channel());

        let source = OciRegistry {
            reference: reference.to_string(),
            resolver: None,
        };
        let platform = host_platform();
        let destination = ImageStore {
            name: reference.to_string(),
            labels: HashMap::new(),
            platforms: vec![platform.clone()],
            all_metadata: false,
            manifest_limit: 0,
            extra_references: vec![],
            unpacks: vec![UnpackConfiguration {
                platform: Some(platform),
                snapshotter: self.snapshotter.clone(),
            }],
        };

        let req = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: None,
        };
        let req = with_namespace!(req, self.namespace.as_str());

        // Pulls can be slow; give them a generous deadline.
        match tokio::time::timeout(std::time::Duration::from_secs(600), client.transfer(req)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(status)) => Err(Error::containerd(
                format!("pulling {}", reference),
                status.message(),
            )),
            Err(_) => Err(Error::Deadline(format!("pulling {}", reference))),
        }
    }

    /// Push a local image to its registry via the transfer service. The
    /// reference decides the destination.
    pub async fn push_image(&self, reference: &str) -> Result<()> {
        if self.get_image(reference).await?.is_none() {
            return Err(Error::ImageNotFound(reference.to_string()));
        }
        let mut client = TransferClient::new(self.channel());

        let source = ImageStore {
            name: reference.to_string(),
            labels: HashMap::new(),
            platforms: vec![host_platform()],
            all_metadata: false,
            manifest_limit: 0,
            extra_references: vec![],
            unpacks: vec![],
        };
        let destination = OciRegistry {
            reference: reference.to_string(),
            resolver: None,
        };

        let req = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: None,
        };
        let req = with_namespace!(req, self.namespace.as_str());

        match tokio::time::timeout(std::time::Duration::from_secs(600), client.transfer(req)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(status)) => Err(Error::containerd(
                format!("pushing {}", reference),
                status.message(),
            )),
            Err(_) => Err(Error::Deadline(format!("pushing {}", reference))),
        }
    }

    /// Ensure an image is present per the pull mode; returns its name.
    pub async fn ensure_image(&self, reference: &str, mode: PullMode) -> Result<String> {
        let present = self.get_image(reference).await?.is_some();
        match mode {
            PullMode::Always => self.pull_image(reference).await?,
            PullMode::Missing if !present => {
                println!("Pulling image {}...", reference);
                self.pull_image(reference).await?;
            }
            PullMode::Never if !present => {
                return Err(Error::ImageNotFound(format!(
                    "{} (and --pull=never was given)",
                    reference
                )));
            }
            _ => {}
        }
        Ok(reference.to_string())
    }

    /// Tag: make `target` resolve to the same content as `source`.
    pub async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let img = self
            .get_image(source)
            .await?
            .ok_or_else(|| Error::ImageNotFound(source.to_string()))?;

        let mut client = ImagesClient::new(self.channel());
        let tagged = Image {
            name: target.to_string(),
            ..img
        };
        let req = CreateImageRequest {
            image: Some(tagged),
            source_date_epoch: None,
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(
            &format!("tagging {} as {}", source, target),
            client.create(req),
        )
        .await?;
        Ok(())
    }

    /// Remove an image by name. Other tags of the same content survive.
    pub async fn remove_image(&self, name: &str) -> Result<()> {
        let mut client = ImagesClient::new(self.channel());
        let req = DeleteImageRequest {
            name: name.to_string(),
            sync: false,
            target: None,
        };
        let req = with_namespace!(req, self.namespace.as_str());
        self.rpc(&format!("removing image {}", name), client.delete(req))
            .await?;
        Ok(())
    }

    /// Read a full content blob by digest.
    async fn read_content(&self, digest: &str) -> Result<Vec<u8>> {
        let mut client = ContentClient::new(self.channel());
        let req = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let req = with_namespace!(req, self.namespace.as_str());
        let stream = self
            .rpc(&format!("reading content {}", digest), client.read(req))
            .await?;

        let mut bytes = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|e| Error::containerd(format!("reading content {}", digest), e))?
        {
            bytes.extend_from_slice(&chunk.data);
        }
        Ok(bytes)
    }

    /// Load the image configuration (entrypoint, cmd, env, volumes, stop
    /// signal) and the rootfs chain ID for snapshot preparation.
    pub async fn image_config(&self, reference: &str) -> Result<(ImageConfiguration, String)> {
        let img = self
            .get_image(reference)
            .await?
            .ok_or_else(|| Error::ImageNotFound(reference.to_string()))?;
        let target_digest = img
            .target
            .ok_or_else(|| Error::containerd(format!("image {}", reference), "no target"))?
            .digest;

        // The target may be a manifest or an index; descend to the manifest
        // matching the host platform.
        let mut manifest: serde_json::Value =
            serde_json::from_slice(&self.read_content(&target_digest).await?)?;
        if let Some(manifests) = manifest.get("manifests").and_then(|m| m.as_array()) {
            let want = host_platform();
            let chosen = manifests
                .iter()
                .find(|m| {
                    m["platform"]["architecture"].as_str() == Some(want.architecture.as_str())
                        && m["platform"]["os"].as_str() == Some("linux")
                })
                .or_else(|| manifests.first())
                .ok_or_else(|| {
                    Error::containerd(format!("image {}", reference), "empty image index")
                })?;
            let digest = chosen["digest"].as_str().ok_or_else(|| {
                Error::containerd(format!("image {}", reference), "index entry has no digest")
            })?;
            manifest = serde_json::from_slice(&self.read_content(digest).await?)?;
        }

        let config_digest = manifest["config"]["digest"].as_str().ok_or_else(|| {
            Error::containerd(format!("image {}", reference), "manifest has no config")
        })?;
        let config_bytes = self.read_content(config_digest).await?;
        let config: ImageConfiguration = serde_json::from_slice(&config_bytes)?;

        let chain_id = chain_id(config.rootfs().diff_ids());
        Ok((config, chain_id))
    }

    /// Prepare a writable snapshot on top of an image chain; returns the
    /// rootfs mounts for task creation.
    pub async fn prepare_snapshot(&self, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel());
        let req = PrepareSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
            parent: parent.to_string(),
            labels: HashMap::new(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self
            .rpc(&format!("preparing snapshot {}", key), client.prepare(req))
            .await?;
        Ok(resp.mounts)
    }

    /// Mounts of an existing snapshot.
    pub async fn snapshot_mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel());
        let req = MountsRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        let resp = self
            .rpc(
                &format!("getting snapshot mounts {}", key),
                client.mounts(req),
            )
            .await?;
        Ok(resp.mounts)
    }

    /// Remove a snapshot; missing snapshots are logged, not fatal.
    pub async fn remove_snapshot(&self, key: &str) {
        let mut client = SnapshotsClient::new(self.channel());
        let req = RemoveSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
        };
        let req = with_namespace!(req, self.namespace.as_str());
        if let Err(e) = self
            .rpc(&format!("removing snapshot {}", key), client.remove(req))
            .await
        {
            tracing::debug!(key = %key, error = %e, "snapshot removal failed");
        }
    }
}

/// Compute the OCI chain ID from rootfs diff IDs.
pub fn chain_id(diff_ids: &[String]) -> String {
    let mut chain = String::new();
    for diff in diff_ids {
        if chain.is_empty() {
            chain = diff.clone();
        } else {
            let input = format!("{} {}", chain, diff);
            let digest = Sha256::digest(input.as_bytes());
            chain = format!("sha256:{:x}", digest);
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_pull_mode_parse() {
        assert_eq!(PullMode::from_str("missing").unwrap(), PullMode::Missing);
        assert_eq!(PullMode::from_str("always").unwrap(), PullMode::Always);
        assert_eq!(PullMode::from_str("never").unwrap(), PullMode::Never);
        assert!(PullMode::from_str("sometimes").is_err());
    }

    #[test]
    fn test_chain_id_single_layer_is_identity() {
        let ids = vec!["sha256:aaaa".to_string()];
        assert_eq!(chain_id(&ids), "sha256:aaaa");
    }

    #[test]
    fn test_chain_id_two_layers() {
        // chain = sha256(hex of "A B") per the OCI image spec.
        let ids = vec!["sha256:aa".to_string(), "sha256:bb".to_string()];
        let expected = format!("sha256:{:x}", Sha256::digest(b"sha256:aa sha256:bb"));
        assert_eq!(chain_id(&ids), expected);
    }

    #[test]
    fn test_chain_id_empty() {
        assert_eq!(chain_id(&[]), "");
    }
}
