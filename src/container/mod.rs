//! Container runtime boundary.
//!
//! Instances run inside containers managed through Docker or Podman via the
//! bollard API. Everything above this module talks to the
//! [`ContainerRuntime`] trait only, so lifecycle logic can be exercised
//! against scripted runtimes.
//!
//! ## Architecture
//!
//! - [`config`]: runtime-agnostic [`ContainerSpec`] builder
//! - [`image`]: server image rebuilds through the `docker` CLI
//! - `client`: Docker/Podman API client wrapper with connection fallback
//! - `docker`: [`DockerRuntime`], the bollard-backed [`ContainerRuntime`]
//!
//! The last two are compiled with the `containers` feature (on by default).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gamefleet::container::{ContainerRuntime, ContainerSpec, DockerRuntime, container_name};
//! use gamefleet::config::ContainerSettings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = DockerRuntime::connect(ContainerSettings::default()).await?;
//!
//!     let spec = ContainerSpec::builder()
//!         .name(container_name(uuid::Uuid::new_v4()))
//!         .image("gamefleet/ark-server:latest")
//!         .build()?;
//!
//!     runtime.create(&spec).await?;
//!     runtime.start(&spec.name).await?;
//!     println!("{:?}", runtime.status(&spec.name).await?);
//!     runtime.stop(&spec.name).await?;
//!     runtime.remove(&spec.name).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;

use crate::env::CONTAINER_NAME_PREFIX;
use crate::model::{InstanceId, RuntimeStatus};

pub mod config;
pub mod image;

#[cfg(feature = "containers")]
mod client;
#[cfg(feature = "containers")]
mod docker;

#[cfg(feature = "containers")]
pub use client::{ContainerClient, RuntimeType};
pub use config::{BindMount, ContainerSpec, ContainerSpecBuilder, PortProtocol, PublishedPort};
#[cfg(feature = "containers")]
pub use docker::DockerRuntime;
pub use image::ImageBuilder;

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker/Podman API error
    #[cfg(feature = "containers")]
    #[error("Container API error: {0}")]
    ApiError(#[from] bollard::errors::Error),

    /// Container not found
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Container configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// External command (image build) failed
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// No runtime reachable
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General error
    #[error("Container error: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Deterministic container name for an instance.
///
/// The prefix namespaces our containers; the uuid makes the name unique.
pub fn container_name(instance_id: InstanceId) -> String {
    format!("{}-{}", CONTAINER_NAME_PREFIX, instance_id.simple())
}

/// Administrative interface of a container runtime.
///
/// Containers are addressed by name. `stop` and `remove` succeed on
/// containers that are already stopped or gone.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container; returns the runtime id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Force-remove a container; a missing container is not an error
    async fn remove(&self, name: &str) -> Result<()>;

    /// Current status; [`RuntimeStatus::Missing`] when no such container exists
    async fn status(&self, name: &str) -> Result<RuntimeStatus>;

    /// Rebuild (or refresh) the server image
    async fn rebuild_image(&self, image: &str) -> Result<()>;

    fn runtime_name(&self) -> &'static str;
}
