//! bollard-backed [`ContainerRuntime`].

use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use bollard::service::{HostConfig, Mount, MountTypeEnum, PortBinding};

use crate::config::ContainerSettings;
use crate::container::{
    ContainerClient, ContainerError, ContainerRuntime, ContainerSpec, ImageBuilder, Result,
};
use crate::executor::HostExecutor;
use crate::model::RuntimeStatus;

/// Docker or Podman, reached through the bollard API.
pub struct DockerRuntime {
    client: ContainerClient,
    settings: ContainerSettings,
    images: ImageBuilder,
}

fn status_code(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

/// Translate a spec into the bollard create body.
fn to_bollard(spec: &ContainerSpec) -> bollard::container::Config<String> {
    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.source.display().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    for port in &spec.ports {
        port_bindings.insert(
            port.key(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.port.to_string()),
            }]),
        );
        exposed_ports.insert(port.key(), HashMap::new());
    }

    let host_config = HostConfig {
        mounts: (!mounts.is_empty()).then_some(mounts),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        ..Default::default()
    };

    bollard::container::Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        working_dir: spec.working_dir.clone(),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        labels: (!spec.labels.is_empty()).then(|| {
            spec.labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

impl DockerRuntime {
    /// Connect to the local runtime; image builds run on the host.
    pub async fn connect(settings: ContainerSettings) -> Result<Self> {
        let client = ContainerClient::new().await?;
        match client.runtime_type().await {
            Ok(kind) => info!("Using {} container runtime", kind),
            Err(e) => debug!("Could not detect runtime type: {}", e),
        }
        let images = ImageBuilder::new(Arc::new(HostExecutor::new()), &settings.build_context)
            .with_timeout(Duration::from_secs(1800));
        Ok(Self::with_client(client, settings, images))
    }

    pub fn with_client(
        client: ContainerClient,
        settings: ContainerSettings,
        images: ImageBuilder,
    ) -> Self {
        Self {
            client,
            settings,
            images,
        }
    }

    pub fn client(&self) -> &ContainerClient {
        &self.client
    }

    /// Pull an image unless it is already present.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.image_exists(image).await? {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }
        self.pull_image(image).await
    }

    /// Pull a container image from registry.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);
        let mut stream = self.client.docker().create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(status) = info.status {
                debug!("Pull status: {}", status);
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.settings.auto_pull {
            self.ensure_image(&spec.image).await?;
        }

        let options = bollard::container::CreateContainerOptions {
            name: spec.name.as_str(),
            ..Default::default()
        };

        debug!("Creating container: {}", spec.name);
        let response = self
            .client
            .docker()
            .create_container(Some(options), to_bollard(spec))
            .await?;

        for warning in &response.warnings {
            warn!("Runtime warning for {}: {}", spec.name, warning);
        }
        info!("Created container: {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        debug!("Starting container: {}", name);
        match self
            .client
            .docker()
            .start_container(name, None::<bollard::container::StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            // 304: already running
            Err(e) if status_code(&e) == Some(304) => {
                debug!("Container {} already running", name);
            }
            Err(e) if status_code(&e) == Some(404) => {
                return Err(ContainerError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        info!("Started container: {}", name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        debug!("Stopping container: {}", name);
        match self
            .client
            .docker()
            .stop_container(
                name,
                Some(bollard::container::StopContainerOptions {
                    t: self.settings.stop_timeout_secs,
                }),
            )
            .await
        {
            Ok(()) => info!("Stopped container: {}", name),
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {
                debug!("Container {} already stopped or gone", name);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        debug!("Removing container: {}", name);
        match self
            .client
            .docker()
            .remove_container(
                name,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: false,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => info!("Removed container: {}", name),
            Err(e) if status_code(&e) == Some(404) => {
                debug!("Container {} already removed", name);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<RuntimeStatus> {
        self.client.container_status(name).await
    }

    async fn rebuild_image(&self, image: &str) -> Result<()> {
        if self.images.context().join("Dockerfile").is_file() {
            self.images.build(image).await.map(|_| ())
        } else {
            debug!(
                "No Dockerfile in {}, pulling {} instead",
                self.images.context().display(),
                image
            );
            self.pull_image(image).await
        }
    }

    fn runtime_name(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::PortProtocol;

    fn spec() -> ContainerSpec {
        ContainerSpec::builder()
            .name("gamefleet-abc")
            .image("gamefleet/ark-server:latest")
            .cmd(vec!["TheIsland_WP?listen"])
            .env("SERVER_PORT", "7777")
            .label("gamefleet.managed", "true")
            .mount("/srv/fleet/instances/abc/server", "/opt/arkserver", false)
            .publish(7777, PortProtocol::Udp)
            .publish(27020, PortProtocol::Tcp)
            .build()
            .unwrap()
    }

    #[test]
    fn test_to_bollard_ports_and_mounts() {
        let config = to_bollard(&spec());
        let host = config.host_config.unwrap();

        let bindings = host.port_bindings.unwrap();
        let udp = bindings["7777/udp"].as_ref().unwrap();
        assert_eq!(udp[0].host_port.as_deref(), Some("7777"));
        assert!(bindings.contains_key("27020/tcp"));

        let mounts = host.mounts.unwrap();
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].target.as_deref(), Some("/opt/arkserver"));
        assert_eq!(config.env.unwrap(), vec!["SERVER_PORT=7777"]);
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman to be running
    async fn test_missing_container_is_idempotent() {
        let runtime = DockerRuntime::connect(ContainerSettings::default())
            .await
            .unwrap();
        runtime.stop("gamefleet-does-not-exist").await.unwrap();
        runtime.remove("gamefleet-does-not-exist").await.unwrap();
        assert_eq!(
            runtime.status("gamefleet-does-not-exist").await.unwrap(),
            RuntimeStatus::Missing
        );
    }
}
