//! Runtime-agnostic container specifications.
//!
//! A [`ContainerSpec`] describes everything the runtime needs to create one
//! instance's container. It carries no runtime types, so the lifecycle manager
//! and its tests never depend on a live daemon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::ContainerSettings;
use crate::container::{ContainerError, Result, container_name};
use crate::env::{labels, vars};
use crate::launch::LaunchSpec;
use crate::model::{InstanceId, PortTriple};

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

/// A port published on the host at the same number it uses inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    pub port: u16,
    pub protocol: PortProtocol,
}

impl PublishedPort {
    /// Key in `<port>/<protocol>` form
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol.as_str())
    }
}

/// Host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Container description handed to a [`crate::container::ContainerRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Arguments passed to the image entrypoint
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    pub ports: Vec<PublishedPort>,
    pub working_dir: Option<String>,
}

impl ContainerSpec {
    /// Create a new specification builder.
    pub fn builder() -> ContainerSpecBuilder {
        ContainerSpecBuilder::default()
    }

    /// Specification of the container serving `instance_id`.
    ///
    /// The install directory is mounted at the configured server dir so
    /// binaries, mods and save data outlive the container.
    pub fn for_instance(
        instance_id: InstanceId,
        launch: &LaunchSpec,
        ports: PortTriple,
        install_dir: &Path,
        settings: &ContainerSettings,
        image: Option<&str>,
    ) -> Result<Self> {
        let mut builder = Self::builder()
            .name(container_name(instance_id))
            .image(image.unwrap_or(&settings.image))
            .cmd(launch.argv())
            .working_dir(&settings.server_dir)
            .label(labels::MANAGED, "true")
            .label(labels::INSTANCE, instance_id.to_string())
            .mount(install_dir, &settings.server_dir, false)
            .env(vars::SERVER_DIR, &settings.server_dir)
            .publish(ports.game, PortProtocol::Udp)
            .publish(ports.query, PortProtocol::Udp)
            .publish(ports.rcon, PortProtocol::Tcp);

        for (key, value) in &launch.env {
            builder = builder.env(key, value);
        }

        builder.build()
    }
}

/// Builder for [`ContainerSpec`].
#[derive(Debug, Default)]
pub struct ContainerSpecBuilder {
    name: Option<String>,
    image: Option<String>,
    cmd: Vec<String>,
    env: Vec<String>,
    labels: BTreeMap<String, String>,
    mounts: Vec<BindMount>,
    ports: Vec<PublishedPort>,
    working_dir: Option<String>,
}

impl ContainerSpecBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable. A later value for the same key wins.
    pub fn env<K: AsRef<str>, V: AsRef<str>>(mut self, key: K, value: V) -> Self {
        let prefix = format!("{}=", key.as_ref());
        self.env.retain(|pair| !pair.starts_with(&prefix));
        self.env.push(format!("{}{}", prefix, value.as_ref()));
        self
    }

    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn mount<P: AsRef<Path>, T: Into<String>>(
        mut self,
        source: P,
        target: T,
        read_only: bool,
    ) -> Self {
        self.mounts.push(BindMount {
            source: source.as_ref().to_path_buf(),
            target: target.into(),
            read_only,
        });
        self
    }

    pub fn publish(mut self, port: u16, protocol: PortProtocol) -> Self {
        self.ports.push(PublishedPort { port, protocol });
        self
    }

    pub fn working_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Build the specification.
    ///
    /// # Errors
    ///
    /// Returns error if the name or image is missing, or a mount source is
    /// not absolute.
    pub fn build(self) -> Result<ContainerSpec> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ContainerError::ConfigError("Container name is required".to_string()))?;
        let image = self
            .image
            .filter(|i| !i.is_empty())
            .ok_or_else(|| ContainerError::ConfigError("Image is required".to_string()))?;

        if let Some(mount) = self.mounts.iter().find(|m| !m.source.is_absolute()) {
            return Err(ContainerError::ConfigError(format!(
                "Mount source {} must be absolute",
                mount.source.display()
            )));
        }

        Ok(ContainerSpec {
            name,
            image,
            cmd: self.cmd,
            env: self.env,
            labels: self.labels,
            mounts: self.mounts,
            ports: self.ports,
            working_dir: self.working_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchSpecComposer;
    use crate::model::{Instance, InstanceSpec};

    #[test]
    fn test_basic_spec() {
        let spec = ContainerSpec::builder()
            .name("gamefleet-test")
            .image("gamefleet/ark-server:latest")
            .cmd(vec!["TheIsland_WP?listen", "-Port=7777"])
            .working_dir("/opt/arkserver")
            .build()
            .unwrap();

        assert_eq!(spec.image, "gamefleet/ark-server:latest");
        assert_eq!(spec.cmd.len(), 2);
        assert_eq!(spec.working_dir.as_deref(), Some("/opt/arkserver"));
    }

    #[test]
    fn test_env_last_value_wins() {
        let spec = ContainerSpec::builder()
            .name("n")
            .image("i")
            .env("FOO", "bar")
            .env("BAZ", "qux")
            .env("FOO", "again")
            .build()
            .unwrap();

        assert_eq!(spec.env, vec!["BAZ=qux", "FOO=again"]);
    }

    #[test]
    fn test_missing_image_error() {
        let result = ContainerSpec::builder().name("n").build();
        assert!(matches!(result, Err(ContainerError::ConfigError(_))));
    }

    #[test]
    fn test_relative_mount_rejected() {
        let result = ContainerSpec::builder()
            .name("n")
            .image("i")
            .mount("relative/dir", "/opt/arkserver", false)
            .build();
        assert!(matches!(result, Err(ContainerError::ConfigError(_))));
    }

    #[test]
    fn test_for_instance() {
        let instance = Instance::new("alice", InstanceSpec::new("S", "TheIsland", 10));
        let ports = PortTriple::new(7777, 27015, 27020);
        let launch = LaunchSpecComposer::compose(&instance, ports).unwrap();
        let settings = ContainerSettings::default();

        let spec = ContainerSpec::for_instance(
            instance.id,
            &launch,
            ports,
            Path::new("/var/lib/gamefleet/instances/x/server"),
            &settings,
            None,
        )
        .unwrap();

        assert_eq!(spec.name, container_name(instance.id));
        assert_eq!(spec.image, settings.image);
        assert_eq!(spec.cmd, launch.argv());
        assert_eq!(spec.labels[labels::INSTANCE], instance.id.to_string());
        assert_eq!(spec.mounts[0].target, settings.server_dir);
        assert!(spec.env.contains(&"SERVER_PORT=7777".to_string()));
        let keys: Vec<String> = spec.ports.iter().map(PublishedPort::key).collect();
        assert_eq!(keys, vec!["7777/udp", "27015/udp", "27020/tcp"]);
    }
}
