//! Fleet configuration.
//!
//! One [`FleetConfig`] value is loaded at startup (see
//! [`crate::cli::ConfigDiscovery`]) and handed to each component's
//! constructor. Every field has a default, so an empty TOML file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::env;
use crate::error::{FleetError, Result};
use crate::model::PortTriple;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Root directory for per-instance install, log and backup directories
    pub data_root: PathBuf,
    pub store: StoreConfig,
    pub ports: PortsConfig,
    pub provisioning: ProvisioningConfig,
    pub container: ContainerSettings,
    pub lifecycle: LifecycleConfig,
    pub governor: GovernorConfig,
    pub notifications: NotificationConfig,
    pub backup: BackupConfig,
    pub rollout: RolloutConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/gamefleet"),
            store: StoreConfig::default(),
            ports: PortsConfig::default(),
            provisioning: ProvisioningConfig::default(),
            container: ContainerSettings::default(),
            lifecycle: LifecycleConfig::default(),
            governor: GovernorConfig::default(),
            notifications: NotificationConfig::default(),
            backup: BackupConfig::default(),
            rollout: RolloutConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| FleetError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Database URL, defaulting to a sqlite file under the data root
    pub fn store_url(&self) -> String {
        match &self.store.url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}", self.data_root.join("gamefleet.db").display()),
        }
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.ports.stride == 0 {
            return Err(FleetError::Config("ports.stride must be at least 1".into()));
        }
        if !self.ports.base().is_pairwise_distinct() {
            return Err(FleetError::Config(
                "ports.game_base, query_base and rcon_base must differ".into(),
            ));
        }
        if self.lifecycle.max_concurrent_operations == 0 {
            return Err(FleetError::Config(
                "lifecycle.max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.governor.fine_interval_minutes == 0 || self.governor.fine_interval_minutes > 30 {
            return Err(FleetError::Config(
                "governor.fine_interval_minutes must be between 1 and 30".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection URL; `None` uses `<data_root>/gamefleet.db`
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Port allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub game_base: u16,
    pub query_base: u16,
    pub rcon_base: u16,
    /// Increment between consecutive candidate triples
    pub stride: u16,
    /// Candidates scanned before giving up
    pub max_candidates: u32,
    /// Unique-constraint conflicts tolerated before giving up
    pub max_conflict_retries: u32,
    /// Address the bind probe uses
    pub bind_address: IpAddr,
}

impl PortsConfig {
    pub fn base(&self) -> PortTriple {
        PortTriple::new(self.game_base, self.query_base, self.rcon_base)
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            game_base: 7777,
            query_base: 27015,
            rcon_base: 27020,
            stride: 1,
            max_candidates: 64,
            max_conflict_retries: 8,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Binary and mod acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Explicit SteamCMD location; otherwise PATH and well-known paths
    pub steamcmd_path: Option<PathBuf>,
    pub app_id: String,
    /// Application the workshop items belong to
    pub workshop_app_id: String,
    /// Pass `validate` to `app_update` on forced updates
    pub validate_on_update: bool,
    pub download_timeout_secs: u64,
    pub native_binary: PathBuf,
    pub alternate_binary: PathBuf,
    pub foreign_binary: PathBuf,
    /// Command prefix that runs the foreign binary
    pub compat_shim: Vec<String>,
    /// Mod search paths, relative to the install dir
    pub mod_link_dirs: Vec<PathBuf>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            steamcmd_path: None,
            app_id: env::DEFAULT_APP_ID.to_string(),
            workshop_app_id: "2399830".to_string(),
            validate_on_update: true,
            download_timeout_secs: 3600,
            native_binary: PathBuf::from("ShooterGame/Binaries/Linux/ArkAscendedServer"),
            alternate_binary: PathBuf::from("ShooterGame/Binaries/Linux/ShooterGameServer"),
            foreign_binary: PathBuf::from("ShooterGame/Binaries/Win64/ArkAscendedServer.exe"),
            compat_shim: vec!["proton".to_string(), "run".to_string()],
            mod_link_dirs: vec![
                PathBuf::from("ShooterGame/Content/Mods"),
                PathBuf::from("ShooterGame/Binaries/Win64/ShooterGame/Mods"),
            ],
        }
    }
}

impl ProvisioningConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Default image for instances without an override
    pub image: String,
    /// Dockerfile context used by image rebuilds
    pub build_context: PathBuf,
    /// Install dir mount point inside the container
    pub server_dir: String,
    pub stop_timeout_secs: i64,
    /// Pull missing images before create
    pub auto_pull: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: "gamefleet/ark-server:latest".to_string(),
            build_context: PathBuf::from("."),
            server_dir: "/opt/arkserver".to_string(),
            stop_timeout_secs: 30,
            auto_pull: false,
        }
    }
}

/// Lifecycle retry and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub start_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Status polls after a start before it counts as unconfirmed
    pub start_confirm_polls: u32,
    pub start_confirm_interval_ms: u64,
    pub max_concurrent_operations: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_retries: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 10_000,
            start_confirm_polls: 10,
            start_confirm_interval_ms: 1000,
            max_concurrent_operations: 8,
        }
    }
}

/// Expiry reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub fine_interval_minutes: u64,
    pub daily_interval_hours: u64,
    pub purge_interval_hours: u64,
    pub warning_window_days: i64,
    pub grace_period_days: i64,
    /// Also stop operable instances that have no bound token at all
    pub stop_unbound_instances: bool,
    /// Lease lifetime; a crashed pass frees its lease after this long
    pub lease_ttl_secs: i64,
    pub token_expiry_days: i64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            fine_interval_minutes: 30,
            daily_interval_hours: 24,
            purge_interval_hours: 24,
            warning_window_days: 5,
            grace_period_days: 30,
            stop_unbound_instances: false,
            lease_ttl_secs: 900,
            token_expiry_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// POST target for governor events
    pub webhook_url: Option<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Archives kept by `prune`
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { keep: 10 }
    }
}

/// Rollout sequence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub project_dir: PathBuf,
    pub branch: String,
    pub service_name: String,
    /// Command re-registering recurring jobs, e.g. installing a crontab
    pub register_jobs_command: Vec<String>,
    pub step_timeout_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("/opt/gamefleet"),
            branch: "main".to_string(),
            service_name: "gamefleet".to_string(),
            register_jobs_command: Vec::new(),
            step_timeout_secs: 600,
        }
    }
}
