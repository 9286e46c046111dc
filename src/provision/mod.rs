//! Binary and mod provisioning.
//!
//! [`BinaryProvisioningPipeline::ensure_provisioned`] makes sure an instance's
//! install directory holds a runnable server binary and that every declared
//! mod is linked into the server's search paths. A missing binary is fatal;
//! a mod that fails to download is recorded and skipped.
//!
//! Re-running the pipeline without `force_update` performs no downloads and
//! leaves existing links untouched.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ProvisioningConfig;
use crate::env;
use crate::error::{FleetError, Result};
use crate::executor::{CommandExecutor, ExecutionCommand, ExecutionResult, append_command_log};
use crate::model::Instance;

pub mod binary;
pub mod mods;
pub mod steamcmd;

pub use binary::{BinaryKind, BinaryLayout, ResolvedBinary};
pub use mods::LinkMethod;
pub use steamcmd::{SteamCmd, workshop_content_dir};

/// A mod that was skipped, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModFailure {
    pub mod_id: u64,
    pub reason: String,
}

impl ModFailure {
    pub fn to_warning(&self) -> String {
        FleetError::ModAcquisitionFailed {
            mod_id: self.mod_id,
            reason: self.reason.clone(),
        }
        .to_string()
    }
}

/// What a provisioning run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub binary: ResolvedBinary,
    /// Whether the server application was downloaded in this run
    pub downloaded: bool,
    /// Mods present in every search path
    pub linked_mods: Vec<u64>,
    /// Mods downloaded in this run
    pub downloaded_mods: Vec<u64>,
    pub skipped_mods: Vec<ModFailure>,
    /// Command log written during this run, if any command ran
    pub log_path: Option<PathBuf>,
}

impl ProvisionResult {
    pub fn warnings(&self) -> Vec<String> {
        self.skipped_mods.iter().map(ModFailure::to_warning).collect()
    }
}

pub struct BinaryProvisioningPipeline {
    executor: Arc<dyn CommandExecutor>,
    config: ProvisioningConfig,
    layout: BinaryLayout,
    data_root: PathBuf,
}

impl BinaryProvisioningPipeline {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        config: ProvisioningConfig,
        data_root: PathBuf,
    ) -> Self {
        let layout = BinaryLayout::from_config(&config);
        Self {
            executor,
            config,
            layout,
            data_root,
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn layout(&self) -> &BinaryLayout {
        &self.layout
    }

    pub fn install_dir(&self, instance: &Instance) -> PathBuf {
        env::instance_server_dir_path(&self.data_root, &instance.id.to_string())
    }

    /// Ensure `instance` has a runnable binary and its mods linked.
    ///
    /// # Errors
    ///
    /// `BinaryMissing` if no binary exists after an attempted download, or if
    /// the download itself fails.
    pub async fn ensure_provisioned(
        &self,
        instance: &Instance,
        force_update: bool,
    ) -> Result<ProvisionResult> {
        let install_dir = self.install_dir(instance);
        tokio::fs::create_dir_all(&install_dir).await?;

        let log_path = env::instance_logs_dir_path(&self.data_root, &instance.id.to_string())
            .join(format!("provision-{}.log", Utc::now().format("%Y%m%d_%H%M%S")));
        let mut wrote_log = false;

        let prefer_foreign = instance.spec.force_compat_layer;
        let existing = self.layout.resolve(&install_dir, prefer_foreign);
        let mut downloaded = false;

        let binary = match existing {
            Some(binary) if !force_update => {
                debug!(
                    "Instance {} already has {:?} binary at {:?}",
                    instance.id, binary.kind, binary.path
                );
                binary
            }
            _ => {
                info!(
                    "Downloading server app {} for instance {} into {:?}",
                    self.config.app_id, instance.id, install_dir
                );
                let steam = self.steamcmd().ok_or_else(|| {
                    FleetError::BinaryMissing("steamcmd not found".to_string())
                })?;
                let validate = force_update && self.config.validate_on_update;
                let cmd = steam.app_update(&install_dir, &self.config.app_id, validate);

                let result = self
                    .run_logged(cmd, &log_path, &mut wrote_log)
                    .await
                    .map_err(|e| FleetError::BinaryMissing(format!("download failed: {}", e)))?;
                if !result.success() {
                    return Err(FleetError::BinaryMissing(format!(
                        "download exited with {}: {}",
                        result.exit_code,
                        result.summary()
                    )));
                }
                downloaded = true;

                self.layout
                    .resolve(&install_dir, prefer_foreign)
                    .ok_or_else(|| {
                        FleetError::BinaryMissing(format!(
                            "no server binary under {:?} after download",
                            install_dir
                        ))
                    })?
            }
        };

        let mut result = ProvisionResult {
            binary,
            downloaded,
            linked_mods: Vec::new(),
            downloaded_mods: Vec::new(),
            skipped_mods: Vec::new(),
            log_path: None,
        };

        for mod_id in instance.spec.all_mods() {
            match self
                .provision_mod(&install_dir, mod_id, force_update, &log_path, &mut wrote_log)
                .await
            {
                Ok(was_downloaded) => {
                    result.linked_mods.push(mod_id);
                    if was_downloaded {
                        result.downloaded_mods.push(mod_id);
                    }
                }
                Err(reason) => {
                    warn!(
                        "Skipping mod {} for instance {}: {}",
                        mod_id, instance.id, reason
                    );
                    result.skipped_mods.push(ModFailure { mod_id, reason });
                }
            }
        }

        if wrote_log {
            result.log_path = Some(log_path);
        }

        info!(
            "Instance {} provisioned: {:?} binary, {} mods linked, {} skipped",
            instance.id,
            result.binary.kind,
            result.linked_mods.len(),
            result.skipped_mods.len()
        );
        Ok(result)
    }

    /// Download (if needed) and link one mod. Returns whether it was downloaded.
    async fn provision_mod(
        &self,
        install_dir: &Path,
        mod_id: u64,
        force: bool,
        log_path: &Path,
        wrote_log: &mut bool,
    ) -> std::result::Result<bool, String> {
        let content = workshop_content_dir(install_dir, &self.config.workshop_app_id, mod_id);
        let search_dirs = self.config.mod_link_dirs.clone();

        if !force && content.is_dir() {
            if mods::is_fully_linked(&content, install_dir, &search_dirs, mod_id) {
                return Ok(false);
            }
            self.link(content, install_dir, search_dirs, mod_id, false)
                .await?;
            return Ok(false);
        }

        let steam = self
            .steamcmd()
            .ok_or_else(|| "steamcmd not found".to_string())?;
        let cmd = steam.workshop_download(install_dir, &self.config.workshop_app_id, mod_id);
        let outcome = self
            .run_logged(cmd, log_path, wrote_log)
            .await
            .map_err(|e| e.to_string())?;

        if !outcome.success() {
            return Err(format!(
                "workshop download exited with {}: {}",
                outcome.exit_code,
                outcome.summary()
            ));
        }
        if !content.is_dir() {
            return Err(format!("no content at {:?} after download", content));
        }

        self.link(content, install_dir, search_dirs, mod_id, force)
            .await?;
        Ok(true)
    }

    async fn link(
        &self,
        content: PathBuf,
        install_dir: &Path,
        search_dirs: Vec<PathBuf>,
        mod_id: u64,
        force: bool,
    ) -> std::result::Result<(), String> {
        let install_dir = install_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            mods::link_into_search_paths(&content, &install_dir, &search_dirs, mod_id, force)
        })
        .await
        .map_err(|e| format!("link task failed: {}", e))?
        .map(|_| ())
        .map_err(|e| format!("linking failed: {}", e))
    }

    fn steamcmd(&self) -> Option<SteamCmd> {
        SteamCmd::locate(self.config.steamcmd_path.as_deref())
            .map(|program| SteamCmd::new(program, self.config.download_timeout()))
    }

    async fn run_logged(
        &self,
        cmd: ExecutionCommand,
        log_path: &Path,
        wrote_log: &mut bool,
    ) -> Result<ExecutionResult> {
        let logged = cmd.clone();
        let result = self.executor.execute(cmd).await?;

        match append_command_log(log_path, &logged, &result).await {
            Ok(()) => *wrote_log = true,
            Err(e) => warn!("Could not write provisioning log {:?}: {}", log_path, e),
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorError;
    use crate::model::InstanceSpec;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Pretends to be SteamCMD by creating the files a real download would.
    #[derive(Default)]
    struct FakeSteam {
        failing_mods: HashSet<u64>,
        fail_app_update: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeSteam {
        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandExecutor for FakeSteam {
        async fn execute(&self, cmd: ExecutionCommand) -> std::result::Result<ExecutionResult, ExecutorError> {
            self.calls.lock().unwrap().push(cmd.args.clone());
            let install_dir = PathBuf::from(&cmd.args[1]);

            if cmd.args.iter().any(|a| a == "+app_update") {
                if self.fail_app_update {
                    return Ok(ExecutionResult::failed(8, "ERROR! Failed to install app"));
                }
                let binary = install_dir.join(&ProvisioningConfig::default().native_binary);
                std::fs::create_dir_all(binary.parent().unwrap())?;
                std::fs::write(binary, b"elf")?;
                return Ok(ExecutionResult::ok("Success! App fully installed."));
            }

            let mod_id: u64 = cmd.args[6].parse().unwrap();
            if self.failing_mods.contains(&mod_id) {
                return Ok(ExecutionResult::failed(5, "ERROR! Download item failed (File Not Found)."));
            }
            let content = workshop_content_dir(&install_dir, &cmd.args[5], mod_id);
            std::fs::create_dir_all(&content)?;
            std::fs::write(content.join("mod.info"), mod_id.to_string())?;
            Ok(ExecutionResult::ok("Success. Downloaded item"))
        }

        fn executor_type(&self) -> &'static str {
            "fake-steam"
        }
    }

    fn pipeline(temp_dir: &TempDir, steam: Arc<FakeSteam>) -> BinaryProvisioningPipeline {
        let config = ProvisioningConfig {
            steamcmd_path: Some(PathBuf::from("/usr/games/steamcmd")),
            ..ProvisioningConfig::default()
        };
        BinaryProvisioningPipeline::new(steam, config, temp_dir.path().to_path_buf())
    }

    fn instance_with_mods(mods: Vec<u64>) -> Instance {
        let mut spec = InstanceSpec::new("Test", "TheIsland", 10);
        spec.mods = mods;
        Instance::new("alice", spec)
    }

    #[tokio::test]
    async fn test_first_run_downloads_binary_and_mods() {
        let temp_dir = TempDir::new().unwrap();
        let steam = Arc::new(FakeSteam::default());
        let pipeline = pipeline(&temp_dir, steam.clone());
        let instance = instance_with_mods(vec![100, 200]);

        let result = pipeline.ensure_provisioned(&instance, false).await.unwrap();
        assert!(result.downloaded);
        assert_eq!(result.binary.kind, BinaryKind::Native);
        assert_eq!(result.linked_mods, vec![100, 200]);
        assert_eq!(result.downloaded_mods, vec![100, 200]);
        assert_eq!(steam.call_count(), 3);

        let log = result.log_path.unwrap();
        assert!(log.starts_with(temp_dir.path()));
        assert!(std::fs::read_to_string(log).unwrap().contains("+app_update"));
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let temp_dir = TempDir::new().unwrap();
        let steam = Arc::new(FakeSteam::default());
        let pipeline = pipeline(&temp_dir, steam.clone());
        let instance = instance_with_mods(vec![100]);

        pipeline.ensure_provisioned(&instance, false).await.unwrap();
        let link = pipeline
            .install_dir(&instance)
            .join("ShooterGame/Content/Mods/100");
        let link_target = std::fs::read_link(&link).unwrap();
        let calls = steam.call_count();

        let again = pipeline.ensure_provisioned(&instance, false).await.unwrap();
        assert!(!again.downloaded);
        assert!(again.downloaded_mods.is_empty());
        assert!(again.log_path.is_none());
        assert_eq!(steam.call_count(), calls);
        assert_eq!(std::fs::read_link(&link).unwrap(), link_target);
    }

    #[tokio::test]
    async fn test_mod_links_resolve_under_mount_path() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir, Arc::new(FakeSteam::default()));
        let instance = instance_with_mods(vec![100]);

        pipeline.ensure_provisioned(&instance, false).await.unwrap();
        let install = pipeline.install_dir(&instance);
        let link = install.join("ShooterGame/Content/Mods/100");
        assert!(std::fs::read_link(&link).unwrap().is_relative());

        // The container sees the install dir at a different absolute path.
        let mounted = temp_dir.path().join("opt").join("arkserver");
        std::fs::create_dir_all(mounted.parent().unwrap()).unwrap();
        std::fs::rename(&install, &mounted).unwrap();

        for dir in &pipeline.config.mod_link_dirs {
            let info = mounted.join(dir).join("100").join("mod.info");
            assert!(info.is_file(), "{:?} does not resolve", info);
        }
    }

    #[tokio::test]
    async fn test_failed_mod_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let steam = Arc::new(FakeSteam {
            failing_mods: HashSet::from([200]),
            ..FakeSteam::default()
        });
        let pipeline = pipeline(&temp_dir, steam);
        let instance = instance_with_mods(vec![100, 200]);

        let result = pipeline.ensure_provisioned(&instance, false).await.unwrap();
        assert_eq!(result.linked_mods, vec![100]);
        assert_eq!(result.skipped_mods.len(), 1);
        assert_eq!(result.skipped_mods[0].mod_id, 200);
        assert!(result.warnings()[0].contains("Mod 200"));

        let install = pipeline.install_dir(&instance);
        assert!(install.join("ShooterGame/Content/Mods/100").exists());
        assert!(
            install
                .join("ShooterGame/Binaries/Win64/ShooterGame/Mods/100")
                .exists()
        );
        assert!(!install.join("ShooterGame/Content/Mods/200").exists());
    }

    #[tokio::test]
    async fn test_failed_download_is_binary_missing() {
        let temp_dir = TempDir::new().unwrap();
        let steam = Arc::new(FakeSteam {
            fail_app_update: true,
            ..FakeSteam::default()
        });
        let pipeline = pipeline(&temp_dir, steam);

        let err = pipeline
            .ensure_provisioned(&instance_with_mods(vec![]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn test_force_update_downloads_again() {
        let temp_dir = TempDir::new().unwrap();
        let steam = Arc::new(FakeSteam::default());
        let pipeline = pipeline(&temp_dir, steam.clone());
        let instance = instance_with_mods(vec![100]);

        pipeline.ensure_provisioned(&instance, false).await.unwrap();
        let forced = pipeline.ensure_provisioned(&instance, true).await.unwrap();
        assert!(forced.downloaded);
        assert_eq!(forced.downloaded_mods, vec![100]);
        assert_eq!(steam.call_count(), 4);

        let calls = steam.calls.lock().unwrap();
        assert!(calls[2].contains(&"validate".to_string()));
    }
}
