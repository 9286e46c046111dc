//! SteamCMD location and command construction.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::executor::ExecutionCommand;

/// Well-known install locations, checked after `PATH`.
fn well_known_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/usr/games/steamcmd"),
        PathBuf::from("/usr/local/bin/steamcmd"),
        PathBuf::from("/opt/steamcmd/steamcmd.sh"),
    ];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join("steamcmd").join("steamcmd.sh"));
    }
    paths
}

/// Builds SteamCMD invocations for one install directory.
#[derive(Debug, Clone)]
pub struct SteamCmd {
    program: PathBuf,
    timeout: Duration,
}

impl SteamCmd {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    /// Find SteamCMD: an explicitly configured path is trusted as-is, then
    /// `PATH`, then the well-known install locations.
    pub fn locate(configured: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = configured {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = which::which("steamcmd") {
            debug!("Found steamcmd on PATH: {:?}", path);
            return Some(path);
        }

        well_known_paths().into_iter().find(|p| p.is_file())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn base_args(install_dir: &Path) -> Vec<String> {
        vec![
            "+force_install_dir".to_string(),
            install_dir.to_string_lossy().into_owned(),
            "+login".to_string(),
            "anonymous".to_string(),
        ]
    }

    /// `app_update` of the server application into `install_dir`.
    pub fn app_update(&self, install_dir: &Path, app_id: &str, validate: bool) -> ExecutionCommand {
        let mut args = Self::base_args(install_dir);
        args.push("+app_update".to_string());
        args.push(app_id.to_string());
        if validate {
            args.push("validate".to_string());
        }
        args.push("+quit".to_string());

        ExecutionCommand::new(self.program.to_string_lossy(), args)
            .with_working_dir(install_dir.to_path_buf())
            .with_timeout(self.timeout)
    }

    /// Workshop download of one mod into `install_dir`.
    pub fn workshop_download(
        &self,
        install_dir: &Path,
        workshop_app_id: &str,
        mod_id: u64,
    ) -> ExecutionCommand {
        let mut args = Self::base_args(install_dir);
        args.push("+workshop_download_item".to_string());
        args.push(workshop_app_id.to_string());
        args.push(mod_id.to_string());
        args.push("+quit".to_string());

        ExecutionCommand::new(self.program.to_string_lossy(), args)
            .with_working_dir(install_dir.to_path_buf())
            .with_timeout(self.timeout)
    }
}

/// Where SteamCMD places a downloaded workshop item.
pub fn workshop_content_dir(install_dir: &Path, workshop_app_id: &str, mod_id: u64) -> PathBuf {
    install_dir
        .join("steamapps")
        .join("workshop")
        .join("content")
        .join(workshop_app_id)
        .join(mod_id.to_string())
}
