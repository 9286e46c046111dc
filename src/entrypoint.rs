//! In-container server startup.
//!
//! The container image runs `gamefleet-entrypoint` as PID 1. It reads the
//! launch environment written by the composer, makes sure a server binary
//! exists (running SteamCMD when it does not, or when an update on boot is
//! requested), then runs the server with its output teed to a log file and
//! exits with the server's exit code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProvisioningConfig;
use crate::env::{self, vars};
use crate::error::{FleetError, Result};
use crate::executor::{CommandExecutor, HostExecutor};
use crate::launch::{LaunchInput, compose_args};
use crate::provision::binary::{BinaryLayout, ResolvedBinary};
use crate::provision::steamcmd::SteamCmd;

const DEFAULT_SERVER_DIR: &str = "/opt/arkserver";

/// Entrypoint settings that come from the container environment rather than
/// the launch configuration.
#[derive(Debug, Clone)]
pub struct EntrypointSettings {
    pub server_dir: PathBuf,
    pub steamcmd: Option<PathBuf>,
    pub app_id: String,
    pub compat_shim: Vec<String>,
    pub layout: BinaryLayout,
    pub download_timeout: Duration,
    pub log_path: PathBuf,
    pub scratch_log_path: PathBuf,
}

impl EntrypointSettings {
    pub fn from_env(environment: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| {
            environment
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let defaults = ProvisioningConfig::default();
        let server_dir = PathBuf::from(get(vars::SERVER_DIR).unwrap_or(DEFAULT_SERVER_DIR));

        Self {
            log_path: server_dir.join(env::SERVER_LOG_RELATIVE),
            scratch_log_path: PathBuf::from(env::SCRATCH_LOG_PATH),
            steamcmd: get(vars::STEAMCMD_PATH).map(PathBuf::from),
            app_id: get(vars::APP_ID).unwrap_or(env::DEFAULT_APP_ID).to_string(),
            compat_shim: get(vars::COMPAT_SHIM)
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| defaults.compat_shim.clone()),
            layout: BinaryLayout::from_config(&defaults),
            download_timeout: defaults.download_timeout(),
            server_dir,
        }
    }
}

/// Program and full argument list for the server process.
pub fn invocation(
    binary: &ResolvedBinary,
    compat_shim: &[String],
    launch_args: Vec<String>,
) -> (String, Vec<String>) {
    let (program, mut args) = binary.invocation(compat_shim);
    args.extend(launch_args);
    (program, args)
}

/// Open the server log, falling back to the scratch location.
pub async fn open_log(primary: &Path, scratch: &Path) -> Result<(PathBuf, File)> {
    match open_append(primary).await {
        Ok(file) => Ok((primary.to_path_buf(), file)),
        Err(e) => {
            warn!(
                "Cannot write {} ({}), logging to {}",
                primary.display(),
                e,
                scratch.display()
            );
            let file = open_append(scratch).await?;
            Ok((scratch.to_path_buf(), file))
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Make sure a server binary exists, downloading it when absent or when
/// `update` is set.
pub async fn ensure_binary(
    settings: &EntrypointSettings,
    executor: &dyn CommandExecutor,
    prefer_foreign: bool,
    update: bool,
) -> Result<ResolvedBinary> {
    let existing = settings.layout.resolve(&settings.server_dir, prefer_foreign);
    if let Some(binary) = &existing
        && !update
    {
        debug!("Using server binary {}", binary.path.display());
        return Ok(binary.clone());
    }

    let program = SteamCmd::locate(settings.steamcmd.as_deref());
    match program {
        Some(program) => {
            fs::create_dir_all(&settings.server_dir).await?;
            let steamcmd = SteamCmd::new(program, settings.download_timeout);
            let cmd = steamcmd.app_update(&settings.server_dir, &settings.app_id, update);
            info!("Installing server files: {}", cmd.display_line());
            let result = executor.execute(cmd).await?;
            if !result.success() {
                warn!("SteamCMD exited with {}: {}", result.exit_code, result.summary());
            }
        }
        None if existing.is_some() => {
            warn!("SteamCMD not found, starting without update");
        }
        None => {
            return Err(FleetError::BinaryMissing(format!(
                "no server binary under {} and SteamCMD not found",
                settings.server_dir.display()
            )));
        }
    }

    settings
        .layout
        .resolve(&settings.server_dir, prefer_foreign)
        .ok_or_else(|| {
            FleetError::BinaryMissing(format!(
                "no server binary under {} after install",
                settings.server_dir.display()
            ))
        })
}

async fn tee<R, W>(reader: R, mut console: W, log: Arc<Mutex<File>>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = format!("{}\n", line);
                let _ = console.write_all(line.as_bytes()).await;
                let mut log = log.lock().await;
                if let Err(e) = log.write_all(line.as_bytes()).await {
                    debug!("Server log write failed: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Server output read failed: {}", e);
                break;
            }
        }
    }
    let _ = console.flush().await;
}

/// Forward a termination request to the server so it can save.
#[cfg(unix)]
fn forward_terminate(pid: Option<u32>) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        warn!("Server pid {} out of range, not signalled", pid);
        return;
    };
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => info!("Forwarded SIGTERM to server {}", pid),
        Err(e) => warn!("Could not signal server {}: {}", pid, e),
    }
}

/// Run the server described by `environment` and return its exit code.
///
/// `argv` overrides the composed launch arguments when non-empty.
pub async fn run(environment: BTreeMap<String, String>, argv: Vec<String>) -> Result<i32> {
    let settings = EntrypointSettings::from_env(&environment);
    let input = LaunchInput::from_env(&environment)?;
    let executor = HostExecutor::new();

    let binary = ensure_binary(
        &settings,
        &executor,
        input.spec.force_compat_layer,
        input.update_on_boot,
    )
    .await?;

    let launch_args = if argv.is_empty() {
        compose_args(&input.spec, input.ports)?.to_vec()
    } else {
        argv
    };
    let (program, args) = invocation(&binary, &settings.compat_shim, launch_args);

    let (log_path, log) = open_log(&settings.log_path, &settings.scratch_log_path).await?;
    info!(
        "Starting {} ({:?}), logging to {}",
        program,
        binary.kind,
        log_path.display()
    );

    let mut child = Command::new(&program)
        .args(&args)
        .current_dir(&settings.server_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FleetError::BinaryMissing(format!("cannot execute {}: {}", program, e)))?;

    let log = Arc::new(Mutex::new(log));
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(tee(stdout, tokio::io::stdout(), log.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(tee(stderr, tokio::io::stderr(), log.clone())));
    }

    let status = wait_forwarding_signals(&mut child).await?;
    for pump in pumps {
        let _ = pump.await;
    }
    log.lock().await.flush().await?;

    let code = status.code().unwrap_or(1);
    info!("Server exited with code {}", code);
    Ok(code)
}

#[cfg(unix)]
async fn wait_forwarding_signals(
    child: &mut tokio::process::Child,
) -> Result<std::process::ExitStatus> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),
            _ = term.recv() => forward_terminate(child.id()),
            _ = interrupt.recv() => forward_terminate(child.id()),
        }
    }
}

#[cfg(not(unix))]
async fn wait_forwarding_signals(
    child: &mut tokio::process::Child,
) -> Result<std::process::ExitStatus> {
    Ok(child.wait().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionCommand, ExecutionResult, ExecutorError};
    use crate::provision::binary::BinaryKind;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct InstallsBinary {
        relative: PathBuf,
        root: PathBuf,
    }

    #[async_trait]
    impl CommandExecutor for InstallsBinary {
        async fn execute(&self, cmd: ExecutionCommand) -> std::result::Result<ExecutionResult, ExecutorError> {
            assert!(cmd.args.contains(&"+app_update".to_string()));
            let path = self.root.join(&self.relative);
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(path, b"")?;
            Ok(ExecutionResult::ok("Success! App fully installed."))
        }

        fn executor_type(&self) -> &'static str {
            "installs-binary"
        }
    }

    fn settings(root: &Path, steamcmd: Option<PathBuf>) -> EntrypointSettings {
        let mut environment = BTreeMap::new();
        environment.insert(vars::SERVER_DIR.to_string(), root.display().to_string());
        let mut settings = EntrypointSettings::from_env(&environment);
        settings.steamcmd = steamcmd;
        settings
    }

    #[test]
    fn test_settings_from_env() {
        let mut environment = BTreeMap::new();
        environment.insert(vars::SERVER_DIR.to_string(), "/srv/ark".to_string());
        environment.insert(vars::COMPAT_SHIM.to_string(), "wine64".to_string());
        let settings = EntrypointSettings::from_env(&environment);

        assert_eq!(settings.server_dir, PathBuf::from("/srv/ark"));
        assert_eq!(settings.compat_shim, vec!["wine64"]);
        assert_eq!(settings.app_id, env::DEFAULT_APP_ID);
        assert!(settings.log_path.starts_with("/srv/ark"));
    }

    #[test]
    fn test_invocation_through_shim() {
        let binary = ResolvedBinary {
            kind: BinaryKind::Foreign,
            path: PathBuf::from("/opt/arkserver/Server.exe"),
        };
        let shim = vec!["proton".to_string(), "run".to_string()];
        let (program, args) = invocation(&binary, &shim, vec!["TheIsland_WP?listen".to_string()]);
        assert_eq!(program, "proton");
        assert_eq!(
            args,
            vec!["run", "/opt/arkserver/Server.exe", "TheIsland_WP?listen"]
        );
    }

    #[tokio::test]
    async fn test_installs_missing_binary() {
        let temp = TempDir::new().unwrap();
        let settings = settings(temp.path(), Some(PathBuf::from("/usr/bin/steamcmd")));
        let executor = InstallsBinary {
            relative: settings.layout.native.clone(),
            root: temp.path().to_path_buf(),
        };

        let binary = ensure_binary(&settings, &executor, false, false)
            .await
            .unwrap();
        assert_eq!(binary.kind, BinaryKind::Native);
    }

    #[tokio::test]
    async fn test_existing_binary_skips_install() {
        let temp = TempDir::new().unwrap();
        let settings = settings(temp.path(), Some(PathBuf::from("/nonexistent/steamcmd")));
        let foreign = temp.path().join(&settings.layout.foreign);
        std::fs::create_dir_all(foreign.parent().unwrap()).unwrap();
        std::fs::write(&foreign, b"").unwrap();
        let executor = InstallsBinary {
            relative: PathBuf::from("unused"),
            root: temp.path().to_path_buf(),
        };

        // The executor asserts on use; an existing binary must not reach it.
        let binary = ensure_binary(&settings, &executor, true, false)
            .await
            .unwrap();
        assert_eq!(binary.kind, BinaryKind::Foreign);
    }

    #[tokio::test]
    async fn test_log_falls_back_to_scratch() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let primary = blocker.join("Logs/server.log");
        let scratch = temp.path().join("scratch/server.log");

        let (path, _file) = open_log(&primary, &scratch).await.unwrap();
        assert_eq!(path, scratch);
        assert!(scratch.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_reaches_server_process() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        forward_terminate(child.id());

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGTERM as i32));
    }
}
