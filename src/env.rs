//! Environment constants and path utilities for the fleet manager.
//!
//! This module centralizes the hardcoded names shared between the managing
//! service and the in-container entrypoint, so both sides agree on the
//! container environment contract.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const FLEET_DIR_NAME: &str = ".gamefleet";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "gamefleet.toml";

/// Prefix for every container this system creates. Keeps our containers apart
/// from unrelated workloads sharing the host.
pub const CONTAINER_NAME_PREFIX: &str = "gamefleet";

/// Label keys attached to managed containers
pub mod labels {
    pub const MANAGED: &str = "gamefleet.managed";
    pub const INSTANCE: &str = "gamefleet.instance";
}

/// Steam application id of the dedicated server package
pub const DEFAULT_APP_ID: &str = "2430930";

/// Suffix the server binary expects on world/map names
pub const MAP_SUFFIX: &str = "_WP";

/// Environment variable names forming the container startup contract
pub mod vars {
    pub const INSTANCE_ID: &str = "INSTANCE_ID";
    pub const MAP_NAME: &str = "MAP_NAME";
    pub const SESSION_NAME: &str = "SESSION_NAME";
    pub const SERVER_PORT: &str = "SERVER_PORT";
    pub const QUERY_PORT: &str = "QUERY_PORT";
    pub const RCON_PORT: &str = "RCON_PORT";
    pub const RCON_ENABLED: &str = "RCON_ENABLED";
    pub const SERVER_ADMIN_PASSWORD: &str = "SERVER_ADMIN_PASSWORD";
    pub const SERVER_PASSWORD: &str = "SERVER_PASSWORD";
    pub const MAX_PLAYERS: &str = "MAX_PLAYERS";
    pub const CLUSTER_ID: &str = "CLUSTER_ID";
    pub const BATTLEEYE: &str = "BATTLEEYE";
    pub const FORCE_COMPAT_LAYER: &str = "FORCE_COMPAT_LAYER";
    pub const MOD_IDS: &str = "MOD_IDS";
    pub const PASSIVE_MOD_IDS: &str = "PASSIVE_MOD_IDS";
    pub const CUSTOM_SERVER_ARGS: &str = "CUSTOM_SERVER_ARGS";
    pub const UPDATE_SERVER: &str = "UPDATE_SERVER";
    pub const SERVER_DIR: &str = "SERVER_DIR";
    pub const STEAMCMD_PATH: &str = "STEAMCMD_PATH";
    pub const APP_ID: &str = "APP_ID";
    pub const COMPAT_SHIM: &str = "COMPAT_SHIM";
}

/// Per-instance directory names below the data root
pub mod instance {
    pub const INSTANCES_DIR_NAME: &str = "instances";
    pub const SERVER_DIR_NAME: &str = "server";
    pub const LOGS_DIR_NAME: &str = "logs";
    pub const BACKUPS_DIR_NAME: &str = "backups";
}

/// Server log location used by the entrypoint, relative to the server dir
pub const SERVER_LOG_RELATIVE: &str = "ShooterGame/Saved/Logs/gamefleet-server.log";

/// Scratch log location used when the server volume is not writable
pub const SCRATCH_LOG_PATH: &str = "/tmp/gamefleet/server.log";

/// Save-data directory relative to an install dir
pub const SAVED_DIR_RELATIVE: &str = "ShooterGame/Saved";

/// Build the directory holding everything that belongs to one instance
pub fn instance_dir_path(data_root: &Path, instance_id: &str) -> PathBuf {
    data_root
        .join(instance::INSTANCES_DIR_NAME)
        .join(instance_id)
}

/// Build the instance install directory (binaries, mods, save data)
pub fn instance_server_dir_path(data_root: &Path, instance_id: &str) -> PathBuf {
    instance_dir_path(data_root, instance_id).join(instance::SERVER_DIR_NAME)
}

/// Build the instance log directory for captured command output
pub fn instance_logs_dir_path(data_root: &Path, instance_id: &str) -> PathBuf {
    instance_dir_path(data_root, instance_id).join(instance::LOGS_DIR_NAME)
}

/// Build the instance backup directory
pub fn instance_backups_dir_path(data_root: &Path, instance_id: &str) -> PathBuf {
    instance_dir_path(data_root, instance_id).join(instance::BACKUPS_DIR_NAME)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(FLEET_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(FLEET_DIR_NAME).join(CONFIG_FILE_NAME)
}
