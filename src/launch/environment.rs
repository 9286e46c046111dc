//! Container environment encoding of a launch configuration.
//!
//! The entrypoint inside the container only sees environment variables, so
//! everything the composer needs is written here and read back by
//! [`LaunchInput::from_env`].

use std::collections::BTreeMap;

use crate::env::vars;
use crate::error::{FleetError, Result};
use crate::model::{InstanceSpec, PortTriple};

/// Logical launch input recovered from a container environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInput {
    pub spec: InstanceSpec,
    pub ports: PortTriple,
    pub update_on_boot: bool,
    pub instance_id: Option<String>,
}

fn flag(value: bool) -> String {
    value.to_string()
}

fn ids(list: &[u64]) -> String {
    list.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Environment for a container running `spec` on `ports`.
pub fn to_env(
    spec: &InstanceSpec,
    ports: PortTriple,
    instance_id: Option<&str>,
    update_on_boot: bool,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set(vars::MAP_NAME, spec.map.clone());
    set(vars::SESSION_NAME, spec.session_name.clone());
    set(vars::SERVER_PORT, ports.game.to_string());
    set(vars::QUERY_PORT, ports.query.to_string());
    set(vars::RCON_PORT, ports.rcon.to_string());
    set(vars::RCON_ENABLED, flag(spec.rcon_enabled));
    set(vars::MAX_PLAYERS, spec.max_players.to_string());
    set(vars::BATTLEEYE, flag(spec.anti_cheat));
    set(vars::FORCE_COMPAT_LAYER, flag(spec.force_compat_layer));
    set(vars::UPDATE_SERVER, flag(update_on_boot));

    if let Some(pw) = &spec.admin_password {
        set(vars::SERVER_ADMIN_PASSWORD, pw.clone());
    }
    if let Some(pw) = &spec.server_password {
        set(vars::SERVER_PASSWORD, pw.clone());
    }
    if let Some(cluster) = &spec.cluster_id {
        set(vars::CLUSTER_ID, cluster.clone());
    }
    if !spec.mods.is_empty() {
        set(vars::MOD_IDS, ids(&spec.mods));
    }
    if !spec.passive_mods.is_empty() {
        set(vars::PASSIVE_MOD_IDS, ids(&spec.passive_mods));
    }
    if !spec.custom_args.is_empty() {
        // JSON keeps arguments containing spaces intact
        let encoded =
            serde_json::to_string(&spec.custom_args).unwrap_or_else(|_| spec.custom_args.join(" "));
        set(vars::CUSTOM_SERVER_ARGS, encoded);
    }
    if let Some(id) = instance_id {
        set(vars::INSTANCE_ID, id.to_string());
    }

    env
}

/// Parse a boolean the way operators write them in env files.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_ids(key: &str, value: &str) -> Result<Vec<u64>> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>().map_err(|_| {
                FleetError::LaunchSpecInvalid(format!("{} has non-numeric id {:?}", key, part))
            })
        })
        .collect()
}

/// Custom arguments: a JSON array, or whitespace-separated for hand-written values.
pub fn parse_custom_args(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[')
        && let Ok(args) = serde_json::from_str::<Vec<String>>(trimmed)
    {
        return args;
    }
    trimmed.split_whitespace().map(str::to_string).collect()
}

impl LaunchInput {
    /// Rebuild the launch input from environment variables.
    pub fn from_env(env: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| env.get(key).map(String::as_str).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| FleetError::LaunchSpecInvalid(format!("{} is not set", key)))
        };
        let port = |key: &str| -> Result<u16> {
            required(key)?.trim().parse::<u16>().map_err(|_| {
                FleetError::LaunchSpecInvalid(format!("{} is not a valid port", key))
            })
        };

        let max_players = required(vars::MAX_PLAYERS)?
            .trim()
            .parse::<u32>()
            .map_err(|_| FleetError::LaunchSpecInvalid("MAX_PLAYERS is not a number".into()))?;

        let mut spec = InstanceSpec::new(
            required(vars::SESSION_NAME)?,
            required(vars::MAP_NAME)?,
            max_players,
        );
        spec.rcon_enabled = get(vars::RCON_ENABLED).is_some_and(parse_flag);
        spec.anti_cheat = get(vars::BATTLEEYE).is_some_and(parse_flag);
        spec.force_compat_layer = get(vars::FORCE_COMPAT_LAYER).is_some_and(parse_flag);
        spec.admin_password = get(vars::SERVER_ADMIN_PASSWORD).map(str::to_string);
        spec.server_password = get(vars::SERVER_PASSWORD).map(str::to_string);
        spec.cluster_id = get(vars::CLUSTER_ID).map(str::to_string);
        spec.mods = get(vars::MOD_IDS)
            .map(|v| parse_ids(vars::MOD_IDS, v))
            .transpose()?
            .unwrap_or_default();
        spec.passive_mods = get(vars::PASSIVE_MOD_IDS)
            .map(|v| parse_ids(vars::PASSIVE_MOD_IDS, v))
            .transpose()?
            .unwrap_or_default();
        spec.custom_args = get(vars::CUSTOM_SERVER_ARGS)
            .map(parse_custom_args)
            .unwrap_or_default();

        Ok(Self {
            spec,
            ports: PortTriple::new(
                port(vars::SERVER_PORT)?,
                port(vars::QUERY_PORT)?,
                port(vars::RCON_PORT)?,
            ),
            update_on_boot: get(vars::UPDATE_SERVER).is_some_and(parse_flag),
            instance_id: get(vars::INSTANCE_ID).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_spec() -> InstanceSpec {
        let mut spec = InstanceSpec::new("Friday Night", "Aberration_WP", 40);
        spec.rcon_enabled = true;
        spec.admin_password = Some("secret".to_string());
        spec.server_password = Some("letmein".to_string());
        spec.cluster_id = Some("eu-1".to_string());
        spec.anti_cheat = true;
        spec.mods = vec![100, 200];
        spec.passive_mods = vec![300];
        spec.custom_args = vec!["-log".to_string(), "-MULTIHOME=10.0.0.1".to_string()];
        spec
    }

    #[test]
    fn test_env_reads_back_to_same_input() {
        let spec = full_spec();
        let ports = PortTriple::new(7778, 27016, 27021);
        let env = to_env(&spec, ports, Some("abc"), true);

        let input = LaunchInput::from_env(&env).unwrap();
        assert_eq!(input.spec, spec);
        assert_eq!(input.ports, ports);
        assert!(input.update_on_boot);
        assert_eq!(input.instance_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_optional_keys_omitted() {
        let spec = InstanceSpec::new("Plain", "TheIsland", 10);
        let env = to_env(&spec, PortTriple::new(7777, 27015, 27020), None, false);
        assert!(!env.contains_key(vars::MOD_IDS));
        assert!(!env.contains_key(vars::SERVER_PASSWORD));
        assert!(!env.contains_key(vars::INSTANCE_ID));
        assert_eq!(env[vars::RCON_ENABLED], "false");
    }

    #[test]
    fn test_hand_written_values() {
        let mut env = BTreeMap::new();
        for (k, v) in [
            (vars::MAP_NAME, "TheIsland"),
            (vars::SESSION_NAME, "Hand Written"),
            (vars::SERVER_PORT, "7777"),
            (vars::QUERY_PORT, "27015"),
            (vars::RCON_PORT, "27020"),
            (vars::MAX_PLAYERS, "70"),
            (vars::BATTLEEYE, "True"),
            (vars::MOD_IDS, "100, 200"),
            (vars::CUSTOM_SERVER_ARGS, "-log -NoTransferFromFiltering"),
        ] {
            env.insert(k.to_string(), v.to_string());
        }

        let input = LaunchInput::from_env(&env).unwrap();
        assert!(input.spec.anti_cheat);
        assert_eq!(input.spec.mods, vec![100, 200]);
        assert_eq!(input.spec.custom_args, vec!["-log", "-NoTransferFromFiltering"]);
        assert!(!input.update_on_boot);
    }

    #[test]
    fn test_missing_required_key() {
        let env = BTreeMap::new();
        assert!(matches!(
            LaunchInput::from_env(&env),
            Err(FleetError::LaunchSpecInvalid(_))
        ));
    }
}
