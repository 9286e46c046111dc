//! The three positional argument groups of a server command line.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::env::MAP_SUFFIX;
use crate::error::{FleetError, Result};
use crate::model::{InstanceSpec, PortTriple};

const CLUSTER_ID_PATTERN: &str = r"^[A-Za-z0-9_-]+$";

pub const MAX_PLAYERS_LIMIT: u32 = 255;

/// Ordered argument groups. The binary parses positionally, so groups are
/// never reordered or merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchArgs {
    /// Group 1: map selector and `?`-delimited options, one token
    pub selector: String,
    /// Group 2: ports, capacity and cluster flags
    pub network: Vec<String>,
    /// Group 3: anti-cheat and mod flags
    pub compat: Vec<String>,
    /// Custom arguments, appended verbatim after group 3
    pub custom: Vec<String>,
}

impl LaunchArgs {
    /// Every token in order
    pub fn to_vec(&self) -> Vec<String> {
        let mut all =
            Vec::with_capacity(1 + self.network.len() + self.compat.len() + self.custom.len());
        all.push(self.selector.clone());
        all.extend(self.network.iter().cloned());
        all.extend(self.compat.iter().cloned());
        all.extend(self.custom.iter().cloned());
        all
    }
}

/// Append the map suffix unless the name already carries it.
pub fn map_with_suffix(map: &str) -> String {
    if map.ends_with(MAP_SUFFIX) {
        map.to_string()
    } else {
        format!("{}{}", map, MAP_SUFFIX)
    }
}

fn bool_option(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn invalid(message: impl Into<String>) -> FleetError {
    FleetError::LaunchSpecInvalid(message.into())
}

fn check_option_value(field: &str, value: &str) -> Result<()> {
    if value.contains('?') || value.contains('"') || value.chars().any(char::is_whitespace) {
        return Err(invalid(format!(
            "{} must not contain '?', '\"' or whitespace",
            field
        )));
    }
    Ok(())
}

/// Reject configurations that would produce a corrupt or contradictory
/// command line.
pub fn validate(spec: &InstanceSpec, ports: PortTriple) -> Result<()> {
    let map = spec.map.trim();
    if map.is_empty() {
        return Err(invalid("map name is empty"));
    }
    if spec.map.contains('?') || spec.map.chars().any(char::is_whitespace) {
        return Err(invalid(format!(
            "map name {:?} contains '?' or whitespace",
            spec.map
        )));
    }

    if spec.session_name.trim().is_empty() {
        return Err(invalid("session name is empty"));
    }
    if spec.session_name.contains('?') || spec.session_name.contains('"') {
        return Err(invalid("session name must not contain '?' or '\"'"));
    }

    match spec.admin_password.as_deref() {
        Some(pw) if !pw.is_empty() => check_option_value("admin password", pw)?,
        _ if spec.rcon_enabled => {
            return Err(invalid("RCON is enabled but no admin password is set"));
        }
        _ => {}
    }
    if let Some(pw) = spec.server_password.as_deref() {
        check_option_value("server password", pw)?;
    }

    if !ports.is_pairwise_distinct() {
        return Err(invalid(format!("ports are not distinct: {}", ports)));
    }

    if spec.max_players == 0 || spec.max_players > MAX_PLAYERS_LIMIT {
        return Err(invalid(format!(
            "max players {} outside 1..={}",
            spec.max_players, MAX_PLAYERS_LIMIT
        )));
    }

    if let Some(dup) = spec.mods.iter().find(|id| spec.passive_mods.contains(id)) {
        return Err(invalid(format!(
            "mod {} is listed as both active and passive",
            dup
        )));
    }

    if let Some(cluster) = spec.cluster_id.as_deref()
        && !Regex::new(CLUSTER_ID_PATTERN)
            .map_err(|e| invalid(e.to_string()))?
            .is_match(cluster)
    {
        return Err(invalid(format!("cluster id {:?} is not [A-Za-z0-9_-]+", cluster)));
    }

    Ok(())
}

/// Group 1 token.
pub fn selector(spec: &InstanceSpec, ports: PortTriple) -> String {
    let mut token = map_with_suffix(spec.map.trim());
    token.push_str("?listen");
    token.push_str(&format!("?SessionName=\"{}\"", spec.session_name));
    token.push_str(&format!("?RCONEnabled={}", bool_option(spec.rcon_enabled)));
    if spec.rcon_enabled {
        token.push_str(&format!("?RCONPort={}", ports.rcon));
    }
    if let Some(pw) = spec.admin_password.as_deref().filter(|pw| !pw.is_empty()) {
        token.push_str(&format!("?ServerAdminPassword={}", pw));
    }
    if let Some(pw) = spec.server_password.as_deref().filter(|pw| !pw.is_empty()) {
        token.push_str(&format!("?ServerPassword={}", pw));
    }
    token
}

/// Group 2 tokens.
pub fn network_flags(spec: &InstanceSpec, ports: PortTriple) -> Vec<String> {
    let mut flags = vec![
        format!("-Port={}", ports.game),
        format!("-QueryPort={}", ports.query),
        format!("-WinLiveMaxPlayers={}", spec.max_players),
    ];
    if let Some(cluster) = spec.cluster_id.as_deref() {
        flags.push(format!("-clusterID={}", cluster));
    }
    flags
}

/// Group 3 tokens, without the custom arguments.
pub fn compat_flags(spec: &InstanceSpec) -> Vec<String> {
    let mut flags = vec![if spec.anti_cheat {
        "-UseBattlEye".to_string()
    } else {
        "-NoBattlEye".to_string()
    }];
    if !spec.mods.is_empty() {
        flags.push(format!("-mods={}", join_ids(&spec.mods)));
    }
    if !spec.passive_mods.is_empty() {
        flags.push(format!("-passivemods={}", join_ids(&spec.passive_mods)));
    }
    flags
}

/// Validate and build all groups.
pub fn compose_args(spec: &InstanceSpec, ports: PortTriple) -> Result<LaunchArgs> {
    validate(spec, ports)?;
    Ok(LaunchArgs {
        selector: selector(spec, ports),
        network: network_flags(spec, ports),
        compat: compat_flags(spec),
        custom: spec.custom_args.clone(),
    })
}
