//! Launch specification composition.
//!
//! Turns an instance's declared configuration and its port triple into the
//! ordered argument list and environment the container runtime receives.
//! Composition is pure: no I/O, and the same input always yields
//! byte-identical output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::{Instance, InstanceSpec, PortTriple};

pub mod args;
pub mod environment;

pub use args::{LaunchArgs, compose_args, map_with_suffix};
pub use environment::{LaunchInput, parse_flag, to_env};

/// Everything handed to the runtime to start one server process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub args: LaunchArgs,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Argument tokens in positional order
    pub fn argv(&self) -> Vec<String> {
        self.args.to_vec()
    }

    /// Shell-escaped command line for display; never executed.
    pub fn display_line(&self, program: &str) -> String {
        std::iter::once(program.to_string())
            .chain(self.argv())
            .map(|part| shell_escape::escape(part.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Stable identity of this spec, used to detect configuration drift
    pub fn fingerprint(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Environment variables as `KEY=VALUE` strings, sorted by key
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Stateless composer of [`LaunchSpec`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchSpecComposer;

impl LaunchSpecComposer {
    /// Compose the launch spec of `instance` on `ports`.
    ///
    /// # Errors
    ///
    /// `LaunchSpecInvalid` for configurations that would corrupt the command
    /// line, before anything reaches the runtime.
    pub fn compose(instance: &Instance, ports: PortTriple) -> Result<LaunchSpec> {
        Self::compose_spec(&instance.spec, ports, Some(&instance.id.to_string()), false)
    }

    /// Compose from a bare spec; used by the in-container entrypoint.
    pub fn compose_spec(
        spec: &InstanceSpec,
        ports: PortTriple,
        instance_id: Option<&str>,
        update_on_boot: bool,
    ) -> Result<LaunchSpec> {
        Ok(LaunchSpec {
            args: compose_args(spec, ports)?,
            env: to_env(spec, ports, instance_id, update_on_boot),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;

    fn instance() -> Instance {
        let mut spec = InstanceSpec::new("Dino's Den", "TheIsland", 20);
        spec.mods = vec![100, 200];
        spec.custom_args = vec!["-ServerPlatform=PC+XSX".to_string()];
        Instance::new("alice", spec)
    }

    #[test]
    fn test_composition_is_deterministic() {
        let instance = instance();
        let ports = PortTriple::new(7777, 27015, 27020);

        let first = LaunchSpecComposer::compose(&instance, ports).unwrap();
        let second = LaunchSpecComposer::compose(&instance, ports).unwrap();
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
        assert_eq!(first.argv(), second.argv());
    }

    #[test]
    fn test_argv_order() {
        let ports = PortTriple::new(7777, 27015, 27020);
        let spec = LaunchSpecComposer::compose(&instance(), ports).unwrap();

        assert_eq!(
            spec.argv(),
            vec![
                "TheIsland_WP?listen?SessionName=\"Dino's Den\"?RCONEnabled=False",
                "-Port=7777",
                "-QueryPort=27015",
                "-WinLiveMaxPlayers=20",
                "-NoBattlEye",
                "-mods=100,200",
                "-ServerPlatform=PC+XSX",
            ]
        );
    }

    #[test]
    fn test_display_line_quotes_selector() {
        let ports = PortTriple::new(7777, 27015, 27020);
        let spec = LaunchSpecComposer::compose(&instance(), ports).unwrap();
        let line = spec.display_line("ArkAscendedServer");
        assert!(line.starts_with("ArkAscendedServer 'TheIsland_WP?listen?SessionName="));
        assert!(line.ends_with("-mods=100,200 -ServerPlatform=PC+XSX"));
    }

    #[test]
    fn test_env_carries_instance_id() {
        let instance = instance();
        let spec =
            LaunchSpecComposer::compose(&instance, PortTriple::new(7777, 27015, 27020)).unwrap();
        assert_eq!(
            spec.env.get(crate::env::vars::INSTANCE_ID),
            Some(&instance.id.to_string())
        );
    }

    #[test]
    fn test_entrypoint_composes_identical_args() {
        let instance = instance();
        let ports = PortTriple::new(7790, 27030, 27040);
        let spec = LaunchSpecComposer::compose(&instance, ports).unwrap();

        let input = LaunchInput::from_env(&spec.env).unwrap();
        let rebuilt = LaunchSpecComposer::compose_spec(
            &input.spec,
            input.ports,
            input.instance_id.as_deref(),
            input.update_on_boot,
        )
        .unwrap();
        assert_eq!(rebuilt, spec);
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let mut instance = instance();
        instance.spec.map = String::new();
        let result = LaunchSpecComposer::compose(&instance, PortTriple::new(7777, 27015, 27020));
        assert!(matches!(result, Err(FleetError::LaunchSpecInvalid(_))));
    }
}
