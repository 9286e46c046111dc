//! Command line argument parsing
//!
//! Subcommands:
//! - `serve`: run the service (governor scheduler, crash recovery)
//! - `instance`: create, start, stop, update, delete and inspect instances
//! - `token`: issue, activate and bind access tokens
//! - `governor`: run one governor pass now
//! - `backup`: create, list, prune and restore save-data backups
//! - `rollout`: pull, migrate, rebuild and restart
//! - `jobs crontab`: print crontab lines for the governor passes
//! - `show-config`: show configuration discovery information

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::governor::PassKind;
use crate::model::{InstanceSpec, TokenType};

#[derive(Debug, Parser)]
#[command(name = "gamefleet")]
#[command(author = "Gamefleet Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-tenant dedicated game-server fleet manager")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Act as this tenant instead of as operator
    #[arg(long = "as", value_name = "OWNER", global = true)]
    pub as_owner: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the fleet service until interrupted
    Serve,
    /// Manage instances
    #[command(subcommand)]
    Instance(InstanceCommand),
    /// Manage access tokens
    #[command(subcommand)]
    Token(TokenCommand),
    /// Run a governor pass now
    Governor {
        #[arg(value_enum)]
        pass: PassArg,
    },
    /// Manage save-data backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Pull, migrate, rebuild the image and restart the service
    Rollout {
        /// Override the configured branch
        #[arg(long)]
        branch: Option<String>,
    },
    /// Recurring job helpers
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Show configuration discovery information
    ShowConfig,
}

#[derive(Debug, Subcommand)]
pub enum InstanceCommand {
    /// Create an instance
    Create(CreateArgs),
    /// Start an instance
    Start { id: Uuid },
    /// Stop an instance
    Stop { id: Uuid },
    /// Update binaries and image, then recreate the container
    Update { id: Uuid },
    /// Delete an instance and release its ports
    Delete { id: Uuid },
    /// Show an instance with its ports and container record
    Status { id: Uuid },
    /// List instances
    List,
    /// Print the server command line an instance would run
    LaunchLine { id: Uuid },
}

#[derive(Debug, Clone, ClapArgs)]
pub struct CreateArgs {
    /// Session name shown in the server browser
    #[arg(long, required_unless_present = "spec_file")]
    pub name: Option<String>,
    /// Map, with or without the `_WP` suffix
    #[arg(long, default_value = "TheIsland")]
    pub map: String,
    #[arg(long, default_value_t = 70)]
    pub max_players: u32,
    /// Owner of the new instance (operators only)
    #[arg(long)]
    pub owner: Option<String>,
    #[arg(long)]
    pub cluster_id: Option<String>,
    /// Enable RCON; requires --admin-password
    #[arg(long)]
    pub rcon: bool,
    #[arg(long)]
    pub admin_password: Option<String>,
    #[arg(long)]
    pub server_password: Option<String>,
    /// Enable BattlEye
    #[arg(long)]
    pub battleye: bool,
    /// Run the foreign binary through the compatibility shim
    #[arg(long)]
    pub force_compat_layer: bool,
    /// Active mod id (repeatable)
    #[arg(long = "mod", value_name = "ID")]
    pub mods: Vec<u64>,
    /// Passive mod id (repeatable)
    #[arg(long = "passive-mod", value_name = "ID")]
    pub passive_mods: Vec<u64>,
    /// Extra server argument, appended verbatim (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    pub custom_args: Vec<String>,
    /// Container image override
    #[arg(long)]
    pub image: Option<String>,
    /// Load the full instance spec from a TOML file instead
    #[arg(long, conflicts_with = "name")]
    pub spec_file: Option<PathBuf>,
}

impl CreateArgs {
    /// Build the instance spec from the flags, or load it from `--spec-file`.
    pub fn into_spec(self) -> Result<InstanceSpec> {
        if let Some(path) = &self.spec_file {
            let content = fs::read_to_string(path)?;
            return toml::from_str(&content)
                .map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)));
        }

        let mut spec = InstanceSpec::new(self.name.unwrap_or_default(), self.map, self.max_players);
        spec.cluster_id = self.cluster_id;
        spec.rcon_enabled = self.rcon;
        spec.admin_password = self.admin_password;
        spec.server_password = self.server_password;
        spec.anti_cheat = self.battleye;
        spec.force_compat_layer = self.force_compat_layer;
        spec.mods = self.mods;
        spec.passive_mods = self.passive_mods;
        spec.custom_args = self.custom_args;
        spec.image = self.image;
        Ok(spec)
    }
}

#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    /// Issue a new, inactive token
    Issue {
        #[arg(long, value_enum, default_value_t = TokenTypeArg::Issuance)]
        kind: TokenTypeArg,
        /// Days until expiry; defaults to governor.token_expiry_days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Activate a token for an owner
    Activate {
        token: String,
        #[arg(long)]
        owner: String,
    },
    /// Bind an active token to an instance
    Bind { id: Uuid, token: String },
}

#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    Create { id: Uuid },
    List { id: Uuid },
    /// Keep only the newest backup.keep archives
    Prune { id: Uuid },
    /// Restore a stopped instance from a named archive
    Restore { id: Uuid, name: String },
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// Print crontab lines driving the governor passes
    Crontab {
        /// Path of the gamefleet binary in the crontab lines
        #[arg(long, default_value = "/usr/local/bin/gamefleet")]
        binary: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PassArg {
    Fine,
    Daily,
    Purge,
}

impl From<PassArg> for PassKind {
    fn from(arg: PassArg) -> Self {
        match arg {
            PassArg::Fine => PassKind::Fine,
            PassArg::Daily => PassKind::Daily,
            PassArg::Purge => PassKind::Purge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TokenTypeArg {
    Issuance,
    Activation,
}

impl From<TokenTypeArg> for TokenType {
    fn from(arg: TokenTypeArg) -> Self {
        match arg {
            TokenTypeArg::Issuance => TokenType::Issuance,
            TokenTypeArg::Activation => TokenType::Activation,
        }
    }
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    /// Default log filter for the chosen verbosity
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "gamefleet=debug"
        } else {
            "gamefleet=info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_instance_create() {
        let args = parse(&[
            "gamefleet",
            "instance",
            "create",
            "--name",
            "Friday Night",
            "--map",
            "Aberration",
            "--mod",
            "100",
            "--mod",
            "200",
            "--arg",
            "-NoTransferFromFiltering",
        ]);

        match args.command {
            Commands::Instance(InstanceCommand::Create(create)) => {
                assert_eq!(create.name.as_deref(), Some("Friday Night"));
                assert_eq!(create.max_players, 70);

                let spec = create.into_spec().unwrap();
                assert_eq!(spec.session_name, "Friday Night");
                assert_eq!(spec.map, "Aberration");
                assert_eq!(spec.mods, vec![100, 200]);
                assert_eq!(spec.custom_args, vec!["-NoTransferFromFiltering"]);
            }
            other => panic!("Expected instance create, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&[
            "gamefleet",
            "governor",
            "fine",
            "--config",
            "/etc/fleet.toml",
            "-v",
        ]);
        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("/etc/fleet.toml")));
        assert_eq!(args.log_filter(), "gamefleet=debug");
        match args.command {
            Commands::Governor { pass } => assert_eq!(PassKind::from(pass), PassKind::Fine),
            other => panic!("Expected governor, got {:?}", other),
        }
    }

    #[test]
    fn test_token_issue_defaults() {
        let args = parse(&["gamefleet", "token", "issue"]);
        match args.command {
            Commands::Token(TokenCommand::Issue { kind, days }) => {
                assert_eq!(TokenType::from(kind), TokenType::Issuance);
                assert!(days.is_none());
            }
            other => panic!("Expected token issue, got {:?}", other),
        }
    }

    #[test]
    fn test_create_needs_name_or_spec_file() {
        assert!(Args::try_parse_from(["gamefleet", "instance", "create"]).is_err());
        assert!(
            Args::try_parse_from(["gamefleet", "instance", "create", "--spec-file", "s.toml"])
                .is_ok()
        );
    }

    #[test]
    fn test_instance_id_must_be_uuid() {
        assert!(Args::try_parse_from(["gamefleet", "instance", "start", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_tenant_flag() {
        let id = Uuid::new_v4().to_string();
        let args = parse(&["gamefleet", "--as", "alice", "instance", "start", &id]);
        assert_eq!(args.as_owner.as_deref(), Some("alice"));
    }
}
