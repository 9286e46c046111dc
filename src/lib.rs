//! # Gamefleet
//!
//! A multi-tenant manager for dedicated game-server instances. Each instance
//! runs in its own container with its own port triple, server binaries and
//! mods, and stays up only while its owner holds a valid access token.
//!
//! ## Architecture Overview
//!
//! - **[`allocator`]**: unique game/query/RCON port triples, re-verified on the host
//! - **[`provision`]**: SteamCMD installs, binary resolution and workshop mods
//! - **[`launch`]**: the server command line and container environment for an instance
//! - **[`container`]**: the container runtime boundary (Docker or Podman via bollard)
//! - **[`lifecycle`]**: create, start, stop, update and delete with per-instance serialization
//! - **[`governor`]**: recurring passes that stop, warn about and purge expired instances
//! - **[`tokens`]**: issuing, activating and binding access tokens
//! - **[`backup`]**: save-data archives with pruning and restore
//! - **[`rollout`]**: pull, migrate, rebuild and restart as one ordered plan
//! - **[`entrypoint`]**: the in-container process that installs and runs the server
//! - **[`fleet`]**: composition root with ownership and token checks
//!
//! Persistent state lives in a sqlx-backed [`store`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gamefleet::config::FleetConfig;
//! use gamefleet::fleet::{Caller, FleetBuilder};
//! use gamefleet::model::{InstanceSpec, TokenType};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fleet = FleetBuilder::new(FleetConfig::default()).build().await?;
//!     let alice = Caller::Tenant("alice".to_string());
//!
//!     let token = fleet.tokens().issue(TokenType::Issuance, None).await?;
//!     fleet.tokens().activate(&token.token, "alice").await?;
//!
//!     let instance = fleet
//!         .create_instance(&alice, InstanceSpec::new("Friday Night", "TheIsland", 20))
//!         .await?;
//!     fleet.tokens().bind(instance.id, &token.token).await?;
//!     fleet.start_instance(&alice, instance.id).await?;
//!     Ok(())
//! }
//! ```

/// Environment constants and path utilities.
///
/// Centralizes hardcoded paths, directory names and container environment
/// variable names.
pub mod env;

pub mod error;

pub mod config;

pub mod model;

/// Persistent fleet state: instances, port assignments, container records,
/// tokens and leases.
pub mod store;

pub mod allocator;

/// Command execution on the host, used for SteamCMD and rollout steps.
pub mod executor;

pub mod provision;

pub mod launch;

pub mod container;

pub mod lifecycle;

pub mod governor;

pub mod tokens;

pub mod backup;

pub mod rollout;

pub mod entrypoint;

pub mod fleet;

// CLI module for command-line interface
pub mod cli;

pub use config::FleetConfig;
pub use error::{FleetError, Result};
pub use fleet::{Caller, Fleet, FleetBuilder};
pub use model::{AccessToken, Instance, InstanceId, InstanceSpec, ObservedState, TokenType};
