//! CLI-specific functionality for the fleet manager
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{
    Args, BackupCommand, Commands, CreateArgs, InstanceCommand, JobsCommand, PassArg,
    TokenCommand,
};
pub use config::ConfigDiscovery;
