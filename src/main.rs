use anyhow::{Context, Result};
use gamefleet::cli::{
    Args, BackupCommand, Commands, ConfigDiscovery, InstanceCommand, JobsCommand, TokenCommand,
};
use gamefleet::config::FleetConfig;
use gamefleet::executor::HostExecutor;
use gamefleet::fleet::{Caller, Fleet, FleetBuilder};
use gamefleet::governor::PassKind;
use gamefleet::rollout::{RolloutRunner, default_plan};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::ShowConfig = args.command {
        ConfigDiscovery::show_discovery_info(args.config.as_deref());
        return Ok(());
    }

    let config = ConfigDiscovery::load(args.config.as_deref())
        .context("failed to load configuration")?;

    if let Commands::Jobs(JobsCommand::Crontab { binary }) = &args.command {
        print_crontab(&config, binary, args.config.as_deref());
        return Ok(());
    }

    let caller = match &args.as_owner {
        Some(owner) => Caller::Tenant(owner.clone()),
        None => Caller::Operator,
    };

    info!("Starting gamefleet");
    let fleet = FleetBuilder::new(config)
        .build()
        .await
        .context("failed to initialize fleet")?;

    match args.command {
        Commands::Serve => fleet.serve().await?,
        Commands::Instance(command) => run_instance(&fleet, &caller, command).await?,
        Commands::Token(command) => run_token(&fleet, command).await?,
        Commands::Governor { pass } => {
            let report = fleet.governor().run(PassKind::from(pass)).await?;
            print_json(&report)?;
        }
        Commands::Backup(command) => run_backup(&fleet, &caller, command).await?,
        Commands::Rollout { branch } => {
            let mut rollout = fleet.config().rollout.clone();
            if let Some(branch) = branch {
                rollout.branch = branch;
            }
            let runner = RolloutRunner::new(Arc::new(HostExecutor::new()))
                .with_store(fleet.store().clone())
                .with_runtime(fleet.lifecycle().runtime().clone());
            let report = runner
                .run(&default_plan(&rollout, &fleet.config().container.image))
                .await;
            print_json(&report)?;
            if !report.succeeded() {
                anyhow::bail!("rollout failed");
            }
        }
        Commands::Jobs(_) | Commands::ShowConfig => {}
    }

    Ok(())
}

async fn run_instance(fleet: &Fleet, caller: &Caller, command: InstanceCommand) -> Result<()> {
    match command {
        InstanceCommand::Create(create) => {
            let owner = create.owner.clone();
            let spec = create.into_spec()?;
            let instance = fleet
                .create_instance_for(caller, owner.as_deref(), spec)
                .await?;
            print_json(&instance)?;
        }
        InstanceCommand::Start { id } => print_json(&fleet.start_instance(caller, id).await?)?,
        InstanceCommand::Stop { id } => print_json(&fleet.stop_instance(caller, id).await?)?,
        InstanceCommand::Update { id } => print_json(&fleet.update_instance(caller, id).await?)?,
        InstanceCommand::Delete { id } => print_json(&fleet.delete_instance(caller, id).await?)?,
        InstanceCommand::Status { id } => print_json(&fleet.status(caller, id).await?)?,
        InstanceCommand::List => {
            for instance in fleet.list_instances(caller).await? {
                println!(
                    "{}  {:<12} {:<10} {}",
                    instance.id,
                    instance.owner,
                    instance.observed.as_str(),
                    instance.spec.session_name
                );
            }
        }
        InstanceCommand::LaunchLine { id } => println!("{}", fleet.launch_line(caller, id).await?),
    }
    Ok(())
}

async fn run_token(fleet: &Fleet, command: TokenCommand) -> Result<()> {
    let token = match command {
        TokenCommand::Issue { kind, days } => fleet.tokens().issue(kind.into(), days).await?,
        TokenCommand::Activate { token, owner } => {
            fleet.tokens().activate(&token, &owner).await?
        }
        TokenCommand::Bind { id, token } => fleet.tokens().bind(id, &token).await?,
    };
    print_json(&token)
}

async fn run_backup(fleet: &Fleet, caller: &Caller, command: BackupCommand) -> Result<()> {
    let id = match &command {
        BackupCommand::Create { id }
        | BackupCommand::List { id }
        | BackupCommand::Prune { id }
        | BackupCommand::Restore { id, .. } => *id,
    };
    // Ownership check
    fleet.status(caller, id).await?;

    let backups = fleet.backups();
    match command {
        BackupCommand::Create { id } => print_json(&backups.create(id).await?),
        BackupCommand::List { id } => print_json(&backups.list(id).await?),
        BackupCommand::Prune { id } => print_json(&backups.prune(id).await?),
        BackupCommand::Restore { id, name } => print_json(&backups.restore(id, &name).await?),
    }
}

fn print_crontab(config: &FleetConfig, binary: &Path, config_path: Option<&Path>) {
    let config_flag = config_path
        .map(|p| format!(" --config {}", p.display()))
        .unwrap_or_default();
    for pass in [PassKind::Fine, PassKind::Daily, PassKind::Purge] {
        println!(
            "{} {}{} governor {}",
            pass.cron_schedule(&config.governor),
            binary.display(),
            config_flag,
            pass
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
