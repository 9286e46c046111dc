//! Container PID 1: install the server if needed, then run it.

use anyhow::Result;
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gamefleet=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let environment: BTreeMap<String, String> = std::env::vars().collect();
    let argv: Vec<String> = std::env::args().skip(1).collect();

    let code = gamefleet::entrypoint::run(environment, argv).await?;
    std::process::exit(code);
}
