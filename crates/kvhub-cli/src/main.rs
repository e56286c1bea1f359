// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 kvhub Contributors

//! kvhub CLI - run commands against named key-value connections.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kvhub::{
    load_config_from, register_shutdown_hooks, Commands, Config, ConfigSet, ConnectionOptions,
    ConnectionRegistry, DefaultRouter, LoggingConfig,
};
use tracing::{info, warn};

mod telemetry;

/// How long `status` waits for connections to come up before reporting.
const STATUS_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// kvhub - named connections to RESP key-value stores
#[derive(Parser)]
#[command(name = "kvhub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file with `[connections.<name>]` tables
    #[arg(short, long, default_value = "kvhub.toml")]
    config: PathBuf,

    /// Use a single `redis://` URL as the default connection instead of a file
    #[arg(short, long, conflicts_with = "config")]
    url: Option<String>,

    /// Connection to run the command on (defaults to `default`)
    #[arg(short = 'n', long)]
    connection: Option<String>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Check the connection answers
    Ping,
    /// Read a key
    Get { key: String },
    /// Write a key
    Set {
        key: String,
        value: String,
        /// Expire after this many seconds
        #[arg(long)]
        ex: Option<u64>,
    },
    /// Delete keys
    Del {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Show registered connections and their state
    Status,
    /// Ping every connection; fails if any is unhealthy
    Health,
    /// Report health periodically until interrupted
    Watch {
        #[arg(short, long, default_value_t = 5)]
        interval_secs: u64,
    },
}

fn load(cli: &Cli) -> Result<Config> {
    match &cli.url {
        Some(url) => {
            let options = ConnectionOptions::from_url(url).context("Invalid connection URL")?;
            Ok(Config {
                connections: ConfigSet::new().with("default", options),
                logging: LoggingConfig::default(),
            })
        }
        None => load_config_from(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load(&cli)?;
    telemetry::init(&config.logging.level);

    let registry = ConnectionRegistry::default();
    let router = registry
        .init(&config.connections, false)
        .await
        .context("Failed to initialize connections")?;

    let result = run(&cli, &registry, &router).await;
    registry.shutdown().await;
    result
}

async fn run(cli: &Cli, registry: &ConnectionRegistry, router: &DefaultRouter) -> Result<()> {
    match &cli.action {
        Action::Status => {
            settle(registry).await;
            println!("status: {:?}", registry.status());
            for name in registry.names() {
                let client = registry.lookup(&name)?;
                println!("{:<16} {:<24} {}", name, client.options().address(), client.state());
            }
            Ok(())
        }
        Action::Health => {
            let health = registry.health_check().await;
            for conn in &health.connections {
                println!(
                    "{:<16} {:<12} {}",
                    conn.name,
                    conn.state.to_string(),
                    if conn.healthy { "ok" } else { "unhealthy" }
                );
            }
            if !health.is_healthy() {
                bail!("registry is unhealthy ({:?})", health.status);
            }
            Ok(())
        }
        Action::Watch { interval_secs } => watch(registry, *interval_secs).await,
        action => match &cli.connection {
            Some(name) => {
                let client = router.connection(name)?;
                execute(&client, action).await
            }
            None => execute(router, action).await,
        },
    }
}

/// Wait, bounded, for every connection to become ready.
async fn settle(registry: &ConnectionRegistry) {
    let wait_all = async {
        for name in registry.names() {
            if let Ok(client) = registry.lookup(&name) {
                let _ = client.ready().await;
            }
        }
    };
    if tokio::time::timeout(STATUS_SETTLE_TIMEOUT, wait_all).await.is_err() {
        warn!("Some connections are not ready yet");
    }
}

async fn execute<C>(target: &C, action: &Action) -> Result<()>
where
    C: Commands,
    C::Error: std::error::Error + Send + Sync + 'static,
{
    match action {
        Action::Ping => println!("{}", target.ping().await?),
        Action::Get { key } => match target.get(key).await? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Action::Set { key, value, ex } => {
            match ex {
                Some(seconds) => target.set_ex(key, value, *seconds).await?,
                None => target.set(key, value).await?,
            }
            println!("OK");
        }
        Action::Del { keys } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            println!("{}", target.del(&keys).await?);
        }
        Action::Status | Action::Health | Action::Watch { .. } => {
            unreachable!("registry-level actions are handled by run")
        }
    }
    Ok(())
}

async fn watch(registry: &ConnectionRegistry, interval_secs: u64) -> Result<()> {
    register_shutdown_hooks(registry).context("Failed to install signal handlers")?;
    info!(interval_secs, "Watching connections, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        let health = registry.health_check().await;
        for conn in &health.connections {
            if conn.healthy {
                info!(connection = %conn.name, state = %conn.state, "Healthy");
            } else {
                warn!(connection = %conn.name, state = %conn.state, "Unhealthy");
            }
        }
    }
}
