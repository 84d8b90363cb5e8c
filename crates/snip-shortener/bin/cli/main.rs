mod cli;

use crate::cli::{Command, LogFormat, CLI};
use anyhow::{anyhow, Context};
use clap::Parser;
use serde::Serialize;
use snip_core::{OwnerId, ShortKey};
use snip_shortener::{BatchItem, Settings, ShortenerService};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CLI::parse();
    init_tracing(cli.log_format);

    let settings = Settings::load(cli.config).context("failed to load configuration")?;
    info!(
        backend = %settings.backend.kind(),
        base_url = %settings.base_url,
        "starting snip"
    );

    let service = ShortenerService::open(&settings)
        .await
        .context("failed to open storage")?;

    let outcome = run(&service, cli.command).await;
    service.close().await.context("failed to close storage")?;
    outcome
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(service: &ShortenerService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Shorten { url, owner } => {
            let owner = owner_or_register(service, owner).await?;
            let shortened = service.shorten(&url, owner).await?;
            print_json(&serde_json::json!({
                "owner": owner,
                "key": shortened.key,
                "short_url": shortened.short_url,
                "conflict": shortened.conflict,
            }))
        }
        Command::ShortenBatch { input, owner } => {
            let owner = owner_or_register(service, owner).await?;
            let raw = read_input(input.as_deref())?;
            let items: Vec<BatchItem> =
                serde_json::from_str(&raw).context("batch input must be a JSON array")?;
            let results = service.shorten_batch(items, owner).await?;
            print_json(&results)
        }
        Command::Resolve { key } => {
            let key = ShortKey::from_short_url(service.base_url(), &key)
                .ok_or_else(|| anyhow!("not a short key: {key}"))?;
            println!("{}", service.resolve(key).await?);
            Ok(())
        }
        Command::List { owner } => print_json(&service.list(OwnerId::new(owner)).await),
        Command::Delete {
            payload,
            owner,
            wait_ms,
        } => {
            let accepted = service.delete(&payload, OwnerId::new(owner))?;
            info!(accepted, "queued delete request");
            wait_for_deletes(service, Duration::from_millis(wait_ms)).await;
            Ok(())
        }
        Command::Stats => print_json(&service.stats().await?),
        Command::Ping => {
            service.ping().await?;
            println!("ok");
            Ok(())
        }
        Command::Register => print_json(&service.register_owner().await?),
    }
}

async fn owner_or_register(
    service: &ShortenerService,
    owner: Option<u64>,
) -> anyhow::Result<OwnerId> {
    match owner {
        Some(owner) => Ok(OwnerId::new(owner)),
        None => {
            let owner = service.register_owner().await?;
            info!(%owner, "registered new owner");
            Ok(owner)
        }
    }
}

fn read_input(path: Option<&Path>) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => std::io::read_to_string(std::io::stdin()).context("failed to read stdin"),
    }
}

async fn wait_for_deletes(service: &ShortenerService, limit: Duration) {
    let deadline = Instant::now() + limit;
    while service.pending_deletes() > 0 {
        if Instant::now() >= deadline {
            warn!(
                pending = service.pending_deletes(),
                "gave up waiting for deletions"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
