use clap::{Parser, Subcommand, ValueEnum};
use snip_shortener::ConfigArgs;
use std::path::PathBuf;

pub const LOG_FORMAT_ENV: &str = "SNIP_LOG_FORMAT";
pub const DEFAULT_DELETE_WAIT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[value(name = "text")]
    Text,
    #[value(name = "json")]
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "snip", about = "Shorten, resolve and delete URLs")]
pub struct CLI {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(long, env = LOG_FORMAT_ENV, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shorten one URL. Registers a new owner when `--owner` is absent.
    Shorten {
        url: String,
        #[arg(long)]
        owner: Option<u64>,
    },
    /// Shorten a JSON array of `{correlation_id, original_url}` objects.
    ShortenBatch {
        /// Input file; stdin when absent.
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        owner: Option<u64>,
    },
    /// Print the original URL for a key or short URL.
    Resolve { key: String },
    /// List an owner's live short URLs.
    List {
        #[arg(long)]
        owner: u64,
    },
    /// Queue a JSON array of keys or short URLs for deletion.
    Delete {
        payload: String,
        #[arg(long)]
        owner: u64,
        /// How long to wait for the deletion pipeline to drain.
        #[arg(long, default_value_t = DEFAULT_DELETE_WAIT_MS)]
        wait_ms: u64,
    },
    /// Print record and owner counts.
    Stats,
    /// Check that the backend is reachable.
    Ping,
    /// Mint a new owner id.
    Register,
}
