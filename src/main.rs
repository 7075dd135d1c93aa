//! # MerkleKV command-line client
//!
//! Connects to a MerkleKV server, runs one text command and prints the
//! reply. With `--subscribe`, pushed messages are printed for
//! `--listen-secs` seconds afterwards.
//!
//! # Configuration Priority
//! 1. Command line arguments (highest priority)
//! 2. Configuration file (client.toml)
//! 3. Default values (lowest priority)
//!
//! The `MERKLEKV_PASSWORD` environment variable overrides the password from
//! the configuration file.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use merkle_kv_client::{
    create_client, ClientSettings, Protocol, PushMessage, ResourceAllocator, Response,
    SubscriptionConfig,
};

#[derive(Parser, Debug)]
#[command(name = "merkle_kv_client", version, about = "MerkleKV command-line client")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "client.toml")]
    config: PathBuf,

    /// Server address as host:port (repeatable, replaces configured addresses)
    #[arg(long = "address")]
    addresses: Vec<String>,

    /// Channel to subscribe to (repeatable)
    #[arg(long = "subscribe")]
    channels: Vec<String>,

    /// How long to keep printing pushed messages after the command
    #[arg(long, default_value_t = 0)]
    listen_secs: u64,

    /// Command to run, e.g. `SET user:1 ada`
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn render(response: &Response) -> String {
    match response {
        Response::Ok => "OK".to_string(),
        Response::Pong => "PONG".to_string(),
        Response::NotFound => "(nil)".to_string(),
        Response::Value(value) | Response::Text(value) => value.clone(),
        Response::Values(values) => values
            .iter()
            .map(|(key, value)| format!("{} = {}", key, value.as_deref().unwrap_or("(nil)")))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn main() -> Result<()> {
    // Use RUST_LOG to control verbosity, e.g. RUST_LOG=debug
    env_logger::init();
    let args = Args::parse();

    let mut settings = if args.config.exists() {
        ClientSettings::load(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        ClientSettings::default()
    };
    if !args.addresses.is_empty() {
        settings.addresses = args.addresses.clone();
    }

    let mut config = settings.into_config()?;
    let mut subscriptions = config
        .subscriptions()
        .cloned()
        .unwrap_or_else(SubscriptionConfig::new);
    for channel in &args.channels {
        subscriptions = subscriptions.channel(channel.as_str());
    }
    if !subscriptions.channels().is_empty() || !subscriptions.patterns().is_empty() {
        let subscriptions = subscriptions.callback(|message: PushMessage| {
            println!("[{}] {}", message.channel, message.message_lossy());
        });
        config = config.to_builder().subscriptions(subscriptions).build();
    }

    let command = if args.command.is_empty() {
        None
    } else {
        Some(Protocol::new().parse(&args.command.join(" "))?)
    };

    // Transport I/O runs on the shared resource; this runtime only drives main
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let outcome = runtime.block_on(async {
        let client = create_client(config).await?;
        if let Some(command) = command {
            let response = client.execute(command).await?;
            println!("{}", render(&response));
        }
        if args.listen_secs > 0 {
            info!("Listening for pushed messages for {}s", args.listen_secs);
            tokio::time::sleep(Duration::from_secs(args.listen_secs)).await;
        }
        client.close();
        Ok::<_, anyhow::Error>(())
    });

    ResourceAllocator::global().shutdown_default();
    outcome
}
