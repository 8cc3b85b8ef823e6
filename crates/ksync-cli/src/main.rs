//! 🚀 ksync-cli: the front door, the bouncer, the maitre d' of ksync.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config, sets up logging,
//! and then lets the real code do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ksync", about = "🔄 Keeps Elasticsearch in sync with wherever your data actually lives")]
struct Cli {
    /// TOML config file. Missing is fine: env vars (KSYNC_*) and defaults fill in.
    #[arg(short, long, default_value = "ksync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll, schedule and sync until Ctrl-C (the default)
    Run,
    /// Show the connector types this build knows about
    ListConnectors,
}

/// 🚀 main(): where it all begins. The "I pressed F5 and held my breath" moment.
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 println! debugging is a lifestyle choice we're trying to move past
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::ListConnectors => {
            list_connectors();
            Ok(())
        }
        Command::Run => {
            // 🔒 a path that doesn't exist is skipped, a path we can't even check is an error
            let config_file = match cli.config.try_exists().with_context(|| {
                format!(
                    "💀 Couldn't check whether the config file exists. Was checking here: '{}'",
                    cli.config.display()
                )
            })? {
                true => Some(cli.config.as_path()),
                false => None,
            };
            let app_config = ksync::app_config::load_config(config_file)
                .context("💀 We couldn't load the config. Take a look at the file and the KSYNC_ env vars")?;

            if let Err(err) = ksync::run(app_config).await {
                report(&err);
                // 🗑️ Exit with prejudice. Process exitus maximus.
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn list_connectors() {
    let registry = ksync::connectors::default_registry();
    let mut table = Table::new();
    table.set_header(vec!["service_type", "name", "configurable fields"]);
    for registration in registry.registrations() {
        let fields: Vec<&str> = registration.configurable_fields.keys().map(String::as_str).collect();
        table.add_row(vec![
            registration.service_type.clone(),
            registration.display_name.clone(),
            fields.join(", "),
        ]);
    }
    println!("{table}");
}

// 🧅 peel the onion of sadness, one layer at a time
fn report(err: &anyhow::Error) {
    error!("💀 error: {}", err);
    let mut smells_like_connection_trouble = false;
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {}", cause);
        let cause = cause.to_string();
        if cause.contains("error sending request")
            || cause.contains("onnection refused")
            || cause.contains("tcp connect error")
            || cause.contains("dns error")
        {
            smells_like_connection_trouble = true;
        }
    }
    if smells_like_connection_trouble {
        error!(
            "🔧 hint: looks like Elasticsearch isn't reachable. Check it's running and that \
             `elasticsearch.url` points at it. If you're using Docker, `docker ps` is your friend. ☕"
        );
    }
}
