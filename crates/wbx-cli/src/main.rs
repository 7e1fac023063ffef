//! 🚀 wbx-cli: the front door of the bridge.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Thin wrapper: parse args, set up logging, load config, then let the library do the
//! heavy lifting. Like a manager. 🦆

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🌉 Move rows between a pipeline and a warehouse table, all or nothing.
#[derive(Debug, Parser)]
#[command(name = "wbx", version, about)]
struct Cli {
    /// 📋 TOML config file. `wbx.toml` is used when it exists and nothing else is given.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 📥 Append the configured part files to the sink target and commit them.
    Import,
    /// 📤 Run the configured query and write the rows out as JSON.
    Export,
    /// 🔁 Run the configured query and commit its rows into the sink target.
    Copy,
}

impl From<&Command> for wbx::Mode {
    fn from(command: &Command) -> Self {
        match command {
            Command::Import => wbx::Mode::Import,
            Command::Export => wbx::Mode::Export,
            Command::Copy => wbx::Mode::Copy,
        }
    }
}

const DEFAULT_CONFIG_FILE: &str = "wbx.toml";

/// 🔍 An explicit `--config` must exist. The default file is used only when it is there.
fn resolve_config_file(explicit: Option<PathBuf>, default: &Path) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => {
            let exists = path.try_exists().with_context(|| {
                format!("💀 Could not check whether the config file exists: '{}'", path.display())
            })?;
            if !exists {
                anyhow::bail!(
                    "💀 Configuration file not found at '{}'. If it's a relative path, check your cwd, or use an absolute path.",
                    path.display()
                );
            }
            Ok(Some(path))
        }
        None => Ok(default.is_file().then(|| default.to_path_buf())),
    }
}

/// 🕵️ Does any cause in the chain smell like an unreachable endpoint?
fn looks_like_connection_trouble(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let cause = cause.to_string();
        cause.contains("error sending request")
            || cause.contains("onnection refused")
            || cause.contains("tcp connect error")
            || cause.contains("dns error")
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = resolve_config_file(cli.config, Path::new(DEFAULT_CONFIG_FILE))?;
    let app_config = wbx::app_config::load_config(config_file.as_deref())
        .context("💀 In wbx-cli, we couldn't load the config. Take a look at the file and the WBX_* variables.")?;
    wbx::run(app_config, (&cli.command).into()).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("💀 error: {err}");
        // -- 🧅 peel the onion, one layer at a time
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {cause}");
        }
        if looks_like_connection_trouble(&err) {
            error!(
                "🔧 hint: looks like the warehouse endpoint isn't reachable. \
                Check storage_endpoint / bigquery_endpoint in [warehouse.BigQuery], \
                and if you're pointing at a local emulator, make sure it's actually running. ☕"
            );
        }
        std::process::exit(1);
    }
}
