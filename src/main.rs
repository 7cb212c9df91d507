//! CLI entry point for the coder bridge server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;

mod config;
mod core;
mod logging;
mod providers;
mod runtime_api;
mod stream;
#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::core::remote::ChatCompletionsFactory;
use crate::providers::PROVIDERS;
use crate::runtime_api::RuntimeApiOptions;

#[derive(Parser, Debug)]
#[command(
    name = "coder-bridge",
    author,
    version,
    about = "Local HTTP bridge that streams AI pair-programming sessions over SSE"
)]
struct Cli {
    /// Subcommand to run (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config profile name
    #[arg(long)]
    profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Workspace directory that relative reference paths resolve against
    #[arg(short, long)]
    workspace: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// List supported providers and the credentials they need
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::set_verbose(cli.verbose);
    logging::init();

    match cli.command.clone() {
        Some(Commands::Providers) => {
            print_providers();
            Ok(())
        }
        Some(Commands::Serve { host, port }) => run_serve(&cli, host, port).await,
        None => run_serve(&cli, None, None).await,
    }
}

async fn run_serve(cli: &Cli, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = load_config_from_cli(cli)?;
    let factory = ChatCompletionsFactory::new(config.retry_policy())
        .context("Failed to build HTTP client")?;
    let options = RuntimeApiOptions {
        host: host.unwrap_or_else(|| config.host()),
        port: port.unwrap_or_else(|| config.port()),
    };
    runtime_api::run_http_server(&config, Arc::new(factory), options).await
}

fn load_config_from_cli(cli: &Cli) -> Result<Config> {
    let profile = cli
        .profile
        .clone()
        .or_else(|| std::env::var("CODER_BRIDGE_PROFILE").ok());
    let mut config = Config::load(cli.config.clone(), profile.as_deref())
        .context("Failed to load configuration")?;
    if let Some(workspace) = &cli.workspace {
        config.workspace = Some(workspace.display().to_string());
    }
    config.validate()?;
    Ok(config)
}

fn print_providers() {
    println!("{:<20} {:<36} credentials", "provider", "default base url");
    for provider in PROVIDERS {
        let fields: Vec<String> = provider
            .credentials
            .slots()
            .into_iter()
            .map(|(field, slot)| format!("{} ({slot})", field.as_str()))
            .collect();
        println!(
            "{:<20} {:<36} {}",
            provider.name,
            provider.default_base_url.unwrap_or("-"),
            fields.join(", ")
        );
    }
}
