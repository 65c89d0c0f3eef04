//! Taskforge CLI - Main entry point

mod demo;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use taskforge_foundation::EngineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Taskforge - bounded-concurrency task execution engine
#[derive(Parser, Debug)]
#[command(name = "taskforge")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Engine config file (.toml or .json); defaults to global + project config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a batch of sleeping tasks through the engine
    Demo(demo::DemoArgs),
    /// Print the effective engine configuration
    Config {
        /// Read this file instead of the default locations
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Write the effective configuration to the project config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match args.command {
        Command::Demo(demo_args) => {
            let config = load_config(args.config.as_deref())?;
            demo::run(config, demo_args).await
        }
        Command::Config { file, save } => {
            let config = load_config(file.as_deref().or(args.config.as_deref()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save_project()?;
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
    }
}

/// Explicit file (plus env overrides), or the merged global/project config
fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)?;
            config.apply_env()?;
            config.validate()?;
            config
        }
        None => EngineConfig::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config: {}", e);
            EngineConfig::default()
        }),
    };
    Ok(config)
}
