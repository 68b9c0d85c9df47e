use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_config::{ConfigLoader, ConfigLoaderOptions, FileConfig};

#[derive(Parser)]
#[command(name = "warden-check", about = "Validate a Warden configuration and print the effective settings")]
struct Cli {
    /// Configuration file; defaults to WARDEN_CONFIG, then warden.toml.
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Ignore .env files.
    #[arg(long)]
    no_env_file: bool,
    #[arg(long, value_enum, default_value = "toml")]
    format: OutputFormat,
    /// Exit non-zero when any warning is reported.
    #[arg(long)]
    strict: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Toml,
    Json,
    Quiet,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let load = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config,
        env_file: cli.env_file,
        skip_env_file: cli.no_env_file,
    })
    .load()
    .context("configuration rejected")?;

    for warning in load.warnings.iter() {
        eprintln!("warning: {}", warning.message);
        if let Some(hint) = &warning.hint {
            eprintln!("  hint: {hint}");
        }
    }

    match cli.format {
        OutputFormat::Toml => {
            let rendered = toml::to_string_pretty(&FileConfig::from(&load.config))
                .context("failed to render configuration")?;
            print!("{rendered}");
        }
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&load.config)
                .context("failed to render configuration")?;
            println!("{rendered}");
        }
        OutputFormat::Quiet => {}
    }

    if cli.strict && !load.warnings.is_empty() {
        anyhow::bail!("{} configuration warning(s) in strict mode", load.warnings.len());
    }
    Ok(())
}
