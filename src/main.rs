//! Floppy: run a fleet of local development services behind one live console.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! sets up logging, loads `floppy.toml` and dispatches to the orchestrator.

mod app;
mod clipboard;
mod config;
mod console;
mod error;
mod events;
mod launcher;
mod orchestrator;
mod output;
mod platform;
mod ports;
mod process;
mod shutdown;
mod state;
mod stats;
#[cfg(test)]
mod testing;
mod toolchain;
mod tui;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{find_config, load_config};
use crate::orchestrator::{Orchestrator, UpOptions};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "floppy",
    version,
    about = "Local development service orchestrator with a live console",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to floppy.toml.
    #[arg(short = 'f', long = "file", global = true)]
    file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start services and bundles (everything when none are named).
    Up {
        services: Vec<String>,
        /// Start in the background and return.
        #[arg(short, long)]
        detached: bool,
        /// Kill whatever is holding a required port.
        #[arg(long)]
        force: bool,
        /// Capture output with pipes instead of a pseudo-terminal.
        #[arg(long)]
        no_pty: bool,
    },
    /// Stop services (everything running when none are named).
    #[command(alias = "down")]
    Stop { services: Vec<String> },
    /// Show which services are running.
    Ps {
        /// Print only service names.
        #[arg(short, long)]
        quiet: bool,
    },
    /// List configured services and bundles.
    List {
        /// Group services by type.
        #[arg(long)]
        grouped: bool,
    },
    /// Check configuration, tools and service directories.
    Doctor,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("floppy {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // The attached console owns the terminal, so logs go to a file there.
    let console_attached = matches!(cli.command, Commands::Up { detached: false, .. });
    init_tracing(console_attached)?;

    let config_path = find_config(cli.file.as_deref())?;
    let config = load_config(&config_path)?;
    tracing::debug!(config = %config_path.display(), services = config.services.len(), "loaded config");
    let orchestrator = Orchestrator::new(config, config_path);

    match cli.command {
        Commands::Up {
            services,
            detached,
            force,
            no_pty,
        } => {
            let options = UpOptions {
                detached,
                force,
                no_pty: no_pty || env_flag("FLOPPY_NO_PTY"),
            };
            orchestrator.up(&services, options).await
        }
        Commands::Stop { services } => orchestrator.stop(&services).await,
        Commands::Ps { quiet } => orchestrator.ps(quiet),
        Commands::List { grouped } => orchestrator.list(grouped),
        Commands::Doctor => orchestrator.doctor(),
        Commands::Version => Ok(()),
    }
}

fn init_tracing(to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if to_file {
        let dir = state::cache_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join("floppy.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
    Ok(())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
