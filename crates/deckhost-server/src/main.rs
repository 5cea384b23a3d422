//! deckhost - companion host for small-screen clients.
//!
//! `deckhost` with no subcommand serves clients. The other subcommands
//! manage installed apps against the same data directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use deckhost_core::{settings_path, HostResult, HostSettings};
use deckhost_plugin_api::PackageSource;
use deckhost_server::Host;

#[derive(Parser)]
#[command(name = "deckhost", version, about = "Companion host for small-screen clients")]
struct Cli {
    /// Settings file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve clients until interrupted (default)
    Serve {
        /// Override the listening port
        #[arg(long)]
        port: Option<u16>,
        /// Override the listening address
        #[arg(long)]
        address: Option<String>,
    },
    /// Install an app from a zip archive or an http(s) URL
    Install { source: String },
    /// Register an unpacked app directory in place
    InstallDev { dir: PathBuf },
    /// List installed apps in display order
    List,
    /// Enable an app so it runs on the next start
    Enable { name: String },
    /// Stop an app and keep its files
    Disable { name: String },
    /// Remove an app with its data and bindings
    Purge { name: String },
}

// =============================================================================
// Setup
// =============================================================================

const DEFAULT_FILTER: &str = "info,deckhost_server=debug,deckhost_plugin_api=debug";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn load_settings(path: Option<PathBuf>) -> HostResult<HostSettings> {
    match path.or_else(settings_path) {
        Some(path) => {
            tracing::debug!("Settings from {}", path.display());
            Ok(HostSettings::load_or_init(&path)?)
        }
        None => {
            tracing::warn!("No config directory available, using default settings");
            Ok(HostSettings::default())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run(cli: Cli) -> HostResult<()> {
    let mut settings = load_settings(cli.config)?;
    let command = cli.command.unwrap_or(Command::Serve {
        port: None,
        address: None,
    });

    if let Command::Serve { port, address } = &command {
        if let Some(port) = port {
            settings.port = *port;
        }
        if let Some(address) = address {
            settings.address = address.clone();
        }
    }

    let host = Host::new(settings).await;
    let registry = host.registry();

    match command {
        Command::Serve { .. } => host.serve(shutdown_signal()).await?,
        Command::Install { source } => {
            let app = registry.install(PackageSource::parse(&source)).await?;
            println!("Installed {} {}", app.name, app.manifest.version);
        }
        Command::InstallDev { dir } => {
            let app = registry.install(PackageSource::Developer(dir)).await?;
            println!("Registered {} from {}", app.name, app.path.display());
        }
        Command::List => {
            let apps = registry.snapshot();
            if apps.is_empty() {
                println!("No apps installed");
            }
            for app in apps {
                println!(
                    "{:>3}  {:<24} {:<10} {}{}",
                    app.pref_index,
                    app.name,
                    app.manifest.version,
                    if app.enabled { "enabled" } else { "disabled" },
                    if app.developer { " (dev)" } else { "" },
                );
            }
        }
        Command::Enable { name } => {
            registry.enable(&name).await?;
            println!("Enabled {}", name);
        }
        Command::Disable { name } => {
            registry.disable(&name).await?;
            println!("Disabled {}", name);
        }
        Command::Purge { name } => {
            registry.purge(&name).await?;
            println!("Purged {}", name);
        }
    }
    Ok(())
}

// =============================================================================
// Entry Point
// =============================================================================

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
