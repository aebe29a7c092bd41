//! claude-relay - stream live Claude Code sessions to paired mobile viewers.

use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use claude_relay::config::RelayConfig;
use claude_relay::relay;

#[derive(Parser)]
#[command(
    name = "claude-relay",
    about = "Stream live Claude Code sessions to paired mobile viewers",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch session logs and serve paired viewers (the default).
    Serve {
        /// HTTP port to bind (overrides RELAY_PORT).
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory tree to watch (overrides RELAY_ROOT).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Use the polling directory backend.
        #[arg(long)]
        poll: bool,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum ConfigAction {
    /// Show the effective configuration.
    Show,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn handle_config(config: &RelayConfig, action: ConfigAction) {
    match action {
        ConfigAction::Show => match serde_json::to_string_pretty(config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("Failed to render config: {e}");
                std::process::exit(1);
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let command = cli.command.unwrap_or(Commands::Serve {
        port: None,
        root: None,
        poll: false,
    });

    match command {
        Commands::Serve { port, root, poll } => {
            let public_url_pinned = std::env::var("RELAY_PUBLIC_URL").is_ok();
            if let Some(port) = port {
                config.port = port;
                if !public_url_pinned {
                    config.public_url = format!("http://{}:{}", config.host, config.port);
                }
            }
            if let Some(root) = root {
                config.watch_root = root;
            }
            if poll {
                config.poll_watcher = true;
            }

            tracing::info!(
                root = %config.watch_root.display(),
                address = %config.bind_address(),
                poll = config.poll_watcher,
                "Starting claude-relay"
            );

            if let Err(e) = relay::run(config).await {
                tracing::error!(error = %e, "Relay failed");
                std::process::exit(1);
            }
        }
        Commands::Config { action } => {
            handle_config(&config, action);
        }
    }
}
