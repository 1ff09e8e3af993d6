use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod utils;

use utils::Target;

/// FaVe producer command line interface
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Unix domain socket of the aggregator
    #[clap(short, long, global = true, default_value = "/tmp/np_aggregator.socket")]
    socket: PathBuf,

    /// TCP address of the aggregator (takes precedence over --socket)
    #[clap(short, long, global = true)]
    tcp: Option<String>,

    /// Connection attempts before giving up
    #[clap(long, global = true, default_value = "5")]
    retries: u32,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send messages read from JSON files
    Send {
        /// Files holding one message or an array of messages
        #[clap(required = true)]
        files: Vec<PathBuf>,

        /// Send without checking the messages first
        #[clap(long)]
        no_validate: bool,
    },

    /// Add or remove links between ports
    Link {
        #[clap(subcommand)]
        cmd: LinkCommands,
    },

    /// Ask the aggregator to write its state to a directory
    Dump {
        /// Directory to write fave.json into
        dir: PathBuf,

        /// Wait up to this many seconds for the dump to appear
        #[clap(short, long)]
        wait: Option<u64>,
    },

    /// Summarize a dump written by the aggregator
    Show {
        /// Directory holding fave.json
        dir: PathBuf,
    },

    /// Stop the aggregator once all queued messages are applied
    Stop,
}

#[derive(Subcommand)]
enum LinkCommands {
    /// Link an egress port to an ingress port
    Add {
        from: String,
        to: String,
    },

    /// Remove a link
    Del {
        from: String,
        to: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" }
    )).init();

    let target = Target::new(cli.socket, cli.tcp, cli.retries);

    match cli.command {
        Commands::Send { files, no_validate } => {
            commands::send::send_files(&target, &files, !no_validate).await?;
        }
        Commands::Link { cmd } => {
            let (add, from, to) = match cmd {
                LinkCommands::Add { from, to } => (true, from, to),
                LinkCommands::Del { from, to } => (false, from, to),
            };
            commands::send::send_link(&target, add, from, to).await?;
        }
        Commands::Dump { dir, wait } => {
            commands::dump::request_dump(&target, &dir, wait).await?;
        }
        Commands::Show { dir } => {
            commands::dump::show_dump(&dir)?;
        }
        Commands::Stop => {
            commands::send::send_stop(&target).await?;
        }
    }

    Ok(())
}
