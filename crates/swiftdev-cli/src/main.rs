#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]

mod commands;
mod logging;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "swiftdev")]
#[command(author, version, about = "A minimal ES module dev server with HMR", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Serve the working directory with on-demand transforms and HMR
    Dev {
        /// Port to listen on [default: 9001]
        #[arg(long, short = 'p')]
        port: Option<u16>,

        /// Host to bind to [default: 127.0.0.1]
        #[arg(long)]
        host: Option<String>,

        /// Path to config file (overrides auto-discovery)
        #[arg(long, short = 'c', value_name = "FILE")]
        config: Option<PathBuf>,

        /// Open browser automatically
        #[arg(long)]
        open: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Dev {
            port,
            host,
            config,
            open,
        } => {
            logging::init(cli.verbose, cli.json);
            let action = commands::dev::DevAction {
                cwd,
                port,
                host,
                config,
                open,
            };
            let rt = tokio::runtime::Runtime::new().into_diagnostic()?;
            rt.block_on(commands::dev::run(action))
        }
    }
}
