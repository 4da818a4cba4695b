//! CLI for the prefork worker spawner.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

mod run;

#[derive(Parser)]
#[command(name = "prefork", version, about = "Preforking spawner for warm application images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate that a directory looks like a spawnable application root.
    Check {
        /// Application root directory.
        root: String,
        /// Entry file checked inside the root.
        #[arg(long, default_value = prefork::DEFAULT_ENTRY_FILE)]
        entry_file: String,
    },
    /// Spawn demo workers from an application root and wait for them.
    Run(run::RunArgs),
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("prefork: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Check { root, entry_file } => run::check(&root, &entry_file),
            Command::Run(args) => args.run(),
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "prefork",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}
