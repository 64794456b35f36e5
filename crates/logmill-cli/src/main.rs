mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use logmill_config::CliOverrides;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "logmill",
    version,
    about = "Log normalization and template mining"
)]
struct Cli {
    /// Path to logmill.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest log files or directories of *.log files
    Ingest {
        /// Files or directories to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Cluster store path
        #[arg(long)]
        state: Option<PathBuf>,
        /// Events output file (JSON Lines)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Events per batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Similarity threshold in (0, 1]
        #[arg(long)]
        threshold: Option<f64>,
        /// Do not load or persist clusters
        #[arg(long)]
        in_memory: bool,
        /// Run the pipeline without writing events
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List learned templates
    #[command(alias = "ls")]
    Templates {
        /// Cluster store path
        #[arg(long)]
        state: Option<PathBuf>,
        /// Show at most this many templates
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse a single log line
    Parse {
        line: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mask PII in a piece of text
    Mask { text: String },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "logmill=debug" } else { "logmill=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config;
    let result = match cli.command {
        Commands::Ingest {
            paths,
            state,
            output,
            batch_size,
            threshold,
            in_memory,
            dry_run,
            json,
        } => {
            let overrides = CliOverrides {
                state_path: state,
                output,
                batch_size,
                similarity_threshold: threshold,
                in_memory,
                dry_run,
            };
            commands::ingest::run(config, paths, overrides, json).await
        }
        Commands::Templates { state, limit, json } => {
            commands::templates::run(config, state, limit, json)
        }
        Commands::Parse { line, json } => commands::parse::run(line, json),
        Commands::Mask { text } => commands::mask::run(config, text),
        Commands::Completions { shell } => commands::completions::run(shell),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_completions_shell_is_validated() {
        assert!(Cli::try_parse_from(["logmill", "completions", "bash"]).is_ok());
        assert!(Cli::try_parse_from(["logmill", "completions", "zsh"]).is_ok());

        let err = Cli::try_parse_from(["logmill", "completions", "nope"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn test_ls_alias() {
        let cli = Cli::try_parse_from(["logmill", "ls", "-n", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Templates { limit: Some(5), .. }));
    }
}
