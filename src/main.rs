mod dry_run;
mod error;

use crate::dry_run::{DryRunClient, LogSink};
use crate::error::{ErrorKind, Result};
use clap::{ArgAction, Parser, Subcommand};
use exn::ResultExt;
use freeway_catalog::{Catalog, CatalogOptions};
use freeway_config::Config;
use freeway_criteria::Criteria;
use freeway_library::{ClientHandle, Library, NotificationSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "freeway", version, about = "Keep a directory of pieces in sync and publish them as assets")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "FREEWAY_CONFIG")]
    config: Option<PathBuf>,
    /// More logging; repeat for even more
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Watch the directory and upload pieces until Ctrl-C
    Watch,
    /// Print catalog pieces as JSON
    List {
        /// Only pieces matching this JSON criteria, e.g. '{"type": "mesh"}'
        #[arg(long)]
        criteria: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, retryable = err.is_retryable(), "Exiting after error");
            ExitCode::FAILURE
        },
    }
}

/// `RUST_LOG` applies unless `-v` was given.
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    match cli.command {
        Command::Watch => watch(&config).await,
        Command::List { criteria } => list(&config, criteria.as_deref()).await,
        Command::Config => print_json(&config),
    }
}

async fn watch(config: &Config) -> Result<()> {
    let client: ClientHandle = Arc::new(DryRunClient);
    let sink: Arc<dyn NotificationSink> = Arc::new(LogSink);
    let library = Library::start(config, client, Some(sink)).await.or_raise(|| ErrorKind::Library)?;
    tracing::info!(root = %library.watcher().root().display(), "Watching for changes, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.or_raise(|| ErrorKind::Signal)?;
    tracing::info!("Shutting down");
    library.shutdown().await.or_raise(|| ErrorKind::Library)
}

async fn list(config: &Config, criteria: Option<&str>) -> Result<()> {
    let criteria = match criteria {
        Some(text) => text.parse::<Criteria>().or_raise(|| ErrorKind::Criteria)?,
        None => Criteria::default(),
    };
    let options = CatalogOptions { is_auto_upload: config.auto_upload };
    let catalog = Catalog::open(config.metadata_path.clone(), options).await.or_raise(|| ErrorKind::Catalog)?;
    print_json(&catalog.find_many(&criteria))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).or_raise(|| ErrorKind::Output)?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["freeway", "watch"], Command::Watch, None, 0)]
    #[case(&["freeway", "-vv", "config"], Command::Config, None, 2)]
    #[case(&["freeway", "list", "--config", "freeway.toml"], Command::List { criteria: None }, Some("freeway.toml"), 0)]
    #[case(
        &["freeway", "list", "--criteria", r#"{"type": "mesh"}"#],
        Command::List { criteria: Some(r#"{"type": "mesh"}"#.to_string()) },
        None,
        0
    )]
    fn test_parse_arguments(
        #[case] args: &[&str],
        #[case] command: Command,
        #[case] config: Option<&str>,
        #[case] verbose: u8,
    ) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.command, command);
        assert_eq!(cli.config, config.map(PathBuf::from));
        assert_eq!(cli.verbose, verbose);
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["freeway"]).is_err());
    }
}
