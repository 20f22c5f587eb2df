//! Stowage CLI - acquire deployable packages from remote feeds into a local cache

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod commands;
mod display;
mod error;
mod exit_codes;
mod util;

use error::Result;

#[derive(Parser)]
#[command(name = "stowage")]
#[command(author = "Stowage Contributors")]
#[command(version)]
#[command(about = "Download deployable packages from NuGet, Maven, npm, Helm, OCI and other feeds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a package into the local cache
    Download(DownloadArgs),

    /// Docker credential helper protocol (invoked by the container engine)
    CredentialHelper {
        #[arg(value_enum)]
        action: HelperAction,
    },

    /// Inspect the local package cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Args)]
struct DownloadArgs {
    /// Feed type (nuget, maven, npm, github, helm, s3, gcs, artifactory, docker, aws-ecr, oci)
    #[arg(long)]
    feed_type: String,

    /// Feed identifier; also names the cache directory
    #[arg(long)]
    feed_id: String,

    /// Feed URI
    #[arg(long)]
    feed_uri: String,

    /// Package identifier
    #[arg(long = "package")]
    package_id: String,

    /// Package version
    #[arg(long)]
    version: String,

    /// Feed username (or access key for object storage)
    #[arg(long, env = "STOWAGE_FEED_USERNAME")]
    username: Option<String>,

    /// Feed password, token or secret key
    #[arg(long, env = "STOWAGE_FEED_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Skip the cache lookup
    #[arg(long)]
    force: bool,

    /// Download attempts (defaults to the configured value)
    #[arg(long)]
    attempts: Option<u32>,

    /// Wait between attempts, e.g. 10s or 500ms
    #[arg(long, value_parser = util::parse_duration)]
    backoff: Option<Duration>,

    /// Cache root (overrides the configured value)
    #[arg(long, env = "STOWAGE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Deployment variable (NAME=VALUE), may be repeated
    #[arg(long = "var", value_parser = util::parse_variable)]
    variables: Vec<(String, String)>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Look up a cached package without touching the network
    Find {
        /// Feed identifier
        #[arg(long)]
        feed_id: String,

        /// Package identifier
        #[arg(long = "package")]
        package_id: String,

        /// Package version
        #[arg(long)]
        version: String,

        /// Version format used to parse and compare the version
        #[arg(long, value_enum, default_value = "semver")]
        format: VersionFormatArg,

        /// Candidate extension (e.g. .nupkg), may be repeated
        #[arg(long = "extension")]
        extensions: Vec<String>,

        /// Cache root (overrides the configured value)
        #[arg(long, env = "STOWAGE_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum HelperAction {
    Get,
    Store,
    Erase,
}

#[derive(Clone, Copy, ValueEnum)]
enum VersionFormatArg {
    Semver,
    Maven,
    Docker,
    Lexicographic,
}

impl From<VersionFormatArg> for stowage_core::VersionFormat {
    fn from(arg: VersionFormatArg) -> Self {
        match arg {
            VersionFormatArg::Semver => Self::Semver,
            VersionFormatArg::Maven => Self::Maven,
            VersionFormatArg::Docker => Self::Docker,
            VersionFormatArg::Lexicographic => Self::Lexicographic,
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Download(args) => {
            let config = commands::load_config(cli.config.as_deref())?;
            let options = commands::download::Options {
                feed_type: args.feed_type,
                feed_id: args.feed_id,
                feed_uri: args.feed_uri,
                package_id: args.package_id,
                version: args.version,
                username: args.username,
                password: args.password,
                force: args.force,
                attempts: args.attempts,
                backoff: args.backoff,
                cache_dir: args.cache_dir,
                variables: args.variables,
                json: args.json,
            };
            commands::download::run(config, options).await
        }

        Commands::CredentialHelper { action } => {
            let action = match action {
                HelperAction::Get => commands::credential_helper::Action::Get,
                HelperAction::Store => commands::credential_helper::Action::Store,
                HelperAction::Erase => commands::credential_helper::Action::Erase,
            };
            commands::credential_helper::run(action)
        }

        Commands::Cache {
            command:
                CacheCommands::Find {
                    feed_id,
                    package_id,
                    version,
                    format,
                    extensions,
                    cache_dir,
                    json,
                },
        } => {
            let config = commands::load_config(cli.config.as_deref())?;
            let query = commands::cache::FindQuery {
                feed_id: &feed_id,
                package_id: &package_id,
                version: &version,
                format: format.into(),
                extensions: &extensions,
            };
            commands::cache::find(&config, cache_dir, &query, json)
        }
    }
}

#[tokio::main]
async fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
