//! `registry-server`: run the registry or one-off maintenance.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use eyre::WrapErr;
use registry::config::{Config, LogFormat};
use registry::daemon::gc;
use registry::dal::gc::Resource;
use registry::{AppBuilder, server};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// OCI distribution registry.
#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about)]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "REGISTRY_CONFIG", global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the registry API and run the background daemons (default).
    Serve,
    /// Run a garbage collection now, in this process.
    Gc {
        /// Phase to start with.
        #[arg(long, value_enum, default_value_t = Phase::Tag)]
        resource: Phase,
        /// Only collect inside this namespace.
        #[arg(long)]
        namespace: Option<String>,
        /// Stop after the first phase.
        #[arg(long)]
        no_cascade: bool,
    },
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Phase {
    Tag,
    Artifact,
    Blob,
    Repository,
}

impl From<Phase> for Resource {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Tag => Resource::Tag,
            Phase::Artifact => Resource::Artifact,
            Phase::Blob => Resource::Blob,
            Phase::Repository => Resource::Repository,
        }
    }
}

fn load_config(path: Option<&Utf8PathBuf>) -> eyre::Result<Config> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).wrap_err_with(|| format!("read {path}"))?;
            toml_edit::de::from_str(&text).wrap_err_with(|| format!("parse {path}"))?
        }
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_error::ErrorLayer::default());
    match config.log.format {
        LogFormat::Text => subscriber.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    init_tracing(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "registry-server starting");

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let app = AppBuilder::new(config).build().await?;
            let shutdown = CancellationToken::new();
            server::cancel_on_signal(shutdown.clone());
            server::serve(app, shutdown).await
        }
        Command::Gc {
            resource,
            namespace,
            no_cascade,
        } => {
            let app = AppBuilder::new(config).build().await?;
            let runners =
                gc::run_now(&app, resource.into(), namespace.as_deref(), !no_cascade, "cli")
                    .await?;
            for runner in &runners {
                println!("{}", serde_json::to_string(runner)?);
            }
            if runners.iter().any(|runner| runner.status != "success") {
                eyre::bail!("garbage collection failed");
            }
            Ok(())
        }
        Command::CheckConfig => {
            println!("configuration is valid");
            Ok(())
        }
    }
}
