use clap::Parser;
use pinion_core::{install_signal_handler, Orchestrator};
use pinion_schema::PinionConfig;
use pinion_server::ServerError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pinion-server", about = "HTTP API for the Pinion orchestrator")]
struct Cli {
    /// Config file (default: ~/.config/pinion/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `bind` from the config).
    #[arg(long)]
    bind: Option<String>,

    /// State directory (overrides `state_dir` from the config).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Catalog file (overrides `catalog_path` from the config).
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Use the in-process mock runner and tunnel provider.
    #[arg(long)]
    mock: bool,
}

fn load_config(cli: &Cli) -> Result<PinionConfig, ServerError> {
    let mut config = match &cli.config {
        Some(path) => PinionConfig::load(path)?,
        None => PinionConfig::load_default()?,
    };
    if let Some(bind) = &cli.bind {
        config.bind.clone_from(bind);
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir.clone_from(dir);
    }
    if let Some(catalog) = &cli.catalog {
        config.catalog_path = Some(catalog.clone());
    }
    if cli.mock {
        "mock".clone_into(&mut config.runner);
        "mock".clone_into(&mut config.tunnel_provider);
    }
    Ok(config)
}

fn serve(cli: &Cli) -> Result<(), ServerError> {
    let config = load_config(cli)?;
    let bind = config.bind.clone();
    info!("state directory: {}", config.state_dir.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pinion-worker")
        .build()?;
    let orch = Orchestrator::builder(config)
        .runtime(runtime.handle().clone())
        .build()?;

    install_signal_handler();
    pinion_server::run_server(&orch, &bind)?;
    runtime.block_on(orch.shutdown());
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PINION_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match serve(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
