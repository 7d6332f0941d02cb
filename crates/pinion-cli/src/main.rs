mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use pinion_core::install_signal_handler;
use pinion_schema::{expand_tilde, PinionConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pinion",
    version,
    about = "Install, run, and share locally hosted generative-AI apps"
)]
struct Cli {
    /// Config file (default: ~/.config/pinion/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State directory (overrides `state_dir` from the config).
    #[arg(long, global = true)]
    state_dir: Option<String>,

    /// Catalog file (overrides `catalog_path` from the config).
    #[arg(long, global = true)]
    catalog: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List catalog packages and their lifecycle phase.
    List,
    /// Show orchestrator health.
    Status,
    /// Show the full state of one package.
    Inspect {
        /// Package id.
        id: String,
    },
    /// Install a package, showing progress.
    Install {
        /// Package id.
        id: String,
    },
    /// Run a package in the foreground until Ctrl-C.
    Run {
        /// Package id.
        id: String,
        /// Also open a public tunnel to the package.
        #[arg(long, default_value_t = false)]
        tunnel: bool,
    },
    /// Print the most recent output lines of a package.
    Logs {
        /// Package id.
        id: String,
        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Run diagnostic checks on the host, config, catalog, and state.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn load_config(cli: &Cli) -> Result<PinionConfig, String> {
    let mut config = match &cli.config {
        Some(path) => PinionConfig::load(path),
        None => PinionConfig::load_default(),
    }
    .map_err(|e| format!("config error: {e}"))?;
    if let Some(dir) = &cli.state_dir {
        config.state_dir = expand_tilde(dir);
    }
    if let Some(catalog) = &cli.catalog {
        config.catalog_path = Some(expand_tilde(catalog));
    }
    Ok(config)
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PINION_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();
    let json = cli.json;

    let result = load_config(&cli).and_then(|config| match cli.command {
        Commands::List => commands::list::run(&config, json),
        Commands::Status => commands::status::run(&config, json),
        Commands::Inspect { id } => commands::inspect::run(&config, &id, json),
        Commands::Install { id } => commands::install::run(&config, &id, json),
        Commands::Run { id, tunnel } => commands::run::run(&config, &id, tunnel, json),
        Commands::Logs { id, lines } => commands::logs::run(&config, &id, lines, json),
        Commands::Doctor => commands::doctor::run(&config, json),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") || msg.starts_with("catalog error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
