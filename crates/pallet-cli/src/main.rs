mod commands;
mod config;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::EXIT_FAILURE;
use config::{CliConfig, Overrides};
use pallet_core::{install_signal_handler, Engine, InstallOptions, DEFAULT_TEST_TIMEOUT};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "pallet",
    version,
    about = "Fetch, verify, install and smoke-test checksum-pinned releases"
)]
struct Cli {
    /// Install prefix (default: ~/.local, or PALLET_PREFIX).
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,

    /// Download cache directory (default: ~/.cache/pallet, or PALLET_CACHE).
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// State directory for receipts, journal and locks (default: ~/.local/state/pallet, or PALLET_STATE).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Config file (default: ~/.config/pallet/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

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
    /// Fetch, verify, install and smoke-test a manifest.
    Install {
        /// Path to manifest TOML file.
        manifest: PathBuf,
        /// Stop after publishing files; do not run smoke tests.
        #[arg(long, default_value_t = false)]
        skip_tests: bool,
        /// Per-command smoke test timeout in seconds.
        #[arg(long, default_value_t = DEFAULT_TEST_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Run the smoke tests of an installed manifest.
    Test {
        /// Path to manifest TOML file.
        manifest: PathBuf,
        /// Per-command smoke test timeout in seconds.
        #[arg(long, default_value_t = DEFAULT_TEST_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Fetch and verify a manifest's archive into the cache without installing.
    Fetch {
        /// Path to manifest TOML file.
        manifest: PathBuf,
    },
    /// Remove the files an installed package owns.
    Uninstall {
        /// Package name.
        name: String,
    },
    /// List installed packages.
    List,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
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
            tracing_subscriber::EnvFilter::try_from_env("PALLET_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { ref dir } => commands::man_pages::run::<Cli>(dir),
        _ => run_pipeline(&cli),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_pipeline(cli: &Cli) -> Result<u8, String> {
    install_signal_handler();

    let home = std::env::var_os("HOME").map(PathBuf::from);
    let config = CliConfig::load_or_default(cli.config.as_deref(), home.as_deref())?;
    let overrides = Overrides {
        prefix: cli.prefix.clone(),
        cache_dir: cli.cache_dir.clone(),
        state_dir: cli.state_dir.clone(),
    };
    let layout = config::resolve_layout(
        &overrides,
        |var| std::env::var(var).ok(),
        &config,
        home.as_deref(),
    )?;
    let engine = match Engine::new(layout, config.fetch) {
        Ok(e) => e,
        Err(e) => return Ok(commands::report_error(&e, cli.json)),
    };
    let json = cli.json;

    match &cli.command {
        Commands::Install {
            manifest,
            skip_tests,
            timeout,
        } => commands::install::run(
            &engine,
            manifest,
            InstallOptions {
                skip_tests: *skip_tests,
                test_timeout: Duration::from_secs(*timeout),
            },
            json,
        ),
        Commands::Test { manifest, timeout } => {
            commands::test::run(&engine, manifest, Duration::from_secs(*timeout), json)
        }
        Commands::Fetch { manifest } => commands::fetch::run(&engine, manifest, json),
        Commands::Uninstall { name } => commands::uninstall::run(&engine, name, json),
        Commands::List => commands::list::run(&engine, json),
        Commands::Completions { .. } | Commands::ManPages { .. } => Ok(commands::EXIT_SUCCESS),
    }
}
