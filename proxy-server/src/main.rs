//! Binary entry point: parses the CLI surface, loads configuration, and
//! dispatches to the master supervision loop, a bare worker loop (when
//! `workers = 0`), or a re-exec'd worker process (`--worker`).

mod daemon;
mod master;
mod worker;

use clap::Parser;
use proxy_common::Config;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "proxy-server", version, about = "TLS-terminating reverse proxy")]
struct Cli {
    /// Path to the JSON configuration file (required for a normal run).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Print the canonical default configuration as JSON and exit.
    #[arg(long = "default-config")]
    default_config: bool,

    /// Daemonize after startup (POSIX only).
    #[arg(short = 'd', long = "daemonize")]
    daemonize: bool,

    /// Internal: re-exec'd worker process.
    #[arg(long = "worker", hide = true)]
    worker: bool,

    /// Internal: raw fd number of the inherited listening socket.
    #[arg(long = "listen-fd", hide = true)]
    listen_fd: Option<i32>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.default_config {
        let defaults = Config::default();
        println!("{}", serde_json::to_string_pretty(&defaults).expect("default config serializes"));
        return ExitCode::SUCCESS;
    }

    let Some(config_path) = cli.config.clone() else {
        eprintln!("proxy-server: --config PATH is required");
        return ExitCode::FAILURE;
    };

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("proxy-server: failed to load {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    proxy_common::logging::init("info");

    if cli.daemonize && !cli.worker {
        if let Err(e) = daemon::daemonize() {
            tracing::error!("daemonize failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("proxy-server: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        if cli.worker {
            let fd = cli.listen_fd.expect("--worker requires --listen-fd");
            worker::run_inherited(config, fd).await
        } else if config.workers == 0 {
            worker::run_workerless(config, config_path).await
        } else {
            master::run(config, config_path).await
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
