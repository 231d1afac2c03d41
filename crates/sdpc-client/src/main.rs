//! sdpc binary entry point.

mod cli;

use clap::Parser;
use tracing::{error, info};

use sdpc_core::com::tls::TlsChannel;
use sdpc_core::com::ComSettings;
use sdpc_core::daemon::{self, StartOutcome};
use sdpc_core::{Client, ClientConfig, Error, LogFormat};

use cli::{Cli, Command};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let mut config = match ClientConfig::load(&cli.config, &cli.fwknoprc) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sdpc: {e}");
            return 1;
        }
    };
    if cli.foreground {
        config.foreground = true;
    }

    // CLI verbosity wins when given; USE_SYSLOG selects structured
    // output for the system log collector.
    let verbosity = if cli.verbose > 0 { cli.verbose } else { config.verbosity };
    let log_file = cli.log_file.clone().or_else(|| config.log_file.clone());
    let format = if config.use_syslog {
        LogFormat::Json
    } else {
        cli.log_format.into()
    };
    if let Err(e) = sdpc_core::init_logging(verbosity, log_file.as_deref(), format) {
        eprintln!("sdpc: failed to initialize logging: {e}");
        return 1;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "sdpc starting");

    match cli.command {
        Command::Start => cmd_start(&config),
        Command::Stop => cmd_stop(&config),
        Command::Restart => cmd_restart(&config),
        Command::Status => cmd_status(&config),
    }
}

fn cmd_start(config: &ClientConfig) -> i32 {
    match daemon::start(config) {
        Ok(StartOutcome::Parent { child }) => {
            info!(child, "control client daemon started");
            0
        }
        Ok(StartOutcome::Run(lock)) => {
            let com = TlsChannel::new(ComSettings::from_config(config));
            let mut client = Client::new(config, com);
            client.attach_pid_lock(lock);
            client.describe();

            match client.run() {
                Ok(()) => 0,
                // INT/TERM shutdown is a normal exit for the operator.
                Err(Error::GotExitSig) => 0,
                Err(e) => {
                    error!(error = %e, "control client failed");
                    1
                }
            }
        }
        Err(Error::ProcExists(pid)) => {
            eprintln!("sdpc: an instance is already running (pid={pid})");
            1
        }
        Err(e) => {
            eprintln!("sdpc: {e}");
            1
        }
    }
}

fn cmd_stop(config: &ClientConfig) -> i32 {
    match daemon::stop(&config.pid_file) {
        Ok(()) => {
            println!("sdpc: stopped");
            0
        }
        Err(e) => {
            eprintln!("sdpc: {e}");
            1
        }
    }
}

fn cmd_restart(config: &ClientConfig) -> i32 {
    match daemon::restart(&config.pid_file) {
        Ok(()) => {
            println!("sdpc: restart signal sent");
            0
        }
        Err(e) => {
            eprintln!("sdpc: {e}");
            1
        }
    }
}

fn cmd_status(config: &ClientConfig) -> i32 {
    match daemon::status(&config.pid_file) {
        Ok(Some(pid)) => {
            println!("sdpc: running (pid={pid})");
            0
        }
        Ok(None) => {
            println!("sdpc: not running");
            1
        }
        Err(e) => {
            eprintln!("sdpc: {e}");
            1
        }
    }
}
