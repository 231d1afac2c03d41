//! Command-line interface for the sdpc binary.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for sdpc_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => sdpc_core::LogFormat::Text,
            CliLogFormat::Json => sdpc_core::LogFormat::Json,
        }
    }
}

/// sdpc - SDP control client.
#[derive(Debug, Parser)]
#[command(
    name = "sdpc",
    version,
    about = "SDP control client - maintains credentials with an SDP controller"
)]
pub struct Cli {
    /// Control client config file
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        default_value = "/etc/sdpc/sdpc.conf"
    )]
    pub config: PathBuf,

    /// fwknop rc file carrying the SPA key stanzas
    #[arg(
        long = "fwknoprc",
        value_name = "FILE",
        default_value = "/etc/sdpc/fwknoprc"
    )]
    pub fwknoprc: PathBuf,

    /// Run in foreground (overrides FOREGROUND in the config)
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Start the control client
    Start,
    /// Stop a running instance
    Stop,
    /// Signal a running instance to re-read its config
    Restart,
    /// Report whether an instance is running
    Status,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_values() {
        let cli = Cli::try_parse_from(["sdpc", "start"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/sdpc/sdpc.conf"));
        assert_eq!(cli.fwknoprc, PathBuf::from("/etc/sdpc/fwknoprc"));
        assert!(!cli.foreground);
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.log_format, CliLogFormat::Text);
        assert_eq!(cli.command, Command::Start);
    }

    #[test]
    fn parse_subcommands() {
        for (arg, expect) in [
            ("start", Command::Start),
            ("stop", Command::Stop),
            ("restart", Command::Restart),
            ("status", Command::Status),
        ] {
            let cli = Cli::try_parse_from(["sdpc", arg]).unwrap();
            assert_eq!(cli.command, expect);
        }
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["sdpc"]).is_err());
    }

    #[test]
    fn parse_config_paths() {
        let cli = Cli::try_parse_from([
            "sdpc",
            "-c",
            "/tmp/sdpc.conf",
            "--fwknoprc",
            "/tmp/fwknoprc",
            "start",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/sdpc.conf"));
        assert_eq!(cli.fwknoprc, PathBuf::from("/tmp/fwknoprc"));
    }

    #[test]
    fn parse_verbosity_count() {
        let cli = Cli::try_parse_from(["sdpc", "-vvv", "start"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn parse_log_format() {
        let cli = Cli::try_parse_from(["sdpc", "--log-format", "json", "status"]).unwrap();
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }

    #[test]
    fn parse_foreground_flag() {
        let cli = Cli::try_parse_from(["sdpc", "-f", "start"]).unwrap();
        assert!(cli.foreground);
    }
}
