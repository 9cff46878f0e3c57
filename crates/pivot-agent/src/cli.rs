//! Agent CLI implementation.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use pivot_core::{Error, Result};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for pivot_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => pivot_core::LogFormat::Text,
            CliLogFormat::Json => pivot_core::LogFormat::Json,
        }
    }
}

/// pivot agent - connects back to the proxy and relays into local networks.
#[derive(Debug, Parser)]
#[command(
    name = "pivot-agent",
    version,
    about = "pivot agent - remote relay endpoint"
)]
pub struct Cli {
    /// Proxy endpoint to connect back to
    #[arg(short = 'c', long = "connect", value_name = "HOST:PORT")]
    pub connect: String,

    /// Skip TLS certificate validation (dangerous), for self-signed proxies
    #[arg(long = "ignore-cert")]
    pub ignore_cert: bool,

    /// Increase verbosity (can be repeated: -v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// The host part of the connect address, used as the TLS server name.
    pub fn server_name(&self) -> Result<String> {
        let (host, port) = self.connect.rsplit_once(':').ok_or_else(|| Error::Transport {
            message: format!("invalid connect address {:?}, expected host:port", self.connect),
        })?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(Error::Transport {
                message: format!("invalid connect address {:?}, expected host:port", self.connect),
            });
        }
        Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_is_required() {
        assert!(Cli::try_parse_from(["pivot-agent"]).is_err());
        assert!(Cli::try_parse_from(["pivot-agent", "--connect", "proxy:11601"]).is_ok());
    }

    #[test]
    fn server_name_strips_port() {
        let cli = Cli::parse_from(["pivot-agent", "-c", "proxy.example.com:11601"]);
        assert_eq!(cli.server_name().unwrap(), "proxy.example.com");
    }

    #[test]
    fn server_name_handles_ipv6_brackets() {
        let cli = Cli::parse_from(["pivot-agent", "-c", "[fd00::1]:11601"]);
        assert_eq!(cli.server_name().unwrap(), "fd00::1");
    }

    #[test]
    fn bad_connect_addresses_are_rejected() {
        for bad in ["proxy", "proxy:", ":11601", "proxy:notaport"] {
            let cli = Cli::parse_from(["pivot-agent", "-c", bad]);
            assert!(cli.server_name().is_err(), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from(["pivot-agent", "-c", "p:1", "--ignore-cert", "-vv"]);
        assert!(cli.ignore_cert);
        assert_eq!(cli.verbose, 2);
    }
}
