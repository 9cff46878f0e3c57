//! Proxy CLI implementation.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use pivot_core::constants::{DEFAULT_STACK_BUFFER, DEFAULT_TCP_BUFFER, DEFAULT_TUN_NAME};
use pivot_core::transport::TlsIdentity;
use pivot_core::{Error, Result};

use crate::forward::RemoteForward;
use crate::netstack::StackConfig;

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

/// pivot proxy - terminates TUN traffic and relays it to connected agents.
#[derive(Debug, Parser)]
#[command(
    name = "pivot-proxy",
    version,
    about = "pivot proxy - TUN-side relay endpoint"
)]
pub struct Cli {
    /// Address to listen on for agents
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:11601")]
    pub listen: SocketAddr,

    /// TUN interface name
    #[arg(long = "tun", default_value = DEFAULT_TUN_NAME)]
    pub tun: String,

    /// TUN interface MTU
    #[arg(long = "tun-mtu", default_value_t = 1500)]
    pub tun_mtu: u16,

    /// TLS certificate file (PEM format)
    #[arg(short = 'c', long = "cert", value_name = "FILE", requires = "key_file")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file (PEM format)
    #[arg(short = 'k', long = "key", value_name = "FILE", requires = "cert_file")]
    pub key_file: Option<PathBuf>,

    /// Generate a self-signed certificate instead of loading one
    #[arg(long = "self-signed", conflicts_with = "cert_file")]
    pub self_signed: bool,

    /// Per-socket TCP buffer in the userland stack
    #[arg(long = "tcp-buffer", default_value_t = DEFAULT_TCP_BUFFER)]
    pub tcp_buffer: usize,

    /// Depth of the userland stack's packet channel
    #[arg(long = "stack-buffer", default_value_t = DEFAULT_STACK_BUFFER)]
    pub stack_buffer: usize,

    /// Disable UDP termination
    #[arg(long = "no-udp")]
    pub no_udp: bool,

    /// Reverse forward: listen on BIND at the agent and splice each
    /// accepted connection to TARGET here (repeatable)
    #[arg(
        short = 'R',
        long = "remote-forward",
        value_name = "BIND/TARGET"
    )]
    pub remote_forward: Vec<String>,

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
    /// Resolve the TLS identity from the flags.
    pub fn identity(&self) -> Result<TlsIdentity> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => TlsIdentity::load(cert, key),
            _ if self.self_signed => TlsIdentity::self_signed(),
            _ => Err(Error::Transport {
                message: "no TLS identity: pass --cert/--key or --self-signed".into(),
            }),
        }
    }

    /// Parse every `-R` spec up front, so a typo fails at startup.
    pub fn remote_forwards(&self) -> Result<Vec<RemoteForward>> {
        self.remote_forward
            .iter()
            .map(|spec| RemoteForward::parse(spec))
            .collect()
    }

    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            tun_name: self.tun.clone(),
            tun_mtu: self.tun_mtu,
            stack_buffer: self.stack_buffer,
            tcp_buffer: self.tcp_buffer,
            udp_enabled: !self.no_udp,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["pivot-proxy", "--self-signed"]);
        assert_eq!(cli.listen.port(), 11601);
        assert_eq!(cli.tun, DEFAULT_TUN_NAME);
        assert!(!cli.no_udp);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn cert_requires_key() {
        assert!(Cli::try_parse_from(["pivot-proxy", "--cert", "proxy.pem"]).is_err());
        assert!(Cli::try_parse_from([
            "pivot-proxy", "--cert", "proxy.pem", "--key", "proxy.key"
        ])
        .is_ok());
    }

    #[test]
    fn self_signed_conflicts_with_cert() {
        assert!(Cli::try_parse_from([
            "pivot-proxy",
            "--self-signed",
            "--cert",
            "proxy.pem",
            "--key",
            "proxy.key"
        ])
        .is_err());
    }

    #[test]
    fn identity_requires_some_source() {
        let cli = Cli::parse_from(["pivot-proxy"]);
        assert!(cli.identity().is_err());

        let cli = Cli::parse_from(["pivot-proxy", "--self-signed"]);
        assert!(cli.identity().is_ok());
    }

    #[test]
    fn stack_config_reflects_flags() {
        let cli = Cli::parse_from([
            "pivot-proxy",
            "--self-signed",
            "--tun",
            "wan0",
            "--no-udp",
            "--tcp-buffer",
            "65536",
        ]);
        let config = cli.stack_config();
        assert_eq!(config.tun_name, "wan0");
        assert!(!config.udp_enabled);
        assert_eq!(config.tcp_buffer, 65536);
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::parse_from(["pivot-proxy", "--self-signed", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn remote_forwards_are_repeatable() {
        let cli = Cli::parse_from([
            "pivot-proxy",
            "--self-signed",
            "-R",
            "0.0.0.0:2222/127.0.0.1:8080",
            "-R",
            "0.0.0.0:2223/127.0.0.1:8081",
        ]);
        let forwards = cli.remote_forwards().unwrap();
        assert_eq!(forwards.len(), 2);
        assert_eq!(forwards[1].bind, "0.0.0.0:2223");
    }

    #[test]
    fn bad_remote_forward_spec_fails() {
        let cli = Cli::parse_from(["pivot-proxy", "--self-signed", "-R", "2222/8080"]);
        assert!(cli.remote_forwards().is_err());
    }
}
