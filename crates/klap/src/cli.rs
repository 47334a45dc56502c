use std::time::Duration;

use clap::{Parser, Subcommand};
use klap_core::DEFAULT_PORT;

pub fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

/// Parses a `key=value` query parameter.
pub fn parse_param(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", arg)),
    }
}

/// Client for TP-Link devices speaking the KLAP protocol
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Device account username (email).
    /// Can also be set via KLAP_USERNAME environment variable.
    #[arg(short, long, global = true, env = "KLAP_USERNAME")]
    pub username: Option<String>,

    /// Read password from stdin.
    /// Useful for scripting: echo "password" | klap -u user@example.com --password-stdin request 192.168.1.100 '{...}'
    #[arg(long, global = true)]
    pub password_stdin: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show version information for CLI and core library
    Version,

    /// Run the KLAP handshake only, to check credentials
    Handshake {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Send an encrypted message and print the decrypted response
    Request {
        #[command(flatten)]
        target: TargetArgs,

        /// Application endpoint under /app
        #[arg(long, default_value = "request")]
        endpoint: String,

        /// Extra query parameter (repeatable); seq is always set by the client
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Message to encrypt, typically a JSON command
        message: String,
    },
}

/// Device address options shared by the device commands.
#[derive(clap::Args)]
pub struct TargetArgs {
    /// Target hostname or IP address
    pub target: String,

    /// Target port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Timeout in seconds for each HTTP round trip
    #[arg(long, value_parser = parse_duration, default_value = "10")]
    pub timeout: Duration,
}
