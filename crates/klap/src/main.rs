mod cli;
mod handlers;
mod utils;

use clap::Parser;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    }

    match cli.command {
        Command::Version => {
            println!("klap {}", env!("CARGO_PKG_VERSION"));
            println!("klap-core {}", klap_core::VERSION);
        }

        Command::Handshake { target } => {
            handlers::handle_handshake(target, cli.username, cli.password_stdin).await
        }

        Command::Request {
            target,
            endpoint,
            params,
            message,
        } => {
            handlers::handle_request(
                target,
                endpoint,
                params,
                message,
                cli.username,
                cli.password_stdin,
            )
            .await
        }
    }
}
