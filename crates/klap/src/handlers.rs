use std::collections::BTreeMap;

use klap_core::{ClientConfig, Credentials, KlapClient};
use tracing::{debug, error};

use crate::cli::TargetArgs;
use crate::utils::{get_credentials, print_json_response};

fn credentials_or_exit(username: Option<String>, password_stdin: bool) -> Credentials {
    match get_credentials(username, password_stdin) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn client_for(target: &TargetArgs, credentials: &Credentials) -> KlapClient {
    let config = ClientConfig::new(target.target.as_str())
        .with_port(target.port)
        .with_timeout(target.timeout);
    KlapClient::new(config, credentials)
}

/// Handle the handshake command.
pub async fn handle_handshake(target: TargetArgs, username: Option<String>, password_stdin: bool) {
    let credentials = credentials_or_exit(username, password_stdin);
    let mut client = client_for(&target, &credentials);

    debug!(host = %target.target, port = target.port, "starting handshake");
    match client.handshake().await {
        Ok(session) => {
            debug!(seq = session.seq(), "session established");
            println!("Handshake with {}:{} succeeded", target.target, target.port);
        }
        Err(e) => {
            error!(host = %target.target, error = %e, "handshake failed");
            eprintln!("Error: Handshake with {} failed: {}", target.target, e);
            if credentials.is_blank() {
                eprintln!();
                eprintln!("The device may require credentials, try:");
                eprintln!("  klap -u your-email@example.com handshake {}", target.target);
            }
            std::process::exit(1);
        }
    }
}

/// Handle the request command.
pub async fn handle_request(
    target: TargetArgs,
    endpoint: String,
    params: Vec<(String, String)>,
    message: String,
    username: Option<String>,
    password_stdin: bool,
) {
    let credentials = credentials_or_exit(username, password_stdin);
    let mut client = client_for(&target, &credentials);
    let params: BTreeMap<String, String> = params.into_iter().collect();

    debug!(host = %target.target, endpoint = %endpoint, "sending request");
    match client.request_str(&endpoint, &message, Some(&params)).await {
        Ok(response) => print_json_response(&response),
        Err(e) => {
            error!(host = %target.target, error = %e, "request failed");
            eprintln!("Error: Request to {} failed: {}", target.target, e);
            std::process::exit(1);
        }
    }
}
