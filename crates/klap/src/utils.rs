use std::io::IsTerminal;

use klap_core::Credentials;

/// Read password securely based on the provided options.
///
/// # Priority
///
/// 1. If `password_stdin` is true, read from stdin
/// 2. Otherwise, prompt interactively (if terminal is available)
pub fn read_password(password_stdin: bool, prompt: &str) -> Result<String, String> {
    if password_stdin {
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| format!("Failed to read password from stdin: {}", e))?;
        return Ok(input.trim().to_string());
    }

    if std::io::stdin().is_terminal() {
        eprint!("{}: ", prompt);
        rpassword::read_password().map_err(|e| format!("Failed to read password: {}", e))
    } else {
        Err("No password provided. Use --password-stdin when piping input.".to_string())
    }
}

/// Get credentials from CLI options and environment.
///
/// Without a username the device is addressed with blank credentials.
/// Password is read from KLAP_PASSWORD env var, stdin (if --password-stdin),
/// or interactively prompted.
pub fn get_credentials(
    username: Option<String>,
    password_stdin: bool,
) -> Result<Credentials, String> {
    let Some(user) = username else {
        return Ok(Credentials::blank());
    };

    if let Ok(pass) = std::env::var("KLAP_PASSWORD") {
        return Ok(Credentials::new(user, pass));
    }

    let prompt = format!("Password for {}", user);
    let pass = read_password(password_stdin, &prompt)?;
    Ok(Credentials::new(user, pass))
}

/// Print a response, compacted if it is valid JSON.
pub fn print_json_response(response: &str) {
    match serde_json::from_str::<serde_json::Value>(response) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{}", response),
    }
}
