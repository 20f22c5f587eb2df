//! Credential helper command - the Docker credential helper protocol
//!
//! The container engine runs `docker-credential-stowage <action>` during a
//! pull; the generated script forwards here. Requests arrive on stdin and
//! responses go to stdout, so nothing else may be printed there.

use std::io::Read;
use std::path::PathBuf;
use stowage_fetch::credential_helper::{FALLBACK_PASSWORD, PASSWORD_ENV, StoredCredential};
use stowage_fetch::CredentialHelper;

use crate::error::{CliError, Result};

/// Message the engine recognises as "no credentials"
const NOT_FOUND_MESSAGE: &str = "credentials not found in native keychain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Get,
    Store,
    Erase,
}

pub fn run(action: Action) -> Result<()> {
    let helper = helper_from_env()?;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    match handle(&helper, action, &input) {
        Ok(Some(output)) => {
            println!("{}", output);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err @ CliError::NotFound { .. }) => {
            println!("{}", NOT_FOUND_MESSAGE);
            Err(err)
        }
        Err(err) => Err(err),
    }
}

fn helper_from_env() -> Result<CredentialHelper> {
    let docker_config = std::env::var_os("DOCKER_CONFIG")
        .map(PathBuf::from)
        .ok_or_else(|| {
            CliError::input_with_help(
                "DOCKER_CONFIG is not set",
                "The credential helper is meant to be run by the container engine during a pull",
            )
        })?;

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => password,
        _ => {
            tracing::warn!("{} is not set; using the built-in fallback password", PASSWORD_ENV);
            FALLBACK_PASSWORD.to_string()
        }
    };

    Ok(CredentialHelper::new(docker_config, password))
}

fn server_url(input: &str) -> Result<&str> {
    let server_url = input.trim();
    if server_url.is_empty() {
        return Err(CliError::input("Expected a server URL on stdin"));
    }
    Ok(server_url)
}

/// Serve one request, returning what to write to stdout
fn handle(helper: &CredentialHelper, action: Action, input: &str) -> Result<Option<String>> {
    match action {
        Action::Get => {
            let server_url = server_url(input)?;
            let credential = helper
                .get(server_url)
                .ok_or_else(|| CliError::not_found(format!("No credentials stored for {}", server_url)))?;
            Ok(Some(serde_json::to_string(&credential)?))
        }
        Action::Store => {
            let credential: StoredCredential = serde_json::from_str(input.trim())?;
            if credential.server_url.is_empty() {
                return Err(CliError::input("ServerURL is required"));
            }
            helper.store(&credential.server_url, &credential.username, &credential.secret)?;
            Ok(None)
        }
        Action::Erase => {
            helper.erase(server_url(input)?)?;
            Ok(None)
        }
    }
}
