//! CLI error types with exit code handling
//!
//! Every command returns [`CliError`]; `main` prints it through miette and
//! exits with [`CliError::exit_code`].

use miette::Diagnostic;
use stowage_fetch::FetchError;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// Invalid flags or arguments
    #[error("Invalid input: {message}")]
    #[diagnostic(code(stowage::cli::input))]
    Input {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {message}")]
    #[diagnostic(code(stowage::cli::config))]
    Config { message: String },

    /// The package could not be acquired
    #[error("{message}")]
    #[diagnostic(code(stowage::cli::download))]
    Download {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Nothing matched a lookup (cache entry, stored credential)
    #[error("{message}")]
    #[diagnostic(code(stowage::cli::not_found))]
    NotFound { message: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(stowage::cli::io))]
    Io { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Input { .. } => exit_codes::USAGE_ERROR,
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Download { .. } => exit_codes::DOWNLOAD_ERROR,
            CliError::NotFound { .. } => exit_codes::NOT_FOUND,
            CliError::Io { .. } => exit_codes::IO_ERROR,
        }
    }

    /// Create an input error (user provided invalid input)
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            help: None,
        }
    }

    /// Create an input error with help text
    pub fn input_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

/// Hint shown under acquisition failures a user can act on
fn help_for(err: &FetchError) -> Option<String> {
    match err {
        FetchError::AuthenticationFailed { .. } | FetchError::TokenUnavailable => {
            Some("Check the feed username and password (--username/--password)".to_string())
        }
        FetchError::RateLimited { .. } => Some("Provide GitHub credentials to raise the rate limit".to_string()),
        FetchError::InvalidPackageId { .. } => {
            Some("The package id format depends on the feed type; see `stowage download --help`".to_string())
        }
        _ => None,
    }
}

impl From<FetchError> for CliError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::UnsupportedFeedType { .. } => CliError::input_with_help(
                err.to_string(),
                "Supported feed types: nuget, maven, npm, github, helm, s3, gcs, artifactory, docker, aws-ecr, oci",
            ),
            FetchError::InvalidConfig { .. } => CliError::Config {
                message: err.to_string(),
            },
            FetchError::Io(e) => CliError::Io { message: e.to_string() },
            other => CliError::Download {
                help: help_for(&other),
                message: other.to_string(),
            },
        }
    }
}

impl From<stowage_core::CoreError> for CliError {
    fn from(err: stowage_core::CoreError) -> Self {
        CliError::input(err.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::input(format!("Malformed JSON: {}", err))
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
