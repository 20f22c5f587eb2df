//! CLI commands

use std::path::Path;
use stowage_fetch::FetchConfig;

use crate::error::{CliError, Result};

pub mod cache;
pub mod credential_helper;
pub mod download;

/// Load the configuration file, or the default one when no path is given
pub fn load_config(path: Option<&Path>) -> Result<FetchConfig> {
    let loaded = match path {
        Some(path) => FetchConfig::load_from(path),
        None => FetchConfig::load(),
    };
    loaded.map_err(|e| CliError::Config { message: e.to_string() })
}
