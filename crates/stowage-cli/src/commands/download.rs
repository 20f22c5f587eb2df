//! Download command - acquire one package into the local cache

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{PackageVersion, Variables};
use stowage_fetch::{Downloaders, FeedCredentials, FeedDescriptor, FeedType, FetchConfig, Services};

use crate::display::{ProgressBarSink, print_json, print_metadata};
use crate::error::Result;

/// Everything the `download` flags carry
pub struct Options {
    pub feed_type: String,
    pub feed_id: String,
    pub feed_uri: String,
    pub package_id: String,
    pub version: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub force: bool,
    pub attempts: Option<u32>,
    pub backoff: Option<Duration>,
    pub cache_dir: Option<PathBuf>,
    pub variables: Vec<(String, String)>,
    pub json: bool,
}

pub async fn run(mut config: FetchConfig, opts: Options) -> Result<()> {
    let feed_type: FeedType = opts.feed_type.parse()?;
    let version = PackageVersion::parse(&opts.version, feed_type.default_version_format())?;

    if let Some(cache_dir) = opts.cache_dir {
        config.cache_root = Some(cache_dir);
    }
    let attempts = opts.attempts.unwrap_or(config.max_attempts);
    let backoff = opts.backoff.unwrap_or(config.backoff);

    let mut variables = Variables::new();
    for (name, value) in opts.variables {
        variables.set(name, value);
    }

    let feed = FeedDescriptor::new(opts.feed_id, opts.feed_uri, feed_type)
        .with_credentials(FeedCredentials::new(opts.username, opts.password));

    let services = Services::new(config, variables)?.with_progress(ProgressBarSink::for_terminal(!opts.json));
    let downloaders = Downloaders::new(Arc::new(services));

    let metadata = downloaders
        .download_package(&opts.package_id, &version, feed, opts.force, attempts, backoff)
        .await?;

    if opts.json {
        print_json(&metadata)?;
    } else {
        print_metadata(&metadata);
    }
    Ok(())
}
