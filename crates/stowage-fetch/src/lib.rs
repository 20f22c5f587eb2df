//! Stowage package acquisition
//!
//! This crate downloads deployable packages from remote feeds into a local
//! cache:
//!
//! - **Feeds**: NuGet, Maven, npm, GitHub releases, Helm repositories,
//!   S3/GCS buckets, Artifactory, Docker/ECR registries and OCI registries
//! - **Cache**: deterministic, parseable file names under one directory per feed
//! - **Retries**: a fixed-interval policy applied per downloader
//! - **Registries**: Basic to Bearer challenge handling for OCI endpoints
//! - **Containers**: image pulls through the `docker` CLI, with a scoped
//!   credential helper so secrets never reach the engine's config
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stowage_core::{PackageVersion, Variables, VersionFormat};
//! use stowage_fetch::{Downloaders, FeedDescriptor, FeedType, FetchConfig, Services};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let services = Services::new(FetchConfig::load()?, Variables::new())?;
//! let downloaders = Downloaders::new(Arc::new(services));
//!
//! let feed = FeedDescriptor::new("feeds-nuget", "https://api.nuget.org/v3/index.json", FeedType::NuGet);
//! let version = PackageVersion::parse("13.0.3", VersionFormat::Semver)?;
//! let package = downloaders
//!     .download_package("Newtonsoft.Json", &version, feed, false, 5, Duration::from_secs(10))
//!     .await?;
//! println!("{}", package.full_file_path.display());
//! # Ok(())
//! # }
//! ```

pub mod aws;
pub mod cache;
pub mod config;
pub mod credential_helper;
pub mod credentials;
pub mod dispatch;
pub mod downloaders;
pub mod engine;
pub mod error;
pub mod feed;
pub mod http;
pub mod registry;
pub mod retry;

// Re-exports for convenience
pub use cache::PackageCache;
pub use config::FetchConfig;
pub use credential_helper::CredentialHelper;
pub use credentials::FeedCredentials;
pub use dispatch::Downloaders;
pub use downloaders::{DownloadRequest, PackageDownloader, Services};
pub use engine::{ContainerEngine, DockerCli};
pub use error::{FetchError, Result};
pub use feed::{FeedDescriptor, FeedType};
pub use http::{Progress, ProgressSink};
pub use retry::RetryPolicy;
