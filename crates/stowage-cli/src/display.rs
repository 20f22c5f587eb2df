//! Terminal output: download progress and package summaries

use console::{Term, style};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;
use stowage_core::PackagePhysicalFileMetadata;
use stowage_fetch::{Progress, ProgressSink};

use crate::error::Result;
use crate::util::{format_size, short_hash};

const BAR_TEMPLATE: &str = "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {msg} {bytes} ({bytes_per_sec})";

/// Draws download progress on stderr
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        Self { bar }
    }

    /// A sink for interactive stderr, `None` otherwise
    pub fn for_terminal(enabled: bool) -> Progress {
        if enabled && Term::stderr().is_term() {
            Some(Arc::new(Self::new()))
        } else {
            None
        }
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn started(&self, label: &str, total: Option<u64>) {
        self.bar.reset();
        let template = match total {
            Some(total) => {
                self.bar.set_length(total);
                BAR_TEMPLATE
            }
            None => SPINNER_TEMPLATE,
        };
        let bar_style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        self.bar.set_style(bar_style);
        self.bar.set_message(label.to_string());
    }

    fn advanced(&self, downloaded: u64) {
        self.bar.set_position(downloaded);
    }

    fn finished(&self) {
        self.bar.finish_and_clear();
    }
}

/// Human-readable summary of an acquired package
pub fn print_metadata(metadata: &PackagePhysicalFileMetadata) {
    println!(
        "{} {} v{}",
        style("✓").green().bold(),
        style(&metadata.package_id).cyan().bold(),
        metadata.version
    );

    if metadata.full_file_path.as_os_str().is_empty() {
        println!("  {} container engine image store", style("Location:").dim());
    } else {
        println!("  {} {}", style("Path:").dim(), metadata.full_file_path.display());
    }
    if !metadata.extension.is_empty() {
        println!("  {} {}", style("Extension:").dim(), metadata.extension);
    }
    println!("  {} {}", style("Size:").dim(), format_size(metadata.size));
    println!("  {} {}", style("Hash:").dim(), short_hash(&metadata.hash, 16));
}

/// Pretty JSON on stdout
pub fn print_json(metadata: &PackagePhysicalFileMetadata) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(metadata)?);
    Ok(())
}
