//! Progress display for transfers.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "{msg:20!} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One progress bar per transfer.
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Standalone bar for `total` bytes labelled `name`.
    pub fn new(total: u64, name: &str) -> Self {
        Self::with_bar(ProgressBar::new(total), name)
    }

    /// Bar attached to a multi-bar display.
    pub fn in_group(group: &MultiProgress, total: u64, name: &str) -> Self {
        Self::with_bar(group.add(ProgressBar::new(total)), name)
    }

    fn with_bar(bar: ProgressBar, name: &str) -> Self {
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.set_message(name.to_string());
        bar.enable_steady_tick(Duration::from_millis(250));
        Self { bar }
    }

    /// Set the absolute byte count.
    pub fn update(&self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    /// Stop the bar at 100%.
    pub fn finish_with_message(&self, message: impl Into<String>) {
        self.bar.set_position(self.bar.length().unwrap_or(0));
        self.bar.finish_with_message(message.into());
    }

    /// Stop the bar where it is.
    pub fn abandon_with_message(&self, message: impl Into<String>) {
        self.bar.abandon_with_message(message.into());
    }
}

/// Format a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
