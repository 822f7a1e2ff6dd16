//! Progress bars for transfer jobs

use indicatif::{ProgressBar, ProgressStyle};
use nb_core::Progress;

use super::Formatter;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} {bytes} ({bytes_per_sec}) {msg}";

/// Progress display for one job; hidden in JSON, quiet or no-progress mode
#[derive(Debug, Clone)]
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(formatter: &Formatter, label: &str) -> Self {
        let bar = if formatter.show_progress() {
            let bar = ProgressBar::new_spinner();
            bar.set_style(spinner_style());
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Apply a snapshot reported by the engine
    pub fn update(&self, progress: &Progress) {
        if let Some(total) = progress.bytes_total
            && self.bar.length() != Some(total)
        {
            self.bar.set_length(total);
            self.bar.set_style(bar_style());
        }
        self.bar.set_position(progress.bytes_transferred);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
