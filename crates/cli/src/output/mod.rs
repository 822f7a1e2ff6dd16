//! Output formatting

mod formatter;
mod progress;

pub use formatter::{Formatter, human_size};
pub use progress::TransferProgress;

/// Output settings shared by every command
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Strict JSON on stdout, no colors or progress bars
    pub json: bool,
    pub no_color: bool,
    pub no_progress: bool,
    /// Only errors are printed
    pub quiet: bool,
}
