//! Human-readable and JSON output
//!
//! In JSON mode every command prints exactly one JSON document on stdout
//! and errors go to stderr as `{"error": ..., "kind": ...}`.

use comfy_table::presets::NOTHING;
use comfy_table::{Cell, CellAlignment, Table};
use console::Style;
use nb_core::ObjectDescriptor;
use serde::Serialize;

use super::OutputConfig;

/// Styles for listing output; every style is a no-op when color is off
#[derive(Debug, Clone)]
struct Theme {
    dir: Style,
    size: Style,
    date: Style,
    key: Style,
    name: Style,
    success: Style,
    error: Style,
    warning: Style,
}

impl Theme {
    fn new(colored: bool) -> Self {
        let style = |f: fn(Style) -> Style| if colored { f(Style::new()) } else { Style::new() };
        Self {
            dir: style(|s| s.blue().bold()),
            size: style(Style::green),
            date: style(Style::dim),
            key: style(Style::cyan),
            name: style(Style::bold),
            success: style(Style::green),
            error: style(Style::red),
            warning: style(Style::yellow),
        }
    }
}

/// Formats sizes the way every command prints them
pub fn human_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

#[derive(Debug, Clone)]
pub struct Formatter {
    config: OutputConfig,
    theme: Theme,
}

impl Formatter {
    pub fn new(config: OutputConfig) -> Self {
        let theme = Theme::new(!config.no_color && !config.json);
        Self { config, theme }
    }

    pub fn is_json(&self) -> bool {
        self.config.json
    }

    /// Whether progress bars may be drawn
    pub fn show_progress(&self) -> bool {
        !self.config.json && !self.config.quiet && !self.config.no_progress
    }

    pub fn style_dir(&self, text: &str) -> String {
        self.theme.dir.apply_to(text).to_string()
    }

    pub fn style_size(&self, text: &str) -> String {
        self.theme.size.apply_to(text).to_string()
    }

    pub fn style_date(&self, text: &str) -> String {
        self.theme.date.apply_to(text).to_string()
    }

    pub fn style_key(&self, text: &str) -> String {
        self.theme.key.apply_to(text).to_string()
    }

    pub fn style_name(&self, text: &str) -> String {
        self.theme.name.apply_to(text).to_string()
    }

    /// Borderless table used for listings
    pub fn table(&self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        if self.config.no_color {
            table.force_no_tty();
        }
        table.set_header(
            headers
                .iter()
                .map(|h| Cell::new(self.style_key(h)))
                .collect::<Vec<_>>(),
        );
        table
    }

    /// One listing row: modified time, size, name
    pub fn object_row(&self, item: &ObjectDescriptor) -> Vec<Cell> {
        let modified = item
            .last_modified
            .map(|t| t.strftime("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let size = match (item.is_directory, item.size) {
            (true, _) => String::new(),
            (false, Some(size)) => human_size(size),
            (false, None) => "?".to_string(),
        };
        let name = if item.is_directory {
            self.style_dir(&format!("{}/", item.name))
        } else {
            item.name.clone()
        };
        vec![
            Cell::new(self.style_date(&modified)),
            Cell::new(self.style_size(&size)).set_alignment(CellAlignment::Right),
            Cell::new(name),
        ]
    }

    pub fn json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error serializing output: {e}"),
        }
    }

    pub fn success(&self, message: &str) {
        if self.config.quiet || self.config.json {
            return;
        }
        let checkmark = self.theme.success.apply_to("✓");
        println!("{checkmark} {message}");
    }

    /// Errors are printed even in quiet mode
    pub fn error(&self, message: &str) {
        self.error_with_kind(message, None);
    }

    pub fn error_with_kind(&self, message: &str, kind: Option<nb_core::ErrorKind>) {
        if self.config.json {
            let error = serde_json::json!({ "error": message, "kind": kind });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&error).unwrap_or_else(|_| message.to_string())
            );
        } else {
            let cross = self.theme.error.apply_to("✗");
            eprintln!("{cross} {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        if self.config.quiet || self.config.json {
            return;
        }
        let warn_icon = self.theme.warning.apply_to("⚠");
        eprintln!("{warn_icon} {message}");
    }

    pub fn println(&self, message: &str) {
        if self.config.quiet {
            return;
        }
        println!("{message}");
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(OutputConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_core::ResourceUri;

    #[test]
    fn test_json_mode_disables_progress() {
        let formatter = Formatter::new(OutputConfig {
            json: true,
            ..Default::default()
        });
        assert!(formatter.is_json());
        assert!(!formatter.show_progress());
        assert!(Formatter::default().show_progress());
    }

    #[test]
    fn test_plain_styles_in_no_color_mode() {
        let formatter = Formatter::new(OutputConfig {
            no_color: true,
            ..Default::default()
        });
        assert_eq!(formatter.style_dir("logs"), "logs");
    }

    #[test]
    fn test_object_row() {
        let formatter = Formatter::new(OutputConfig {
            no_color: true,
            ..Default::default()
        });
        let file = ObjectDescriptor::object(ResourceUri::parse("s3://b/a.bin").unwrap(), 2048);
        let row = formatter.object_row(&file);
        assert_eq!(row[1].content(), "2 KiB");
        assert_eq!(row[2].content(), "a.bin");

        let dir = ObjectDescriptor::directory(ResourceUri::parse("s3://b/logs/").unwrap());
        assert_eq!(formatter.object_row(&dir)[2].content(), "logs/");
    }
}
