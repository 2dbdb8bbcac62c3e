//! Shared styling utilities for terminal output.

use comfy_table::{Cell, Color};
use console::Style;

use assetsync_core::models::ImportStatus;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Table cell for an import or batch status string.
pub fn status_cell(status: &str) -> Cell {
    match status {
        "success" => Cell::new("✓ success").fg(Color::Green),
        "error" => Cell::new("✗ error").fg(Color::Red),
        "cancelled" => Cell::new("○ cancelled").fg(Color::DarkGrey),
        "queued" => Cell::new("⧗ queued").fg(Color::Yellow),
        other => Cell::new(format!("● {}", other)).fg(Color::Blue),
    }
}

/// One-line summary of a terminal import status.
pub fn outcome(status: ImportStatus, what: &str) -> String {
    match status {
        ImportStatus::Success => success(what),
        ImportStatus::Cancelled => warn(&format!("{} (cancelled)", what)),
        _ => error(what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_keep_text() {
        assert!(success("done").ends_with("done"));
        assert!(error("failed").ends_with("failed"));
        assert!(outcome(ImportStatus::Cancelled, "chair").contains("cancelled"));
    }
}
