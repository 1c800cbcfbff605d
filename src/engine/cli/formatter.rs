//! CLI Output Formatting Module
//! Provides consistent, colorized output for terminal UX

use colored::Colorize;

use crate::engine::updater::UpdateEvent;

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print an info message
    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.len()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// Print an update event as it happens
    pub fn event(event: &UpdateEvent) {
        match event {
            UpdateEvent::Ready { .. } => Self::success(&event.describe()),
            UpdateEvent::Failed { .. } => Self::error(&event.describe()),
            UpdateEvent::Busy | UpdateEvent::Cancelled | UpdateEvent::RolledBack { .. } => {
                Self::warning(&event.describe())
            }
            UpdateEvent::DownloadProgress { downloaded, total } => {
                Self::progress(*downloaded, *total)
            }
            // Phase changes are only interesting in logs
            UpdateEvent::PhaseChanged { .. } => {}
            _ => Self::info(&event.describe()),
        }
    }

    /// Print a single-line download progress bar, rewritten in place
    pub fn progress(downloaded: u64, total: Option<u64>) {
        match total {
            Some(total) if total > 0 => {
                let percentage = (downloaded.min(total) as f64 / total as f64 * 100.0) as u32;
                let filled = (percentage / 5) as usize;
                print!(
                    "\r  {} [{}{}] {}% of {}",
                    "▶".bright_blue(),
                    "█".repeat(filled).bright_green(),
                    "░".repeat(20 - filled).bright_black(),
                    percentage,
                    format_size(total)
                );
                if downloaded >= total {
                    println!();
                }
            }
            _ => print!("\r  {} {}", "▶".bright_blue(), format_size(downloaded)),
        }
        std::io::Write::flush(&mut std::io::stdout()).ok();
    }

    /// Print a table header
    pub fn table_header(columns: &[&str]) {
        let header = columns
            .iter()
            .map(|c| c.bright_white().bold().to_string())
            .collect::<Vec<_>>()
            .join(" │ ");
        println!("  {}", header);
        println!("  {}", "─".repeat(header.len()).bright_black());
    }

    /// Print a table row
    pub fn table_row(values: &[&str]) {
        println!("  {}", values.join(" │ "));
    }

    /// Print an empty line
    pub fn blank() {
        println!();
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
