use chrono::{DateTime, Local, Utc};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use console::{style, Emoji, Term};
use indicatif::{ProgressBar, ProgressStyle};
use mwca_core::csr_types::{CertificateStatus, RequestStatus};
use std::io::Write;
use std::time::Duration;

pub struct Symbols;
impl Symbols {
    pub const SUCCESS: Emoji<'static, 'static> = Emoji("✔", "+");
    pub const WARNING: Emoji<'static, 'static> = Emoji("⚠", "!");
    pub const INFO: Emoji<'static, 'static> = Emoji("ℹ", "i");
    pub const ARROW: Emoji<'static, 'static> = Emoji("➜", ">");
    pub const STEP: Emoji<'static, 'static> = Emoji("⚡", "*");
}

pub fn print_header(title: &str) {
    println!();
    println!("{} {}", Symbols::STEP, style(title).bold().underlined());
    println!();
}

pub fn print_success(message: &str) {
    println!("  {} {}", style(Symbols::SUCCESS).green(), message);
}

pub fn print_warning(message: &str) {
    println!("  {} {}", style(Symbols::WARNING).yellow(), message);
}

pub fn print_info(message: &str) {
    println!("  {} {}", style(Symbols::INFO).blue(), message);
}

pub fn print_next_step(message: &str) {
    println!("  {} {}", style(Symbols::ARROW).cyan(), message);
}

pub fn log_detail(key: &str, value: &str) {
    println!("    {}: {}", style(key).dim(), value);
}

pub fn confirm_action(message: &str) -> bool {
    println!();
    println!(
        "  {} {}",
        style(Symbols::WARNING).yellow(),
        style(message).red().bold()
    );

    let term = Term::stdout();
    print!("  {} (y/N): ", style(Symbols::ARROW).cyan());
    let _ = std::io::stdout().flush();

    let input = term.read_line().unwrap_or_default();
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
        .template("{spinner:.blue} {msg}")
    {
        pb.set_style(spinner_style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect::<Vec<_>>(),
    );
    table
}

pub fn format_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn request_status_cell(status: RequestStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        RequestStatus::PendingApproval => cell.fg(Color::Yellow),
        RequestStatus::Approved => cell.fg(Color::Green).add_attribute(Attribute::Bold),
        RequestStatus::Rejected => cell.fg(Color::Red),
    }
}

pub fn certificate_status_cell(status: CertificateStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        CertificateStatus::Active => cell.fg(Color::Green),
        CertificateStatus::Expired => cell.fg(Color::DarkGrey),
        CertificateStatus::Revoked => cell.fg(Color::Red).add_attribute(Attribute::Bold),
    }
}

/// 截断字符串
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
