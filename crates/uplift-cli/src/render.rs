use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use uplift_core::{LogEntry, Severity};
use uplift_installer::{TransactionOutcome, TransactionReport, UpdaterStatus};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style(plain: bool) -> OutputStyle {
    if plain || std::env::var_os("NO_COLOR").is_some() || !std::io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct DownloadProgress {
    style: OutputStyle,
    received: u64,
    total: Option<u64>,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn new(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!();
            println!("{line}");
        }
    }

    pub(crate) fn print_log(self, entries: &[LogEntry]) {
        for entry in entries {
            println!("{}", render_log_line(self.style, entry));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_download(self) -> DownloadProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<10} [{bar:20.cyan/blue}] {bytes:>10}/{total_bytes:10} {elapsed_precise}",
            ) {
                progress_bar.set_style(style.tick_chars("<^>v ").progress_chars("=>-"));
            }
            progress_bar.set_message("download");
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        DownloadProgress {
            style: self.style,
            received: 0,
            total: None,
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl DownloadProgress {
    pub(crate) fn set(&mut self, received: u64, total: Option<u64>) {
        self.received = received;
        self.total = total;

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };
        if let Some(total) = total {
            progress_bar.set_length(total.max(1));
        }
        progress_bar.set_position(received);
    }

    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if self.received > 0 {
            if let Some(line) = render_download_line(
                self.style,
                self.received,
                self.total,
                Some(self.started_at.elapsed()),
            ) {
                println!("{line}");
            }
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::Info => Style::new().fg_color(Some(AnsiColor::BrightBlack.into())),
        Severity::Warning => Style::new()
            .fg_color(Some(AnsiColor::Yellow.into()))
            .effects(Effects::BOLD),
        Severity::Error => Style::new()
            .fg_color(Some(AnsiColor::Red.into()))
            .effects(Effects::BOLD),
    }
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "ok" | "completed" | "valid" => AnsiColor::Green,
        "warning" | "rolled back" | "busy" => AnsiColor::Yellow,
        "error" | "failed" | "invalid" | "recovery failed" => AnsiColor::Red,
        _ => AnsiColor::Cyan,
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => format!("{status}: {message}"),
        OutputStyle::Rich => format!("{} {message}", colorize(status_style(status), status)),
    }
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

pub(crate) fn render_log_line(style: OutputStyle, entry: &LogEntry) -> String {
    let tag = format!("[{}]", entry.severity);
    match style {
        OutputStyle::Plain => format!("{} {tag} {}", entry.timestamp, entry.message),
        OutputStyle::Rich => format!(
            "{} {} {}",
            entry.timestamp,
            colorize(severity_style(entry.severity), &format!("{tag:<9}")),
            entry.message
        ),
    }
}

pub(crate) fn render_download_line(
    style: OutputStyle,
    received: u64,
    total: Option<u64>,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let counts = match total {
        Some(total) => format!("{}/{}", HumanBytes(received), HumanBytes(total)),
        None => HumanBytes(received).to_string(),
    };
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();
    Some(format!(
        "{} {counts}{suffix}",
        colorize(section_style(), "download")
    ))
}

pub(crate) fn outcome_status(outcome: TransactionOutcome) -> &'static str {
    match outcome {
        TransactionOutcome::Completed => "completed",
        TransactionOutcome::Aborted(_) => "failed",
        TransactionOutcome::RolledBack => "rolled back",
        TransactionOutcome::RecoveryFailed => "recovery failed",
    }
}

pub(crate) fn format_report_summary(report: &TransactionReport) -> String {
    let version = report.version.as_deref().unwrap_or("unknown");
    let mut summary = format!(
        "update {} (version {version}, {} warning(s), {} error(s))",
        report.outcome,
        report.count(Severity::Warning),
        report.count(Severity::Error)
    );
    if let Some(error) = &report.error {
        summary.push_str(&format!(": {error}"));
    }
    summary
}

pub(crate) fn format_status_lines(status: &UpdaterStatus) -> Vec<String> {
    let mut lines = vec![format!("version: {}", status.version)];
    lines.push(format!(
        "last update: {}",
        status.last_update.as_deref().unwrap_or("never")
    ));
    match &status.maintenance {
        Some(marker) => {
            lines.push("maintenance: active".to_string());
            lines.extend(marker.lines().map(|line| format!("  {line}")));
        }
        None => lines.push("maintenance: inactive".to_string()),
    }
    lines.push(format!(
        "recovery container: {}",
        status
            .recovery_container
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    ));
    if let Some(entry) = &status.last_log {
        lines.push(format!(
            "last log: [{}] {} {}",
            entry.severity, entry.timestamp, entry.message
        ));
    }
    lines
}

pub(crate) fn status_json(status: &UpdaterStatus) -> serde_json::Value {
    serde_json::json!({
        "version": status.version,
        "last_update": status.last_update,
        "maintenance": status.maintenance.is_some(),
        "recovery_container": status
            .recovery_container
            .as_ref()
            .map(|path| path.display().to_string()),
        "logs": status.last_log,
    })
}
