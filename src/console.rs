//! Line-oriented front end
//!
//! Reads commands from stdin, forwards them to the controller and prints every
//! UI snapshot change as a status line (or one JSON object per line).

use std::io::{self, BufRead};

use tokio::sync::{mpsc, watch};

use crate::controller::{ControllerHandle, UiSnapshot};
use crate::metrics::MetricsReport;
use crate::state_machine::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Empty line: start when idle, stop otherwise
    Toggle,
    /// Print session history and recent errors
    Stats,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_lowercase().as_str() {
            "" => Some(Command::Toggle),
            "start" | "s" => Some(Command::Start),
            "stop" | "x" => Some(Command::Stop),
            "stats" => Some(Command::Stats),
            "help" | "?" => Some(Command::Help),
            "quit" | "exit" | "q" => Some(Command::Quit),
            _ => None,
        }
    }

    /// Controller event for this command, given whether a session is active.
    pub fn to_event(self, active: bool) -> Option<Event> {
        match self {
            Command::Start => Some(Event::Start),
            Command::Stop => Some(Event::Stop),
            Command::Toggle if active => Some(Event::Stop),
            Command::Toggle => Some(Event::Start),
            Command::Stats | Command::Help | Command::Quit => None,
        }
    }
}

pub fn print_help() {
    println!("Commands:");
    println!("  start, s     - Start streaming");
    println!("  stop, x      - Stop streaming");
    println!("  <enter>      - Toggle start/stop");
    println!("  stats        - Show past sessions and errors");
    println!("  quit, q      - Stop and exit (also Ctrl-C)");
}

/// One-line rendering of a snapshot.
pub fn render_line(snapshot: &UiSnapshot) -> String {
    let mut line = format!(
        "[{}] breaths: {}  noise: {}",
        snapshot.status.as_str(),
        snapshot.breath_count,
        if snapshot.noise_detected { "yes" } else { "no" }
    );
    if let Some(stats) = &snapshot.stats {
        line.push_str(&format!("  frames sent: {}", stats.frames_sent));
    }
    if let Some(error) = &snapshot.error {
        line.push_str(&format!("  error: {}", error));
    }
    line
}

/// Multi-line rendering of the metrics report, newest entries first.
pub fn render_report(report: &MetricsReport) -> Vec<String> {
    let mut lines = vec![format!("Sessions started: {}", report.total_sessions)];

    for summary in &report.history {
        let mut line = format!(
            "  {} {}  {}ms  sent {} ({} bytes)  discarded {}  dropped {}  results {}",
            summary.started_at.format("%H:%M:%S"),
            summary.session_uid.as_deref().unwrap_or("-"),
            summary.duration_ms,
            summary.stats.frames_sent,
            summary.stats.bytes_sent,
            summary.stats.frames_discarded,
            summary.stats.frames_dropped,
            summary.stats.results_received
        );
        if let Some(error) = &summary.error_message {
            line.push_str(&format!("  error: {}", error));
        }
        lines.push(line);
    }

    if !report.errors.is_empty() {
        lines.push("Recent errors:".to_string());
        for error in &report.errors {
            lines.push(format!(
                "  {} [{}] {}",
                error.timestamp.format("%H:%M:%S"),
                error.error_type,
                error.message
            ));
        }
    }
    lines
}

fn print_report(report: &MetricsReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(text) => println!("{}", text),
            Err(e) => log::warn!("Console: failed to serialize report: {}", e),
        }
    } else {
        for line in render_report(report) {
            println!("{}", line);
        }
    }
}

fn render(snapshot: &UiSnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(text) => println!("{}", text),
            Err(e) => log::warn!("Console: failed to serialize snapshot: {}", e),
        }
    } else {
        println!("{}", render_line(snapshot));
    }
}

/// Read stdin on a plain thread; the blocking read cannot be cancelled and
/// must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Console: stdin error: {}", e);
                        break;
                    }
                }
            }
            log::debug!("Console: stdin closed");
        });
    if let Err(e) = spawned {
        log::warn!("Console: could not read stdin: {}", e);
    }
    rx
}

/// Run until quit, Ctrl-C, or the controller goes away.
/// The caller is responsible for sending `Exit` afterwards.
pub async fn run_console(
    handle: ControllerHandle,
    mut ui_rx: watch::Receiver<UiSnapshot>,
    json: bool,
) {
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut last_rendered: Option<UiSnapshot> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    if !json {
        print_help();
    }

    loop {
        let snapshot = ui_rx.borrow_and_update().clone();
        if last_rendered.as_ref() != Some(&snapshot) {
            render(&snapshot, json);
            last_rendered = Some(snapshot);
        }

        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    log::warn!("Console: failed to listen for Ctrl-C: {}", e);
                }
                log::info!("Console: interrupted, shutting down");
                break;
            }

            changed = ui_rx.changed() => {
                if changed.is_err() {
                    log::debug!("Console: controller gone");
                    break;
                }
            }

            line = lines.recv(), if stdin_open => {
                let Some(line) = line else {
                    // EOF only stops reading; Ctrl-C still exits
                    stdin_open = false;
                    continue;
                };

                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(Command::Help) => print_help(),
                    Some(Command::Stats) => print_report(&handle.metrics_report(), json),
                    Some(command) => {
                        let active = ui_rx.borrow().active;
                        if let Some(event) = command.to_event(active) {
                            if handle.send(event).await.is_err() {
                                log::debug!("Console: controller gone");
                                break;
                            }
                        }
                    }
                    None => println!("Unknown command: {:?} (try 'help')", line.trim()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ErrorRecord, SessionStats, SessionSummary};
    use crate::state_machine::DisplayStatus;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("start"), Some(Command::Start));
        assert_eq!(Command::parse(" S "), Some(Command::Start));
        assert_eq!(Command::parse("stop"), Some(Command::Stop));
        assert_eq!(Command::parse("x"), Some(Command::Stop));
        assert_eq!(Command::parse(""), Some(Command::Toggle));
        assert_eq!(Command::parse("q"), Some(Command::Quit));
        assert_eq!(Command::parse("?"), Some(Command::Help));
        assert_eq!(Command::parse("stats"), Some(Command::Stats));
        assert_eq!(Command::parse("breathe"), None);
    }

    #[test]
    fn test_toggle_follows_session_activity() {
        assert!(matches!(Command::Toggle.to_event(false), Some(Event::Start)));
        assert!(matches!(Command::Toggle.to_event(true), Some(Event::Stop)));
        assert!(Command::Quit.to_event(true).is_none());
    }

    #[test]
    fn test_render_line() {
        let mut snapshot = UiSnapshot::default();
        assert_eq!(render_line(&snapshot), "[Ready] breaths: 0  noise: no");

        snapshot.status = DisplayStatus::Error;
        snapshot.breath_count = 7;
        snapshot.noise_detected = true;
        snapshot.error = Some("WebSocket error".to_string());
        assert_eq!(
            render_line(&snapshot),
            "[Error] breaths: 7  noise: yes  error: WebSocket error"
        );
    }

    #[test]
    fn test_render_report() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 9, 30, 0).unwrap();
        let report = MetricsReport {
            total_sessions: 2,
            history: vec![SessionSummary {
                session_id: "s1".to_string(),
                session_uid: Some("guest_user_1".to_string()),
                started_at: at,
                duration_ms: 1500,
                stats: SessionStats {
                    frames_sent: 3,
                    bytes_sent: 24576,
                    ..SessionStats::default()
                },
                error_message: Some("WebSocket error".to_string()),
            }],
            errors: vec![ErrorRecord {
                timestamp: at,
                error_type: "transport".to_string(),
                message: "connection refused".to_string(),
                session_id: Some("s1".to_string()),
            }],
        };

        assert_eq!(
            render_report(&report),
            vec![
                "Sessions started: 2".to_string(),
                "  09:30:00 guest_user_1  1500ms  sent 3 (24576 bytes)  discarded 0  dropped 0  results 0  error: WebSocket error".to_string(),
                "Recent errors:".to_string(),
                "  09:30:00 [transport] connection refused".to_string(),
            ]
        );
        assert_eq!(render_report(&MetricsReport::default()).len(), 1);
    }
}
