//! Run progress reporting.
//!
//! Reports observable progress during `kb run` so users see how many
//! batches are planned, how far along the run is, and roughly how long is
//! left. Progress is emitted on **stderr** so stdout stays parseable: the
//! final run report is the only thing `kb run` prints there.

use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

/// Width of the human progress bar, in cells.
const BAR_WIDTH: usize = 24;

/// How a batch ended, as shown in progress output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchStatus {
    /// At least one new fact was appended.
    Accepted,
    /// Completed with nothing new to append.
    Empty,
    /// Ended on a transport error.
    Failed,
}

impl BatchStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Accepted => "accepted",
            BatchStatus::Empty => "empty",
            BatchStatus::Failed => "failed",
        }
    }
}

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Planning finished; `messages` pending messages in `batches` batches.
    Planned {
        messages: u64,
        batches: u64,
        resumed_from: i64,
    },
    /// One batch finished.
    BatchDone {
        batch: u64,
        batches: u64,
        first_id: i64,
        last_id: i64,
        messages_done: u64,
        messages: u64,
        new_facts: u64,
        status: BatchStatus,
        elapsed: Duration,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the run coordinator.
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr:
/// `run  batch 3 / 10  ids 1187..1204  [#######.................]  30%  1,204 / 4,000 messages  +5 facts  eta 2m10s`.
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Planned {
                messages,
                batches,
                resumed_from,
            } => format!(
                "run  planned {} messages in {} batches (after id {})\n",
                format_number(*messages),
                format_number(*batches),
                resumed_from
            ),
            RunProgressEvent::BatchDone {
                batch,
                batches,
                first_id,
                last_id,
                messages_done,
                messages,
                new_facts,
                status,
                elapsed,
            } => {
                let eta = estimate_remaining(*elapsed, *messages_done, *messages)
                    .map(|d| format!("  eta {}", format_duration(d)))
                    .unwrap_or_default();
                let detail = match status {
                    BatchStatus::Failed => "  FAILED".to_string(),
                    _ => format!("  +{} facts", new_facts),
                };
                format!(
                    "run  batch {} / {}  ids {}..{}  [{}] {:>3}%  {} / {} messages{}{}\n",
                    batch,
                    batches,
                    first_id,
                    last_id,
                    render_bar(*messages_done, *messages, BAR_WIDTH),
                    percent(*messages_done, *messages),
                    format_number(*messages_done),
                    format_number(*messages),
                    detail,
                    eta
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Planned {
                messages,
                batches,
                resumed_from,
            } => serde_json::json!({
                "event": "planned",
                "messages": messages,
                "batches": batches,
                "resumed_from": resumed_from
            }),
            RunProgressEvent::BatchDone {
                batch,
                batches,
                first_id,
                last_id,
                messages_done,
                messages,
                new_facts,
                status,
                elapsed,
            } => serde_json::json!({
                "event": "batch",
                "batch": batch,
                "batches": batches,
                "first_id": first_id,
                "last_id": last_id,
                "messages_done": messages_done,
                "messages": messages,
                "new_facts": new_facts,
                "status": status.as_str(),
                "elapsed_ms": elapsed.as_millis() as u64
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

fn render_bar(done: u64, total: u64, width: usize) -> String {
    let filled = if total == 0 {
        width
    } else {
        ((done.min(total) as u128 * width as u128) / total as u128) as usize
    };
    format!("{}{}", "#".repeat(filled), ".".repeat(width - filled))
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    done.min(total) * 100 / total
}

/// Linear extrapolation from the rate so far. `None` until there is a rate.
fn estimate_remaining(elapsed: Duration, done: u64, total: u64) -> Option<Duration> {
    if done == 0 || done >= total {
        return None;
    }
    let per_item = elapsed.as_secs_f64() / done as f64;
    Some(Duration::from_secs_f64(per_item * (total - done) as f64))
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}': expected off, human, or json",
                other
            )),
        }
    }
}
