//! Worker output parsing: progress markers and result markers.
//!
//! Workers are external programs (Python diffusion scripts, trainers,
//! scrapers), so progress arrives as free text. [`parse_worker_line`]
//! recognises the handful of formats those programs emit and turns them
//! into a [`WorkerEvent`]. Lines that match nothing are log-only.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum stored length of a progress message in characters.
pub const MAX_PROGRESS_MESSAGE_LENGTH: usize = 500;

/// Prefix of the line a worker prints to name its produced artifact.
pub const RESULT_MARKER: &str = "RESULT:";

/// `PROGRESS: 42%`, `progress 42.5 % sampling`.
static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*progress\s*[:=]?\s*(\d+(?:\.\d+)?)\s*%\s*(.*)$").expect("valid regex")
});

/// `step 3/10`, `Epoch 2 of 5`, `page 7/100`.
static STEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:step|epoch|iteration|iter|page|batch)\s+(\d+)\s*(?:/|of)\s*(\d+)")
        .expect("valid regex")
});

/// tqdm bars: ` 45%|####      | 45/100 [00:10<00:12, 4.5it/s]`.
static TQDM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[^|%]*?:\s*)?(\d{1,3})%\|[^|]*\|\s*(\d+)/(\d+)").expect("valid regex")
});

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Latest known progress of a running job.
///
/// Always defined: a job that has not reported anything yet has the
/// all-`None` default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Completion percentage in `0.0..=100.0`.
    pub percent: Option<f32>,
    pub step: Option<u64>,
    pub total_steps: Option<u64>,
    /// Free-text status message from the worker.
    pub message: Option<String>,
}

/// A partial progress report parsed from one line of worker output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<f32>,
    pub step: Option<u64>,
    pub total_steps: Option<u64>,
    pub message: Option<String>,
}

/// Something meaningful a worker said on its output.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Progress(ProgressUpdate),
    /// Reference to the artifact the worker produced.
    Result(String),
}

impl JobProgress {
    /// Merge a partial update into this snapshot.
    ///
    /// Fields present in the update win. When the update carries a step
    /// counter but no percentage, the percentage is derived from
    /// `step / total_steps`.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if update.step.is_some() {
            self.step = update.step;
        }
        if update.total_steps.is_some() {
            self.total_steps = update.total_steps;
        }
        if update.message.is_some() {
            self.message = update.message.clone();
        }

        self.percent = match update.percent {
            Some(p) => Some(clamp_percent(p)),
            None if update.step.is_some() => match (self.step, self.total_steps) {
                (Some(step), Some(total)) if total > 0 => {
                    Some(clamp_percent(step as f32 / total as f32 * 100.0))
                }
                _ => self.percent,
            },
            None => self.percent,
        };
    }

    pub fn is_empty(&self) -> bool {
        self == &JobProgress::default()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one line of worker output.
///
/// Returns `None` for lines that carry no progress or result information.
/// Carriage-return separated redraws (as tqdm emits) are reduced to their
/// last non-empty segment first.
pub fn parse_worker_line(raw: &str) -> Option<WorkerEvent> {
    let line = raw
        .split('\r')
        .map(str::trim_end)
        .filter(|s| !s.trim().is_empty())
        .last()?;
    let trimmed = line.trim();

    if let Some(rest) = trimmed.strip_prefix(RESULT_MARKER) {
        let reference = rest.trim();
        return (!reference.is_empty()).then(|| WorkerEvent::Result(reference.to_string()));
    }

    if trimmed.starts_with('{') {
        return parse_json_line(trimmed);
    }

    if let Some(caps) = TQDM_RE.captures(line) {
        return Some(WorkerEvent::Progress(ProgressUpdate {
            percent: caps[1].parse().ok(),
            step: caps[2].parse().ok(),
            total_steps: caps[3].parse().ok(),
            message: None,
        }));
    }

    if let Some(caps) = PERCENT_RE.captures(trimmed) {
        let message = caps[2].trim();
        return Some(WorkerEvent::Progress(ProgressUpdate {
            percent: caps[1].parse().ok(),
            step: None,
            total_steps: None,
            message: (!message.is_empty()).then(|| truncate_message(message)),
        }));
    }

    if let Some(caps) = STEP_RE.captures(trimmed) {
        return Some(WorkerEvent::Progress(ProgressUpdate {
            percent: None,
            step: caps[1].parse().ok(),
            total_steps: caps[2].parse().ok(),
            message: Some(truncate_message(trimmed)),
        }));
    }

    None
}

/// JSON progress lines: any of `percent` (0-100), `progress` (a 0-1
/// fraction, or 0-100 when above 1), `step`, `total`, `message`, `result`.
fn parse_json_line(line: &str) -> Option<WorkerEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    if let Some(result) = obj.get("result").and_then(Value::as_str) {
        if !result.trim().is_empty() {
            return Some(WorkerEvent::Result(result.trim().to_string()));
        }
    }

    let percent = obj
        .get("percent")
        .and_then(Value::as_f64)
        .or_else(|| {
            obj.get("progress")
                .and_then(Value::as_f64)
                .map(|p| if p <= 1.0 { p * 100.0 } else { p })
        })
        .map(|p| p as f32);
    let step = obj.get("step").and_then(Value::as_u64);
    let total_steps = obj.get("total").and_then(Value::as_u64);
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .map(truncate_message);

    if percent.is_none() && step.is_none() && total_steps.is_none() && message.is_none() {
        return None;
    }

    Some(WorkerEvent::Progress(ProgressUpdate {
        percent,
        step,
        total_steps,
        message,
    }))
}

fn clamp_percent(p: f32) -> f32 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 100.0)
    }
}

fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_PROGRESS_MESSAGE_LENGTH).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn progress(line: &str) -> ProgressUpdate {
        match parse_worker_line(line) {
            Some(WorkerEvent::Progress(update)) => update,
            other => panic!("expected progress from {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn plain_lines_are_log_only() {
        assert_eq!(parse_worker_line("loading model weights"), None);
        assert_eq!(parse_worker_line(""), None);
        assert_eq!(parse_worker_line("   \r  "), None);
    }

    #[test]
    fn percent_marker_with_message() {
        let update = progress("PROGRESS: 42.5% denoising");
        assert_eq!(update.percent, Some(42.5));
        assert_eq!(update.message.as_deref(), Some("denoising"));
    }

    #[test]
    fn percent_marker_case_insensitive() {
        assert_eq!(progress("progress 7%").percent, Some(7.0));
    }

    #[test]
    fn step_counter() {
        let update = progress("Epoch 2 of 5 loss=0.31");
        assert_eq!(update.step, Some(2));
        assert_eq!(update.total_steps, Some(5));
        assert_eq!(update.percent, None);
    }

    #[test]
    fn tqdm_bar_uses_last_redraw() {
        let update = progress(" 10%|#         | 10/100 [00:01<00:09]\r 45%|####      | 45/100 [00:05<00:06]");
        assert_eq!(update.percent, Some(45.0));
        assert_eq!(update.step, Some(45));
        assert_eq!(update.total_steps, Some(100));
    }

    #[test]
    fn tqdm_bar_with_description() {
        let update = progress("Sampling:  80%|########  | 8/10 [00:08<00:02]");
        assert_eq!(update.percent, Some(80.0));
        assert_eq!(update.step, Some(8));
    }

    #[test]
    fn json_progress_fraction() {
        let update = progress(r#"{"progress": 0.25, "message": "warmup"}"#);
        assert_eq!(update.percent, Some(25.0));
        assert_eq!(update.message.as_deref(), Some("warmup"));
    }

    #[test]
    fn json_without_known_keys_is_log_only() {
        assert_eq!(parse_worker_line(r#"{"lr": 0.001}"#), None);
        assert_eq!(parse_worker_line("{not json"), None);
    }

    #[test]
    fn result_markers() {
        assert_matches!(
            parse_worker_line("RESULT: /data/outputs/generation/7"),
            Some(WorkerEvent::Result(r)) if r == "/data/outputs/generation/7"
        );
        assert_matches!(
            parse_worker_line(r#"{"result": "ckpt-0042.safetensors"}"#),
            Some(WorkerEvent::Result(r)) if r == "ckpt-0042.safetensors"
        );
        assert_eq!(parse_worker_line("RESULT:   "), None);
    }

    #[test]
    fn apply_derives_percent_from_steps() {
        let mut snapshot = JobProgress::default();
        snapshot.apply(&ProgressUpdate {
            step: Some(3),
            total_steps: Some(12),
            ..Default::default()
        });
        assert_eq!(snapshot.percent, Some(25.0));

        // A later step without a total reuses the known total.
        snapshot.apply(&ProgressUpdate {
            step: Some(6),
            ..Default::default()
        });
        assert_eq!(snapshot.percent, Some(50.0));
        assert_eq!(snapshot.total_steps, Some(12));
    }

    #[test]
    fn apply_clamps_and_keeps_message() {
        let mut snapshot = JobProgress::default();
        snapshot.apply(&ProgressUpdate {
            percent: Some(140.0),
            message: Some("almost".into()),
            ..Default::default()
        });
        assert_eq!(snapshot.percent, Some(100.0));

        snapshot.apply(&ProgressUpdate {
            percent: Some(-3.0),
            ..Default::default()
        });
        assert_eq!(snapshot.percent, Some(0.0));
        assert_eq!(snapshot.message.as_deref(), Some("almost"));
    }

    #[test]
    fn default_snapshot_is_empty() {
        assert!(JobProgress::default().is_empty());
    }
}
