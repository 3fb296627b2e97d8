use crate::executor::{JobOutcome, ProgressEvent};
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{prefix:.bold} [{bar:40.green/white}] {percent:>3}% {bytes}/{total_bytes} @ {msg} ETA {eta}";

/// Terminal renderer for a job's progress events.
///
/// One bar per pass; every other event is printed as a line above the bar.
pub struct ProgressRenderer {
    visible: bool,
    bar: Option<ProgressBar>,
    total_passes: usize,
    lines: Vec<String>,
}

impl ProgressRenderer {
    /// Draw to stderr.
    pub fn new() -> Self {
        Self::with_visibility(true)
    }

    /// Draw nothing; lines are still collected. Used with JSON logging and in tests.
    pub fn hidden() -> Self {
        Self::with_visibility(false)
    }

    fn with_visibility(visible: bool) -> Self {
        Self {
            visible,
            bar: None,
            total_passes: 0,
            lines: Vec::new(),
        }
    }

    /// Status lines printed so far, without color.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Position of the current pass bar, if one is active.
    pub fn position(&self) -> Option<u64> {
        self.bar.as_ref().map(ProgressBar::position)
    }

    pub fn handle(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::JobStarted { total_passes, .. } => {
                self.total_passes = *total_passes;
            }
            ProgressEvent::PassStarted { pass_index, .. } => {
                let target = if self.visible {
                    ProgressDrawTarget::stderr()
                } else {
                    ProgressDrawTarget::hidden()
                };
                let bar = ProgressBar::with_draw_target(None, target);
                let style = ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▓░");
                bar.set_style(style);
                bar.set_prefix(format!("pass {}/{}", pass_index + 1, self.total_passes));
                if let Some(old) = self.bar.replace(bar) {
                    old.finish_and_clear();
                }
            }
            ProgressEvent::Progress {
                bytes_done,
                bytes_total,
                bytes_per_second,
                ..
            } => {
                if let Some(ref bar) = self.bar {
                    bar.set_length(*bytes_total);
                    bar.set_position(*bytes_done);
                    bar.set_message(format!("{}/s", human_bytes(*bytes_per_second)));
                }
                return;
            }
            ProgressEvent::PassCompleted { .. } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_and_clear();
                }
            }
            _ => {}
        }

        if let Some(line) = describe_event(event) {
            let shown = match event {
                ProgressEvent::HiddenRegionRestoreFailed { .. }
                | ProgressEvent::Stalled { .. }
                | ProgressEvent::SectorSkipped { .. } => line.yellow().to_string(),
                ProgressEvent::JobFinished { outcome } => {
                    format!("{} {}", "job finished:".bold(), outcome_label(*outcome))
                }
                _ => line.clone(),
            };
            match self.bar {
                Some(ref bar) => bar.println(shown),
                None if self.visible => eprintln!("{}", shown),
                None => {}
            }
            self.lines.push(line);
        }
    }

    /// Clear any bar left over from an interrupted job.
    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line description of an event; `None` for the high-rate `Progress` events.
pub fn describe_event(event: &ProgressEvent) -> Option<String> {
    let text = match event {
        ProgressEvent::JobStarted {
            device_id,
            method_id,
            total_passes,
            bytes_per_pass,
            ..
        } => format!(
            "{}: {} ({} pass{}, {} each)",
            device_id,
            method_id,
            total_passes,
            if *total_passes == 1 { "" } else { "es" },
            human_bytes(*bytes_per_pass)
        ),
        ProgressEvent::PreErasureCaptured { samples } => {
            format!("captured {} pre-erasure samples", samples)
        }
        ProgressEvent::PassStarted {
            pass_index,
            total_passes,
            description,
        } => format!("pass {}/{}: {}", pass_index + 1, total_passes, description),
        ProgressEvent::HiddenRegionExposed {
            kind,
            offset,
            length,
            ..
        } => format!("{} at {} exposed ({})", kind, offset, human_bytes(*length)),
        ProgressEvent::HiddenRegionRestored { kind, offset, .. } => {
            format!("{} at {} restored", kind, offset)
        }
        ProgressEvent::HiddenRegionRestoreFailed {
            kind,
            offset,
            reason,
            ..
        } => format!("{} at {} NOT restored: {}", kind, offset, reason),
        ProgressEvent::Progress { .. } => return None,
        ProgressEvent::SectorSkipped { pass_index, offset } => {
            format!("pass {}: skipped bad sector at {}", pass_index + 1, offset)
        }
        ProgressEvent::PassCompleted {
            pass_index,
            bytes_written,
            elapsed,
        } => format!(
            "pass {} done: {} in {}",
            pass_index + 1,
            human_bytes(*bytes_written),
            humantime::format_duration(std::time::Duration::from_secs(elapsed.as_secs()))
        ),
        ProgressEvent::Stalled { watermark } => format!(
            "no progress for {}",
            humantime::format_duration(*watermark)
        ),
        ProgressEvent::JobFinished { outcome } => format!("job finished: {}", outcome),
    };
    Some(text)
}

pub fn outcome_label(outcome: JobOutcome) -> ColoredString {
    match outcome {
        JobOutcome::Success => outcome.as_str().green().bold(),
        JobOutcome::Partial => outcome.as_str().yellow().bold(),
        JobOutcome::Failed => outcome.as_str().red().bold(),
        JobOutcome::Aborted => outcome.as_str().red(),
    }
}

/// Binary-prefixed size, e.g. "1.50 MiB".
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
