//! Progress reporting for long-running batch runs, with TTY detection.
//!
//! Renders a live progress bar while tailing the Event Bus in a TTY, and
//! falls back to one line per row when stdout is redirected (a CI log, a
//! pipe into `jq`, etc).

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};
use shipagent_events::{Event, EventKind};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Tracks row-level progress for a single job run and renders it as either
/// a progress bar (TTY) or line-oriented status updates (non-TTY).
pub struct ProgressReporter {
    is_tty: bool,
    total_rows: u64,
    done_rows: u64,
    bar: Option<ProgressBar>,
    start_time: Instant,
}

impl ProgressReporter {
    pub fn new(total_rows: u64) -> Self {
        let is_tty = is_tty();
        let bar = if is_tty {
            let pb = ProgressBar::new(total_rows);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:40}] {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_rows,
            done_rows: 0,
            bar,
            start_time: Instant::now(),
        }
    }

    /// Folds one tailed event into the running tally, re-rendering the bar
    /// (or emitting a line) for row-level and terminal job events. Events
    /// the progress display doesn't care about (`JobStatus`, `BatchProgress`)
    /// are ignored here but still visible to other tail consumers.
    pub fn on_event(&mut self, event: &Event) {
        match event.kind {
            EventKind::RowShipped | EventKind::RowFailed | EventKind::RowSkipped => {
                self.done_rows += 1;
                self.render(&format!("row {}: {:?}", event.row_number.unwrap_or(0), event.kind));
            }
            EventKind::JobCompleted | EventKind::JobFailed => {
                self.render(&format!("job {:?}", event.kind));
            }
            _ => {}
        }
    }

    fn render(&mut self, msg: &str) {
        if self.is_tty {
            if let Some(bar) = &self.bar {
                bar.set_position(self.done_rows.min(self.total_rows));
                bar.set_message(msg.to_string());
            }
        } else {
            eprintln!("[{}/{}] {msg}", self.done_rows, self.total_rows);
        }
    }

    pub fn finish(self) {
        let elapsed = self.start_time.elapsed();
        if let Some(bar) = self.bar {
            bar.finish_with_message(format!("done in {elapsed:?}"));
        } else {
            eprintln!("[{}/{}] done in {elapsed:?}", self.done_rows, self.total_rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample(kind: EventKind, row_number: Option<u32>) -> Event {
        Event::new(kind, Uuid::new_v4(), row_number, serde_json::json!({}))
    }

    #[test]
    fn counts_only_row_terminal_events() {
        let mut reporter = ProgressReporter::new(3);
        reporter.on_event(&sample(EventKind::RowStart, Some(1)));
        assert_eq!(reporter.done_rows, 0);
        reporter.on_event(&sample(EventKind::RowShipped, Some(1)));
        assert_eq!(reporter.done_rows, 1);
        reporter.on_event(&sample(EventKind::RowFailed, Some(2)));
        assert_eq!(reporter.done_rows, 2);
    }

    #[test]
    fn finish_does_not_panic_without_a_tty() {
        let reporter = ProgressReporter::new(1);
        reporter.finish();
    }
}
