// AI
//! 📊 progress.rs: "Are we there yet?", asked once per batch.
//!
//! 🚀 Two things live here:
//! - [`ProgressMetrics`]: a live bar for one sink session. Rows, batches and bytes, with
//!   rates over a sliding window, rendered as a borderless comfy-table inside an indicatif bar.
//! - [`render_transfer_report`]: the after-party table the CLI prints once every session of a
//!   coordinator run is done, success or otherwise.
//!
//! ⚠️ Watching the bar will not make the warehouse ack faster. We checked.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressStyle};

use crate::coordinator::TransferReport;

const MIB: f64 = 1024.0 * 1024.0;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 🔢 "1000000" → "1,000,000".
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS once it gets serious.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

struct Rates {
    rows_per_sec: f64,
    batches_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Live throughput for one session. The bar length is the advertised row count
/// (0 when nobody advertised anything, in which case the bar just spins its wheels).
pub(crate) struct ProgressMetrics {
    label: String,
    expected_rows: u64,
    total_rows: u64,
    total_batches: u64,
    total_bytes: u64,
    progress_bar: ProgressBar,
    /// (when, rows, batches, bytes)
    rate_samples: VecDeque<(Instant, u64, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar does not do Debug, so neither do we, fully
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("expected_rows", &self.expected_rows)
            .field("total_rows", &self.total_rows)
            .field("total_batches", &self.total_batches)
            .finish()
    }
}

impl ProgressMetrics {
    pub(crate) fn new(label: String, expected_rows: u64) -> Self {
        let progress_bar = ProgressBar::new(expected_rows);
        // -- 🐛 the template is a literal; if it ever fails to parse we fall back to the default look
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            progress_bar.set_style(style.progress_chars("=>-"));
        }

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0, 0, 0));

        Self {
            label,
            expected_rows,
            total_rows: 0,
            total_batches: 0,
            total_bytes: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 One more batch went out the door.
    pub(crate) fn update(&mut self, rows: u64, bytes: u64) {
        self.total_rows += rows;
        self.total_batches += 1;
        self.total_bytes += bytes;

        let rates = self.calculate_rates();
        self.render(rates);
        self.progress_bar.set_position(self.total_rows);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    pub(crate) fn total_rows(&self) -> u64 {
        self.total_rows
    }

    fn calculate_rates(&mut self) -> Rates {
        let now = Instant::now();
        while let Some(&(timestamp, ..)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples
            .push_back((now, self.total_rows, self.total_batches, self.total_bytes));

        if let Some(&(oldest, rows, batches, bytes)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest).as_secs_f64();
            if elapsed > 0.0 {
                return Rates {
                    rows_per_sec: self.total_rows.saturating_sub(rows) as f64 / elapsed,
                    batches_per_sec: self.total_batches.saturating_sub(batches) as f64 / elapsed,
                    mib_per_sec: self.total_bytes.saturating_sub(bytes) as f64 / elapsed / MIB,
                };
            }
        }
        Rates {
            rows_per_sec: 0.0,
            batches_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    /// 🎨 Layout:
    /// ```text
    /// | session: <label>
    /// | [=====>----------]
    ///   <rows/s>      <rows so far / expected>
    ///   <batches/s>   <batches so far>
    ///   <MiB/s>       <elapsed>
    /// ```
    fn render(&self, rates: Rates) {
        let rows_progress = if self.expected_rows > 0 {
            format!(
                "{} / {} Rows",
                format_number(self.total_rows),
                format_number(self.expected_rows)
            )
        } else {
            format!("{} Rows", format_number(self.total_rows))
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Rows/s", format_number(rates.rows_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(rows_progress).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} Batches/s", rates.batches_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Batches", format_number(self.total_batches)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} elapsed", format_duration(self.start_time.elapsed())))
                .set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("session: {}\n{}", self.label, table));
    }
}

/// 🧾 One row per session: target, outcome, rows, commit time, and the reason when it failed.
pub fn render_transfer_report(report: &TransferReport) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Target", "Outcome", "Rows", "Batches", "Commit time", "Reason"]);

    for session in &report.sessions {
        let (outcome, rows, batches, commit_time, reason) = match &session.outcome {
            Ok(done) => (
                "✅ committed",
                format_number(done.rows_appended),
                format_number(done.batches_appended as u64),
                done.commit_time.clone().unwrap_or_default(),
                if done.terminated_in_time {
                    String::new()
                } else {
                    "client teardown timed out".to_string()
                },
            ),
            Err(reason) => (
                "💀 failed",
                "-".to_string(),
                "-".to_string(),
                String::new(),
                reason.clone(),
            ),
        };
        table.add_row(vec![
            Cell::new(&session.target),
            Cell::new(outcome),
            Cell::new(rows).set_alignment(CellAlignment::Right),
            Cell::new(batches).set_alignment(CellAlignment::Right),
            Cell::new(commit_time),
            Cell::new(reason),
        ]);
    }

    format!(
        "{table}\n{} of {} sessions committed, {} rows expected, {} elapsed",
        report.succeeded(),
        report.sessions.len(),
        format_number(report.expected_rows),
        format_duration(report.elapsed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_durations_grow_an_hour_column() {
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_updates_accumulate() {
        let mut metrics = ProgressMetrics::new("test".into(), 10);
        metrics.update(3, 100);
        metrics.update(4, 120);
        assert_eq!(metrics.total_rows(), 7);
        assert_eq!(metrics.total_batches, 2);
        assert_eq!(metrics.total_bytes, 220);
        metrics.finish();
    }
}
