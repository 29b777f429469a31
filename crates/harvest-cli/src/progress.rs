//! Terminal progress for engine runs.

use std::time::Duration;

use harvest_core::ProgressSnapshot;
use indicatif::{ProgressBar, ProgressStyle};

/// Bar shown while a batch runs. Starts as a spinner until the engine
/// reports a total.
pub fn create_search_progress() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message("extracting hashes");
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

pub fn apply_snapshot(pb: &ProgressBar, snapshot: &ProgressSnapshot) {
    if snapshot.progress_denominator > 0 {
        pb.set_length(snapshot.progress_denominator);
        pb.set_position(snapshot.progress_numerator.min(snapshot.progress_denominator));
    }
    let (found, of) = snapshot.recovered_count;
    pb.set_message(format!(
        "recovered {found}/{of} | {}",
        format_speed(snapshot.total_speed())
    ));
}

/// Format a guess rate into a human-readable string
pub fn format_speed(per_second: u64) -> String {
    const UNITS: &[&str] = &["H/s", "kH/s", "MH/s", "GH/s", "TH/s"];
    let mut speed = per_second as f64;
    let mut unit_idx = 0;

    while speed >= 1000.0 && unit_idx < UNITS.len() - 1 {
        speed /= 1000.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", per_second, UNITS[0])
    } else {
        format!("{:.2} {}", speed, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0), "0 H/s");
        assert_eq!(format_speed(999), "999 H/s");
        assert_eq!(format_speed(1500), "1.50 kH/s");
        assert_eq!(format_speed(2_000_000_000), "2.00 GH/s");
    }

    #[test]
    fn test_snapshot_sets_length() {
        let pb = ProgressBar::hidden();
        let snapshot = ProgressSnapshot {
            progress_numerator: 25,
            progress_denominator: 100,
            ..ProgressSnapshot::default()
        };
        apply_snapshot(&pb, &snapshot);
        assert_eq!(pb.length(), Some(100));
        assert_eq!(pb.position(), 25);
    }

    #[test]
    fn test_unknown_total_keeps_spinner() {
        let pb = ProgressBar::hidden();
        apply_snapshot(&pb, &ProgressSnapshot::default());
        assert_eq!(pb.position(), 0);
    }
}
