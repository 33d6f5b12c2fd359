//! Observability of a build: progress reporting and throughput estimates.

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::cell::RefCell;
use std::time::Duration;

use crate::types::{Split, SplitStats};

/// Processing speed of a split and the time left at that speed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub processed: usize,
    pub remaining: usize,
    pub per_hour: f64,
    pub time_left: Duration,
}

impl Throughput {
    /// `processed` locations took `elapsed`; `position` locations of `todo`
    /// have been visited, skipped ones included.
    pub fn measure(processed: usize, position: usize, todo: usize, elapsed: Duration) -> Option<Self> {
        let seconds = elapsed.as_secs_f64();
        if processed == 0 || seconds <= 0.0 {
            return None;
        }
        let per_hour = processed as f64 * 3600.0 / seconds;
        let remaining = todo.saturating_sub(position);
        let time_left = Duration::from_secs_f64(remaining as f64 * seconds / processed as f64);
        Some(Self {
            processed,
            remaining,
            per_hour,
            time_left,
        })
    }

    /// `H:MM left for N of TODO at X/h`
    pub fn describe(&self, todo: usize) -> String {
        let minutes = self.time_left.as_secs() / 60;
        format!(
            "{}:{:02} left for {} of {} at {:.0}/h",
            minutes / 60,
            minutes % 60,
            self.remaining,
            todo,
            self.per_hour
        )
    }
}

/// Receives progress events of a build.
pub trait BuildObserver {
    fn split_started(&self, split: Split, todo: usize);
    fn location_processed(&self, split: Split, position: usize, throughput: Option<Throughput>);
    fn split_finished(&self, split: Split, stats: &SplitStats);
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BuildObserver for NoopObserver {
    fn split_started(&self, _split: Split, _todo: usize) {}
    fn location_processed(&self, _split: Split, _position: usize, _throughput: Option<Throughput>) {}
    fn split_finished(&self, _split: Split, _stats: &SplitStats) {}
}

/// Shows a progress bar per split and logs the split summary.
#[derive(Default)]
pub struct ProgressBarObserver {
    current: RefCell<Option<(ProgressBar, usize)>>,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BuildObserver for ProgressBarObserver {
    fn split_started(&self, split: Split, todo: usize) {
        let label = split.as_str();
        *self.current.borrow_mut() = Some((create_progress_bar(todo as u64, label), todo));
    }

    fn location_processed(&self, split: Split, position: usize, throughput: Option<Throughput>) {
        if let Some((pb, todo)) = self.current.borrow().as_ref() {
            pb.set_position(position as u64);
            if let Some(throughput) = throughput {
                let message = throughput.describe(*todo);
                debug!("[{}] {}", split, message);
                pb.set_message(message);
            }
        }
    }

    fn split_finished(&self, split: Split, stats: &SplitStats) {
        if let Some((pb, _)) = self.current.borrow_mut().take() {
            pb.finish_with_message(format!("{} split complete", split));
        }
        stats.print_summary(split);
    }
}

/// Create a progress bar with the given length and label
pub fn create_progress_bar(len: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{}] [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {{msg}}",
                label
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}
