use std::sync::Arc;
use std::time::Duration;

use circular_buffer::CircularBuffer;

use indicatif::{MultiProgress, ProgressBar, ProgressState, ProgressStyle};

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::shared_types::ByteCount;

const UPDATE_INTERVAL: Duration = Duration::from_millis(500);
const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta}) ({msg})";

type ProgressPoint = (ByteCount, Instant);

pub struct ProgressReporter {
    r_progress: mpsc::Receiver<ByteCount>,
    total_size: Option<ByteCount>,
    multi_progress: MultiProgress,
}

impl ProgressReporter {
    pub fn new(
        r_progress: mpsc::Receiver<ByteCount>,
        total_size: Option<ByteCount>,
        multi_progress: MultiProgress,
    ) -> Self {
        Self {
            r_progress,
            total_size,
            multi_progress,
        }
    }

    /// Runs until every progress sender is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        spawn_progress_reporter(self.total_size, self.r_progress, self.multi_progress)
    }
}

/// Bytes per second between the oldest and newest samples.
fn speed(oldest: &ProgressPoint, latest: &ProgressPoint) -> Option<f64> {
    let (oldest_bytes, oldest_instant) = oldest;
    let (latest_bytes, latest_instant) = latest;
    let elapsed = latest_instant.duration_since(*oldest_instant).as_secs_f64();
    if latest_bytes <= oldest_bytes || elapsed == 0.0 {
        return None;
    }
    Some((latest_bytes - oldest_bytes) as f64 / elapsed)
}

fn format_speed(speed: f64) -> String {
    if speed > 1024.0 * 1024.0 {
        format!("{:.1} MB/s", speed / (1024.0 * 1024.0))
    } else {
        format!("{:.1} kB/s", speed / 1024.0)
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template(TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            write!(w, "{:.1}s", state.eta().as_secs_f64()).ok();
        })
        .progress_chars("#>-")
}

pub(crate) fn spawn_progress_reporter(
    total_size: Option<ByteCount>,
    mut r_progress: mpsc::Receiver<ByteCount>,
    multi: MultiProgress,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut progress = 0;
        let progress_q = Arc::new(RwLock::new(CircularBuffer::<50, ProgressPoint>::new()));
        let pb = total_size.map_or_else(ProgressBar::new_spinner, ProgressBar::new);
        let pb = multi.add(pb);
        pb.set_style(progress_style());

        // Refresh the speed estimate from the sample window
        let speed_task = {
            let progress_q = progress_q.clone();
            let pb = pb.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(UPDATE_INTERVAL).await;
                    let q = progress_q.read().await;
                    if let (Some(oldest), Some(latest)) = (q.front(), q.back()) {
                        if let Some(speed) = speed(oldest, latest) {
                            pb.set_message(format_speed(speed));
                        }
                    }
                }
            })
        };

        while let Some(chunk_size) = r_progress.recv().await {
            progress += chunk_size;
            pb.set_position(progress);
            let mut q = progress_q.write().await;
            q.push_back((progress, Instant::now()));
        }
        speed_task.abort();

        let elapsed = pb.elapsed().as_secs_f64();
        let average = if elapsed > 0.0 {
            progress as f64 / elapsed
        } else {
            0.0
        };
        pb.finish_with_message(format_speed(average));
    })
}
