// Progress reporting for the --verbose flag. A pure observer: it consumes
// engine events, computes instantaneous throughput from its own sample
// anchor, and renders status lines on stderr. It never touches transfer
// state.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::transfer::{Direction, ProgressEvent, TransferState, MIB};

/// Throughput sample anchor: (time, byte offset) of the previous event.
#[derive(Debug)]
pub struct ProgressSample {
    at: Instant,
    bytes: u64,
}

impl ProgressSample {
    pub fn new() -> Self {
        ProgressSample {
            at: Instant::now(),
            bytes: 0,
        }
    }

    /// MiB/s moved since the previous sample; resets the anchor.
    pub fn rate(&mut self, bytes_now: u64) -> f64 {
        self.rate_at(bytes_now, Instant::now())
    }

    fn rate_at(&mut self, bytes_now: u64, now: Instant) -> f64 {
        let mib = bytes_now.saturating_sub(self.bytes) as f64 / MIB as f64;
        let secs = now.duration_since(self.at).as_secs_f64();
        self.at = now;
        self.bytes = bytes_now;
        if secs > 0.0 {
            mib / secs
        } else {
            0.0
        }
    }
}

impl Default for ProgressSample {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders one status line for an in-progress event.
pub fn format_progress_line(ev: &ProgressEvent, rate_mib_s: f64) -> String {
    let verb = match ev.direction {
        Direction::Upload => "Uploaded",
        Direction::Download => "Downloaded",
    };
    let moved_mib = ev.bytes_moved / MIB;
    match (ev.total_bytes, ev.fraction()) {
        (Some(total), Some(fraction)) => format!(
            "{verb} {moved_mib} of {} MiB ({} %). Current speed is {rate_mib_s:.1} MiB/s.",
            total / MIB,
            (fraction * 100.0) as u32,
        ),
        _ => format!("{verb} {moved_mib} MiB. Current speed is {rate_mib_s:.1} MiB/s."),
    }
}

/// Renders the terminal line.
pub fn format_done_line(ev: &ProgressEvent) -> String {
    let verb = match ev.direction {
        Direction::Upload => "uploaded",
        Direction::Download => "downloaded",
    };
    format!("Done! {} bytes {verb}.", ev.bytes_moved)
}

/// Event handler wired into the engine when --verbose is set. Writes to
/// stderr so the data channel (stdout) stays clean.
pub struct ProgressReporter {
    sample: ProgressSample,
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        bar.set_style(ProgressStyle::with_template("{msg}").unwrap());
        ProgressReporter {
            sample: ProgressSample::new(),
            bar,
        }
    }

    pub fn handle(&mut self, ev: &ProgressEvent) {
        match ev.state {
            TransferState::NotStarted => {}
            TransferState::InitiationStarted => self.bar.println("Preparing to upload ..."),
            TransferState::InitiationComplete => self.bar.println("Starting upload ..."),
            TransferState::MediaInProgress => {
                let rate = self.sample.rate(ev.bytes_moved);
                self.bar.set_message(format_progress_line(ev, rate));
            }
            TransferState::MediaComplete => {
                self.bar.finish_with_message(format_done_line(ev));
            }
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
