use crate::types::Progress;
use indicatif::{ProgressBar, ProgressStyle};

/// Terminal progress bar over the bytes of the export document.
pub struct ProgressReporter {
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    /// `total` is the document size in bytes; `quiet` hides the bar.
    pub fn new(total: u64, quiet: bool) -> Self {
        let bar = (!quiet).then(|| {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        });
        Self { bar }
    }

    pub fn update(&self, progress: Progress) {
        let Some(pb) = self.bar.as_ref() else {
            return;
        };
        match progress {
            Progress::Advanced(n) => pb.inc(n),
            Progress::Finished => pb.finish_with_message("done"),
        }
    }

    /// Position in bytes (0 when hidden).
    pub fn position(&self) -> u64 {
        self.bar.as_ref().map_or(0, ProgressBar::position)
    }
}
