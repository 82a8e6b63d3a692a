use indicatif::{ProgressBar, ProgressStyle};

/// Observer told the job total once and every completion after that.
pub trait Progress: Send + Sync {
    fn set_total(&self, total: u64);
    fn inc(&self);
    fn finish(&self);
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self) {}
    fn finish(&self) {}
}

const TEMPLATE: &str =
    "{pos}/{len} [{bar:40.cyan/blue}] {percent}% {per_sec} elapsed {elapsed} eta {eta}";

/// Terminal progress bar on stderr.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for BarProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    fn inc(&self) {
        self.bar.inc(1);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}
