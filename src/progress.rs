//! Transfer progress reporting.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;

const BAR_TEMPLATE: &str = "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes}";

/// A live-updating single status line.
pub trait ProgressDisplay: Send {
    /// Called once before the first byte moves.
    fn start(&mut self, _total: u64) {}

    /// Replace the current status line.
    fn render(&mut self, transferred: u64, status: &str);

    /// Render the final status and release the display.
    fn finish(&mut self, status: &str);
}

/// A byte progress bar on stderr.
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let bar = ProgressBar::new(0);
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDisplay for TerminalProgress {
    fn start(&mut self, total: u64) {
        self.bar.set_length(total);
    }

    fn render(&mut self, transferred: u64, status: &str) {
        self.bar.set_message(status.to_string());
        self.bar.set_position(transferred);
    }

    fn finish(&mut self, status: &str) {
        self.bar.finish_with_message(status.to_string());
    }
}

/// Emits status lines through `log::debug!`. Useful when stderr is not a tty.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressDisplay for LogProgress {
    fn render(&mut self, _transferred: u64, status: &str) {
        log::debug!("{}", status);
    }

    fn finish(&mut self, status: &str) {
        log::info!("{}", status);
    }
}

pub type ProgressFactory = std::sync::Arc<dyn Fn() -> Box<dyn ProgressDisplay> + Send + Sync>;

/// Counts bytes passing through a transfer and renders a percentage.
///
/// Writing never fails; progress is a side channel and must not abort the
/// transfer it observes. A writer dropped before [`ProgressWriter::stop`]
/// finishes its display with an interrupted status.
pub struct ProgressWriter {
    total: u64,
    transferred: u64,
    doing: String,
    done: String,
    display: Box<dyn ProgressDisplay>,
    finished: bool,
}

impl ProgressWriter {
    pub fn new(total: u64, doing: &str, done: &str, mut display: Box<dyn ProgressDisplay>) -> Self {
        display.start(total);
        Self {
            total,
            transferred: 0,
            doing: doing.to_string(),
            done: done.to_string(),
            display,
            finished: false,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        100.0 * self.transferred as f64 / self.total as f64
    }

    pub fn status_line(&self) -> String {
        format!("{}... {:.2}%", self.doing, self.percent())
    }

    pub fn update(&mut self, data: &[u8]) -> usize {
        self.transferred += data.len() as u64;
        let status = self.status_line();
        self.display.render(self.transferred, &status);
        data.len()
    }

    pub fn stop(mut self) {
        let status = format!("{}.", self.done);
        self.display.finish(&status);
        self.finished = true;
    }
}

impl Drop for ProgressWriter {
    fn drop(&mut self) {
        if !self.finished {
            let status = format!("{} interrupted at {:.2}%", self.doing, self.percent());
            self.display.finish(&status);
        }
    }
}

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.update(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
