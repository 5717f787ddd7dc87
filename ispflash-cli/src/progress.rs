//! Console rendering of library events.

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ispflash::{Event, EventSink, Severity};
use log::debug;
use std::sync::{Mutex, PoisonError};

/// Event sink printing to stderr with a chunk progress bar.
///
/// In quiet mode only warnings and errors are printed and no bar is drawn.
pub(crate) struct ConsoleSink {
    quiet: bool,
    fancy: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleSink {
    pub(crate) fn new(quiet: bool, fancy: bool) -> Self {
        Self {
            quiet,
            fancy,
            bar: Mutex::new(None),
        }
    }

    fn new_bar(total: usize) -> ProgressBar {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    }

    fn render(&self, event: &Event) -> String {
        let marker = match (event.severity, self.fancy) {
            (Severity::Info, true) => style("ℹ").blue(),
            (Severity::Hint, true) => style("⏳").yellow(),
            (Severity::Warning, true) => style("⚠").yellow(),
            (Severity::Error, true) => style("✗").red().bold(),
            (Severity::Info, false) => style("info:"),
            (Severity::Hint, false) => style("hint:"),
            (Severity::Warning, false) => style("warning:").yellow(),
            (Severity::Error, false) => style("error:").red().bold(),
            (Severity::Debug, _) => style(""),
        };
        format!("{marker} {}", event.message)
    }

    /// Drop a bar left behind by an aborted operation.
    pub(crate) fn finish(&self) {
        let mut bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = bar.take() {
            pb.abandon();
        }
    }
}

impl EventSink for ConsoleSink {
    fn event(&self, event: Event) {
        match event.severity {
            Severity::Debug => {
                debug!("{}", event.message);
                return;
            },
            Severity::Info | Severity::Hint if self.quiet => return,
            _ => {},
        }

        let line = self.render(&event);
        let bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        match bar.as_ref() {
            Some(pb) => pb.suspend(|| eprintln!("{line}")),
            None => eprintln!("{line}"),
        }
    }

    fn progress(&self, done: usize, total: usize) {
        if self.quiet || !self.fancy {
            return;
        }
        let mut bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        let pb = bar.get_or_insert_with(|| Self::new_bar(total));
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        if done >= total {
            pb.finish_and_clear();
            *bar = None;
        }
    }
}
