//! Terminal feedback for the acquisition CLI.
//!
//! Pretty mode draws indicatif spinners on stderr; plain mode prints one line
//! per stage and periodic status lines, which suits logs and pipes.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Snapshot shown on the live status line.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AcquisitionStatus {
    pub fps: u32,
    pub frames: u64,
    pub dropped: u64,
    pub min_fluor: f64,
    pub max_fluor: f64,
    pub recording: bool,
}

impl AcquisitionStatus {
    pub fn summary(&self) -> String {
        format!(
            "{} fps, {} frames, {} dropped, F {:.0}..{:.0}{}",
            self.fps,
            self.frames,
            self.dropped,
            self.min_fluor,
            self.max_fluor,
            if self.recording { ", REC" } else { "" }
        )
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    fn spinner(template: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner
    }

    /// Report a step such as connecting; completion is printed on drop.
    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = Self::spinner("{spinner} {msg}");
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Live status line for a running acquisition.
    pub fn acquisition(&self) -> StatusLine {
        let spinner = self
            .use_pretty()
            .then(|| Self::spinner("{spinner} [{elapsed_precise}] {msg}"));
        StatusLine {
            spinner,
            last_plain: None,
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// Interval between plain-mode status lines.
const PLAIN_STATUS_INTERVAL: Duration = Duration::from_secs(1);

pub struct StatusLine {
    spinner: Option<ProgressBar>,
    last_plain: Option<Instant>,
}

impl StatusLine {
    pub fn update(&mut self, status: &AcquisitionStatus) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(status.summary());
            return;
        }
        let due = self
            .last_plain
            .map_or(true, |last| last.elapsed() >= PLAIN_STATUS_INTERVAL);
        if due {
            eprintln!("... {}", status.summary());
            self.last_plain = Some(Instant::now());
        }
    }

    /// Print a status message without tearing the spinner.
    pub fn message(&self, msg: &str) {
        match &self.spinner {
            Some(spinner) => spinner.println(msg),
            None => eprintln!("{msg}"),
        }
    }

    pub fn finish(self, status: &AcquisitionStatus) {
        let message = format!("✔ acquisition stopped: {}", status.summary());
        match self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn summary_marks_recording() {
        let status = AcquisitionStatus {
            fps: 20,
            frames: 100,
            dropped: 1,
            min_fluor: 3.0,
            max_fluor: 240.0,
            recording: true,
        };
        assert_eq!(status.summary(), "20 fps, 100 frames, 1 dropped, F 3..240, REC");
    }

    #[test]
    fn plain_mode_never_draws_spinners() {
        let ui = Ui::from_args(Some("plain"), true);
        assert!(!ui.use_pretty());
        let ui = Ui::from_args(Some("pretty"), false);
        assert!(!ui.use_pretty());
        let ui = Ui::from_args(None, true);
        assert!(ui.use_pretty());
    }
}
