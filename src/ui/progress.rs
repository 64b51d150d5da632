use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::fixer::{FixPhase, FixProgressState, StepStatus, project};

const CHECK: &str = "✓";
const CROSS: &str = "✗";
const ARROW: &str = "→";
const THOUGHT: &str = "💭";

/// Terminal UI for one asset's fix run, rendered via `indicatif`.
///
/// Two stacked elements: an attempt bar sized by the attempt budget and a
/// spinner carrying the current phase. Completed projection steps and
/// fresh reasoning lines are printed once each as they appear; call
/// [`FixUi::render`] with every snapshot and [`FixUi::finish`] with the
/// terminal one.
pub struct FixUi {
    multi: MultiProgress,
    attempt_bar: ProgressBar,
    phase_bar: ProgressBar,
    printed_steps: AtomicUsize,
    printed_thoughts: AtomicUsize,
    verbose: bool,
}

impl FixUi {
    pub fn new(max_attempts: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let attempt_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let attempt_bar = multi.add(ProgressBar::new(max_attempts));
        attempt_bar.set_style(attempt_style);
        attempt_bar.set_prefix("Attempts");

        let phase_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("   Phase");
        phase_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            attempt_bar,
            phase_bar,
            printed_steps: AtomicUsize::new(0),
            printed_thoughts: AtomicUsize::new(0),
            verbose,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` so
    /// failures and critiques are never silently lost.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Render one progress snapshot.
    pub fn render(&self, state: &FixProgressState) {
        self.attempt_bar.set_position(u64::from(state.attempt));
        self.phase_bar.set_message(format!(
            "{} (attempt {}/{})",
            phase_label(state.phase),
            style(state.attempt).cyan(),
            state.max_attempts
        ));

        let steps = project(state);
        let already = self.printed_steps.load(Ordering::SeqCst);
        for step in steps.iter().skip(already) {
            match step.status {
                StepStatus::Completed => {
                    let score = step
                        .score
                        .map(|s| format!(" ({})", style(s).cyan()))
                        .unwrap_or_default();
                    self.print_line(format!(
                        "  {} {}{}",
                        style(CHECK).green(),
                        step.label,
                        score
                    ));
                }
                StepStatus::Failed => {
                    let detail = step
                        .detail
                        .as_deref()
                        .map(|d| format!(": {}", d))
                        .unwrap_or_default();
                    self.print_line(format!(
                        "  {} {}{}",
                        style(CROSS).red(),
                        step.label,
                        style(detail).dim()
                    ));
                }
                StepStatus::InProgress | StepStatus::Pending => {}
            }
        }
        let settled = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Failed))
            .count();
        // Only settled steps are printed; in-progress ones live on the
        // spinner until they settle.
        if settled > already {
            self.printed_steps.store(settled, Ordering::SeqCst);
        }

        if self.verbose {
            let seen = self.printed_thoughts.load(Ordering::SeqCst);
            for thought in state.thinking.iter().skip(seen) {
                self.print_line(format!(
                    "    {} {}",
                    style(THOUGHT).dim(),
                    style(thought).dim()
                ));
            }
            self.printed_thoughts
                .store(state.thinking.len(), Ordering::SeqCst);
        }
    }

    /// Render the terminal snapshot and close the bars.
    pub fn finish(&self, state: &FixProgressState) {
        self.render(state);
        self.phase_bar.finish_and_clear();
        self.attempt_bar.finish_and_clear();

        match state.phase {
            FixPhase::Complete => {
                if let Some(passed) = state.passed_attempt() {
                    self.print_line(format!(
                        "\n{} Fix passed on attempt {} (score {})",
                        style(CHECK).green().bold(),
                        passed.index,
                        passed.score().unwrap_or_default()
                    ));
                } else {
                    self.print_line(format!(
                        "\n{} No attempt passed after {} tries",
                        style(CROSS).red().bold(),
                        state.attempts.len()
                    ));
                    if let Some(critique) = &state.last_critique {
                        self.print_line(format!(
                            "  {} last critique: {}",
                            style(ARROW).dim(),
                            critique
                        ));
                    }
                }
            }
            FixPhase::Error => {
                let detail = state
                    .failure
                    .as_ref()
                    .map(|f| format!("{}: {}", f.kind, f.message))
                    .unwrap_or_else(|| "unknown failure".to_string());
                self.print_line(format!(
                    "\n{} Fix run could not complete — {}",
                    style(CROSS).red().bold(),
                    detail
                ));
            }
            _ => {}
        }
    }
}

fn phase_label(phase: FixPhase) -> &'static str {
    match phase {
        FixPhase::Generating => "generating fix candidate",
        FixPhase::Verifying => "verifying against compliance",
        FixPhase::Retrying => "retrying with critique",
        FixPhase::Complete => "complete",
        FixPhase::Error => "error",
    }
}
