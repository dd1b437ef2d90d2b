use crate::features::{Counts, ItemStatus};
use crate::phase::{PhaseOutcome, PhaseResult};
use crate::ui::icons::{BLOCKER, CHECK, CLOCK, CROSS, PIVOT, PROGRESS, SKIP, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for one pipeline run, rendered via `indicatif`.
///
/// A phase bar tracks completed phases; during the build phase a second bar
/// (see [`BuildProgress`]) tracks resolved work items.
pub struct PipelineUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    verbose: bool,
}

impl PipelineUI {
    /// Create the UI sized for `total_phases`.
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        Self {
            multi,
            phase_bar,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to `eprintln!` when the
    /// bars are not drawn (no terminal) or the draw fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.is_hidden() || self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn iteration_header(&self, iteration: u32, max: u32) {
        self.phase_bar.reset();
        self.print_line(format!(
            "\n{} {} {}/{}",
            PIVOT,
            style("Iteration").bold(),
            style(iteration).cyan(),
            max
        ));
    }

    pub fn start_phase(&self, name: &str) {
        self.phase_bar
            .set_message(format!("{}", style(name).yellow()));
        if self.verbose {
            self.print_line(format!("  {} {}", style("→").dim(), style(name).dim()));
        }
    }

    pub fn phase_complete(&self, result: &PhaseResult) {
        let icon = match result.outcome {
            PhaseOutcome::Pass => CHECK,
            PhaseOutcome::Warn => WARN,
            PhaseOutcome::Fail => CROSS,
            PhaseOutcome::Skip => SKIP,
        };
        let name = match result.outcome {
            PhaseOutcome::Pass => style(result.name.as_str()).green(),
            PhaseOutcome::Warn => style(result.name.as_str()).yellow(),
            PhaseOutcome::Fail => style(result.name.as_str()).red(),
            PhaseOutcome::Skip => style(result.name.as_str()).dim(),
        };
        self.print_line(format!(
            "  {}{:<14} {} {}",
            icon,
            name,
            style(format!("{:.1}s", result.duration_secs)).dim(),
            result.message
        ));
        self.phase_bar.inc(1);
    }

    /// Add the work-item bar for the build phase.
    pub fn build_progress(&self) -> BuildProgress {
        BuildProgress::attach(&self.multi)
    }

    pub fn finish(&self) {
        self.phase_bar.finish_and_clear();
    }
}

/// Work-item progress bar shown while the agent runs.
#[derive(Clone)]
pub struct BuildProgress {
    multi: MultiProgress,
    bar: ProgressBar,
}

impl BuildProgress {
    fn attach(multi: &MultiProgress) -> Self {
        let style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} {spinner} [{bar:30.green/white}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bar.set_prefix(" Items");
        bar.enable_steady_tick(Duration::from_millis(200));
        Self {
            multi: multi.clone(),
            bar,
        }
    }

    /// A bar that is never drawn.
    pub fn hidden() -> Self {
        let multi = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let bar = multi.add(ProgressBar::hidden());
        Self { multi, bar }
    }

    pub fn update(&self, counts: &Counts) {
        self.bar.set_length(counts.total as u64);
        self.bar.set_position(counts.resolved() as u64);
        self.bar.set_message(format!(
            "{} {:.0}% | {} blocked",
            PROGRESS,
            counts.resolved_pct(),
            counts.blocked
        ));
    }

    pub fn item_resolved(&self, key: &str, status: ItemStatus) {
        let line = match status {
            ItemStatus::Blocked => format!("    {}{}", BLOCKER, style(key).red()),
            _ => format!("    {}{}", CHECK, style(key).green()),
        };
        if !self.multi.is_hidden() {
            let _ = self.multi.println(line);
        }
    }

    pub fn elapsed(&self, elapsed: Duration) {
        let secs = elapsed.as_secs();
        let time_str = if secs >= 60 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}s", secs)
        };
        self.bar.set_prefix(format!("{}{}", CLOCK, time_str));
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
