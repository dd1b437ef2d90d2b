//! Stop the loop when coverage stops improving.

/// Tracks the coverage signal across iterations.
///
/// An iteration improves when its coverage exceeds the best seen before it.
/// A missing signal never improves. After `window` consecutive iterations
/// without improvement the loop is stagnant.
#[derive(Debug, Clone)]
pub struct StagnationGuard {
    window: usize,
    history: Vec<Option<f64>>,
    best: Option<f64>,
    streak: usize,
}

impl StagnationGuard {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: Vec::new(),
            best: None,
            streak: 0,
        }
    }

    /// Record one iteration's coverage. Returns true once stagnant.
    pub fn record(&mut self, coverage: Option<f64>) -> bool {
        let first = self.history.is_empty();
        self.history.push(coverage);

        let improved = match (coverage, self.best) {
            (Some(value), Some(best)) => value > best,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if let Some(value) = coverage
            && self.best.is_none_or(|best| value > best)
        {
            self.best = Some(value);
        }

        // The first iteration sets the baseline.
        if first {
            return false;
        }
        if improved {
            self.streak = 0;
        } else {
            self.streak += 1;
        }
        self.is_stagnant()
    }

    pub fn is_stagnant(&self) -> bool {
        self.streak >= self.window
    }

    pub fn history(&self) -> &[Option<f64>] {
        &self.history
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(window: usize, values: &[Option<f64>]) -> Vec<bool> {
        let mut guard = StagnationGuard::new(window);
        values.iter().map(|v| guard.record(*v)).collect()
    }

    #[test]
    fn test_flat_coverage_stops_after_third_iteration() {
        assert_eq!(
            feed(2, &[Some(50.0), Some(50.0), Some(50.0)]),
            vec![false, false, true]
        );
    }

    #[test]
    fn test_improvement_resets_streak() {
        assert_eq!(
            feed(2, &[Some(50.0), Some(50.0), Some(60.0), Some(55.0), Some(60.0)]),
            vec![false, false, false, false, true]
        );
    }

    #[test]
    fn test_missing_signal_counts_as_no_improvement() {
        assert_eq!(
            feed(2, &[Some(40.0), None, Some(40.0)]),
            vec![false, false, true]
        );
        assert_eq!(feed(2, &[None, None, None]), vec![false, false, true]);
        assert_eq!(feed(2, &[None, Some(10.0), None]), vec![false, false, false]);
    }

    #[test]
    fn test_window_of_one() {
        assert_eq!(feed(1, &[Some(70.0), Some(65.0)]), vec![false, true]);
    }

    #[test]
    fn test_history_and_best() {
        let mut guard = StagnationGuard::new(2);
        guard.record(Some(30.0));
        guard.record(Some(45.0));
        guard.record(None);
        assert_eq!(guard.history(), &[Some(30.0), Some(45.0), None]);
        assert_eq!(guard.best(), Some(45.0));
    }
}
