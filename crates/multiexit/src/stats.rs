//! Exit-depth accounting across many inference batches.

/// Counts how many examples left the encoder at each stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatistics {
    counts: Vec<usize>,
}

impl ExitStatistics {
    pub fn new(num_stages: usize) -> Self {
        Self {
            counts: vec![0; num_stages],
        }
    }

    pub fn num_stages(&self) -> usize {
        self.counts.len()
    }

    /// Records `examples` examples that exited at the 1-based `exit_stage`.
    ///
    /// Stage indices outside `1..=num_stages` are logged and ignored.
    pub fn record(&mut self, exit_stage: usize, examples: usize) {
        match exit_stage
            .checked_sub(1)
            .and_then(|idx| self.counts.get_mut(idx))
        {
            Some(slot) => *slot += examples,
            None => log::warn!(
                "dropping {} examples with exit stage {} outside 1..={}",
                examples,
                exit_stage,
                self.counts.len()
            ),
        }
    }

    /// Per-stage exit counts, index 0 being stage 1.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Mean number of stages executed per example.
    pub fn average_depth(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.weighted_depth() as f64 / total as f64
    }

    /// Stages executed relative to running every example through all stages.
    pub fn cost_ratio(&self) -> f64 {
        let full = self.total() * self.num_stages();
        if full == 0 {
            return 0.0;
        }
        self.weighted_depth() as f64 / full as f64
    }

    /// Fraction of stage computations avoided by exiting early.
    pub fn compute_saving(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            1.0 - self.cost_ratio()
        }
    }

    pub fn merge(&mut self, other: &ExitStatistics) {
        if self.counts.len() < other.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (slot, count) in self.counts.iter_mut().zip(other.counts.iter()) {
            *slot += count;
        }
    }

    fn weighted_depth(&self) -> usize {
        self.counts
            .iter()
            .enumerate()
            .map(|(idx, count)| (idx + 1) * count)
            .sum()
    }
}
