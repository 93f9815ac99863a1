//! Meta-reasoner metrics: cheap per-iteration process-health signals.
//!
//! All inputs are counters the orchestrator already has; nothing here
//! invokes an LLM. The meta-reasoner changes *strategy*, never the plan —
//! plan changes belong to value discovery.

/// Smoothing factor for the value-velocity EMA.
const EMA_ALPHA: f64 = 0.3;

/// Closed set of strategy adjustments the strategy sub-agent may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyAction {
    ChangeTestApproach,
    ChangeFixApproach,
    ChangeExecutionOrder,
    ReduceScope,
    ChangeResearchTiming,
    LowerEscalationThreshold,
}

impl StrategyAction {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "CHANGE_TEST_APPROACH" => Some(Self::ChangeTestApproach),
            "CHANGE_FIX_APPROACH" => Some(Self::ChangeFixApproach),
            "CHANGE_EXECUTION_ORDER" => Some(Self::ChangeExecutionOrder),
            "REDUCE_SCOPE" => Some(Self::ReduceScope),
            "CHANGE_RESEARCH_TIMING" => Some(Self::ChangeResearchTiming),
            "LOWER_ESCALATION_THRESHOLD" => Some(Self::LowerEscalationThreshold),
            _ => None,
        }
    }
}

/// Scan agent stdout for the last `STRATEGY: <TOKEN>` line.
pub fn scan_strategy(stdout: &str) -> Option<StrategyAction> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("STRATEGY:"))
        .filter_map(|token| StrategyAction::parse(token.trim()))
        .next_back()
}

/// Traffic-light classification of process health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Health {
    Green,
    Yellow,
    Red,
}

/// One iteration's raw observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationSample {
    /// passed + blocked test count after the iteration.
    pub settled_tests: u32,
    /// Hash of the latest failing output, if a fix ran this iteration.
    pub error_surface: Option<u64>,
    /// Distinct orchestrated files whose content changed this iteration.
    pub files_touched: u32,
    /// Task and test status transitions observed this iteration (a
    /// regression sweep can flip several at once).
    pub task_transitions: u32,
}

/// Rolling meta-reasoner state.
#[derive(Debug, Clone, Default)]
pub struct MetaMetrics {
    velocity_ema: f64,
    last_settled: Option<u32>,
    last_error_surface: Option<u64>,
    /// Consecutive fixes whose error surface did not change.
    stagnant_fixes: u32,
    concentration_ema: f64,
    churn_ema: f64,
}

impl MetaMetrics {
    pub fn observe(&mut self, sample: &IterationSample) {
        let delta = match self.last_settled {
            Some(prev) => f64::from(sample.settled_tests.saturating_sub(prev)),
            None => 0.0,
        };
        self.velocity_ema = EMA_ALPHA * delta + (1.0 - EMA_ALPHA) * self.velocity_ema;
        self.last_settled = Some(sample.settled_tests);

        if let Some(surface) = sample.error_surface {
            if self.last_error_surface == Some(surface) {
                self.stagnant_fixes += 1;
            } else {
                self.stagnant_fixes = 0;
            }
            self.last_error_surface = Some(surface);
        }

        self.concentration_ema =
            EMA_ALPHA * f64::from(sample.files_touched) + (1.0 - EMA_ALPHA) * self.concentration_ema;
        self.churn_ema =
            EMA_ALPHA * f64::from(sample.task_transitions) + (1.0 - EMA_ALPHA) * self.churn_ema;
    }

    pub fn velocity(&self) -> f64 {
        self.velocity_ema
    }

    /// True when recent fixes keep producing the same error output.
    pub fn fixes_not_converging(&self) -> bool {
        self.stagnant_fixes >= 2
    }

    /// Classify overall health. RED requires two independent signals so a
    /// single slow iteration cannot trigger a strategy change.
    ///
    /// Statuses flip once or twice in a productive iteration and the
    /// orchestrated file set is small, so sustained churn above ~2 files or
    /// ~2 transitions with no settled-test growth is edits going nowhere.
    pub fn health(&self, iterations_observed: u32) -> Health {
        if iterations_observed < 3 {
            return Health::Green;
        }
        let slow = self.velocity_ema < 0.05;
        let stagnant = self.fixes_not_converging();
        let thrashing = self.churn_ema > 2.0 && self.velocity_ema < 0.2;
        let scattered = self.concentration_ema > 2.5 && self.velocity_ema < 0.2;
        let signals =
            u32::from(slow) + u32::from(stagnant) + u32::from(thrashing) + u32::from(scattered);
        match signals {
            0 => Health::Green,
            1 => Health::Yellow,
            _ => Health::Red,
        }
    }
}

/// Bounds on strategy-agent invocation frequency.
#[derive(Debug, Clone, Copy)]
pub struct StrategyPolicy {
    /// Never fire during the first N iterations.
    pub warmup_iterations: u32,
    /// Minimum iterations between invocations.
    pub cooldown_iterations: u32,
    /// Never fire above this fraction of the iteration budget.
    pub budget_ceiling: f64,
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self {
            warmup_iterations: 5,
            cooldown_iterations: 5,
            budget_ceiling: 0.95,
        }
    }
}

impl StrategyPolicy {
    /// Whether a RED reading at `iteration` may invoke the strategy agent.
    /// `last_strategy` is the iteration of the previous strategy change.
    pub fn may_invoke(
        &self,
        iteration: u32,
        last_strategy: Option<u32>,
        max_iterations: u32,
    ) -> bool {
        if iteration <= self.warmup_iterations {
            return false;
        }
        if let Some(last) = last_strategy {
            // Covers both the cooldown and "never immediately after".
            if iteration.saturating_sub(last) <= self.cooldown_iterations {
                return false;
            }
        }
        let ceiling = (f64::from(max_iterations) * self.budget_ceiling) as u32;
        iteration < ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(settled: u32) -> IterationSample {
        IterationSample {
            settled_tests: settled,
            ..IterationSample::default()
        }
    }

    #[test]
    fn velocity_tracks_settled_test_growth() {
        let mut metrics = MetaMetrics::default();
        metrics.observe(&sample(0));
        metrics.observe(&sample(1));
        metrics.observe(&sample(2));
        assert!(metrics.velocity() > 0.3);
    }

    #[test]
    fn repeated_error_surface_flags_non_convergence() {
        let mut metrics = MetaMetrics::default();
        for _ in 0..3 {
            metrics.observe(&IterationSample {
                error_surface: Some(42),
                ..IterationSample::default()
            });
        }
        assert!(metrics.fixes_not_converging());

        metrics.observe(&IterationSample {
            error_surface: Some(7),
            ..IterationSample::default()
        });
        assert!(!metrics.fixes_not_converging());
    }

    #[test]
    fn health_stays_green_during_warmup() {
        let metrics = MetaMetrics::default();
        assert_eq!(metrics.health(1), Health::Green);
    }

    #[test]
    fn stalled_and_stagnant_reads_red() {
        let mut metrics = MetaMetrics::default();
        for _ in 0..4 {
            metrics.observe(&IterationSample {
                settled_tests: 1,
                error_surface: Some(9),
                ..IterationSample::default()
            });
        }
        assert_eq!(metrics.health(6), Health::Red);
    }

    #[test]
    fn sustained_status_churn_without_velocity_reads_red() {
        let mut metrics = MetaMetrics::default();
        // A regression sweep keeps flipping several statuses per iteration
        // while the settled count never grows.
        for _ in 0..4 {
            metrics.observe(&IterationSample {
                settled_tests: 2,
                task_transitions: 4,
                ..IterationSample::default()
            });
        }
        assert_eq!(metrics.health(6), Health::Red);
    }

    #[test]
    fn scattered_file_churn_without_velocity_reads_red() {
        let mut metrics = MetaMetrics::default();
        for _ in 0..4 {
            metrics.observe(&IterationSample {
                settled_tests: 2,
                files_touched: 5,
                ..IterationSample::default()
            });
        }
        assert_eq!(metrics.health(6), Health::Red);
    }

    #[test]
    fn productive_churn_stays_out_of_red() {
        let mut metrics = MetaMetrics::default();
        // The same transition volume with growing settled tests is normal
        // forward motion, not thrashing.
        for settled in 1..=5u32 {
            metrics.observe(&IterationSample {
                settled_tests: settled,
                task_transitions: 4,
                files_touched: 5,
                ..IterationSample::default()
            });
        }
        assert!(metrics.health(6) < Health::Red);
    }

    #[test]
    fn strategy_policy_enforces_warmup_cooldown_and_ceiling() {
        let policy = StrategyPolicy::default();
        assert!(!policy.may_invoke(4, None, 100));
        assert!(policy.may_invoke(10, None, 100));
        assert!(!policy.may_invoke(10, Some(7), 100));
        assert!(policy.may_invoke(13, Some(7), 100));
        assert!(!policy.may_invoke(96, None, 100));
    }

    #[test]
    fn strategy_token_scan_takes_the_last_line() {
        let stdout = "STRATEGY: REDUCE_SCOPE\nnotes\nSTRATEGY: CHANGE_FIX_APPROACH\n";
        assert_eq!(
            scan_strategy(stdout),
            Some(StrategyAction::ChangeFixApproach)
        );
        assert_eq!(scan_strategy("STRATEGY: PANIC\n"), None);
        assert_eq!(scan_strategy("no token"), None);
    }
}
