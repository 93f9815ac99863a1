//! Meta-reasoner driver: samples process health every iteration and, on a
//! RED reading, asks the strategy sub-agent for one tactical adjustment.
//!
//! Strategy changes alter *how* the loop works (ordering, escalation), not
//! *what* it builds — plan changes stay with value discovery.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::agents::AgentCtx;
use crate::core::metrics::{
    Health, IterationSample, MetaMetrics, StrategyAction, StrategyPolicy, scan_strategy,
};
use crate::core::types::AgentRole;
use crate::io::state::LoopState;

/// Process-lifetime reasoner state. Metrics are deliberately not persisted:
/// a resumed process re-learns health from fresh observations instead of
/// acting on a stale diagnosis.
#[derive(Debug, Default)]
pub struct MetaReasoner {
    metrics: MetaMetrics,
    policy: StrategyPolicy,
    iterations_observed: u32,
    active_strategy: Option<StrategyAction>,
}

impl MetaReasoner {
    pub fn new() -> Self {
        Self {
            metrics: MetaMetrics::default(),
            policy: StrategyPolicy::default(),
            iterations_observed: 0,
            active_strategy: None,
        }
    }

    pub fn active_strategy(&self) -> Option<StrategyAction> {
        self.active_strategy
    }

    /// Observe one iteration; on RED (and within policy bounds) invoke the
    /// strategy agent and adopt its adjustment.
    pub fn observe(
        &mut self,
        ctx: &AgentCtx<'_>,
        state: &mut LoopState,
        sample: &IterationSample,
    ) -> Result<Option<StrategyAction>> {
        self.iterations_observed += 1;
        self.metrics.observe(sample);
        let health = self.metrics.health(self.iterations_observed);
        debug!(?health, velocity = self.metrics.velocity(), "meta sample");

        if health != Health::Red {
            if health == Health::Yellow {
                info!(velocity = self.metrics.velocity(), "process health yellow");
            }
            return Ok(None);
        }

        if !self.policy.may_invoke(
            state.iteration,
            state.strategy_iteration,
            ctx.config.limits.max_iterations,
        ) {
            debug!("health RED but strategy invocation out of policy bounds");
            return Ok(None);
        }

        let diagnosis = format!(
            "value velocity {:.2}, fixes converging: {}",
            self.metrics.velocity(),
            !self.metrics.fixes_not_converging()
        );
        let invocation = ctx.invoke_default(
            AgentRole::Strategy,
            "strategy",
            state.iteration,
            &[("DIAGNOSIS", diagnosis)],
        );

        let action = match invocation {
            Ok(inv) => scan_strategy(&inv.stdout),
            Err(err) => {
                warn!(%err, "strategy invocation failed");
                None
            }
        };

        if let Some(action) = action {
            info!(?action, "adopting strategy change");
            state.strategy_iteration = Some(state.iteration);
            self.active_strategy = Some(action);
        }
        Ok(action)
    }
}
