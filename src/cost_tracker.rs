//! Per-stage USD-equivalent cost accounting.
//!
//! Monitoring only — the underlying subscription is flat-rate, so nothing
//! here throttles a call. Grounded on the accumulation pattern in
//! `cloudllm::orchestration::OrchestrationResponse::total_tokens_used`,
//! which sums token counts across rounds rather than overwriting.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::state::TokenUsage;

/// USD-per-million-token pricing for a single model tier.
#[derive(Debug, Clone, Copy)]
pub struct PricingRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for PricingRate {
    fn default() -> Self {
        // Conservative default tier; callers override via `with_rate`.
        PricingRate {
            input_per_million: 3.0,
            output_per_million: 15.0,
        }
    }
}

impl PricingRate {
    pub fn cost_for(&self, usage: &TokenUsage) -> f64 {
        let input_cost = (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_million;
        let output_cost = (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_million;
        input_cost + output_cost
    }
}

#[derive(Debug, Clone, Default)]
struct StageAccumulator {
    usage: TokenUsage,
}

/// One row of [`CostReport`].
#[derive(Debug, Clone, Serialize)]
pub struct StageCostRecord {
    pub stage: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost_usd: f64,
}

/// Returned by [`CostTracker::generate_report`].
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub stages: Vec<StageCostRecord>,
    pub total_cost_usd: f64,
    pub budget_usd: f64,
    pub utilization_pct: f64,
    pub input_rate_per_million: f64,
    pub output_rate_per_million: f64,
}

/// Per-run, mutable cost accumulator owned by the driver.
#[derive(Debug, Clone)]
pub struct CostTracker {
    rate: PricingRate,
    budget_usd: f64,
    per_stage: BTreeMap<usize, StageAccumulator>,
}

impl CostTracker {
    pub fn new(budget_usd: f64) -> Self {
        CostTracker {
            rate: PricingRate::default(),
            budget_usd,
            per_stage: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, rate: PricingRate) -> Self {
        self.rate = rate;
        self
    }

    /// Accumulates across repair iterations for the same stage rather than
    /// overwriting.
    pub fn record_stage(&mut self, stage: usize, usage: &TokenUsage) {
        let entry = self.per_stage.entry(stage).or_default();
        entry.usage = entry.usage.add(usage);
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.per_stage
            .values()
            .map(|acc| self.rate.cost_for(&acc.usage))
            .sum()
    }

    pub fn within_budget(&self) -> bool {
        self.total_cost_usd() < self.budget_usd
    }

    pub fn generate_report(&self) -> CostReport {
        let stages: Vec<StageCostRecord> = self
            .per_stage
            .iter()
            .map(|(stage, acc)| StageCostRecord {
                stage: *stage,
                input_tokens: acc.usage.input_tokens,
                output_tokens: acc.usage.output_tokens,
                cost_usd: self.rate.cost_for(&acc.usage),
            })
            .collect();
        let total_cost_usd = self.total_cost_usd();
        let utilization_pct = if self.budget_usd > 0.0 {
            (total_cost_usd / self.budget_usd) * 100.0
        } else {
            100.0
        };
        CostReport {
            stages,
            total_cost_usd,
            budget_usd: self.budget_usd,
            utilization_pct,
            input_rate_per_million: self.rate.input_per_million,
            output_rate_per_million: self.rate.output_per_million,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_budget_false_immediately_when_budget_is_zero() {
        let mut tracker = CostTracker::new(0.0);
        tracker.record_stage(
            0,
            &TokenUsage {
                input_tokens: 10,
                output_tokens: 10,
            },
        );
        assert!(!tracker.within_budget());
    }

    #[test]
    fn record_stage_accumulates_across_repair_iterations() {
        let mut tracker = CostTracker::new(100.0);
        tracker.record_stage(
            3,
            &TokenUsage {
                input_tokens: 1_000,
                output_tokens: 500,
            },
        );
        tracker.record_stage(
            3,
            &TokenUsage {
                input_tokens: 1_000,
                output_tokens: 500,
            },
        );
        let report = tracker.generate_report();
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].input_tokens, 2_000);
        assert_eq!(report.stages[0].output_tokens, 1_000);
    }

    #[test]
    fn report_is_sorted_by_stage_id() {
        let mut tracker = CostTracker::new(100.0);
        tracker.record_stage(4, &TokenUsage::default());
        tracker.record_stage(0, &TokenUsage::default());
        tracker.record_stage(2, &TokenUsage::default());
        let report = tracker.generate_report();
        let ids: Vec<usize> = report.stages.iter().map(|r| r.stage).collect();
        assert_eq!(ids, vec![0, 2, 4]);
    }
}
