//! Adaptive pool sizing from smoothed service-time and work-mix estimates.
//!
//! Each tick the scheduler snapshots queue and pool state; the autoscaler
//! turns that into a spawn/stop plan bounded by per-tick budgets so the pool
//! composition drifts toward the measured work mix instead of thrashing.

use crate::config::Config;
use crate::models::WorkerKind;

/// Exponentially weighted moving average over f64 samples.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    value: f64,
    alpha: f64,
}

impl Ewma {
    pub fn new(initial: f64, alpha: f64) -> Self {
        Self {
            value: initial,
            alpha,
        }
    }

    /// Fold in a sample; non-finite samples are ignored.
    pub fn update(&mut self, sample: f64) {
        if sample.is_finite() {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Pool and queue state captured at one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolSnapshot {
    pub pending_markdown: usize,
    pub pending_hybrid: usize,
    pub in_flight_markdown: usize,
    pub in_flight_hybrid: usize,
    pub workers_markdown: usize,
    pub workers_hybrid: usize,
    pub idle_markdown: usize,
    pub idle_hybrid: usize,
    pub max_total: usize,
}

/// Worker lifecycle actions for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub spawn_markdown: usize,
    pub spawn_hybrid: usize,
    pub stop_markdown: usize,
    pub stop_hybrid: usize,
}

impl ScalePlan {
    pub fn is_noop(&self) -> bool {
        *self == ScalePlan::default()
    }
}

#[derive(Debug)]
pub struct Autoscaler {
    markdown_active_ms: Ewma,
    hybrid_active_ms: Ewma,
    markdown_unavailable_rate: Ewma,
}

impl Default for Autoscaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Autoscaler {
    pub fn new() -> Self {
        Self {
            markdown_active_ms: Ewma::new(Config::INITIAL_MARKDOWN_ACTIVE_MS, Config::EWMA_ALPHA),
            hybrid_active_ms: Ewma::new(Config::INITIAL_HYBRID_ACTIVE_MS, Config::EWMA_ALPHA),
            markdown_unavailable_rate: Ewma::new(
                Config::INITIAL_MARKDOWN_UNAVAILABLE_RATE,
                Config::EWMA_ALPHA,
            ),
        }
    }

    /// Record the fetch-to-terminal active time of a finished job.
    pub fn record_active(&mut self, kind: WorkerKind, active_ms: u64) {
        match kind {
            WorkerKind::Markdown => self.markdown_active_ms.update(active_ms as f64),
            WorkerKind::Hybrid => self.hybrid_active_ms.update(active_ms as f64),
        }
    }

    /// Record whether a markdown probe found a companion document.
    pub fn record_markdown_outcome(&mut self, unavailable: bool) {
        self.markdown_unavailable_rate
            .update(if unavailable { 1.0 } else { 0.0 });
    }

    pub fn markdown_unavailable_rate(&self) -> f64 {
        self.markdown_unavailable_rate.value()
    }

    /// Compute per-kind worker targets from expected remaining work.
    pub fn targets(&self, snap: &PoolSnapshot) -> (usize, usize) {
        let markdown_demand = (snap.pending_markdown + snap.in_flight_markdown) as f64;
        // Markdown jobs that will bounce become hybrid work.
        let hybrid_demand = (snap.pending_hybrid + snap.in_flight_hybrid) as f64
            + markdown_demand * self.markdown_unavailable_rate.value();

        let markdown_work_ms = markdown_demand * self.markdown_active_ms.value();
        let hybrid_work_ms = hybrid_demand * self.hybrid_active_ms.value();
        let total_work_ms = markdown_work_ms + hybrid_work_ms;

        let max_total = snap.max_total.max(Config::MIN_TOTAL_WORKERS);
        let desired_total = if total_work_ms > 0.0 {
            ((total_work_ms / Config::AUTOSCALE_TARGET_DRAIN_MS).ceil() as usize)
                .clamp(Config::MIN_TOTAL_WORKERS, max_total)
        } else {
            Config::MIN_TOTAL_WORKERS
        };

        // Split proportional to work, with a per-kind floor.
        let markdown_share = if total_work_ms > 0.0 {
            markdown_work_ms / total_work_ms
        } else {
            0.5
        };
        let floor = Config::MIN_WORKERS_PER_KIND;
        let ceiling = desired_total.saturating_sub(floor).max(floor);
        let target_markdown =
            ((desired_total as f64 * markdown_share).round() as usize).clamp(floor, ceiling);
        let target_hybrid = desired_total.saturating_sub(target_markdown);
        (target_markdown, target_hybrid)
    }

    /// Produce this tick's spawn/stop plan, honoring per-tick budgets and
    /// only ever stopping idle workers.
    pub fn plan(&self, snap: &PoolSnapshot) -> ScalePlan {
        let (target_markdown, target_hybrid) = self.targets(snap);

        let mut plan = ScalePlan::default();
        let mut spawn_budget = Config::MAX_SPAWN_PER_TICK;
        let mut stop_budget = Config::MAX_STOP_PER_TICK;

        let mut workers_markdown = snap.workers_markdown;
        let mut workers_hybrid = snap.workers_hybrid;
        let mut idle_markdown = snap.idle_markdown;
        let mut idle_hybrid = snap.idle_hybrid;

        // Pass 1: rebalance one-for-one when one kind is over target and the
        // other under; this keeps the total steady.
        loop {
            if spawn_budget == 0 || stop_budget == 0 {
                break;
            }
            if workers_markdown > target_markdown
                && workers_hybrid < target_hybrid
                && idle_markdown > 0
            {
                plan.stop_markdown += 1;
                plan.spawn_hybrid += 1;
                workers_markdown -= 1;
                idle_markdown -= 1;
                workers_hybrid += 1;
                spawn_budget -= 1;
                stop_budget -= 1;
                continue;
            }
            if workers_hybrid > target_hybrid
                && workers_markdown < target_markdown
                && idle_hybrid > 0
            {
                plan.stop_hybrid += 1;
                plan.spawn_markdown += 1;
                workers_hybrid -= 1;
                idle_hybrid -= 1;
                workers_markdown += 1;
                spawn_budget -= 1;
                stop_budget -= 1;
                continue;
            }
            break;
        }

        // Pass 2: scale up toward the larger deficit first.
        while spawn_budget > 0 {
            let deficit_markdown = target_markdown.saturating_sub(workers_markdown);
            let deficit_hybrid = target_hybrid.saturating_sub(workers_hybrid);
            if deficit_markdown == 0 && deficit_hybrid == 0 {
                break;
            }
            if deficit_markdown >= deficit_hybrid {
                plan.spawn_markdown += 1;
                workers_markdown += 1;
            } else {
                plan.spawn_hybrid += 1;
                workers_hybrid += 1;
            }
            spawn_budget -= 1;
        }

        // Pass 3: scale down idle surplus.
        while stop_budget > 0 && workers_markdown > target_markdown && idle_markdown > 0 {
            plan.stop_markdown += 1;
            workers_markdown -= 1;
            idle_markdown -= 1;
            stop_budget -= 1;
        }
        while stop_budget > 0 && workers_hybrid > target_hybrid && idle_hybrid > 0 {
            plan.stop_hybrid += 1;
            workers_hybrid -= 1;
            idle_hybrid -= 1;
            stop_budget -= 1;
        }

        plan
    }
}
