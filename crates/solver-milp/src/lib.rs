mod domain;
mod model;

use async_trait::async_trait;
use good_lp::ResolutionError;
use lab_core::{SchedError, Solver};
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info, warn};
use types::{
    Horizon, SoftWeights, SolveEnvelope, SolveReport, SolveResult, SolveStatus, TrainerHours,
};

/// Exact scheduler over the `good_lp` MILP seam. The bundled pure-Rust
/// backend is deterministic and proves optimality, so a successful run
/// reports [`SolveStatus::Optimal`]; the time-limit and worker parameters
/// are forwarded to backends that honor them.
pub struct MilpSolver;

impl MilpSolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MilpSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Solver for MilpSolver {
    async fn solve(&self, env: SolveEnvelope) -> anyhow::Result<SolveResult> {
        Ok(solve_envelope(&env)?)
    }
}

/// Build → solve → extract, with one diagnostic re-solve on infeasibility.
pub fn solve_envelope(env: &SolveEnvelope) -> Result<SolveResult, SchedError> {
    lab_core::validate(&env.instance)?;
    let horizon = Horizon::build(&env.instance.calendar)?;

    let started = Instant::now();
    info!(
        weeks = horizon.week_count(),
        time_limit_sec = env.params.time_limit_sec,
        seed = env.params.seed,
        workers = env.params.worker_count(),
        "building model"
    );

    let prep = domain::build_prep(&env.instance, &horizon)?;
    debug!(
        enrollments = prep.enrollments.len(),
        meetings = prep.meetings.len(),
        pairs = prep.pairs.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "domains reduced"
    );

    match model::run_model(&prep, &env.instance.policy.soft_weights) {
        Ok(outcome) => {
            let records = model::to_records(&prep, &outcome);
            let wall_seconds = started.elapsed().as_secs_f64();
            let groupings = outcome.realized.iter().filter(|r| **r).count() as u32;
            info!(
                objective = outcome.objective,
                records = records.len(),
                groupings,
                wall_seconds,
                "solved to optimality"
            );

            let used = lab_core::scoring::trainer_hours_used(&env.instance, &records);
            let trainer_hours = env
                .instance
                .trainers
                .iter()
                .map(|t| TrainerHours {
                    trainer_id: t.id.clone(),
                    used: used
                        .iter()
                        .find(|(id, _)| id == &t.id)
                        .map(|(_, h)| *h)
                        .unwrap_or(0),
                    budget: t.total_hours,
                })
                .collect();

            Ok(SolveResult {
                status: SolveStatus::Optimal,
                objective: outcome.objective,
                records,
                report: SolveReport {
                    wall_seconds,
                    trainer_hours,
                    groupings,
                    completions: prep.enrollments.len() as u32,
                    stats: json!({
                        "backend": "microlp",
                        "meetings": prep.meetings.len(),
                        "candidates": outcome.candidates,
                        "raw_cells": prep.raw_cells,
                        "grouping_pairs": prep.pairs.len(),
                    }),
                },
            })
        }
        Err(ResolutionError::Infeasible) => {
            // Soft terms cannot make this model infeasible, but the contract
            // is to confirm against the bare hard system before reporting.
            let confirmed = matches!(
                model::run_model(&prep, &SoftWeights::zeroed()),
                Err(ResolutionError::Infeasible)
            );
            warn!(confirmed_hard = confirmed, "model infeasible");
            Err(SchedError::Infeasible)
        }
        Err(e) => {
            warn!(error = %e, "backend returned no solution");
            Err(SchedError::TimeoutNoFeasible)
        }
    }
}
