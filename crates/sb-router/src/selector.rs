//! Multi-criteria model selection.
//!
//! Every available catalog entry gets four sub-scores in `[0, 1]`:
//!
//! | criterion      | value                                                   |
//! |----------------|---------------------------------------------------------|
//! | performance    | rolling success/speed score, 0.5 with no history        |
//! | specialization | 1.0 if the task type is a specialty, else 0.5           |
//! | availability   | 1.0 (unavailable models never become candidates)        |
//! | cost           | `1 - price / max_price` over the candidates; free = 1.0 |
//!
//! The weighted sum decides. Ties keep catalog scan order.

use std::sync::Arc;

use sb_core::clock::SharedClock;
use sb_core::config::ScoringWeights;
use sb_core::types::{ModelDescriptor, TaskType};
use sb_harness::health::HealthTracker;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::ModelCatalog;
use crate::performance::PerformanceLedger;

const SPECIALIZED: f64 = 1.0;
const GENERIC: f64 = 0.5;

/// Restricts which catalog entries may compete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateFilter {
    Any,
    /// Zero-cost models only. Used after an admission denial.
    FreeOnly,
}

impl CandidateFilter {
    fn admits(self, descriptor: &ModelDescriptor) -> bool {
        match self {
            CandidateFilter::Any => true,
            CandidateFilter::FreeOnly => descriptor.is_free(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub performance: f64,
    pub specialization: f64,
    pub availability: f64,
    pub cost: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Scored,
    Explicit,
    /// Nothing was eligible; the configured default was substituted.
    DefaultFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub model: ModelDescriptor,
    pub task_type: TaskType,
    pub scores: Option<ScoreBreakdown>,
    pub source: SelectionSource,
}

pub struct ModelSelector {
    catalog: Arc<ModelCatalog>,
    performance: Arc<PerformanceLedger>,
    health: Arc<HealthTracker>,
    weights: ScoringWeights,
    default_model: ModelDescriptor,
    clock: SharedClock,
}

impl ModelSelector {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        performance: Arc<PerformanceLedger>,
        health: Arc<HealthTracker>,
        weights: ScoringWeights,
        default_model: ModelDescriptor,
        clock: SharedClock,
    ) -> Self {
        Self {
            catalog,
            performance,
            health,
            weights,
            default_model,
            clock,
        }
    }

    pub fn default_model(&self) -> &ModelDescriptor {
        &self.default_model
    }

    /// Catalog entries the provider listed and the health tracker admits.
    pub fn candidates(&self, filter: CandidateFilter) -> Vec<ModelDescriptor> {
        let now = self.clock.now();
        self.catalog
            .descriptors()
            .into_iter()
            .filter(|d| filter.admits(d))
            .filter(|d| self.catalog.is_listed(d))
            .filter(|d| self.health.is_selectable(d.key(), now))
            .collect()
    }

    /// Scores for every candidate, in catalog order.
    pub async fn score_candidates(
        &self,
        task_type: TaskType,
        filter: CandidateFilter,
    ) -> Vec<(ModelDescriptor, ScoreBreakdown)> {
        let candidates = self.candidates(filter);
        let max_price = candidates
            .iter()
            .map(ModelDescriptor::blended_price)
            .fold(0.0_f64, f64::max);

        let mut scored = Vec::with_capacity(candidates.len());
        for descriptor in candidates {
            let performance = self.performance.score(descriptor.key(), task_type).await;
            let specialization = if descriptor.supports(task_type) {
                SPECIALIZED
            } else {
                GENERIC
            };
            let availability = 1.0;
            let cost = if max_price > 0.0 {
                1.0 - descriptor.blended_price() / max_price
            } else {
                1.0
            };
            let w = &self.weights;
            let total = w.performance * performance
                + w.specialization * specialization
                + w.availability * availability
                + w.cost * cost;
            scored.push((
                descriptor,
                ScoreBreakdown {
                    performance,
                    specialization,
                    availability,
                    cost,
                    total,
                },
            ));
        }
        scored
    }

    /// Highest weighted total wins; the first of equal totals is kept. With
    /// no candidates the configured default is returned, never an error.
    pub async fn select(&self, task_type: TaskType, filter: CandidateFilter) -> Selection {
        let scored = self.score_candidates(task_type, filter).await;

        let mut best: Option<(ModelDescriptor, ScoreBreakdown)> = None;
        for (descriptor, scores) in scored {
            let better = best.as_ref().map_or(true, |(_, b)| scores.total > b.total);
            if better {
                best = Some((descriptor, scores));
            }
        }

        match best {
            Some((model, scores)) => {
                debug!(
                    model = model.key(),
                    task = %task_type,
                    total = scores.total,
                    "model selected"
                );
                Selection {
                    model,
                    task_type,
                    scores: Some(scores),
                    source: SelectionSource::Scored,
                }
            }
            None => {
                warn!(
                    task = %task_type,
                    ?filter,
                    default = self.default_model.key(),
                    "no eligible model, using default"
                );
                Selection {
                    model: self.default_model.clone(),
                    task_type,
                    scores: None,
                    source: SelectionSource::DefaultFallback,
                }
            }
        }
    }
}
