// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Bounded-parallel population evaluation
//!
//! One generation of the search loop hands the evaluator a population of
//! optimizer graphs. Candidates are independent units of work: each is
//! restored into an exclusive domain pipeline, fitted through the shared
//! [`OperationsCache`], and scored, with the fan-out bounded by
//! [`EvaluationConfig::n_jobs`] worker threads.
//!
//! Failure containment is per candidate: a fit or score error - and a
//! candidate exceeding the configured timeout - is reported as a failed
//! [`CandidateOutcome`], never as a generation-level error. A timed-out
//! candidate's in-flight fit runs to completion (work is not preempted),
//! but its artifacts land in the cache, so the time is not wholly wasted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::adapter::{PipelineAdapter, RunMetadata};
use crate::cache::OperationsCache;
use crate::error::{Error, Result};
use crate::graph::OptGraph;
use crate::pipeline::{OperationFitter, Pipeline};

/// Scoring collaborator: evaluates a fitted pipeline on validation data.
/// Higher scores are better.
pub trait PipelineScorer: Send + Sync {
    /// Score a fitted candidate.
    ///
    /// # Errors
    ///
    /// Any error marks the candidate as failed; it never aborts the
    /// generation.
    fn score(&self, pipeline: &Pipeline) -> Result<f64>;
}

impl<F> PipelineScorer for F
where
    F: Fn(&Pipeline) -> Result<f64> + Send + Sync,
{
    fn score(&self, pipeline: &Pipeline) -> Result<f64> {
        self(pipeline)
    }
}

/// How many workers evaluate in parallel and how long one candidate may
/// take.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationConfig {
    /// Worker thread count for one generation. Must be at least 1.
    pub n_jobs: usize,
    /// Per-candidate budget for fit-and-score; exceeding it scores the
    /// candidate as a failure. `None` disables the deadline.
    pub timeout: Option<Duration>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            n_jobs: 1,
            timeout: None,
        }
    }
}

impl EvaluationConfig {
    /// Default configuration: one worker, no timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread count.
    #[must_use]
    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = n_jobs;
        self
    }

    /// Set the per-candidate deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of evaluating one candidate. Failures carry enough context for
/// the search loop to log and move on; they are scored as "no improvement".
#[derive(Debug, Clone)]
pub enum CandidateOutcome {
    /// Fit and score completed within budget.
    Scored {
        /// The scorer's value; higher is better.
        score: f64,
        /// Wall-clock time the candidate took.
        elapsed: Duration,
    },
    /// Fit-and-score exceeded the configured timeout.
    TimedOut {
        /// Wall-clock time the candidate took before being cut off.
        elapsed: Duration,
    },
    /// Restore, fit, or score failed.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

impl CandidateOutcome {
    /// Whether the candidate produced a usable score.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Scored { .. })
    }

    /// The score, when present.
    #[must_use]
    pub fn score(&self) -> Option<f64> {
        match self {
            Self::Scored { score, .. } => Some(*score),
            _ => None,
        }
    }
}

/// Evaluates populations of optimizer graphs: restore → fit-with-cache →
/// score, bounded-parallel across candidates.
///
/// Graphs are never shared between workers - every candidate is restored
/// into its own pipeline - so the cache is the only cross-worker state.
pub struct PopulationEvaluator {
    adapter: PipelineAdapter,
    fitter: Arc<dyn OperationFitter>,
    scorer: Arc<dyn PipelineScorer>,
    cache: Option<Arc<OperationsCache>>,
    config: EvaluationConfig,
}

impl PopulationEvaluator {
    /// Evaluator over the given fitting and scoring collaborators.
    #[must_use]
    pub fn new(fitter: Arc<dyn OperationFitter>, scorer: Arc<dyn PipelineScorer>) -> Self {
        Self {
            adapter: PipelineAdapter::new(),
            fitter,
            scorer,
            cache: None,
            config: EvaluationConfig::default(),
        }
    }

    /// Share an operations cache across candidates and generations.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<OperationsCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set worker count and timeout.
    #[must_use]
    pub fn with_config(mut self, config: EvaluationConfig) -> Self {
        self.config = config;
        self
    }

    /// Evaluate every candidate of one generation. Sibling candidates have
    /// no required ordering and run concurrently on up to `n_jobs` workers;
    /// the returned outcomes are positionally aligned with `population`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when `n_jobs` is 0 or the worker pool cannot
    /// be built. Candidate-level failures are reported inside the outcome
    /// vector, never as an `Err`.
    pub fn evaluate_population(
        &self,
        population: &[OptGraph],
        fold: Option<u32>,
    ) -> Result<Vec<CandidateOutcome>> {
        if self.config.n_jobs == 0 {
            return Err(Error::configuration("n_jobs must be at least 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_jobs)
            .build()
            .map_err(|err| {
                Error::configuration(format!("failed to build the evaluation worker pool: {err}"))
            })?;
        debug!(
            candidates = population.len(),
            n_jobs = self.config.n_jobs,
            ?fold,
            "evaluating population"
        );
        Ok(pool.install(|| {
            population
                .par_iter()
                .map(|candidate| self.evaluate_candidate(candidate, fold))
                .collect()
        }))
    }

    /// Evaluate a single candidate: restore an exclusive pipeline, fit it
    /// through the cache, score it, and attach the elapsed time as run
    /// metadata on the way.
    #[must_use]
    pub fn evaluate_candidate(&self, candidate: &OptGraph, fold: Option<u32>) -> CandidateOutcome {
        let started = Instant::now();
        let pipeline = match self.adapter.restore(candidate, RunMetadata::new()) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                warn!(%err, "candidate restore failed");
                return CandidateOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };
        let fitted = match pipeline.fit(self.fitter.as_ref(), self.cache.as_deref(), fold) {
            Ok(fitted) => fitted,
            Err(err) => {
                warn!(%err, "candidate fit failed");
                return CandidateOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };
        if let Some(outcome) = self.check_deadline(started) {
            return outcome;
        }
        let fitted = fitted.with_computation_time(Some(started.elapsed()));
        match self.scorer.score(&fitted) {
            Ok(score) => match self.check_deadline(started) {
                Some(outcome) => outcome,
                None => {
                    debug!(score, elapsed = ?started.elapsed(), "candidate scored");
                    CandidateOutcome::Scored {
                        score,
                        elapsed: started.elapsed(),
                    }
                }
            },
            Err(err) => {
                warn!(%err, "candidate scoring failed");
                CandidateOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn check_deadline(&self, started: Instant) -> Option<CandidateOutcome> {
        let timeout = self.config.timeout?;
        let elapsed = started.elapsed();
        if elapsed <= timeout {
            return None;
        }
        warn!(?elapsed, ?timeout, "candidate exceeded its evaluation budget");
        Some(CandidateOutcome::TimedOut { elapsed })
    }
}
