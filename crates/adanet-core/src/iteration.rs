//! The immutable record of one built iteration.

use crate::candidate::Candidate;
use crate::ensemble::{ExportOutput, Predictions};
use crate::error::{IterationError, IterationResult};
use crate::graph::{Expr, Op};
use crate::hooks::TrainingHook;
use crate::metrics::MetricOps;
use crate::mode::Mode;
use crate::report::Report;
use crate::summary::ScopedSummary;
use crate::tensor::DType;
use crate::variables::BoolVariable;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Resolves the iteration's completion flag at the point of use.
pub type IsOverFn = Arc<dyn Fn() -> IterationResult<BoolVariable> + Send + Sync>;

/// Everything the execution engine needs to train, evaluate or serve an iteration.
#[derive(Clone)]
pub struct EstimatorSpec {
    pub mode: Mode,
    pub predictions: Predictions,
    /// `None` in predict mode.
    pub loss: Option<Expr>,
    /// A no-op outside of training.
    pub train_op: Op,
    /// Only populated in eval mode.
    pub eval_metric_ops: Option<MetricOps>,
    /// Only populated in predict mode.
    pub export_outputs: Option<BTreeMap<String, ExportOutput>>,
    pub training_chief_hooks: Vec<Arc<dyn TrainingHook>>,
    pub training_hooks: Vec<Arc<dyn TrainingHook>>,
}

impl fmt::Debug for EstimatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstimatorSpec")
            .field("mode", &self.mode)
            .field("predictions", &self.predictions)
            .field("loss", &self.loss)
            .field("train_op", &self.train_op)
            .field("eval_metric_ops", &self.eval_metric_ops.as_ref().map(|m| m.keys().collect::<Vec<_>>()))
            .field("export_outputs", &self.export_outputs)
            .field("training_chief_hooks", &self.training_chief_hooks.len())
            .field("training_hooks", &self.training_hooks.len())
            .finish()
    }
}

/// Unvalidated fields of an `Iteration`.
pub struct IterationParts {
    pub number: i64,
    pub candidates: Vec<Candidate>,
    pub estimator_spec: Option<EstimatorSpec>,
    pub best_candidate_index: Option<Expr>,
    pub summaries: Vec<Arc<ScopedSummary>>,
    pub is_over_fn: IsOverFn,
    pub subnetwork_reports: BTreeMap<String, Report>,
    pub step: Option<Expr>,
}

/// The simultaneous training of several candidates for one round of the
/// ensemble search, and the selection of the best one among them.
///
/// There is at most one `Iteration` per graph.
#[derive(Clone)]
pub struct Iteration {
    number: u64,
    candidates: Vec<Candidate>,
    estimator_spec: EstimatorSpec,
    best_candidate_index: Expr,
    summaries: Vec<Arc<ScopedSummary>>,
    is_over_fn: IsOverFn,
    subnetwork_reports: BTreeMap<String, Report>,
    step: Expr,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> IterationError {
    IterationError::InvalidIteration { field, reason: reason.into() }
}

impl TryFrom<IterationParts> for Iteration {
    type Error = IterationError;

    fn try_from(parts: IterationParts) -> IterationResult<Self> {
        let number = u64::try_from(parts.number)
            .map_err(|_| invalid("number", format!("must be greater than or equal to 0, got {}", parts.number)))?;
        if parts.candidates.is_empty() {
            return Err(invalid("candidates", "must be a non-empty list"));
        }
        let estimator_spec = parts.estimator_spec.ok_or_else(|| invalid("estimator_spec", "is required"))?;
        let best_candidate_index =
            parts.best_candidate_index.ok_or_else(|| invalid("best_candidate_index", "is required"))?;
        if best_candidate_index.dtype() != DType::Int {
            return Err(invalid(
                "best_candidate_index",
                format!("must be an int value, got {}", best_candidate_index.dtype()),
            ));
        }
        let step = parts.step.ok_or_else(|| invalid("step", "is required"))?;
        if step.dtype() != DType::Int {
            return Err(invalid("step", format!("must be an int value, got {}", step.dtype())));
        }
        if parts.summaries.len() != parts.candidates.len() {
            return Err(invalid(
                "summaries",
                format!(
                    "must have one entry per candidate, got {} for {} candidates",
                    parts.summaries.len(),
                    parts.candidates.len()
                ),
            ));
        }
        Ok(Self {
            number,
            candidates: parts.candidates,
            estimator_spec,
            best_candidate_index,
            summaries: parts.summaries,
            is_over_fn: parts.is_over_fn,
            subnetwork_reports: parts.subnetwork_reports,
            step,
        })
    }
}

impl fmt::Debug for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iteration")
            .field("number", &self.number)
            .field("candidates", &self.candidates.iter().map(|c| &c.ensemble_spec.name).collect::<Vec<_>>())
            .field("estimator_spec", &self.estimator_spec)
            .field("best_candidate_index", &self.best_candidate_index)
            .field("subnetwork_reports", &self.subnetwork_reports.keys().collect::<Vec<_>>())
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl Iteration {
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    #[must_use]
    pub fn estimator_spec(&self) -> &EstimatorSpec {
        &self.estimator_spec
    }

    #[must_use]
    pub fn best_candidate_index(&self) -> &Expr {
        &self.best_candidate_index
    }

    #[must_use]
    pub fn summaries(&self) -> &[Arc<ScopedSummary>] {
        &self.summaries
    }

    #[must_use]
    pub fn is_over_fn(&self) -> &IsOverFn {
        &self.is_over_fn
    }

    /// Whether every candidate has finished training.
    pub fn is_over(&self) -> IterationResult<bool> {
        Ok((self.is_over_fn)()?.get())
    }

    #[must_use]
    pub fn subnetwork_reports(&self) -> &BTreeMap<String, Report> {
        &self.subnetwork_reports
    }

    /// Steps since this iteration began, as opposed to the global step.
    #[must_use]
    pub fn step(&self) -> &Expr {
        &self.step
    }
}
