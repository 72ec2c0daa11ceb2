use crate::config::IterationConfig;
use crate::ensemble::EnsembleSpec;
use crate::error::IterationResult;
use crate::graph::Expr;
use crate::summary::ScopedSummary;
use crate::tensor::{DType, Tensor};
use std::sync::Arc;

/// An ensemble being trained and ranked within an iteration.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub ensemble_spec: EnsembleSpec,
    /// True while this candidate still has local training to do.
    pub is_training: Expr,
    /// Scalar loss used to rank candidates against each other.
    pub adanet_loss: Expr,
    pub is_previous_best: bool,
}

/// Wraps ensemble specs into trainable candidates.
pub trait CandidateBuilder: Send + Sync {
    fn build_candidate(
        &self,
        ensemble_spec: EnsembleSpec,
        training: bool,
        iteration_step: &Expr,
        summary: &Arc<ScopedSummary>,
        is_previous_best: bool,
    ) -> IterationResult<Candidate>;

    /// Step budget after which new candidates stop training, if any.
    fn max_iteration_steps(&self) -> Option<u64> {
        None
    }
}

/// Candidates train until the iteration step reaches a fixed budget.
///
/// The previous best candidate is frozen and never training. Without a
/// budget, new candidates train for as long as the outer loop keeps running.
#[derive(Debug, Clone, Default)]
pub struct MaxStepsCandidateBuilder {
    max_iteration_steps: Option<u64>,
}

impl MaxStepsCandidateBuilder {
    #[must_use]
    pub fn new(max_iteration_steps: Option<u64>) -> Self {
        Self { max_iteration_steps }
    }

    #[must_use]
    pub fn from_config(config: &IterationConfig) -> Self {
        Self::new(config.max_iteration_steps)
    }
}

impl CandidateBuilder for MaxStepsCandidateBuilder {
    fn build_candidate(
        &self,
        ensemble_spec: EnsembleSpec,
        training: bool,
        iteration_step: &Expr,
        summary: &Arc<ScopedSummary>,
        is_previous_best: bool,
    ) -> IterationResult<Candidate> {
        let is_training = match self.max_iteration_steps {
            _ if !training || is_previous_best => Expr::constant(Tensor::scalar_bool(false)),
            None => Expr::constant(Tensor::scalar_bool(true)),
            Some(max_steps) => {
                let max_steps = i64::try_from(max_steps).unwrap_or(i64::MAX);
                Expr::map("is_training", vec![iteration_step.clone()], DType::Bool, move |inputs| {
                    Ok(Tensor::scalar_bool(inputs[0].as_i64()? < max_steps))
                })
            }
        };
        let adanet_loss = ensemble_spec.adanet_loss.clone();
        summary.scalar("adanet_loss", &adanet_loss);
        Ok(Candidate { ensemble_spec, is_training, adanet_loss, is_previous_best })
    }

    fn max_iteration_steps(&self) -> Option<u64> {
        self.max_iteration_steps
    }
}
