//! What an ensemble exposes to the iteration, and the collaborator that builds it.

use crate::dict_utils::NestedMap;
use crate::error::IterationResult;
use crate::graph::{Expr, Op};
use crate::hooks::TrainingHook;
use crate::metrics::MetricOps;
use crate::mode::Mode;
use crate::report::Report;
use crate::summary::ScopedSummary;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type Features = BTreeMap<String, Expr>;

/// Model params as handed to the model function, e.g. `{"batch_size": 32}`.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Predictions are either one tensor or a set of named tensors.
#[derive(Debug, Clone)]
pub enum Predictions {
    Tensor(Expr),
    Named(BTreeMap<String, Expr>),
}

/// A signature output for exported models.
#[derive(Debug, Clone)]
pub enum ExportOutput {
    Classification { scores: Option<Expr>, classes: Option<Expr> },
    Regression { value: Expr },
    Predict { outputs: Predictions },
    /// An output kind the iteration cannot select between, named by `kind`.
    Unsupported { kind: String },
}

impl ExportOutput {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Classification { .. } => "classification",
            Self::Regression { .. } => "regression",
            Self::Predict { .. } => "predict",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

/// Builds metric ops from the metric arguments it is handed.
pub type MetricFn = Arc<dyn Fn(&NestedMap<Expr>) -> IterationResult<MetricOps> + Send + Sync>;

/// A metric function together with the tensors to call it with.
#[derive(Clone)]
pub struct EvalMetrics {
    pub metric_fn: MetricFn,
    pub args: NestedMap<Expr>,
}

impl fmt::Debug for EvalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalMetrics").field("args", &self.args.keys().collect::<Vec<_>>()).finish_non_exhaustive()
    }
}

impl EvalMetrics {
    pub fn new<F>(metric_fn: F, args: NestedMap<Expr>) -> Self
    where
        F: Fn(&NestedMap<Expr>) -> IterationResult<MetricOps> + Send + Sync + 'static,
    {
        Self { metric_fn: Arc::new(metric_fn), args }
    }

    pub fn call(&self) -> IterationResult<MetricOps> {
        (self.metric_fn)(&self.args)
    }
}

/// A train op with the hooks that must run alongside it.
#[derive(Clone)]
pub struct TrainOpSpec {
    pub train_op: Op,
    pub chief_hooks: Vec<Arc<dyn TrainingHook>>,
    pub hooks: Vec<Arc<dyn TrainingHook>>,
}

impl fmt::Debug for TrainOpSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainOpSpec")
            .field("train_op", &self.train_op)
            .field("chief_hooks", &self.chief_hooks.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("hooks", &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl TrainOpSpec {
    #[must_use]
    pub fn new(train_op: Op) -> Self {
        Self { train_op, chief_hooks: Vec::new(), hooks: Vec::new() }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn TrainingHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn with_chief_hook(mut self, hook: Arc<dyn TrainingHook>) -> Self {
        self.chief_hooks.push(hook);
        self
    }
}

/// Everything a candidate ensemble contributes to an iteration.
///
/// The train ops are `None` for an ensemble carried over from a previous
/// iteration, which is frozen.
#[derive(Debug, Clone)]
pub struct EnsembleSpec {
    pub name: String,
    pub loss: Expr,
    pub adanet_loss: Expr,
    pub predictions: Predictions,
    pub eval_metrics: Option<EvalMetrics>,
    pub export_outputs: BTreeMap<String, ExportOutput>,
    pub subnetwork_train_op: Option<TrainOpSpec>,
    pub ensemble_train_op: Option<TrainOpSpec>,
}

/// Generates one new subnetwork per iteration.
pub trait SubnetworkBuilder: Send + Sync {
    /// Unique name among the builders of an iteration.
    fn name(&self) -> &str;

    /// Hyperparameters, attributes and metrics describing the subnetwork.
    fn build_subnetwork_report(&self) -> Option<Report> {
        None
    }
}

/// Arguments for `EnsembleBuilder::append_new_subnetwork`.
pub struct AppendSubnetwork<'a, B: ?Sized> {
    pub ensemble_name: &'a str,
    pub previous_ensemble_spec: Option<&'a EnsembleSpec>,
    pub iteration_number: u64,
    pub subnetwork_builder: &'a B,
    pub summary: &'a Arc<ScopedSummary>,
    pub features: &'a Features,
    pub mode: Mode,
    pub iteration_step: &'a Expr,
    pub labels: Option<&'a Expr>,
    pub params: Option<&'a Params>,
}

/// Extends the current best ensemble with a new subnetwork.
pub trait EnsembleBuilder: Send + Sync {
    type Builder: SubnetworkBuilder;

    fn append_new_subnetwork(&self, request: AppendSubnetwork<'_, Self::Builder>) -> IterationResult<EnsembleSpec>;
}
