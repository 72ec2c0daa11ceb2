//! Run-time selection of the best candidate's outputs.
//!
//! Every candidate's outputs are built up front. They are stacked along a
//! leading candidate axis and gathered with the best candidate index, which is
//! only known once the iteration executes.

use crate::candidate::Candidate;
use crate::dict_utils::{flatten, unflatten, Nested, NestedMap};
use crate::ensemble::{ExportOutput, MetricFn, Params, Predictions};
use crate::error::{IterationError, IterationResult};
use crate::graph::{Expr, Op};
use crate::metrics::{mean, MetricOp, MetricOps};
use crate::mode::Mode;
use crate::tensor::{DType, Tensor};
use crate::variables::VariableStore;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Flat key under which the tiled best candidate index travels with the metric args.
pub const BEST_CANDIDATE_INDEX_KEY: &str = "best_candidate_index";

/// Metrics of the weighted ensemble end with this suffix.
pub const ENSEMBLE_METRIC_SUFFIX: &str = "/adanet/adanet_weighted_ensemble";

/// Root metric name that is never surfaced from the ensemble suffix.
const RESERVED_ROOT_METRIC: &str = "loss";

fn candidate_key(index: usize) -> String {
    format!("candidate_{index}")
}

fn stack_and_gather(values: Vec<Expr>, index: &Expr) -> IterationResult<Expr> {
    Expr::try_stack(values)?.try_gather(index)
}

/// Index of the candidate with the lowest adanet loss.
///
/// A single candidate is always the best one, so its index is the constant 0.
pub fn best_candidate_index(candidates: &[Candidate]) -> IterationResult<Expr> {
    if candidates.len() == 1 {
        return Ok(Expr::constant(Tensor::scalar_i64(0)));
    }
    Expr::try_argmin(candidates.iter().map(|c| c.adanet_loss.clone()).collect())
}

/// The best candidate's predictions, as a tensor or named tensors.
pub fn best_predictions(candidates: &[Candidate], best_candidate_index: &Expr) -> IterationResult<Predictions> {
    if candidates.len() == 1 {
        return Ok(candidates[0].ensemble_spec.predictions.clone());
    }

    match &candidates[0].ensemble_spec.predictions {
        Predictions::Tensor(_) => {
            let mut tensors = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                match &candidate.ensemble_spec.predictions {
                    Predictions::Tensor(tensor) => tensors.push(tensor.clone()),
                    Predictions::Named(_) => {
                        return Err(IterationError::InconsistentPredictions(format!(
                            "'{}' returns named predictions while '{}' returns a single tensor",
                            candidate.ensemble_spec.name, candidates[0].ensemble_spec.name
                        )))
                    }
                }
            }
            Ok(Predictions::Tensor(stack_and_gather(tensors, best_candidate_index)?))
        }
        Predictions::Named(_) => {
            let mut named = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                match &candidate.ensemble_spec.predictions {
                    Predictions::Named(map) => named.push((&candidate.ensemble_spec.name, map)),
                    Predictions::Tensor(_) => {
                        return Err(IterationError::InconsistentPredictions(format!(
                            "'{}' returns a single tensor while '{}' returns named predictions",
                            candidate.ensemble_spec.name, candidates[0].ensemble_spec.name
                        )))
                    }
                }
            }
            let keys: BTreeSet<&String> = named.iter().flat_map(|(_, map)| map.keys()).collect();
            let mut best = BTreeMap::new();
            for key in keys {
                let mut tensors = Vec::with_capacity(named.len());
                for (name, map) in &named {
                    let tensor = map.get(key).ok_or_else(|| {
                        IterationError::InconsistentPredictions(format!("'{name}' has no prediction '{key}'"))
                    })?;
                    tensors.push(tensor.clone());
                }
                best.insert(key.clone(), stack_and_gather(tensors, best_candidate_index)?);
            }
            Ok(Predictions::Named(best))
        }
    }
}

/// The best candidate's loss; `None` in predict mode.
pub fn best_loss(candidates: &[Candidate], best_candidate_index: &Expr, mode: Mode) -> IterationResult<Option<Expr>> {
    if !mode.outputs().loss {
        return Ok(None);
    }
    if candidates.len() == 1 {
        return Ok(Some(candidates[0].ensemble_spec.loss.clone()));
    }
    let losses = candidates.iter().map(|c| c.ensemble_spec.loss.clone()).collect();
    Ok(Some(stack_and_gather(losses, best_candidate_index)?))
}

/// Stacks an optional component that must be present on all candidates or none.
fn gather_optional(
    key: &str,
    component: &str,
    values: Vec<Option<Expr>>,
    best_candidate_index: &Expr,
) -> IterationResult<Option<Expr>> {
    let present: Vec<Expr> = values.iter().flatten().cloned().collect();
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != values.len() {
        return Err(IterationError::InconsistentExportOutputs(format!(
            "'{key}' {component} present on {} of {} candidates",
            present.len(),
            values.len()
        )));
    }
    Ok(Some(stack_and_gather(present, best_candidate_index)?))
}

/// The best candidate's export outputs; `None` outside of predict mode.
///
/// All candidates must export the same keys with the same output kinds.
pub fn best_export_outputs(
    candidates: &[Candidate],
    best_candidate_index: &Expr,
    mode: Mode,
    best_predictions: &Predictions,
) -> IterationResult<Option<BTreeMap<String, ExportOutput>>> {
    if !mode.outputs().export_outputs {
        return Ok(None);
    }
    if candidates.len() == 1 {
        return Ok(Some(candidates[0].ensemble_spec.export_outputs.clone()));
    }

    for candidate in candidates {
        for (key, output) in &candidate.ensemble_spec.export_outputs {
            if let ExportOutput::Unsupported { kind } = output {
                return Err(IterationError::UnsupportedExportOutput { key: key.clone(), kind: kind.clone() });
            }
        }
    }

    let mut best = BTreeMap::new();
    for (key, first) in &candidates[0].ensemble_spec.export_outputs {
        let mut outputs = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let output = candidate.ensemble_spec.export_outputs.get(key).ok_or_else(|| {
                IterationError::InconsistentExportOutputs(format!(
                    "'{}' has no export output '{key}'",
                    candidate.ensemble_spec.name
                ))
            })?;
            if output.kind() != first.kind() {
                return Err(IterationError::ExportOutputKindMismatch {
                    key: key.clone(),
                    expected: first.kind(),
                    found: output.kind(),
                });
            }
            outputs.push(output);
        }

        let output = match first {
            ExportOutput::Classification { .. } => {
                let (scores, classes): (Vec<_>, Vec<_>) = outputs
                    .iter()
                    .map(|output| match output {
                        ExportOutput::Classification { scores, classes } => (scores.clone(), classes.clone()),
                        _ => (None, None),
                    })
                    .unzip();
                ExportOutput::Classification {
                    scores: gather_optional(key, "scores", scores, best_candidate_index)?,
                    classes: gather_optional(key, "classes", classes, best_candidate_index)?,
                }
            }
            ExportOutput::Regression { .. } => {
                let values = outputs
                    .iter()
                    .filter_map(|output| match output {
                        ExportOutput::Regression { value } => Some(value.clone()),
                        _ => None,
                    })
                    .collect();
                ExportOutput::Regression { value: stack_and_gather(values, best_candidate_index)? }
            }
            ExportOutput::Predict { .. } => ExportOutput::Predict { outputs: best_predictions.clone() },
            ExportOutput::Unsupported { kind } => {
                return Err(IterationError::UnsupportedExportOutput { key: key.clone(), kind: kind.clone() })
            }
        };
        best.insert(key.clone(), output);
    }
    Ok(Some(best))
}

/// A metric function over flat tensors that reports every candidate's
/// metrics plus those of the best candidate.
///
/// The flat form lets the arguments cross interfaces that only accept
/// `name -> tensor` inputs; `call` restores the per-candidate nesting.
pub struct BestEvalMetrics {
    metric_fns: Vec<(String, MetricFn)>,
    candidate_count: usize,
    tensors: BTreeMap<String, Expr>,
    store: Arc<VariableStore>,
}

impl fmt::Debug for BestEvalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BestEvalMetrics")
            .field("candidates", &self.metric_fns.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("candidate_count", &self.candidate_count)
            .field("tensors", &self.tensors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Collates metric functions and arguments by candidate position, and flattens
/// them with the tiled best index. `None` outside of eval mode.
pub fn best_eval_metrics(
    candidates: &[Candidate],
    best_candidate_index: &Expr,
    mode: Mode,
    params: Option<&Params>,
    default_batch_size: usize,
    store: &Arc<VariableStore>,
) -> IterationResult<Option<BestEvalMetrics>> {
    if !mode.outputs().eval_metrics {
        return Ok(None);
    }

    let mut metric_fns = Vec::new();
    let mut tensors: NestedMap<Expr> = NestedMap::new();
    for (i, candidate) in candidates.iter().enumerate() {
        let Some(eval_metrics) = &candidate.ensemble_spec.eval_metrics else {
            continue;
        };
        let key = candidate_key(i);
        metric_fns.push((key.clone(), eval_metrics.metric_fn.clone()));
        tensors.insert(key, Nested::Map(eval_metrics.args.clone()));
    }

    // Metric inputs are consumed batch-major.
    let batch_size = match params.and_then(|p| p.get("batch_size")) {
        None => default_batch_size,
        Some(value) => value
            .as_u64()
            .and_then(|b| usize::try_from(b).ok())
            .filter(|b| *b >= 1)
            .ok_or_else(|| {
                IterationError::InvalidConfig(format!("params batch_size must be an integer >= 1, got {value}"))
            })?,
    };
    tensors.insert(BEST_CANDIDATE_INDEX_KEY.to_string(), Nested::Leaf(best_candidate_index.tile(batch_size)));

    Ok(Some(BestEvalMetrics {
        metric_fns,
        candidate_count: candidates.len(),
        tensors: flatten(&tensors),
        store: store.clone(),
    }))
}

impl BestEvalMetrics {
    /// The flat metric arguments.
    #[must_use]
    pub fn tensors(&self) -> &BTreeMap<String, Expr> {
        &self.tensors
    }

    /// Metric ops over this iteration's own flat arguments.
    pub fn evaluate(&self) -> IterationResult<MetricOps> {
        self.call(self.tensors.clone())
    }

    /// Builds every candidate's metric ops from `flat`, grouped by name, and
    /// the best candidate's metric for every name all candidates share.
    pub fn call(&self, flat: BTreeMap<String, Expr>) -> IterationResult<MetricOps> {
        let prefixes: Vec<&str> = self.metric_fns.iter().map(|(key, _)| key.as_str()).collect();
        let nested = unflatten(flat, &prefixes)?;
        let grouped = self.group_metric_ops(&nested)?;

        let best_candidate_index = match nested.get(BEST_CANDIDATE_INDEX_KEY) {
            Some(Nested::Leaf(index)) => index.clone(),
            _ => {
                return Err(IterationError::Evaluation(format!(
                    "metric arguments carry no '{BEST_CANDIDATE_INDEX_KEY}'"
                )))
            }
        };

        let mut eval_metric_ops = MetricOps::new();
        for (metric_name, metric_ops) in grouped {
            if metric_ops.len() != self.candidate_count {
                warn!(
                    metric = %metric_name,
                    candidates_with_metric = metric_ops.len(),
                    candidates = self.candidate_count,
                    "Metric not produced by every candidate; skipping best candidate aggregation"
                );
                continue;
            }

            let index = mean(&self.store, "best_eval_metrics/best_candidate_index", &best_candidate_index)?;
            let values = metric_ops.iter().map(|m| m.value.clone()).collect();
            let best_value = stack_and_gather(values, &index.value.cast(DType::Int))?;
            // The index mean is only read through the gather, so its update
            // must run with the candidates' updates or it never advances.
            let mut updates: Vec<Op> = metric_ops.into_iter().map(|m| m.update).collect();
            updates.push(index.update);
            let best = MetricOp { value: best_value, update: Op::group(format!("best_eval_metrics/{metric_name}"), updates) };

            if let Some(root) = metric_name.strip_suffix(ENSEMBLE_METRIC_SUFFIX) {
                if root != RESERVED_ROOT_METRIC {
                    eval_metric_ops.insert(root.to_string(), best.clone());
                }
            }
            eval_metric_ops.insert(metric_name, best);
        }
        debug!(metrics = eval_metric_ops.len(), "Built best candidate eval metrics");
        Ok(eval_metric_ops)
    }

    /// Calls each candidate's metric function with its own arguments, in
    /// candidate order, and groups the resulting ops by metric name.
    fn group_metric_ops(&self, nested: &NestedMap<Expr>) -> IterationResult<BTreeMap<String, Vec<MetricOp>>> {
        let no_args = NestedMap::new();
        let mut grouped: BTreeMap<String, Vec<MetricOp>> = BTreeMap::new();
        for (key, metric_fn) in &self.metric_fns {
            let args = match nested.get(key) {
                Some(Nested::Map(args)) => args,
                None => &no_args,
                Some(Nested::Leaf(_)) => {
                    return Err(IterationError::Evaluation(format!("metric arguments of '{key}' are not a mapping")))
                }
            };
            for (metric_name, metric_op) in metric_fn(args)? {
                grouped.entry(metric_name).or_default().push(metric_op);
            }
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{EnsembleSpec, EvalMetrics};
    use crate::session::{Feeds, Session};

    fn constant(v: f64) -> Expr {
        Expr::constant(Tensor::scalar_f64(v))
    }

    fn candidate(name: &str, loss: f64, predictions: Predictions) -> Candidate {
        let loss = constant(loss);
        Candidate {
            ensemble_spec: EnsembleSpec {
                name: name.to_string(),
                loss: loss.clone(),
                adanet_loss: loss.clone(),
                predictions,
                eval_metrics: None,
                export_outputs: BTreeMap::new(),
                subnetwork_train_op: None,
                ensemble_train_op: None,
            },
            is_training: Expr::constant(Tensor::scalar_bool(false)),
            adanet_loss: loss,
            is_previous_best: false,
        }
    }

    fn named(pairs: &[(&str, f64)]) -> Predictions {
        Predictions::Named(pairs.iter().map(|(k, v)| ((*k).to_string(), constant(*v))).collect())
    }

    #[test]
    fn test_nan_loss_is_never_best() {
        let candidates = vec![
            candidate("a", f64::NAN, Predictions::Tensor(constant(1.0))),
            candidate("b", 2.0, Predictions::Tensor(constant(2.0))),
        ];
        let index = best_candidate_index(&candidates).unwrap();
        let session = Session::new(Arc::new(VariableStore::new()));
        assert_eq!(session.eval(&index, &Feeds::new()).unwrap().as_i64().unwrap(), 1);
    }

    #[test]
    fn test_named_predictions_are_gathered_per_key() {
        let candidates = vec![
            candidate("a", 1.0, named(&[("logits", 1.0), ("probabilities", 0.1)])),
            candidate("b", 0.5, named(&[("logits", 2.0), ("probabilities", 0.2)])),
        ];
        let index = best_candidate_index(&candidates).unwrap();
        let Predictions::Named(best) = best_predictions(&candidates, &index).unwrap() else {
            panic!("expected named predictions");
        };
        let session = Session::new(Arc::new(VariableStore::new()));
        assert_eq!(session.eval(&best["logits"], &Feeds::new()).unwrap().as_f64().unwrap(), 2.0);
        assert_eq!(session.eval(&best["probabilities"], &Feeds::new()).unwrap().as_f64().unwrap(), 0.2);
    }

    #[test]
    fn test_inconsistent_predictions_fail() {
        let index = Expr::constant(Tensor::scalar_i64(0));
        let mixed = vec![
            candidate("a", 1.0, Predictions::Tensor(constant(1.0))),
            candidate("b", 1.0, named(&[("logits", 1.0)])),
        ];
        assert!(matches!(best_predictions(&mixed, &index), Err(IterationError::InconsistentPredictions(_))));

        let missing_key = vec![
            candidate("a", 1.0, named(&[("logits", 1.0), ("classes", 1.0)])),
            candidate("b", 1.0, named(&[("logits", 1.0)])),
        ];
        assert!(matches!(best_predictions(&missing_key, &index), Err(IterationError::InconsistentPredictions(_))));
    }

    #[test]
    fn test_export_kind_mismatch_fails() {
        let index = Expr::constant(Tensor::scalar_i64(0));
        let predictions = Predictions::Tensor(constant(1.0));
        let mut a = candidate("a", 1.0, predictions.clone());
        a.ensemble_spec.export_outputs.insert("out".to_string(), ExportOutput::Regression { value: constant(1.0) });
        let mut b = candidate("b", 1.0, predictions.clone());
        b.ensemble_spec
            .export_outputs
            .insert("out".to_string(), ExportOutput::Classification { scores: Some(constant(1.0)), classes: None });

        let result = best_export_outputs(&[a.clone(), b], &index, Mode::Predict, &predictions);
        assert!(matches!(
            result,
            Err(IterationError::ExportOutputKindMismatch { expected: "regression", found: "classification", .. })
        ));

        let mut c = candidate("c", 1.0, predictions.clone());
        c.ensemble_spec
            .export_outputs
            .insert("out".to_string(), ExportOutput::Classification { scores: Some(constant(1.0)), classes: None });
        let mut d = candidate("d", 1.0, predictions.clone());
        d.ensemble_spec
            .export_outputs
            .insert("out".to_string(), ExportOutput::Classification { scores: None, classes: None });
        let result = best_export_outputs(&[c, d], &index, Mode::Predict, &predictions);
        assert!(matches!(result, Err(IterationError::InconsistentExportOutputs(_))));

        assert!(best_export_outputs(&[a], &index, Mode::Eval, &predictions).unwrap().is_none());
    }

    fn with_metric(mut candidate: Candidate, store: &Arc<VariableStore>, metric_names: &'static [&'static str]) -> Candidate {
        let store = store.clone();
        let args = NestedMap::from([("loss".to_string(), Nested::Leaf(candidate.adanet_loss.clone()))]);
        candidate.ensemble_spec.eval_metrics = Some(EvalMetrics::new(
            move |args: &NestedMap<Expr>| {
                let Some(Nested::Leaf(loss)) = args.get("loss") else {
                    return Err(IterationError::Evaluation("missing loss".to_string()));
                };
                let mut ops = MetricOps::new();
                for name in metric_names {
                    ops.insert((*name).to_string(), mean(&store, name, loss)?);
                }
                Ok(ops)
            },
            args,
        ));
        candidate
    }

    #[test]
    fn test_metrics_missing_from_a_candidate_are_skipped() {
        let store = Arc::new(VariableStore::new());
        let candidates = vec![
            with_metric(candidate("a", 1.0, Predictions::Tensor(constant(1.0))), &store, &["shared", "only_a"]),
            with_metric(candidate("b", 0.5, Predictions::Tensor(constant(2.0))), &store, &["shared"]),
        ];
        let index = best_candidate_index(&candidates).unwrap();
        let metrics = best_eval_metrics(&candidates, &index, Mode::Eval, None, 1, &store).unwrap().unwrap();
        let ops = metrics.evaluate().unwrap();

        assert_eq!(ops.keys().collect::<Vec<_>>(), ["shared"]);
        let session = Session::new(store);
        session.run(&ops["shared"].update, &Feeds::new()).unwrap();
        assert_eq!(session.eval(&ops["shared"].value, &Feeds::new()).unwrap().as_f64().unwrap(), 0.5);
    }

    #[test]
    fn test_index_is_tiled_to_params_batch_size() {
        let store = Arc::new(VariableStore::new());
        let candidates = vec![
            with_metric(candidate("a", 1.0, Predictions::Tensor(constant(1.0))), &store, &["loss"]),
            with_metric(candidate("b", 0.5, Predictions::Tensor(constant(2.0))), &store, &["loss"]),
        ];
        let index = best_candidate_index(&candidates).unwrap();
        let mut params = Params::new();
        params.insert("batch_size".to_string(), serde_json::json!(8));
        let metrics = best_eval_metrics(&candidates, &index, Mode::Eval, Some(&params), 1, &store).unwrap().unwrap();

        let flat_keys: Vec<_> = metrics.tensors().keys().map(String::as_str).collect();
        assert_eq!(flat_keys, ["best_candidate_index", "candidate_0/loss", "candidate_1/loss"]);
        let session = Session::new(store.clone());
        let tiled = session.eval(&metrics.tensors()[BEST_CANDIDATE_INDEX_KEY], &Feeds::new()).unwrap();
        assert_eq!(tiled.shape(), &[8]);

        assert!(best_eval_metrics(&candidates, &index, Mode::Train, None, 1, &store).unwrap().is_none());
    }

    #[test]
    fn test_invalid_params_batch_size_is_rejected() {
        let store = Arc::new(VariableStore::new());
        let candidates = vec![
            with_metric(candidate("a", 1.0, Predictions::Tensor(constant(1.0))), &store, &["loss"]),
            with_metric(candidate("b", 0.5, Predictions::Tensor(constant(2.0))), &store, &["loss"]),
        ];
        let index = best_candidate_index(&candidates).unwrap();
        for bad in [serde_json::json!(0), serde_json::json!(2.5), serde_json::json!("8")] {
            let mut params = Params::new();
            params.insert("batch_size".to_string(), bad);
            let result = best_eval_metrics(&candidates, &index, Mode::Eval, Some(&params), 1, &store);
            assert!(matches!(result, Err(IterationError::InvalidConfig(_))));
        }
    }
}
