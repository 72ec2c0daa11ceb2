//! Builds one AdaNet iteration: every candidate, the fused train op and the
//! best candidate's outputs.

use crate::candidate::{Candidate, CandidateBuilder};
use crate::config::IterationConfig;
use crate::ensemble::{AppendSubnetwork, EnsembleBuilder, EnsembleSpec, Features, Params, SubnetworkBuilder};
use crate::error::{IterationError, IterationResult};
use crate::graph::{Expr, Op};
use crate::hooks::TrainingHook;
use crate::iteration::{EstimatorSpec, IsOverFn, Iteration, IterationParts};
use crate::metrics::{mean, MetricOps};
use crate::mode::Mode;
use crate::report::{Report, PREVIOUS_ENSEMBLE_REPORT};
use crate::selection;
use crate::summary::ScopedSummary;
use crate::variables::{BoolVariable, CounterVariable, VariableStore};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Arguments for `IterationBuilder::build_iteration`.
pub struct BuildIteration<'a, B> {
    pub iteration_number: u64,
    /// New subnetworks to train, one candidate each, in this order.
    pub subnetwork_builders: &'a [Arc<B>],
    pub features: &'a Features,
    pub mode: Mode,
    pub labels: Option<&'a Expr>,
    pub previous_ensemble_summary: Option<Arc<ScopedSummary>>,
    /// The best ensemble of the previous iteration, kept as a candidate.
    pub previous_ensemble_spec: Option<&'a EnsembleSpec>,
    /// Whether the iteration restores earlier state rather than training anew.
    pub rebuilding: bool,
    pub params: Option<&'a Params>,
}

impl<'a, B> BuildIteration<'a, B> {
    #[must_use]
    pub fn new(iteration_number: u64, subnetwork_builders: &'a [Arc<B>], features: &'a Features, mode: Mode) -> Self {
        Self {
            iteration_number,
            subnetwork_builders,
            features,
            mode,
            labels: None,
            previous_ensemble_summary: None,
            previous_ensemble_spec: None,
            rebuilding: false,
            params: None,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: &'a Expr) -> Self {
        self.labels = Some(labels);
        self
    }

    #[must_use]
    pub fn with_previous_ensemble(mut self, spec: &'a EnsembleSpec, summary: Option<Arc<ScopedSummary>>) -> Self {
        self.previous_ensemble_spec = Some(spec);
        self.previous_ensemble_summary = summary;
        self
    }

    #[must_use]
    pub fn rebuilding(mut self, rebuilding: bool) -> Self {
        self.rebuilding = rebuilding;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: &'a Params) -> Self {
        self.params = Some(params);
        self
    }
}

/// Name of the iteration-local step counter.
fn iteration_step_name(iteration_number: u64) -> String {
    format!("iteration_{iteration_number}/step")
}

/// Name of the flag that records every candidate finished training.
#[must_use]
pub fn is_over_variable_name(iteration_number: u64) -> String {
    format!("iteration_{iteration_number}/is_over_var_fn/is_over_var")
}

pub struct IterationBuilder<C, E> {
    candidate_builder: C,
    ensemble_builder: E,
    config: IterationConfig,
    store: Arc<VariableStore>,
}

impl<C, E> IterationBuilder<C, E>
where
    C: CandidateBuilder,
    E: EnsembleBuilder,
{
    pub fn new(
        candidate_builder: C,
        ensemble_builder: E,
        config: IterationConfig,
        store: Arc<VariableStore>,
    ) -> IterationResult<Self> {
        config.validate()?;
        // The candidate builder is what enforces the step budget.
        if config.max_iteration_steps.is_some()
            && candidate_builder.max_iteration_steps() != config.max_iteration_steps
        {
            return Err(IterationError::InvalidConfig(format!(
                "max_iteration_steps is {:?} but the candidate builder trains for {:?} steps",
                config.max_iteration_steps,
                candidate_builder.max_iteration_steps()
            )));
        }
        Ok(Self { candidate_builder, ensemble_builder, config, store })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<VariableStore> {
        &self.store
    }

    #[must_use]
    pub fn ensemble_builder(&self) -> &E {
        &self.ensemble_builder
    }

    /// Builds an iteration that trains one candidate per subnetwork builder
    /// alongside the previous best ensemble, if any.
    ///
    /// Every configuration and type error is returned here, before anything
    /// is executed.
    pub fn build_iteration(&self, request: BuildIteration<'_, E::Builder>) -> IterationResult<Iteration> {
        let BuildIteration {
            iteration_number,
            subnetwork_builders,
            features,
            mode,
            labels,
            previous_ensemble_summary,
            previous_ensemble_spec,
            rebuilding,
            params,
        } = request;

        if rebuilding {
            info!(iteration = iteration_number, %mode, "Rebuilding iteration");
        } else {
            info!(iteration = iteration_number, %mode, "Building iteration");
        }
        if subnetwork_builders.is_empty() {
            return Err(IterationError::NoSubnetworkBuilders);
        }

        let outputs = mode.outputs();
        let training = mode == Mode::Train;
        let ensemble_mode = mode.ensemble_mode(rebuilding, self.config.replicate_ensemble_in_training);
        debug!(iteration = iteration_number, %ensemble_mode, "Selected ensemble mode");

        let iteration_step_var = self.store.counter_variable(&iteration_step_name(iteration_number))?;
        let iteration_step = Expr::read_counter(&iteration_step_var);

        let mut seen_names = HashSet::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut summaries = Vec::new();
        let mut subnetwork_reports = BTreeMap::new();

        if let Some(previous) = previous_ensemble_spec {
            seen_names.insert(previous.name.clone());
            let summary = previous_ensemble_summary
                .unwrap_or_else(|| Arc::new(ScopedSummary::new(Some(previous.name.clone()), true)));
            let candidate =
                self.candidate_builder.build_candidate(previous.clone(), training, &iteration_step, &summary, true)?;
            debug!(candidate = %previous.name, "Added previous best ensemble as candidate");

            if outputs.previous_ensemble_report {
                let metrics = match &previous.eval_metrics {
                    Some(eval_metrics) => eval_metrics.call()?,
                    None => MetricOps::new(),
                };
                let mut report = Report { metrics, ..Report::default() };
                report.metrics.insert(
                    "adanet_loss".to_string(),
                    mean(&self.store, &format!("{}/adanet_loss", previous.name), &previous.adanet_loss)?,
                );
                subnetwork_reports.insert(PREVIOUS_ENSEMBLE_REPORT.to_string(), report);
            }
            candidates.push(candidate);
            summaries.push(summary);
        }

        for subnetwork_builder in subnetwork_builders {
            let builder_name = subnetwork_builder.name();
            if !seen_names.insert(builder_name.to_string()) {
                return Err(IterationError::DuplicateName { name: builder_name.to_string() });
            }
            let ensemble_name = format!("t{iteration_number}_{builder_name}");
            let summary =
                Arc::new(ScopedSummary::new(Some(ensemble_name.clone()), !outputs.summaries || rebuilding));

            let ensemble_spec = self.ensemble_builder.append_new_subnetwork(AppendSubnetwork {
                ensemble_name: &ensemble_name,
                previous_ensemble_spec,
                iteration_number,
                subnetwork_builder: subnetwork_builder.as_ref(),
                summary: &summary,
                features,
                mode: ensemble_mode,
                iteration_step: &iteration_step,
                labels,
                params,
            })?;
            let candidate =
                self.candidate_builder.build_candidate(ensemble_spec, training, &iteration_step, &summary, false)?;
            debug!(candidate = %ensemble_name, builder = %builder_name, "Added candidate");

            if outputs.subnetwork_reports {
                let report = self.subnetwork_report(subnetwork_builder.as_ref(), &candidate.ensemble_spec)?;
                subnetwork_reports.insert(builder_name.to_string(), report);
            }
            candidates.push(candidate);
            summaries.push(summary);
        }

        let best_candidate_index = selection::best_candidate_index(&candidates)?;
        let best_predictions = selection::best_predictions(&candidates, &best_candidate_index)?;
        let best_loss = selection::best_loss(&candidates, &best_candidate_index, mode)?;
        let best_eval_metrics = selection::best_eval_metrics(
            &candidates,
            &best_candidate_index,
            mode,
            params,
            self.config.batch_size,
            &self.store,
        )?;
        let best_export_outputs =
            selection::best_export_outputs(&candidates, &best_candidate_index, mode, &best_predictions)?;

        let is_over_name = is_over_variable_name(iteration_number);
        let is_over_var = self.store.bool_variable(&is_over_name)?;
        let store = self.store.clone();
        let is_over_fn: IsOverFn = Arc::new(move || store.bool_variable(&is_over_name));

        let (training_chief_hooks, training_hooks) = collect_hooks(&candidates);
        let eval_metric_ops = best_eval_metrics.map(|metrics| metrics.evaluate()).transpose()?;
        let train_op = self.create_train_op(&candidates, mode, &iteration_step_var, &is_over_var)?;

        let estimator_spec = EstimatorSpec {
            mode,
            predictions: best_predictions,
            loss: best_loss,
            train_op,
            eval_metric_ops,
            export_outputs: best_export_outputs,
            training_chief_hooks,
            training_hooks,
        };

        Iteration::try_from(IterationParts {
            number: i64::try_from(iteration_number).map_err(|_| IterationError::InvalidIteration {
                field: "number",
                reason: format!("{iteration_number} does not fit in an i64"),
            })?,
            candidates,
            estimator_spec: Some(estimator_spec),
            best_candidate_index: Some(best_candidate_index),
            summaries,
            is_over_fn,
            subnetwork_reports,
            step: Some(iteration_step),
        })
    }

    /// The builder's report, or an empty one, with the candidate's eval
    /// metrics and its adanet loss.
    fn subnetwork_report(
        &self,
        subnetwork_builder: &E::Builder,
        ensemble_spec: &EnsembleSpec,
    ) -> IterationResult<Report> {
        let mut report = subnetwork_builder.build_subnetwork_report().unwrap_or_default();
        if let Some(eval_metrics) = &ensemble_spec.eval_metrics {
            for (metric_name, metric) in eval_metrics.call()? {
                report.metrics.insert(metric_name, metric);
            }
        }
        report.metrics.insert(
            "adanet_loss".to_string(),
            mean(&self.store, &format!("{}/adanet_loss", ensemble_spec.name), &ensemble_spec.adanet_loss)?,
        );
        Ok(report)
    }

    /// Fuses the candidates' train ops with the completion flag update.
    ///
    /// The global and iteration steps only advance once every candidate op
    /// and the flag update have run.
    fn create_train_op(
        &self,
        candidates: &[Candidate],
        mode: Mode,
        iteration_step: &CounterVariable,
        is_over: &BoolVariable,
    ) -> IterationResult<Op> {
        if !mode.outputs().train_op {
            return Ok(Op::no_op("train_op/no_op"));
        }

        let mut train_ops = Vec::new();
        for candidate in candidates {
            let spec = &candidate.ensemble_spec;
            for train_op_spec in [&spec.subnetwork_train_op, &spec.ensemble_train_op].into_iter().flatten() {
                debug!(candidate = %spec.name, op = %train_op_spec.train_op.name(), "Fusing train op");
                train_ops.push(train_op_spec.train_op.clone());
            }
        }
        train_ops.push(assign_is_over(candidates, is_over)?);

        let increment = Op::increment_steps(
            "train_op/increment_steps",
            vec![self.store.global_step()?, iteration_step.clone()],
        );
        Ok(Op::after("train_op", train_ops, increment))
    }
}

/// Sets the completion flag once no candidate is training.
///
/// Workers only ever set the flag, so one worker's stale view cannot undo
/// another's completion.
fn assign_is_over(candidates: &[Candidate], is_over: &BoolVariable) -> IterationResult<Op> {
    let not_training = candidates.iter().map(|c| c.is_training.try_not()).collect::<IterationResult<Vec<_>>>()?;
    let all_done = Expr::try_all(not_training)?;
    Op::try_cond(
        "is_over/assign",
        &all_done,
        Op::set_true("is_over/assign_is_over", is_over),
        Op::no_op("is_over/noassign_is_over"),
    )
}

type Hooks = Vec<Arc<dyn TrainingHook>>;

fn collect_hooks(candidates: &[Candidate]) -> (Hooks, Hooks) {
    let mut chief_hooks = Vec::new();
    let mut hooks = Vec::new();
    for candidate in candidates {
        let spec = &candidate.ensemble_spec;
        for train_op_spec in [&spec.subnetwork_train_op, &spec.ensemble_train_op].into_iter().flatten() {
            chief_hooks.extend(train_op_spec.chief_hooks.iter().cloned());
            hooks.extend(train_op_spec.hooks.iter().cloned());
        }
    }
    (chief_hooks, hooks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::MaxStepsCandidateBuilder;
    use crate::ensemble::{Predictions, TrainOpSpec};
    use crate::session::{Feeds, Session};
    use crate::tensor::Tensor;

    struct Named(String);

    impl SubnetworkBuilder for Named {
        fn name(&self) -> &str {
            &self.0
        }
    }

    /// Every subnetwork gets the same constant loss and a train op.
    struct ConstantEnsembles;

    impl EnsembleBuilder for ConstantEnsembles {
        type Builder = Named;

        fn append_new_subnetwork(&self, request: AppendSubnetwork<'_, Named>) -> IterationResult<EnsembleSpec> {
            let loss = Expr::constant(Tensor::scalar_f64(1.0));
            Ok(EnsembleSpec {
                name: request.ensemble_name.to_string(),
                loss: loss.clone(),
                adanet_loss: loss,
                predictions: Predictions::Tensor(Expr::constant(Tensor::scalar_f64(2.0))),
                eval_metrics: None,
                export_outputs: BTreeMap::new(),
                subnetwork_train_op: Some(TrainOpSpec::new(Op::no_op(format!("{}/train", request.ensemble_name)))),
                ensemble_train_op: None,
            })
        }
    }

    fn builder(max_steps: Option<u64>) -> IterationBuilder<MaxStepsCandidateBuilder, ConstantEnsembles> {
        IterationBuilder::new(
            MaxStepsCandidateBuilder::new(max_steps),
            ConstantEnsembles,
            IterationConfig::default(),
            Arc::new(VariableStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_candidates_are_named_by_iteration() {
        let builders = vec![Arc::new(Named("linear".to_string())), Arc::new(Named("dnn".to_string()))];
        let features = Features::new();
        let iteration = builder(None).build_iteration(BuildIteration::new(3, &builders, &features, Mode::Train)).unwrap();

        let names: Vec<_> = iteration.candidates().iter().map(|c| c.ensemble_spec.name.as_str()).collect();
        assert_eq!(names, ["t3_linear", "t3_dnn"]);
        assert_eq!(iteration.summaries()[0].scope(), Some("t3_linear"));
        assert!(!iteration.summaries()[0].is_skipped());
    }

    #[test]
    fn test_train_op_sets_flag_and_steps() {
        let builders = vec![Arc::new(Named("linear".to_string()))];
        let features = Features::new();
        let iteration_builder = builder(Some(1));
        let iteration =
            iteration_builder.build_iteration(BuildIteration::new(0, &builders, &features, Mode::Train)).unwrap();
        let session = Session::new(iteration_builder.store().clone());
        let train_op = &iteration.estimator_spec().train_op;

        session.run(train_op, &Feeds::new()).unwrap();
        assert!(!iteration.is_over().unwrap());
        session.run(train_op, &Feeds::new()).unwrap();
        assert!(iteration.is_over().unwrap());

        let store = iteration_builder.store();
        let step = store.counter_variable("iteration_0/step").unwrap();
        assert_eq!(store.read_together(&[store.global_step().unwrap(), step]), vec![2, 2]);
    }

    #[test]
    fn test_rebuilding_skips_summaries() {
        let builders = vec![Arc::new(Named("linear".to_string()))];
        let features = Features::new();
        let iteration = builder(None)
            .build_iteration(BuildIteration::new(1, &builders, &features, Mode::Train).rebuilding(true))
            .unwrap();
        assert!(iteration.summaries()[0].is_skipped());
    }

    struct FailingEnsembles;

    impl EnsembleBuilder for FailingEnsembles {
        type Builder = Named;

        fn append_new_subnetwork(&self, request: AppendSubnetwork<'_, Named>) -> IterationResult<EnsembleSpec> {
            Err(anyhow::anyhow!("no features for '{}'", request.ensemble_name).into())
        }
    }

    #[test]
    fn test_collaborator_errors_propagate() {
        let builders = vec![Arc::new(Named("linear".to_string()))];
        let features = Features::new();
        let iteration_builder = IterationBuilder::new(
            MaxStepsCandidateBuilder::new(None),
            FailingEnsembles,
            IterationConfig::default(),
            Arc::new(VariableStore::new()),
        )
        .unwrap();
        let err = iteration_builder.build_iteration(BuildIteration::new(0, &builders, &features, Mode::Train)).unwrap_err();
        assert!(matches!(err, IterationError::Other(_)));
        assert_eq!(err.to_string(), "no features for 't0_linear'");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = IterationConfig { batch_size: 0, ..IterationConfig::default() };
        let result =
            IterationBuilder::new(MaxStepsCandidateBuilder::new(None), ConstantEnsembles, config, Arc::new(VariableStore::new()));
        assert!(matches!(result, Err(IterationError::InvalidConfig(_))));
    }

    #[test]
    fn test_step_budget_must_match_candidate_builder() {
        let config = IterationConfig { max_iteration_steps: Some(5), ..IterationConfig::default() };
        let result = IterationBuilder::new(
            MaxStepsCandidateBuilder::new(None),
            ConstantEnsembles,
            config.clone(),
            Arc::new(VariableStore::new()),
        );
        assert!(matches!(result, Err(IterationError::InvalidConfig(_))));

        let result = IterationBuilder::new(
            MaxStepsCandidateBuilder::from_config(&config),
            ConstantEnsembles,
            config,
            Arc::new(VariableStore::new()),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_train_op_is_no_op_outside_training() {
        let builders = vec![Arc::new(Named("linear".to_string()))];
        let features = Features::new();
        let iteration = builder(None).build_iteration(BuildIteration::new(0, &builders, &features, Mode::Eval)).unwrap();
        assert!(iteration.estimator_spec().train_op.is_no_op());
    }
}
