//! Fake subnetworks and ensembles shared by the integration tests.

#![allow(dead_code)]

use adanet_core::dict_utils::{Nested, NestedMap};
use adanet_core::metrics::mean;
use adanet_core::{
    AppendSubnetwork, EnsembleBuilder, EnsembleSpec, EvalMetrics, ExportOutput, Expr, HookContext, IterationError,
    IterationResult, MetricOps, Mode, Op, Predictions, Report, SubnetworkBuilder, Tensor, TrainOpSpec, TrainingHook,
    VariableStore,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A subnetwork whose loss and prediction are fixed constants.
pub struct FakeSubnetwork {
    pub name: String,
    pub loss: f64,
    pub prediction: f64,
}

impl FakeSubnetwork {
    pub fn new(name: &str, loss: f64, prediction: f64) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), loss, prediction })
    }
}

impl SubnetworkBuilder for FakeSubnetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_subnetwork_report(&self) -> Option<Report> {
        let mut report = Report::default();
        report.hparams.insert("loss".to_string(), serde_json::json!(self.loss));
        Some(report)
    }
}

/// Hook that counts how often it was invoked.
#[derive(Default)]
pub struct CountingHook {
    pub calls: AtomicUsize,
}

impl TrainingHook for CountingHook {
    fn name(&self) -> &str {
        "counting_hook"
    }

    fn after_run(&self, _context: &HookContext<'_>) -> IterationResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn leaf<'a>(args: &'a NestedMap<Expr>, key: &str) -> IterationResult<&'a Expr> {
    match args.get(key) {
        Some(Nested::Leaf(expr)) => Ok(expr),
        _ => Err(IterationError::Evaluation(format!("missing metric argument '{key}'"))),
    }
}

/// Eval metrics reporting the mean loss and mean prediction of an ensemble.
pub fn eval_metrics(store: &Arc<VariableStore>, loss: &Expr, prediction: &Expr) -> EvalMetrics {
    let store = store.clone();
    let args = NestedMap::from([
        ("labels".to_string(), Nested::Map(NestedMap::from([("loss".to_string(), Nested::Leaf(loss.clone()))]))),
        ("predictions".to_string(), Nested::Leaf(prediction.clone())),
    ]);
    EvalMetrics::new(
        move |args: &NestedMap<Expr>| -> IterationResult<MetricOps> {
            let labels = match args.get("labels") {
                Some(Nested::Map(labels)) => labels,
                _ => return Err(IterationError::Evaluation("missing labels".to_string())),
            };
            let mut ops = MetricOps::new();
            ops.insert(
                "loss/adanet/adanet_weighted_ensemble".to_string(),
                mean(&store, "loss", leaf(labels, "loss")?)?,
            );
            ops.insert(
                "prediction/adanet/adanet_weighted_ensemble".to_string(),
                mean(&store, "prediction", leaf(args, "predictions")?)?,
            );
            Ok(ops)
        },
        args,
    )
}

/// A frozen ensemble spec, as carried over from a previous iteration.
pub fn frozen_spec(store: &Arc<VariableStore>, name: &str, loss: f64, prediction: f64) -> EnsembleSpec {
    let loss = Expr::constant(Tensor::scalar_f64(loss));
    let prediction = Expr::constant(Tensor::scalar_f64(prediction));
    EnsembleSpec {
        name: name.to_string(),
        loss: loss.clone(),
        adanet_loss: loss.clone(),
        predictions: Predictions::Tensor(prediction.clone()),
        eval_metrics: Some(eval_metrics(store, &loss, &prediction)),
        export_outputs: BTreeMap::from([
            ("serving_default".to_string(), ExportOutput::Predict { outputs: Predictions::Tensor(prediction.clone()) }),
            ("regression".to_string(), ExportOutput::Regression { value: prediction.clone() }),
            (
                "classification".to_string(),
                ExportOutput::Classification { scores: Some(prediction), classes: None },
            ),
        ]),
        subnetwork_train_op: None,
        ensemble_train_op: None,
    }
}

/// Builds one ensemble per subnetwork from its fixed loss and prediction.
pub struct FakeEnsembleBuilder {
    pub store: Arc<VariableStore>,
    pub unsupported_export: bool,
    pub hook: Arc<CountingHook>,
    pub train_steps: Arc<AtomicUsize>,
    pub modes: Mutex<Vec<Mode>>,
}

impl FakeEnsembleBuilder {
    pub fn new(store: &Arc<VariableStore>) -> Self {
        Self {
            store: store.clone(),
            unsupported_export: false,
            hook: Arc::new(CountingHook::default()),
            train_steps: Arc::new(AtomicUsize::new(0)),
            modes: Mutex::new(Vec::new()),
        }
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.modes.lock().unwrap().clone()
    }
}

impl EnsembleBuilder for FakeEnsembleBuilder {
    type Builder = FakeSubnetwork;

    fn append_new_subnetwork(&self, request: AppendSubnetwork<'_, FakeSubnetwork>) -> IterationResult<EnsembleSpec> {
        self.modes.lock().unwrap().push(request.mode);
        let subnetwork = request.subnetwork_builder;
        let mut spec = frozen_spec(&self.store, request.ensemble_name, subnetwork.loss, subnetwork.prediction);
        if self.unsupported_export {
            spec.export_outputs.insert("custom".to_string(), ExportOutput::Unsupported { kind: "custom".to_string() });
        }

        let train_steps = self.train_steps.clone();
        let train_op = Op::effect(format!("{}/train", request.ensemble_name), move |_pass| {
            train_steps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        spec.subnetwork_train_op = Some(TrainOpSpec::new(train_op).with_hook(self.hook.clone()));
        spec.ensemble_train_op = Some(
            TrainOpSpec::new(Op::no_op(format!("{}/train_mixture_weights", request.ensemble_name)))
                .with_chief_hook(self.hook.clone()),
        );
        Ok(spec)
    }
}
