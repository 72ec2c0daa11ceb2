//! AdaNet iteration core
//!
//! Builds one iteration of an adaptive ensemble search:
//! - Wrapping the previous best ensemble and every new subnetwork as candidates
//! - Selecting the best candidate's outputs at run time (`selection`)
//! - Fusing the candidates' train ops with the completion flag (`iteration_builder`)
//! - Recording the result as an immutable `Iteration`
//!
//! Candidates are described with `graph` expressions and ops, and executed
//! against a shared `VariableStore` by a `Session`.

pub mod candidate;
pub mod config;
pub mod dict_utils;
pub mod ensemble;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod iteration;
pub mod iteration_builder;
pub mod metrics;
pub mod mode;
pub mod report;
pub mod selection;
pub mod session;
pub mod summary;
pub mod tensor;
pub mod variables;

pub use candidate::{Candidate, CandidateBuilder, MaxStepsCandidateBuilder};
pub use config::IterationConfig;
pub use ensemble::{
    AppendSubnetwork, EnsembleBuilder, EnsembleSpec, EvalMetrics, ExportOutput, Features, MetricFn, Params,
    Predictions, SubnetworkBuilder, TrainOpSpec,
};
pub use error::{IterationError, IterationResult};
pub use graph::{Expr, Op};
pub use hooks::{HookContext, IterationEvent, StepLoggingHook, TrainingHook};
pub use iteration::{EstimatorSpec, IsOverFn, Iteration, IterationParts};
pub use iteration_builder::{BuildIteration, IterationBuilder};
pub use metrics::{MetricOp, MetricOps};
pub use mode::{Mode, ModeOutputs};
pub use report::{MaterializedReport, Report, ReportMaterializer};
pub use selection::BestEvalMetrics;
pub use session::{Feeds, RunContext, Session};
pub use summary::ScopedSummary;
pub use tensor::{DType, Tensor};
pub use variables::{BoolVariable, CounterVariable, FloatVariable, VariableStore};
