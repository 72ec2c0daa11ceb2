use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a graph is built for training, evaluation or inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::Eval => "eval",
            Self::Predict => "predict",
        };
        f.write_str(name)
    }
}

/// Which parts of the estimator spec an iteration populates in a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeOutputs {
    pub loss: bool,
    pub train_op: bool,
    pub eval_metrics: bool,
    pub export_outputs: bool,
    pub subnetwork_reports: bool,
    pub previous_ensemble_report: bool,
    pub summaries: bool,
}

impl Mode {
    #[must_use]
    pub fn outputs(self) -> ModeOutputs {
        match self {
            Self::Train => ModeOutputs {
                loss: true,
                train_op: true,
                eval_metrics: false,
                export_outputs: false,
                subnetwork_reports: true,
                previous_ensemble_report: false,
                summaries: true,
            },
            Self::Eval => ModeOutputs {
                loss: true,
                train_op: false,
                eval_metrics: true,
                export_outputs: false,
                subnetwork_reports: true,
                previous_ensemble_report: true,
                summaries: true,
            },
            Self::Predict => ModeOutputs {
                loss: false,
                train_op: false,
                eval_metrics: false,
                export_outputs: true,
                subnetwork_reports: false,
                previous_ensemble_report: false,
                summaries: false,
            },
        }
    }

    /// Mode in which ensembles are constructed for a build requested in `self`.
    ///
    /// Rebuilt ensembles only restore earlier state, so they are frozen in
    /// eval mode unless inference was requested or the caller replicates
    /// ensembles in training.
    #[must_use]
    pub fn ensemble_mode(self, rebuilding: bool, replicate_ensemble_in_training: bool) -> Self {
        if !rebuilding {
            return self;
        }
        match self {
            Self::Predict => Self::Predict,
            Self::Train if replicate_ensemble_in_training => Self::Train,
            Self::Train | Self::Eval => Self::Eval,
        }
    }
}
