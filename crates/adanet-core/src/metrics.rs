//! Streaming evaluation metrics.

use crate::error::{IterationError, IterationResult};
use crate::graph::{Expr, Op};
use crate::tensor::DType;
use crate::variables::{FloatVariable, VariableStore};
use std::collections::BTreeMap;

/// A metric's current value paired with the op that folds in one more batch.
#[derive(Debug, Clone)]
pub struct MetricOp {
    pub value: Expr,
    pub update: Op,
}

/// Metric ops keyed by metric name.
pub type MetricOps = BTreeMap<String, MetricOp>;

/// Running total and count backing a streaming mean.
#[derive(Debug, Clone)]
pub struct MeanAccumulator {
    total: FloatVariable,
    count: FloatVariable,
}

impl MeanAccumulator {
    pub(crate) fn update(&self, sum: f64, count: usize) {
        self.total.add(sum);
        #[allow(clippy::cast_precision_loss)]
        self.count.add(count as f64);
    }

    /// Mean of everything seen so far, zero before the first update.
    #[must_use]
    pub fn value(&self) -> f64 {
        let count = self.count.get();
        if count == 0.0 {
            0.0
        } else {
            self.total.get() / count
        }
    }
}

/// Streaming mean of every element of `values` across update passes.
pub fn mean(store: &VariableStore, name: &str, values: &Expr) -> IterationResult<MetricOp> {
    if values.dtype() == DType::Str {
        return Err(IterationError::TypeMismatch(format!("mean of '{name}' needs numeric values")));
    }
    let scope = store.unique_scope(&format!("{name}/mean"));
    let accumulator = MeanAccumulator {
        total: store.float_variable(&format!("{scope}/total"))?,
        count: store.float_variable(&format!("{scope}/count"))?,
    };
    Ok(MetricOp {
        value: Expr::mean(accumulator.clone()),
        update: Op::mean_update(format!("{scope}/update"), accumulator, values.clone()),
    })
}
