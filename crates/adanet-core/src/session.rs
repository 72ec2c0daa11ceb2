//! Execution phase: evaluates `Expr`s and runs `Op`s against a `VariableStore`.
//!
//! Each `eval`/`run` call is one execution pass. Within a pass every value is
//! computed at most once and every op takes effect at most once, however many
//! times it is referenced.

use crate::error::{IterationError, IterationResult};
use crate::graph::{Expr, Node, Op, OpKind};
use crate::hooks::{HookContext, TrainingHook};
use crate::tensor::Tensor;
use crate::variables::VariableStore;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Placeholder values for one execution pass, keyed by placeholder name.
pub type Feeds = HashMap<String, Tensor>;

/// Executes graph descriptions against shared persistent state.
#[derive(Debug, Clone)]
pub struct Session {
    store: Arc<VariableStore>,
}

impl Session {
    #[must_use]
    pub fn new(store: Arc<VariableStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<VariableStore> {
        &self.store
    }

    /// Starts a pass that can interleave several evaluations and runs.
    #[must_use]
    pub fn pass<'a>(&'a self, feeds: &'a Feeds) -> RunContext<'a> {
        RunContext { store: &self.store, feeds, values: HashMap::new(), executed: HashSet::new() }
    }

    pub fn eval(&self, expr: &Expr, feeds: &Feeds) -> IterationResult<Tensor> {
        self.pass(feeds).eval(expr)
    }

    pub fn run(&self, op: &Op, feeds: &Feeds) -> IterationResult<()> {
        self.pass(feeds).run(op)
    }

    /// Runs `op`, then lets every hook observe the resulting state.
    pub fn run_with_hooks(
        &self,
        op: &Op,
        feeds: &Feeds,
        hooks: &[Arc<dyn TrainingHook>],
    ) -> IterationResult<()> {
        self.run(op, feeds)?;
        let context = HookContext { store: &self.store, op_name: op.name() };
        for hook in hooks {
            hook.after_run(&context)?;
        }
        Ok(())
    }
}

/// State of a single execution pass.
pub struct RunContext<'a> {
    store: &'a VariableStore,
    feeds: &'a Feeds,
    values: HashMap<u64, Tensor>,
    executed: HashSet<u64>,
}

impl RunContext<'_> {
    #[must_use]
    pub fn store(&self) -> &VariableStore {
        self.store
    }

    pub fn eval(&mut self, expr: &Expr) -> IterationResult<Tensor> {
        if let Some(value) = self.values.get(&expr.id()) {
            return Ok(value.clone());
        }
        let value = self.compute(expr)?;
        if value.dtype() != expr.dtype() {
            return Err(IterationError::TypeMismatch(format!(
                "node {} declared {} but produced {}",
                expr.id(),
                expr.dtype(),
                value.dtype()
            )));
        }
        self.values.insert(expr.id(), value.clone());
        Ok(value)
    }

    fn compute(&mut self, expr: &Expr) -> IterationResult<Tensor> {
        match &expr.0.node {
            Node::Constant(value) => Ok(value.clone()),
            Node::Placeholder(name) => self
                .feeds
                .get(name)
                .cloned()
                .ok_or_else(|| IterationError::MissingFeed(name.clone())),
            Node::ReadBool(variable) => Ok(Tensor::scalar_bool(variable.get())),
            Node::ReadCounter(variable) => Ok(Tensor::scalar_i64(variable.get())),
            Node::Stack(items) => {
                let values = items.iter().map(|e| self.eval(e)).collect::<IterationResult<Vec<_>>>()?;
                Tensor::stack(&values)
            }
            Node::Gather { params, index } => {
                let params = self.eval(params)?;
                let index = self.eval(index)?.as_i64()?;
                params.index(index)
            }
            Node::ArgMin(values) => {
                let mut best: Option<(usize, f64)> = None;
                for (i, value) in values.iter().enumerate() {
                    let value = self.eval(value)?.as_f64()?;
                    let better = match best {
                        None => true,
                        Some((_, current)) => compare_for_min(value, current) == Ordering::Less,
                    };
                    if better {
                        best = Some((i, value));
                    }
                }
                let (index, _) = best.ok_or_else(|| IterationError::Evaluation("argmin of nothing".to_string()))?;
                Ok(Tensor::scalar_i64(i64::try_from(index).unwrap_or(i64::MAX)))
            }
            Node::All(values) => {
                let mut all = true;
                for value in values {
                    all &= self.eval(value)?.as_bool()?;
                }
                Ok(Tensor::scalar_bool(all))
            }
            Node::Not(value) => Ok(Tensor::scalar_bool(!self.eval(value)?.as_bool()?)),
            Node::Cast(input) => self.eval(input)?.cast(expr.dtype()),
            Node::Tile { input, times } => self.eval(input)?.tile(*times),
            Node::Mean(accumulator) => Ok(Tensor::scalar_f64(accumulator.value())),
            Node::Map { name, inputs, f } => {
                let values = inputs.iter().map(|e| self.eval(e)).collect::<IterationResult<Vec<_>>>()?;
                trace!(node = %name, "Evaluating map");
                f(&values)
            }
        }
    }

    pub fn run(&mut self, op: &Op) -> IterationResult<()> {
        if !self.executed.insert(op.id()) {
            return Ok(());
        }
        trace!(op = %op.name(), "Running op");
        match &op.0.kind {
            OpKind::NoOp => Ok(()),
            OpKind::Group(ops) => ops.iter().try_for_each(|o| self.run(o)),
            OpKind::After { dependencies, then } => {
                dependencies.iter().try_for_each(|o| self.run(o))?;
                self.run(then)
            }
            OpKind::Cond { predicate, then, otherwise } => {
                if self.eval(predicate)?.as_bool()? {
                    self.run(then)
                } else {
                    self.run(otherwise)
                }
            }
            OpKind::SetTrue(variable) => {
                variable.set_true();
                Ok(())
            }
            OpKind::IncrementSteps(counters) => {
                self.store.increment_together(counters);
                Ok(())
            }
            OpKind::MeanUpdate { accumulator, values } => {
                let (sum, count) = self.eval(values)?.sum_and_count()?;
                accumulator.update(sum, count);
                Ok(())
            }
            OpKind::Effect(f) => f(self),
        }
    }
}

/// Orders numbers for a minimum search, with NaN above everything.
fn compare_for_min(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}
