//! Construction phase: immutable descriptions of values (`Expr`) and effects (`Op`).
//!
//! Nothing in this module computes anything. An `Expr` records how a value
//! will be produced, and an `Op` records what will happen, once a `Session`
//! executes them. Both are cheap to clone and can be shared by any number of
//! downstream nodes.

use crate::error::{IterationError, IterationResult};
use crate::metrics::MeanAccumulator;
use crate::session::RunContext;
use crate::tensor::{DType, Tensor};
use crate::variables::{BoolVariable, CounterVariable};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_node_id() -> u64 {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// User computation over evaluated inputs.
pub type MapFn = Arc<dyn Fn(&[Tensor]) -> IterationResult<Tensor> + Send + Sync>;

/// User side effect run inside an execution pass.
pub type EffectFn = Arc<dyn Fn(&mut RunContext<'_>) -> IterationResult<()> + Send + Sync>;

pub(crate) enum Node {
    Constant(Tensor),
    Placeholder(String),
    ReadBool(BoolVariable),
    ReadCounter(CounterVariable),
    Stack(Vec<Expr>),
    Gather { params: Expr, index: Expr },
    ArgMin(Vec<Expr>),
    All(Vec<Expr>),
    Not(Expr),
    Cast(Expr),
    Tile { input: Expr, times: usize },
    Mean(MeanAccumulator),
    Map { name: String, inputs: Vec<Expr>, f: MapFn },
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Self::Constant(_) => "constant",
            Self::Placeholder(_) => "placeholder",
            Self::ReadBool(_) | Self::ReadCounter(_) => "read_variable",
            Self::Stack(_) => "stack",
            Self::Gather { .. } => "gather",
            Self::ArgMin(_) => "argmin",
            Self::All(_) => "logical_and",
            Self::Not(_) => "logical_not",
            Self::Cast(_) => "cast",
            Self::Tile { .. } => "tile",
            Self::Mean(_) => "mean",
            Self::Map { .. } => "map",
        }
    }
}

pub(crate) struct ExprInner {
    pub(crate) id: u64,
    pub(crate) dtype: DType,
    pub(crate) node: Node,
}

/// A deferred value with a statically known element type.
#[derive(Clone)]
pub struct Expr(pub(crate) Arc<ExprInner>);

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expr")
            .field("id", &self.0.id)
            .field("kind", &self.0.node.kind())
            .field("dtype", &self.0.dtype)
            .finish()
    }
}

fn require_dtype(expr: &Expr, wanted: DType, what: &str) -> IterationResult<()> {
    if expr.dtype() == wanted {
        Ok(())
    } else {
        Err(IterationError::TypeMismatch(format!(
            "{what} must be {wanted}, got {}",
            expr.dtype()
        )))
    }
}

impl Expr {
    fn from_node(dtype: DType, node: Node) -> Self {
        Self(Arc::new(ExprInner { id: next_node_id(), dtype, node }))
    }

    #[must_use]
    pub fn constant(value: Tensor) -> Self {
        Self::from_node(value.dtype(), Node::Constant(value))
    }

    /// A value supplied through the feeds of each execution pass.
    #[must_use]
    pub fn placeholder(name: impl Into<String>, dtype: DType) -> Self {
        Self::from_node(dtype, Node::Placeholder(name.into()))
    }

    #[must_use]
    pub fn read_bool(variable: &BoolVariable) -> Self {
        Self::from_node(DType::Bool, Node::ReadBool(variable.clone()))
    }

    #[must_use]
    pub fn read_counter(variable: &CounterVariable) -> Self {
        Self::from_node(DType::Int, Node::ReadCounter(variable.clone()))
    }

    pub(crate) fn mean(accumulator: MeanAccumulator) -> Self {
        Self::from_node(DType::Float, Node::Mean(accumulator))
    }

    /// A named user computation producing a `dtype` value from `inputs`.
    pub fn map<F>(name: impl Into<String>, inputs: Vec<Expr>, dtype: DType, f: F) -> Self
    where
        F: Fn(&[Tensor]) -> IterationResult<Tensor> + Send + Sync + 'static,
    {
        Self::from_node(dtype, Node::Map { name: name.into(), inputs, f: Arc::new(f) })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    /// Stacks values along a new leading axis. All inputs must share a dtype.
    pub fn try_stack(items: Vec<Expr>) -> IterationResult<Self> {
        let Some(first) = items.first() else {
            return Err(IterationError::TypeMismatch("cannot stack zero values".to_string()));
        };
        let dtype = first.dtype();
        for item in &items[1..] {
            require_dtype(item, dtype, "stacked values")?;
        }
        Ok(Self::from_node(dtype, Node::Stack(items)))
    }

    /// Selects entry `index` of `self` along the leading axis.
    pub fn try_gather(&self, index: &Expr) -> IterationResult<Self> {
        require_dtype(index, DType::Int, "gather index")?;
        Ok(Self::from_node(self.dtype(), Node::Gather { params: self.clone(), index: index.clone() }))
    }

    /// Position of the smallest scalar; the leftmost one wins ties.
    pub fn try_argmin(values: Vec<Expr>) -> IterationResult<Self> {
        if values.is_empty() {
            return Err(IterationError::TypeMismatch("argmin needs at least one value".to_string()));
        }
        for value in &values {
            if !matches!(value.dtype(), DType::Float | DType::Int) {
                return Err(IterationError::TypeMismatch(format!(
                    "argmin values must be numeric, got {}",
                    value.dtype()
                )));
            }
        }
        Ok(Self::from_node(DType::Int, Node::ArgMin(values)))
    }

    /// Logical AND of boolean scalars. True when `values` is empty.
    pub fn try_all(values: Vec<Expr>) -> IterationResult<Self> {
        for value in &values {
            require_dtype(value, DType::Bool, "logical_and inputs")?;
        }
        Ok(Self::from_node(DType::Bool, Node::All(values)))
    }

    pub fn try_not(&self) -> IterationResult<Self> {
        require_dtype(self, DType::Bool, "logical_not input")?;
        Ok(Self::from_node(DType::Bool, Node::Not(self.clone())))
    }

    #[must_use]
    pub fn cast(&self, dtype: DType) -> Self {
        if self.dtype() == dtype {
            return self.clone();
        }
        Self::from_node(dtype, Node::Cast(self.clone()))
    }

    #[must_use]
    pub fn tile(&self, times: usize) -> Self {
        Self::from_node(self.dtype(), Node::Tile { input: self.clone(), times })
    }
}

pub(crate) enum OpKind {
    NoOp,
    Group(Vec<Op>),
    After { dependencies: Vec<Op>, then: Op },
    Cond { predicate: Expr, then: Op, otherwise: Op },
    SetTrue(BoolVariable),
    IncrementSteps(Vec<CounterVariable>),
    MeanUpdate { accumulator: MeanAccumulator, values: Expr },
    Effect(EffectFn),
}

impl OpKind {
    fn kind(&self) -> &'static str {
        match self {
            Self::NoOp => "no_op",
            Self::Group(_) => "group",
            Self::After { .. } => "after",
            Self::Cond { .. } => "cond",
            Self::SetTrue(_) => "set_true",
            Self::IncrementSteps(_) => "increment_steps",
            Self::MeanUpdate { .. } => "mean_update",
            Self::Effect(_) => "effect",
        }
    }
}

pub(crate) struct OpInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) kind: OpKind,
}

/// A deferred side effect. Runs at most once per execution pass.
#[derive(Clone)]
pub struct Op(pub(crate) Arc<OpInner>);

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("kind", &self.0.kind.kind())
            .finish()
    }
}

impl Op {
    fn from_kind(name: impl Into<String>, kind: OpKind) -> Self {
        Self(Arc::new(OpInner { id: next_node_id(), name: name.into(), kind }))
    }

    #[must_use]
    pub fn no_op(name: impl Into<String>) -> Self {
        Self::from_kind(name, OpKind::NoOp)
    }

    /// Runs every op of `ops`; no ordering between them is implied.
    #[must_use]
    pub fn group(name: impl Into<String>, ops: Vec<Op>) -> Self {
        Self::from_kind(name, OpKind::Group(ops))
    }

    /// Runs `then` only once every op in `dependencies` has taken effect.
    #[must_use]
    pub fn after(name: impl Into<String>, dependencies: Vec<Op>, then: Op) -> Self {
        Self::from_kind(name, OpKind::After { dependencies, then })
    }

    pub fn try_cond(name: impl Into<String>, predicate: &Expr, then: Op, otherwise: Op) -> IterationResult<Self> {
        require_dtype(predicate, DType::Bool, "cond predicate")?;
        Ok(Self::from_kind(name, OpKind::Cond { predicate: predicate.clone(), then, otherwise }))
    }

    #[must_use]
    pub fn set_true(name: impl Into<String>, variable: &BoolVariable) -> Self {
        Self::from_kind(name, OpKind::SetTrue(variable.clone()))
    }

    /// Adds one to each counter as a single indivisible group.
    #[must_use]
    pub fn increment_steps(name: impl Into<String>, counters: Vec<CounterVariable>) -> Self {
        Self::from_kind(name, OpKind::IncrementSteps(counters))
    }

    pub(crate) fn mean_update(name: impl Into<String>, accumulator: MeanAccumulator, values: Expr) -> Self {
        Self::from_kind(name, OpKind::MeanUpdate { accumulator, values })
    }

    /// A named user effect, e.g. one optimizer step of a subnetwork.
    pub fn effect<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunContext<'_>) -> IterationResult<()> + Send + Sync + 'static,
    {
        Self::from_kind(name, OpKind::Effect(Arc::new(f)))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn is_no_op(&self) -> bool {
        matches!(self.0.kind, OpKind::NoOp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_requires_matching_dtypes() {
        let a = Expr::constant(Tensor::scalar_f64(1.0));
        let b = Expr::constant(Tensor::scalar_bool(true));
        assert!(matches!(Expr::try_stack(vec![a, b]), Err(IterationError::TypeMismatch(_))));
    }

    #[test]
    fn test_gather_requires_int_index() {
        let values = Expr::constant(Tensor::vector_f64(vec![1.0, 2.0]));
        let bad_index = Expr::constant(Tensor::scalar_f64(0.0));
        assert!(values.try_gather(&bad_index).is_err());
        let index = Expr::constant(Tensor::scalar_i64(0));
        assert_eq!(values.try_gather(&index).unwrap().dtype(), DType::Float);
    }

    #[test]
    fn test_cond_requires_bool_predicate() {
        let predicate = Expr::constant(Tensor::scalar_i64(1));
        let result = Op::try_cond("c", &predicate, Op::no_op("a"), Op::no_op("b"));
        assert!(result.is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Op::no_op("a");
        let b = Op::no_op("a");
        assert_ne!(a.id(), b.id());
        assert!(a.is_no_op());
        assert!(!Op::group("g", vec![a]).is_no_op());
    }

    #[test]
    fn test_cast_to_same_dtype_is_identity() {
        let a = Expr::constant(Tensor::scalar_i64(3));
        assert_eq!(a.cast(DType::Int).id(), a.id());
        assert_eq!(a.cast(DType::Float).dtype(), DType::Float);
    }
}
