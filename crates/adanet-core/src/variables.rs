//! Persistent variables shared by every worker that executes an iteration.
//!
//! A `VariableStore` outlives individual execution passes. Variables are
//! created on first request and reused by name afterwards, so two workers that
//! build the same iteration resolve the same flag and counters.

use crate::error::{IterationError, IterationResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub const GLOBAL_STEP: &str = "global_step";

/// A boolean variable that can only move from `false` to `true`.
#[derive(Clone)]
pub struct BoolVariable {
    name: Arc<str>,
    cell: Arc<AtomicBool>,
}

impl BoolVariable {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get(&self) -> bool {
        self.cell.load(Ordering::Acquire)
    }

    /// Sets the flag. Returns `true` if this call performed the transition.
    pub fn set_true(&self) -> bool {
        let transitioned = !self.cell.swap(true, Ordering::AcqRel);
        if transitioned {
            debug!(variable = %self.name, "Flag set");
        }
        transitioned
    }
}

impl fmt::Debug for BoolVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoolVariable").field("name", &self.name).field("value", &self.get()).finish()
    }
}

/// An integer counter.
#[derive(Clone)]
pub struct CounterVariable {
    name: Arc<str>,
    cell: Arc<AtomicI64>,
}

impl CounterVariable {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.cell.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self, delta: i64) -> i64 {
        self.cell.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

impl fmt::Debug for CounterVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterVariable").field("name", &self.name).field("value", &self.get()).finish()
    }
}

/// A float accumulator, e.g. the total of a streaming mean.
#[derive(Clone)]
pub struct FloatVariable {
    name: Arc<str>,
    cell: Arc<Mutex<f64>>,
}

impl FloatVariable {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get(&self) -> f64 {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, delta: f64) {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) += delta;
    }
}

impl fmt::Debug for FloatVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloatVariable").field("name", &self.name).field("value", &self.get()).finish()
    }
}

#[derive(Clone)]
enum Slot {
    Bool(BoolVariable),
    Counter(CounterVariable),
    Float(FloatVariable),
}

impl Slot {
    fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Counter(_) => "counter",
            Self::Float(_) => "float",
        }
    }
}

/// Name-addressed store of persistent variables.
#[derive(Default)]
pub struct VariableStore {
    slots: Mutex<HashMap<String, Slot>>,
    scopes: Mutex<HashMap<String, usize>>,
    step_lock: Mutex<()>,
}

impl fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableStore")
            .field("variable_count", &self.slots.try_lock().map(|s| s.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl VariableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_insert(&self, name: &str, make: impl FnOnce(Arc<str>) -> Slot) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(variable = %name, "Creating variable");
                make(Arc::from(name))
            })
            .clone()
    }

    fn kind_error(name: &str, wanted: &str, slot: &Slot) -> IterationError {
        IterationError::TypeMismatch(format!(
            "variable '{name}' exists as a {} variable, requested {wanted}",
            slot.kind()
        ))
    }

    /// Returns the boolean variable `name`, creating it as `false`.
    pub fn bool_variable(&self, name: &str) -> IterationResult<BoolVariable> {
        match self.get_or_insert(name, |name| {
            Slot::Bool(BoolVariable { name, cell: Arc::new(AtomicBool::new(false)) })
        }) {
            Slot::Bool(var) => Ok(var),
            other => Err(Self::kind_error(name, "bool", &other)),
        }
    }

    /// Returns the counter `name`, creating it at zero.
    pub fn counter_variable(&self, name: &str) -> IterationResult<CounterVariable> {
        match self.get_or_insert(name, |name| {
            Slot::Counter(CounterVariable { name, cell: Arc::new(AtomicI64::new(0)) })
        }) {
            Slot::Counter(var) => Ok(var),
            other => Err(Self::kind_error(name, "counter", &other)),
        }
    }

    /// Returns the float variable `name`, creating it at zero.
    pub fn float_variable(&self, name: &str) -> IterationResult<FloatVariable> {
        match self.get_or_insert(name, |name| {
            Slot::Float(FloatVariable { name, cell: Arc::new(Mutex::new(0.0)) })
        }) {
            Slot::Float(var) => Ok(var),
            other => Err(Self::kind_error(name, "float", &other)),
        }
    }

    /// Returns `base` the first time, then `base_1`, `base_2`, ...
    ///
    /// Used for per-build local state such as streaming metric accumulators,
    /// where every construction must get fresh variables.
    pub fn unique_scope(&self, base: &str) -> String {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        let uses = scopes.entry(base.to_string()).or_insert(0);
        let scope = if *uses == 0 { base.to_string() } else { format!("{base}_{uses}") };
        *uses += 1;
        scope
    }

    pub fn global_step(&self) -> IterationResult<CounterVariable> {
        self.counter_variable(GLOBAL_STEP)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Increments every counter by one as a single group.
    pub(crate) fn increment_together(&self, counters: &[CounterVariable]) {
        let _guard = self.step_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for counter in counters {
            counter.add(1);
        }
    }

    /// Reads counters as a consistent snapshot with respect to grouped increments.
    #[must_use]
    pub fn read_together(&self, counters: &[CounterVariable]) -> Vec<i64> {
        let _guard = self.step_lock.lock().unwrap_or_else(PoisonError::into_inner);
        counters.iter().map(CounterVariable::get).collect()
    }
}
