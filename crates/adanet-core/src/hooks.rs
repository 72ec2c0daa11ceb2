use crate::error::IterationResult;
use crate::variables::{BoolVariable, CounterVariable, VariableStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IterationEvent {
    Step { iteration: u64, global_step: i64, iteration_step: i64 },
    Over { iteration: u64, global_step: i64 },
}

/// What a hook can observe after an execution pass.
pub struct HookContext<'a> {
    pub store: &'a VariableStore,
    pub op_name: &'a str,
}

/// Observer attached to a train-op bundle and run after each training pass.
pub trait TrainingHook: Send + Sync {
    fn name(&self) -> &str;

    fn after_run(&self, context: &HookContext<'_>) -> IterationResult<()>;
}

/// Logs step counters every `every_n_steps` and once when the iteration is over.
pub struct StepLoggingHook {
    iteration: u64,
    every_n_steps: i64,
    iteration_step: CounterVariable,
    is_over: BoolVariable,
    last_logged: AtomicI64,
}

impl StepLoggingHook {
    #[must_use]
    pub fn new(iteration: u64, every_n_steps: u64, iteration_step: CounterVariable, is_over: BoolVariable) -> Self {
        Self {
            iteration,
            every_n_steps: i64::try_from(every_n_steps.max(1)).unwrap_or(i64::MAX),
            iteration_step,
            is_over,
            last_logged: AtomicI64::new(-1),
        }
    }

    /// Event for the current state, or `None` when nothing is due.
    pub fn poll(&self, store: &VariableStore) -> IterationResult<Option<IterationEvent>> {
        let global = store.global_step()?;
        let steps = store.read_together(&[global, self.iteration_step.clone()]);
        let (global_step, iteration_step) = (steps[0], steps[1]);

        if self.is_over.get() {
            if self.last_logged.swap(i64::MAX, Ordering::AcqRel) == i64::MAX {
                return Ok(None);
            }
            return Ok(Some(IterationEvent::Over { iteration: self.iteration, global_step }));
        }
        let bucket = iteration_step / self.every_n_steps;
        if self.last_logged.fetch_max(bucket, Ordering::AcqRel) >= bucket {
            return Ok(None);
        }
        Ok(Some(IterationEvent::Step { iteration: self.iteration, global_step, iteration_step }))
    }
}

impl TrainingHook for StepLoggingHook {
    fn name(&self) -> &str {
        "step_logging"
    }

    fn after_run(&self, context: &HookContext<'_>) -> IterationResult<()> {
        match self.poll(context.store)? {
            Some(IterationEvent::Step { iteration, global_step, iteration_step }) => {
                info!(iteration, global_step, iteration_step, op = %context.op_name, "[iteration:{iteration}] step");
            }
            Some(IterationEvent::Over { iteration, global_step }) => {
                info!(iteration, global_step, "[iteration:{iteration}] all candidates finished training");
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_logging_hook_reports_each_bucket_once() {
        let store = VariableStore::new();
        let step = store.counter_variable("iteration_0/step").unwrap();
        let is_over = store.bool_variable("iteration_0/is_over").unwrap();
        let hook = StepLoggingHook::new(0, 2, step.clone(), is_over.clone());

        assert!(matches!(hook.poll(&store).unwrap(), Some(IterationEvent::Step { iteration_step: 0, .. })));
        assert_eq!(hook.poll(&store).unwrap(), None);

        store.increment_together(&[store.global_step().unwrap(), step.clone()]);
        assert_eq!(hook.poll(&store).unwrap(), None);
        store.increment_together(&[store.global_step().unwrap(), step]);
        assert!(matches!(hook.poll(&store).unwrap(), Some(IterationEvent::Step { iteration_step: 2, .. })));

        is_over.set_true();
        assert_eq!(hook.poll(&store).unwrap(), Some(IterationEvent::Over { iteration: 0, global_step: 2 }));
        assert_eq!(hook.poll(&store).unwrap(), None);
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = IterationEvent::Over { iteration: 3, global_step: 10 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "over");
        assert_eq!(json["iteration"], 3);
    }
}
