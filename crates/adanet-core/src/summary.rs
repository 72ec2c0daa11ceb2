use crate::error::IterationResult;
use crate::graph::Expr;
use crate::session::{Feeds, Session};
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    Scalar,
    Histogram,
}

#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub tag: String,
    pub kind: SummaryKind,
    pub value: Expr,
}

/// Summaries recorded under one candidate's scope.
///
/// A skipped summary accepts records and drops them, so builders can log
/// unconditionally in modes where summaries are not wanted.
#[derive(Debug)]
pub struct ScopedSummary {
    scope: Option<String>,
    skip_summary: bool,
    entries: Mutex<Vec<SummaryEntry>>,
}

impl ScopedSummary {
    #[must_use]
    pub fn new(scope: Option<String>, skip_summary: bool) -> Self {
        Self { scope, skip_summary, entries: Mutex::new(Vec::new()) }
    }

    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skip_summary
    }

    fn tag(&self, name: &str) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}/{name}"),
            None => name.to_string(),
        }
    }

    fn record(&self, name: &str, kind: SummaryKind, value: &Expr) {
        if self.skip_summary {
            return;
        }
        let entry = SummaryEntry { tag: self.tag(name), kind, value: value.clone() };
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    pub fn scalar(&self, name: &str, value: &Expr) {
        self.record(name, SummaryKind::Scalar, value);
    }

    pub fn histogram(&self, name: &str, values: &Expr) {
        self.record(name, SummaryKind::Histogram, values);
    }

    #[must_use]
    pub fn entries(&self) -> Vec<SummaryEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Evaluates every recorded summary in a single pass, keyed by tag.
    pub fn evaluate(&self, session: &Session, feeds: &Feeds) -> IterationResult<BTreeMap<String, Tensor>> {
        let entries = self.entries();
        let mut pass = session.pass(feeds);
        let mut values = BTreeMap::new();
        for entry in entries {
            let value = pass.eval(&entry.value)?;
            debug!(tag = %entry.tag, kind = ?entry.kind, "Summary evaluated");
            values.insert(entry.tag, value);
        }
        Ok(values)
    }
}
