use crate::error::{IterationError, IterationResult};
use crate::graph::{Expr, Op};
use crate::metrics::MetricOps;
use crate::session::{Feeds, Session};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Key of the carried-over ensemble's report among `subnetwork_reports`.
pub const PREVIOUS_ENSEMBLE_REPORT: &str = "previous_ensemble";

/// Describes one candidate: its hyperparameters, attributes and metrics.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub hparams: BTreeMap<String, serde_json::Value>,
    pub attributes: BTreeMap<String, Expr>,
    pub metrics: MetricOps,
}

/// A `Report` with every tensor evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedReport {
    pub name: String,
    pub hparams: BTreeMap<String, serde_json::Value>,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub included_in_final_ensemble: bool,
}

/// Turns the reports of an iteration into plain values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportMaterializer;

impl ReportMaterializer {
    /// Runs every metric update once per batch, then reads the results.
    ///
    /// Attributes are evaluated with the feeds of the last batch. Reports are
    /// returned in name order; `included` names the candidates that made it
    /// into the final ensemble.
    pub fn materialize(
        &self,
        session: &Session,
        reports: &BTreeMap<String, Report>,
        batches: &[Feeds],
        included: &[&str],
    ) -> IterationResult<Vec<MaterializedReport>> {
        let updates: Vec<Op> = reports
            .values()
            .flat_map(|report| report.metrics.values().map(|metric| metric.update.clone()))
            .collect();
        let update_all = Op::group("report_metrics_update", updates);
        for feeds in batches {
            session.run(&update_all, feeds)?;
        }
        debug!(reports = reports.len(), batches = batches.len(), "Materializing subnetwork reports");

        let empty = Feeds::new();
        let mut pass = session.pass(batches.last().unwrap_or(&empty));
        let mut out = Vec::with_capacity(reports.len());
        for (name, report) in reports {
            let mut attributes = BTreeMap::new();
            for (key, value) in &report.attributes {
                attributes.insert(key.clone(), pass.eval(value)?.to_json());
            }
            let mut metrics = BTreeMap::new();
            for (key, metric) in &report.metrics {
                metrics.insert(key.clone(), pass.eval(&metric.value)?.to_json());
            }
            out.push(MaterializedReport {
                name: name.clone(),
                hparams: report.hparams.clone(),
                attributes,
                metrics,
                included_in_final_ensemble: included.contains(&name.as_str()),
            });
        }
        Ok(out)
    }
}

pub fn write_reports_jsonl(path: &Path, reports: &[MaterializedReport]) -> IterationResult<()> {
    let mut out = String::new();
    for report in reports {
        out.push_str(&serde_json::to_string(report)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

pub fn read_reports_jsonl(path: &Path) -> IterationResult<Vec<MaterializedReport>> {
    let contents = std::fs::read_to_string(path)?;
    let mut reports = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let report: MaterializedReport = serde_json::from_str(line).map_err(|e| {
            IterationError::Evaluation(format!("failed to parse report line {}: {}", idx + 1, e))
        })?;
        reports.push(report);
    }

    Ok(reports)
}
