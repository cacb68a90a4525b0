//! Quality gates: weighted checks that decide whether a stage may hand off
//! to the next one.
//!
//! Check execution is pluggable through [`CheckRunner`]. The evaluator runs
//! every check of a gate concurrently and scores the result as
//! `weighted passed / weighted total`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::model::{Context, Workflow};

/// Threshold used when a gate does not specify one.
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.8;

// ─────────────────────────────────────────────────────────────────────────────
// Gate and check data
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Checking,
    Passed,
    Failed,
    /// Overridden by an operator; counts as passed.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Passed,
    Failed,
}

/// What a check inspects. Selects the registered [`CheckRunner`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Documentation,
    Lint,
    TestCoverage,
    Performance,
    SecurityScan,
    Custom(String),
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Documentation => f.write_str("documentation"),
            CheckKind::Lint => f.write_str("lint"),
            CheckKind::TestCoverage => f.write_str("test_coverage"),
            CheckKind::Performance => f.write_str("performance"),
            CheckKind::SecurityScan => f.write_str("security_scan"),
            CheckKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// A single check within a gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub name: String,
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub message: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Runner parameters (e.g. `key`, `min`).
    #[serde(default)]
    pub params: Context,
}

impl QualityCheck {
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
            status: CheckStatus::Pending,
            message: None,
            weight: default_weight(),
            params: Context::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Context key this check reads: the `key` param, else the check name.
    pub fn target_key(&self) -> &str {
        self.params
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
    }
}

/// Threshold-based gate attached to a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    pub id: String,
    pub name: String,
    pub checks: Vec<QualityCheck>,
    /// Minimum weighted pass ratio (0.0–1.0).
    pub pass_threshold: f64,
    pub is_blocking: bool,
    pub status: GateStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Score of the last evaluation.
    pub score: Option<f64>,
    pub override_reason: Option<String>,
}

impl QualityGate {
    /// Blocking gate with the default threshold and no checks.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            checks: Vec::new(),
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            is_blocking: true,
            status: GateStatus::Pending,
            started_at: None,
            ended_at: None,
            score: None,
            override_reason: None,
        }
    }

    pub fn with_check(mut self, check: QualityCheck) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.is_blocking = blocking;
        self
    }

    /// Skipped gates always pass; otherwise the last score must meet the
    /// threshold.
    pub fn is_passed(&self) -> bool {
        match self.status {
            GateStatus::Skipped => true,
            _ => self.score.is_some_and(|s| s >= self.pass_threshold),
        }
    }

    /// Back to `pending`, clearing check results and the last score.
    pub fn reset(&mut self) {
        self.status = GateStatus::Pending;
        self.started_at = None;
        self.ended_at = None;
        self.score = None;
        self.override_reason = None;
        for check in &mut self.checks {
            check.status = CheckStatus::Pending;
            check.message = None;
        }
    }

    /// Weighted pass ratio of the current check statuses. An empty check set
    /// (or zero total weight) scores 1.0.
    pub fn weighted_score(&self) -> f64 {
        let total: f64 = self.checks.iter().map(|c| c.weight).sum();
        if total <= 0.0 {
            return 1.0;
        }
        let passed: f64 = self
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Passed)
            .map(|c| c.weight)
            .sum();
        passed / total
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub kind: CheckKind,
    pub passed: bool,
    pub message: String,
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub gate_id: String,
    pub gate_name: String,
    pub score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub blocking: bool,
    pub skipped: bool,
    pub checks: Vec<CheckReport>,
}

impl GateReport {
    fn from_gate(gate: &QualityGate) -> Self {
        Self {
            gate_id: gate.id.clone(),
            gate_name: gate.name.clone(),
            score: gate.score.unwrap_or(1.0),
            threshold: gate.pass_threshold,
            passed: gate.is_passed(),
            blocking: gate.is_blocking,
            skipped: gate.status == GateStatus::Skipped,
            checks: gate
                .checks
                .iter()
                .map(|c| CheckReport {
                    name: c.name.clone(),
                    kind: c.kind.clone(),
                    passed: c.status == CheckStatus::Passed,
                    message: c.message.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckReport> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Check runners
// ─────────────────────────────────────────────────────────────────────────────

/// Result reported by a [`CheckRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub message: String,
}

impl CheckOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Executes one kind of quality check.
///
/// Returning `Err` marks the check failed with the error as its message.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, check: &QualityCheck, context: &Context) -> Result<CheckOutcome>;
}

/// Passes when a numeric context value is at least the check's `min` param.
///
/// The value is looked up by the check's target key; dotted keys descend
/// into nested objects (`build.coverage`).
#[derive(Debug, Default, Clone)]
pub struct ContextThresholdRunner;

#[async_trait]
impl CheckRunner for ContextThresholdRunner {
    async fn run(&self, check: &QualityCheck, context: &Context) -> Result<CheckOutcome> {
        let key = check.target_key();
        let min = check
            .params
            .get("min")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                PipelineError::InvalidWorkflow(format!(
                    "check '{}' needs a numeric 'min' parameter",
                    check.name
                ))
            })?;

        let Some(value) = lookup(context, key) else {
            return Ok(CheckOutcome::fail(format!("'{key}' not found in context")));
        };
        let Some(actual) = value.as_f64() else {
            return Ok(CheckOutcome::fail(format!("'{key}' is not a number")));
        };

        if actual >= min {
            Ok(CheckOutcome::pass(format!("{key} = {actual} (min {min})")))
        } else {
            Ok(CheckOutcome::fail(format!("{key} = {actual} below min {min}")))
        }
    }
}

/// Passes when the target context key exists and is truthy.
#[derive(Debug, Default, Clone)]
pub struct ContextPresenceRunner;

#[async_trait]
impl CheckRunner for ContextPresenceRunner {
    async fn run(&self, check: &QualityCheck, context: &Context) -> Result<CheckOutcome> {
        let key = check.target_key();
        match lookup(context, key) {
            Some(value) if is_truthy(value) => Ok(CheckOutcome::pass(format!("'{key}' present"))),
            Some(_) => Ok(CheckOutcome::fail(format!("'{key}' is empty or false"))),
            None => Ok(CheckOutcome::fail(format!("'{key}' not found in context"))),
        }
    }
}

fn lookup<'a>(context: &'a Context, key: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(key) {
        return Some(value);
    }
    let mut parts = key.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluator
// ─────────────────────────────────────────────────────────────────────────────

/// Runs gate checks through registered runners and scores the result.
#[derive(Default, Clone)]
pub struct QualityGateEvaluator {
    runners: HashMap<CheckKind, Arc<dyn CheckRunner>>,
}

impl QualityGateEvaluator {
    /// Evaluator with no runners: every check passes by default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluator with the bundled context runners: coverage and performance
    /// checks compare against `min`; documentation, lint and security checks
    /// test for presence.
    pub fn with_default_runners() -> Self {
        let mut evaluator = Self::new();
        let threshold: Arc<dyn CheckRunner> = Arc::new(ContextThresholdRunner);
        let presence: Arc<dyn CheckRunner> = Arc::new(ContextPresenceRunner);
        evaluator.register(CheckKind::TestCoverage, threshold.clone());
        evaluator.register(CheckKind::Performance, threshold);
        evaluator.register(CheckKind::Documentation, presence.clone());
        evaluator.register(CheckKind::Lint, presence.clone());
        evaluator.register(CheckKind::SecurityScan, presence);
        evaluator
    }

    /// Register (or replace) the runner for a check kind.
    pub fn register(&mut self, kind: CheckKind, runner: Arc<dyn CheckRunner>) {
        self.runners.insert(kind, runner);
    }

    pub fn has_runner(&self, kind: &CheckKind) -> bool {
        self.runners.contains_key(kind)
    }

    /// Run every check of `gate` concurrently and record the verdict.
    ///
    /// A gate already overridden to `skipped` is reported as passed without
    /// running any check.
    pub async fn evaluate(&self, gate: &mut QualityGate, context: &Context) -> GateReport {
        if gate.status == GateStatus::Skipped {
            debug!(gate_id = %gate.id, "Gate overridden, skipping checks");
            return GateReport::from_gate(gate);
        }

        gate.status = GateStatus::Checking;
        gate.started_at = Some(Utc::now());
        gate.ended_at = None;

        let outcomes = join_all(gate.checks.iter().map(|check| self.run_check(check, context))).await;

        for (check, outcome) in gate.checks.iter_mut().zip(outcomes) {
            check.status = if outcome.passed {
                CheckStatus::Passed
            } else {
                CheckStatus::Failed
            };
            check.message = Some(outcome.message);
        }

        let score = gate.weighted_score();
        gate.score = Some(score);
        gate.status = if score >= gate.pass_threshold {
            GateStatus::Passed
        } else {
            GateStatus::Failed
        };
        gate.ended_at = Some(Utc::now());

        info!(
            gate_id = %gate.id,
            score,
            threshold = gate.pass_threshold,
            passed = gate.is_passed(),
            "Quality gate evaluated"
        );

        GateReport::from_gate(gate)
    }

    /// Force a gate to `skipped` without running its checks.
    pub fn override_gate(gate: &mut QualityGate, reason: impl Into<String>) -> GateReport {
        let reason = reason.into();
        info!(gate_id = %gate.id, %reason, "Quality gate overridden");
        gate.status = GateStatus::Skipped;
        gate.override_reason = Some(reason);
        gate.ended_at = Some(Utc::now());
        GateReport::from_gate(gate)
    }

    /// Reset every gate of a workflow to `pending`.
    pub fn reset(workflow: &mut Workflow) {
        for gate in workflow.stages.iter_mut().filter_map(|s| s.gate.as_mut()) {
            gate.reset();
        }
    }

    async fn run_check(&self, check: &QualityCheck, context: &Context) -> CheckOutcome {
        let Some(runner) = self.runners.get(&check.kind) else {
            return CheckOutcome::pass(format!("no runner registered for {}; passed by default", check.kind));
        };
        match runner.run(check, context).await {
            Ok(outcome) => outcome,
            Err(e) => CheckOutcome::fail(format!("check error: {e}")),
        }
    }
}

impl fmt::Debug for QualityGateEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityGateEvaluator")
            .field("runners", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}
