//! Contract of the expression evaluator consumed by the scheduler.
//!
//! The evaluator itself lives outside this crate. A rule routine creates one
//! [`RuleEvaluator`] per evaluation through an [`EvaluatorFactory`] and turns
//! the returned [`Results`] into instance state transitions.

use crate::types::{Condition, Labels, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DATASOURCE_QUERY_ACTION: &str = "datasources:query";
pub const DATASOURCE_SCOPE_ALL: &str = "datasources:*";
pub const SCHEDULER_LOGIN: &str = "grafana_scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EvalState {
    #[default]
    Normal,
    Pending,
    Alerting,
    NoData,
    Error,
}

impl fmt::Display for EvalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvalState::Normal => "Normal",
            EvalState::Pending => "Pending",
            EvalState::Alerting => "Alerting",
            EvalState::NoData => "NoData",
            EvalState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Verdict for one series of a rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub instance: Labels,
    pub state: EvalState,
    pub error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub evaluation_duration: Duration,
    pub evaluation_string: String,
    pub values: BTreeMap<String, Option<f64>>,
}

impl EvalResult {
    pub fn new(instance: Labels, state: EvalState, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            instance,
            state,
            error: None,
            evaluated_at,
            evaluation_duration: Duration::ZERO,
            evaluation_string: String::new(),
            values: BTreeMap::new(),
        }
    }

    /// Single result standing in for an evaluation that could not run.
    pub fn from_error(error: impl fmt::Display, at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            instance: Labels::new(),
            state: EvalState::Error,
            error: Some(error.to_string()),
            evaluated_at: at,
            evaluation_duration: duration,
            evaluation_string: String::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_value(mut self, ref_id: impl Into<String>, value: Option<f64>) -> Self {
        self.values.insert(ref_id.into(), value);
        self
    }
}

pub type Results = Vec<EvalResult>;

pub fn has_errors(results: &[EvalResult]) -> bool {
    results.iter().any(|r| r.state == EvalState::Error)
}

/// Identity the scheduler evaluates rules as. Scoped to the rule's org and
/// allowed to query every datasource in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerIdentity {
    pub org_id: i64,
    pub login: String,
    pub is_service_account: bool,
    pub permissions: HashMap<String, Vec<String>>,
}

impl SchedulerIdentity {
    pub fn for_org(org_id: i64) -> Self {
        let mut permissions = HashMap::new();
        permissions.insert(
            DATASOURCE_QUERY_ACTION.to_string(),
            vec![DATASOURCE_SCOPE_ALL.to_string()],
        );
        Self {
            org_id,
            login: SCHEDULER_LOGIN.to_string(),
            is_service_account: true,
            permissions,
        }
    }

    pub fn can(&self, action: &str) -> bool {
        self.permissions.contains_key(action)
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub identity: SchedulerIdentity,
}

impl EvaluationContext {
    pub fn for_org(org_id: i64) -> Self {
        Self {
            identity: SchedulerIdentity::for_org(org_id),
        }
    }
}

/// Evaluator bound to one rule condition.
///
/// The future returned by `evaluate` is dropped when the rule is deleted or
/// the scheduler shuts down, so implementations must be cancel-safe.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, at: DateTime<Utc>) -> Result<Results>;
}

#[async_trait]
pub trait EvaluatorFactory: Send + Sync {
    async fn create(
        &self,
        ctx: &EvaluationContext,
        condition: &Condition,
    ) -> Result<Box<dyn RuleEvaluator>>;
}

pub type DynEvaluatorFactory = Arc<dyn EvaluatorFactory>;
