use crate::eval::EvalState;
use crate::state::instance::State;
use crate::types::{cache_id, Labels, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persisted row of an alert instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub rule_org_id: i64,
    pub rule_uid: String,
    pub labels: Labels,
    pub labels_hash: String,
    pub current_state: EvalState,
    pub current_reason: String,
    pub current_state_since: Option<DateTime<Utc>>,
    pub current_state_end: Option<DateTime<Utc>>,
    pub last_eval_time: DateTime<Utc>,
}

impl From<&State> for AlertInstance {
    fn from(state: &State) -> Self {
        Self {
            rule_org_id: state.org_id,
            rule_uid: state.rule_uid.clone(),
            labels: state.labels.clone(),
            labels_hash: cache_id(&state.labels),
            current_state: state.state,
            current_reason: state.state_reason.clone(),
            current_state_since: state.starts_at,
            current_state_end: state.ends_at,
            last_eval_time: state.last_evaluation_time,
        }
    }
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn save_alert_instance(&self, instance: AlertInstance) -> Result<()>;

    async fn list_alert_instances(&self, org_id: i64) -> Result<Vec<AlertInstance>>;

    async fn delete_alert_instance(
        &self,
        org_id: i64,
        rule_uid: &str,
        labels_hash: &str,
    ) -> Result<()>;

    async fn fetch_org_ids(&self) -> Result<Vec<i64>>;
}

pub type DynInstanceStore = Arc<dyn InstanceStore>;
