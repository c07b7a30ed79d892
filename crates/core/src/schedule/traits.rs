use crate::types::{AlertRule, AlertRuleKey, Labels, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Full snapshot of the rules the scheduler should run.
#[derive(Debug, Clone, Default)]
pub struct SchedulableRules {
    pub rules: Vec<AlertRule>,
    /// Folder title by namespace UID.
    pub folder_titles: HashMap<String, String>,
}

#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn list_schedulable_rules(&self) -> Result<SchedulableRules>;

    async fn list_rule_keys(&self) -> Result<Vec<AlertRuleKey>>;
}

pub type DynRuleSource = Arc<dyn RuleSource>;

/// Alert in the shape the notification pipeline accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostableAlert {
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub generator_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostableAlerts {
    pub alerts: Vec<PostableAlert>,
}

impl PostableAlerts {
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }
}

/// Hands alerts to the notification pipeline. Delivery is the sender's
/// concern; the routine never waits on an outcome.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, key: &AlertRuleKey, alerts: PostableAlerts);
}

pub type DynAlertSender = Arc<dyn AlertSender>;
