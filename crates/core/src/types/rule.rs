// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::types::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Label carrying the rule UID on every alert instance.
pub const RULE_UID_LABEL: &str = "__alert_rule_uid__";
/// Label carrying the folder (namespace) UID on every alert instance.
pub const NAMESPACE_UID_LABEL: &str = "__alert_rule_namespace_uid__";
/// Human readable folder title, can be disabled in the scheduler config.
pub const FOLDER_TITLE_LABEL: &str = "grafana_folder";
pub const ALERT_NAME_LABEL: &str = "alertname";

/// Stable identity of an alert rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertRuleKey {
    pub org_id: i64,
    pub uid: String,
}

impl AlertRuleKey {
    pub fn new(org_id: i64, uid: impl Into<String>) -> Self {
        Self {
            org_id,
            uid: uid.into(),
        }
    }
}

impl fmt::Display for AlertRuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{org_id: {}, uid: {}}}", self.org_id, self.uid)
    }
}

/// What an instance becomes when its rule returns no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NoDataState {
    Alerting,
    #[default]
    NoData,
    #[serde(rename = "OK")]
    Ok,
}

impl fmt::Display for NoDataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoDataState::Alerting => write!(f, "Alerting"),
            NoDataState::NoData => write!(f, "NoData"),
            NoDataState::Ok => write!(f, "OK"),
        }
    }
}

impl FromStr for NoDataState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Alerting" => Ok(NoDataState::Alerting),
            "NoData" => Ok(NoDataState::NoData),
            "OK" => Ok(NoDataState::Ok),
            other => Err(CoreError::ConfigurationError(format!(
                "unknown NoData state option {}",
                other
            ))),
        }
    }
}

/// What an instance becomes when its rule fails to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecErrState {
    #[default]
    Alerting,
    Error,
    #[serde(rename = "OK")]
    Ok,
}

impl fmt::Display for ExecErrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecErrState::Alerting => write!(f, "Alerting"),
            ExecErrState::Error => write!(f, "Error"),
            ExecErrState::Ok => write!(f, "OK"),
        }
    }
}

impl FromStr for ExecErrState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Alerting" => Ok(ExecErrState::Alerting),
            "Error" => Ok(ExecErrState::Error),
            "OK" => Ok(ExecErrState::Ok),
            other => Err(CoreError::ConfigurationError(format!(
                "unknown Error state option {}",
                other
            ))),
        }
    }
}

/// Reference to the condition the evaluator should compute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub org_id: i64,
    /// RefID of the query or expression whose result decides the verdict.
    pub condition: String,
    /// Opaque query/expression model handed to the evaluator as-is.
    pub data: serde_json::Value,
}

/// Read-only snapshot of a schedulable alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub org_id: i64,
    pub uid: String,
    pub title: String,
    pub rule_group: String,
    pub namespace_uid: String,
    pub condition: String,
    pub data: serde_json::Value,
    pub interval_seconds: i64,
    #[serde(with = "duration_secs")]
    pub for_duration: Duration,
    pub no_data_state: NoDataState,
    pub exec_err_state: ExecErrState,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub dashboard_uid: Option<String>,
    pub panel_id: Option<i64>,
    pub version: i64,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            org_id: 1,
            uid: String::new(),
            title: String::new(),
            rule_group: String::new(),
            namespace_uid: String::new(),
            condition: "A".to_string(),
            data: serde_json::Value::Null,
            interval_seconds: 10,
            for_duration: Duration::ZERO,
            no_data_state: NoDataState::default(),
            exec_err_state: ExecErrState::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            dashboard_uid: None,
            panel_id: None,
            version: 1,
        }
    }
}

impl AlertRule {
    pub fn key(&self) -> AlertRuleKey {
        AlertRuleKey::new(self.org_id, self.uid.clone())
    }

    pub fn eval_condition(&self) -> Condition {
        Condition {
            org_id: self.org_id,
            condition: self.condition.clone(),
            data: self.data.clone(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(0) as u64)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
