use crate::state::instance::StateAndReason;
use crate::types::{format_labels, remove_private_labels, AlertRule, Labels, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// State-change record written against the rule's dashboard panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub org_id: i64,
    pub rule_uid: String,
    pub dashboard_uid: Option<String>,
    pub panel_id: Option<i64>,
    pub prev_state: String,
    pub new_state: String,
    pub text: String,
    /// Evaluation time in epoch milliseconds.
    pub epoch: i64,
}

impl Annotation {
    pub fn new(
        rule: &AlertRule,
        labels: &Labels,
        evaluated_at: DateTime<Utc>,
        current: &StateAndReason,
        previous: &StateAndReason,
    ) -> Self {
        let text = format!(
            "{} {{{}}} - {}",
            rule.title,
            format_labels(&remove_private_labels(labels)),
            current
        );
        Self {
            org_id: rule.org_id,
            rule_uid: rule.uid.clone(),
            dashboard_uid: rule.dashboard_uid.clone(),
            panel_id: rule.panel_id,
            prev_state: previous.to_string(),
            new_state: current.to_string(),
            text,
            epoch: evaluated_at.timestamp_millis(),
        }
    }
}

#[async_trait]
pub trait AnnotationStore: Send + Sync {
    async fn save(&self, annotation: Annotation) -> Result<()>;
}

pub type DynAnnotationStore = Arc<dyn AnnotationStore>;

/// Writes annotations in the background so a slow store never holds up a
/// transition.
#[derive(Clone, Default)]
pub struct Annotator {
    store: Option<DynAnnotationStore>,
}

impl Annotator {
    pub fn new(store: Option<DynAnnotationStore>) -> Self {
        Self { store }
    }

    pub fn annotate(
        &self,
        rule: &AlertRule,
        labels: &Labels,
        evaluated_at: DateTime<Utc>,
        current: &StateAndReason,
        previous: &StateAndReason,
    ) {
        debug!(
            rule_uid = %rule.uid,
            new_state = %current,
            old_state = %previous,
            "Alert state changed, creating annotation"
        );
        let Some(store) = self.store.clone() else {
            return;
        };
        let annotation = Annotation::new(rule, labels, evaluated_at, current, previous);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(rule_uid = %rule.uid, "No runtime available, annotation skipped");
            return;
        };
        handle.spawn(async move {
            let rule_uid = annotation.rule_uid.clone();
            if let Err(e) = store.save(annotation).await {
                error!(rule_uid = %rule_uid, error = %e, "Failed to save alert annotation");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalState;
    use chrono::TimeZone;

    #[test]
    fn test_annotation_text_hides_private_labels() {
        let rule = AlertRule {
            uid: "r1".to_string(),
            title: "High CPU".to_string(),
            dashboard_uid: Some("dash".to_string()),
            panel_id: Some(4),
            ..Default::default()
        };
        let mut labels = Labels::new();
        labels.insert("__alert_rule_uid__".to_string(), "r1".to_string());
        labels.insert("host".to_string(), "h1".to_string());

        let current = StateAndReason {
            state: EvalState::Alerting,
            reason: "NoData".to_string(),
        };
        let previous = StateAndReason {
            state: EvalState::Normal,
            reason: String::new(),
        };
        let at = Utc.timestamp_opt(10, 0).unwrap();
        let a = Annotation::new(&rule, &labels, at, &current, &previous);

        assert_eq!(a.text, "High CPU {host=h1} - Alerting (NoData)");
        assert_eq!(a.prev_state, "Normal");
        assert_eq!(a.epoch, 10_000);
        assert_eq!(a.dashboard_uid.as_deref(), Some("dash"));
        assert_eq!(a.panel_id, Some(4));
    }
}
