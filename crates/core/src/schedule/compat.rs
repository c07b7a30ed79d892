//! Translation of instance states into notifier alerts.

use crate::eval::EvalState;
use crate::schedule::traits::{PostableAlert, PostableAlerts};
use crate::state::State;
use crate::types::ALERT_NAME_LABEL;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

pub const NO_DATA_ALERT_NAME: &str = "DatasourceNoData";
pub const ERROR_ALERT_NAME: &str = "DatasourceError";
/// Keeps the rule title when `alertname` is rewritten for NoData/Error.
pub const RULE_NAME_LABEL: &str = "rulename";
pub const STATE_REASON_ANNOTATION: &str = "__state_reason__";
pub const VALUE_STRING_ANNOTATION: &str = "__value_string__";
pub const ERROR_ANNOTATION: &str = "Error";

fn value_string(state: &State) -> Option<String> {
    if !state.last_evaluation_string.is_empty() {
        return Some(state.last_evaluation_string.clone());
    }
    let point = state.results.last()?;
    if point.values.is_empty() {
        return None;
    }
    let parts: Vec<String> = point
        .values
        .iter()
        .map(|(ref_id, value)| match value {
            Some(v) => format!("[ var='{}' value={} ]", ref_id, v),
            None => format!("[ var='{}' value=null ]", ref_id),
        })
        .collect();
    Some(parts.join(", "))
}

fn generator_url(app_url: Option<&str>, rule_uid: &str) -> Option<String> {
    app_url.map(|url| {
        format!(
            "{}/alerting/grafana/{}/view",
            url.trim_end_matches('/'),
            rule_uid
        )
    })
}

fn rename_alert(labels: &mut crate::types::Labels, alert_name: &str) {
    if let Some(title) = labels.insert(ALERT_NAME_LABEL.to_string(), alert_name.to_string()) {
        labels.insert(RULE_NAME_LABEL.to_string(), title);
    }
}

pub fn state_to_postable_alert(state: &State, app_url: Option<&str>) -> PostableAlert {
    let mut labels = state.labels.clone();
    let mut annotations: BTreeMap<String, String> = state
        .annotations
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if !state.state_reason.is_empty() {
        annotations.insert(
            STATE_REASON_ANNOTATION.to_string(),
            state.state_reason.clone(),
        );
    }
    if let Some(value) = value_string(state) {
        annotations.insert(VALUE_STRING_ANNOTATION.to_string(), value);
    }

    match state.state {
        EvalState::NoData => rename_alert(&mut labels, NO_DATA_ALERT_NAME),
        EvalState::Error => {
            rename_alert(&mut labels, ERROR_ALERT_NAME);
            annotations.insert(
                ERROR_ANNOTATION.to_string(),
                state.error.clone().unwrap_or_default(),
            );
        }
        _ => {}
    }

    let ends_at = if state.resolved {
        Some(state.last_evaluation_time)
    } else {
        state.ends_at
    };

    PostableAlert {
        labels,
        annotations,
        starts_at: state.starts_at,
        ends_at,
        generator_url: generator_url(app_url, &state.rule_uid),
    }
}

/// Alerts for the instances the notifier must hear about now, together with
/// the states they were built from.
pub fn from_alert_states_to_postable_alerts<'a>(
    states: &'a [State],
    resend_delay: Duration,
    app_url: Option<&str>,
) -> (PostableAlerts, Vec<&'a State>) {
    let sent: Vec<&State> = states
        .iter()
        .filter(|s| s.needs_sending(resend_delay))
        .collect();
    let alerts = sent
        .iter()
        .map(|s| state_to_postable_alert(s, app_url))
        .collect();
    (PostableAlerts { alerts }, sent)
}

/// Alerts that resolve every removed active instance at `now`.
pub fn from_alert_states_to_stopped_alerts(
    states: &[State],
    now: DateTime<Utc>,
    app_url: Option<&str>,
) -> PostableAlerts {
    let alerts = states
        .iter()
        .filter(|s| {
            matches!(
                s.state,
                EvalState::Alerting | EvalState::NoData | EvalState::Error
            )
        })
        .map(|s| {
            let mut alert = state_to_postable_alert(s, app_url);
            alert.ends_at = Some(now);
            alert
        })
        .collect();
    PostableAlerts { alerts }
}
