use crate::eval::EvalState;
use crate::types::AlertRuleKey;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

const METRIC_PREFIX: &str = "alerting";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OrgLabels {
    pub org: String,
}

impl OrgLabels {
    pub fn new(org_id: i64) -> Self {
        Self {
            org: org_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleLabels {
    pub org: String,
    pub rule_uid: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub state: String,
}

fn evaluation_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.01, 2.0, 12))
}

/// Metrics of the tick loop and the per-rule routines.
#[derive(Clone, Debug)]
pub struct SchedulerMetrics {
    pub evaluations_total: Family<OrgLabels, Counter>,
    pub evaluation_failures_total: Family<OrgLabels, Counter>,
    pub evaluation_duration: Family<OrgLabels, Histogram, fn() -> Histogram>,
    pub evaluations_missed_total: Family<RuleLabels, Counter>,
    pub schedulable_alert_rules: Gauge,
    pub schedulable_alert_rules_hash: Gauge,
    pub behind_seconds: Gauge<f64, AtomicU64>,
    pub periodic_duration: Histogram,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            evaluations_total: Family::default(),
            evaluation_failures_total: Family::default(),
            evaluation_duration: Family::new_with_constructor(evaluation_histogram),
            evaluations_missed_total: Family::default(),
            schedulable_alert_rules: Gauge::default(),
            schedulable_alert_rules_hash: Gauge::default(),
            behind_seconds: Gauge::default(),
            periodic_duration: Histogram::new(exponential_buckets(0.001, 2.0, 12)),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix(METRIC_PREFIX);
        registry.register(
            "rule_evaluations",
            "The total number of rule evaluations",
            self.evaluations_total.clone(),
        );
        registry.register(
            "rule_evaluation_failures",
            "The total number of rule evaluation failures",
            self.evaluation_failures_total.clone(),
        );
        registry.register(
            "rule_evaluation_duration_seconds",
            "The duration for a rule to execute",
            self.evaluation_duration.clone(),
        );
        registry.register(
            "rule_evaluations_missed",
            "The number of ticks dropped because the previous evaluation was still running",
            self.evaluations_missed_total.clone(),
        );
        registry.register(
            "schedulable_alert_rules",
            "The number of alert rules that could be considered for evaluation at the next tick",
            self.schedulable_alert_rules.clone(),
        );
        registry.register(
            "schedulable_alert_rules_hash",
            "A hash of the alert rules that could be considered for evaluation at the next tick",
            self.schedulable_alert_rules_hash.clone(),
        );
        registry.register(
            "scheduler_behind_seconds",
            "The total number of seconds the scheduler is behind",
            self.behind_seconds.clone(),
        );
        registry.register(
            "schedule_periodic_duration_seconds",
            "The time taken to run the scheduler",
            self.periodic_duration.clone(),
        );
    }

    pub fn record_evaluation(&self, org_id: i64, duration: Duration, failed: bool) {
        let labels = OrgLabels::new(org_id);
        self.evaluations_total.get_or_create(&labels).inc();
        self.evaluation_duration
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
        if failed {
            self.evaluation_failures_total.get_or_create(&labels).inc();
        }
    }

    pub fn record_missed(&self, key: &AlertRuleKey) {
        self.evaluations_missed_total
            .get_or_create(&RuleLabels {
                org: key.org_id.to_string(),
                rule_uid: key.uid.clone(),
            })
            .inc();
    }

    pub fn record_schedulable(&self, uids: &[&str]) {
        self.schedulable_alert_rules.set(uids.len() as i64);
        self.schedulable_alert_rules_hash
            .set(hash_gauge_value(schedulable_rules_hash(uids)));
    }

    pub fn evaluations(&self, org_id: i64) -> u64 {
        self.evaluations_total
            .get_or_create(&OrgLabels::new(org_id))
            .get()
    }

    pub fn failures(&self, org_id: i64) -> u64 {
        self.evaluation_failures_total
            .get_or_create(&OrgLabels::new(org_id))
            .get()
    }

    pub fn missed(&self, key: &AlertRuleKey) -> u64 {
        self.evaluations_missed_total
            .get_or_create(&RuleLabels {
                org: key.org_id.to_string(),
                rule_uid: key.uid.clone(),
            })
            .get()
    }
}

/// The gauge is signed; the top bit is dropped so the reading never wraps.
fn hash_gauge_value(hash: u64) -> i64 {
    (hash & i64::MAX as u64) as i64
}

/// FNV-1a over the sorted UIDs. Equal rule sets give equal hashes on every
/// replica.
pub fn schedulable_rules_hash(uids: &[&str]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut sorted: Vec<&str> = uids.to_vec();
    sorted.sort_unstable();

    let mut hash = OFFSET;
    for uid in sorted {
        for byte in uid.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

/// Snapshot metrics of the instance state cache.
#[derive(Clone, Debug, Default)]
pub struct StateMetrics {
    pub alerts: Family<StateLabels, Gauge>,
}

impl StateMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.sub_registry_with_prefix(METRIC_PREFIX).register(
            "alerts",
            "How many alerts by state",
            self.alerts.clone(),
        );
    }

    /// Every known state is written so that a state that drained to zero is
    /// reported as zero instead of its last value.
    pub fn set_alerts(&self, counts: &HashMap<EvalState, usize>) {
        for state in [
            EvalState::Normal,
            EvalState::Pending,
            EvalState::Alerting,
            EvalState::NoData,
            EvalState::Error,
        ] {
            let n = counts.get(&state).copied().unwrap_or(0);
            self.alerts
                .get_or_create(&StateLabels {
                    state: state.to_string().to_lowercase(),
                })
                .set(n as i64);
        }
    }

    pub fn alerts_in(&self, state: EvalState) -> i64 {
        self.alerts
            .get_or_create(&StateLabels {
                state: state.to_string().to_lowercase(),
            })
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_rules_hash_ignores_order() {
        assert_eq!(
            schedulable_rules_hash(&["a", "b", "c"]),
            schedulable_rules_hash(&["c", "a", "b"])
        );
        assert_ne!(
            schedulable_rules_hash(&["a", "b"]),
            schedulable_rules_hash(&["a", "c"])
        );
    }

    #[test]
    fn test_schedulable_hash_gauge_is_never_negative() {
        assert_eq!(hash_gauge_value(u64::MAX), i64::MAX);
        assert_eq!(hash_gauge_value(1 << 63), 0);
        assert_eq!(hash_gauge_value(42), 42);

        let metrics = SchedulerMetrics::new();
        for i in 0..64 {
            let uid = format!("rule-{}", i);
            metrics.record_schedulable(&[uid.as_str()]);
            let reading = metrics.schedulable_alert_rules_hash.get();
            assert!(reading >= 0);
            assert_eq!(reading, hash_gauge_value(schedulable_rules_hash(&[uid.as_str()])));
        }
    }

    #[test]
    fn test_record_evaluation_counts_failures() {
        let metrics = SchedulerMetrics::new();
        metrics.record_evaluation(1, Duration::from_millis(20), false);
        metrics.record_evaluation(1, Duration::from_millis(20), true);
        metrics.record_evaluation(2, Duration::from_millis(20), false);

        assert_eq!(metrics.evaluations(1), 2);
        assert_eq!(metrics.failures(1), 1);
        assert_eq!(metrics.failures(2), 0);
    }

    #[test]
    fn test_registered_metrics_are_encoded() {
        let mut registry = Registry::default();
        let metrics = SchedulerMetrics::new();
        metrics.register(&mut registry);
        let state_metrics = StateMetrics::default();
        state_metrics.register(&mut registry);

        metrics.record_schedulable(&["r1", "r2"]);
        let mut counts = HashMap::new();
        counts.insert(EvalState::Alerting, 3);
        state_metrics.set_alerts(&counts);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("alerting_schedulable_alert_rules 2"));
        assert!(out.contains("alerting_alerts{state=\"alerting\"} 3"));
        assert_eq!(state_metrics.alerts_in(EvalState::Normal), 0);
    }
}
