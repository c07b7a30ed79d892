
use crate::clock::MockClock;
use crate::config::{SchedulerConfig, StateConfig};
use crate::monitoring::SchedulerMetrics;
use crate::schedule::{Scheduler, SchedulerDeps};
use crate::state::StateManager;
use crate::types::{AlertRule, AlertRuleKey};
use chrono::{DateTime, TimeZone, Utc};
use fakes::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tick-aligned start time used across scenarios.
pub(crate) fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub(crate) fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub(crate) fn rule(uid: &str) -> AlertRule {
    AlertRule {
        org_id: 1,
        uid: uid.to_string(),
        title: format!("rule {}", uid),
        rule_group: "group".to_string(),
        namespace_uid: "ns".to_string(),
        interval_seconds: 10,
        ..Default::default()
    }
}

/// Polls `check` until it holds. Under a paused clock each poll advances
/// virtual time by one millisecond.
pub(crate) async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held: {}", what);
}

pub(crate) struct Harness {
    pub clock: MockClock,
    pub source: Arc<FakeRuleSource>,
    pub evaluator: Arc<FakeEvaluatorFactory>,
    pub sender: Arc<RecordingSender>,
    pub store: Arc<InMemoryInstanceStore>,
    pub annotations: Arc<RecordingAnnotationStore>,
    pub state_manager: Arc<StateManager>,
    pub metrics: SchedulerMetrics,
    pub scheduler: Scheduler,
    pub evaluated: mpsc::UnboundedReceiver<(AlertRuleKey, DateTime<Utc>)>,
    pub stopped: mpsc::UnboundedReceiver<AlertRuleKey>,
}

impl Harness {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self::with_config(rules, SchedulerConfig::default())
    }

    pub fn with_config(rules: Vec<AlertRule>, config: SchedulerConfig) -> Self {
        let clock = MockClock::new(t0());
        let source = Arc::new(FakeRuleSource::new(rules));
        source.set_folder("ns", "Infra");
        let evaluator = Arc::new(FakeEvaluatorFactory::default());
        let sender = Arc::new(RecordingSender::default());
        let store = Arc::new(InMemoryInstanceStore::default());
        let annotations = Arc::new(RecordingAnnotationStore::default());
        let metrics = SchedulerMetrics::new();

        let state_manager = Arc::new(
            StateManager::new(StateConfig::default(), Arc::new(clock.clone()), store.clone())
                .with_annotation_store(annotations.clone()),
        );

        let (eval_tx, evaluated) = mpsc::unbounded_channel();
        let (stop_tx, stopped) = mpsc::unbounded_channel();

        let scheduler = Scheduler::new(
            config,
            SchedulerDeps {
                rule_source: source.clone(),
                evaluator_factory: Arc::new(SharedEvaluatorFactory(evaluator.clone())),
                state_manager: state_manager.clone(),
                sender: sender.clone(),
                clock: Arc::new(clock.clone()),
                metrics: metrics.clone(),
            },
        )
        .with_eval_applied_hook(Arc::new(move |key: &AlertRuleKey, at: DateTime<Utc>| {
            let _ = eval_tx.send((key.clone(), at));
        }))
        .with_stop_applied_hook(Arc::new(move |key: &AlertRuleKey| {
            let _ = stop_tx.send(key.clone());
        }));

        Self {
            clock,
            source,
            evaluator,
            sender,
            store,
            annotations,
            state_manager,
            metrics,
            scheduler,
            evaluated,
            stopped,
        }
    }

    pub async fn next_evaluation(&mut self) -> (AlertRuleKey, DateTime<Utc>) {
        tokio::time::timeout(Duration::from_secs(60), self.evaluated.recv())
            .await
            .expect("timed out waiting for an evaluation")
            .expect("hook channel closed")
    }

    pub async fn next_stop(&mut self) -> AlertRuleKey {
        tokio::time::timeout(Duration::from_secs(60), self.stopped.recv())
            .await
            .expect("timed out waiting for a routine to stop")
            .expect("hook channel closed")
    }
}
