//! Alert instance state engine.
//!
//! [`StateManager`] owns every alert instance. Rule routines feed it
//! evaluation results and read back the instances they must notify about;
//! nothing else mutates instance state.

pub mod annotations;
pub mod cache;
pub mod instance;
pub mod results;
pub mod store;

pub use annotations::*;
pub use cache::*;
pub use instance::*;
pub use results::*;
pub use store::*;

use crate::clock::DynClock;
use crate::config::StateConfig;
use crate::eval::{EvalResult, EvalState};
use crate::monitoring::StateMetrics;
use crate::schedule::traits::RuleSource;
use crate::types::{cache_id, AlertRule, AlertRuleKey, Labels};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

struct StateChange {
    labels: Labels,
    evaluated_at: DateTime<Utc>,
    transition: StateTransition,
}

pub struct StateManager {
    cache: InstanceCache,
    config: StateConfig,
    clock: DynClock,
    instance_store: DynInstanceStore,
    annotator: Annotator,
    metrics: StateMetrics,
}

impl StateManager {
    pub fn new(config: StateConfig, clock: DynClock, instance_store: DynInstanceStore) -> Self {
        Self {
            cache: InstanceCache::new(),
            config,
            clock,
            instance_store,
            annotator: Annotator::default(),
            metrics: StateMetrics::default(),
        }
    }

    pub fn with_annotation_store(mut self, store: DynAnnotationStore) -> Self {
        self.annotator = Annotator::new(Some(store));
        self
    }

    pub fn with_metrics(mut self, metrics: StateMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    fn policy(&self) -> TransitionPolicy {
        TransitionPolicy {
            keep_alive: self.config.keep_alive_window(),
            max_results: self.config.max_results_per_instance,
        }
    }

    /// Applies one evaluation of `rule` to its instances, then evicts the
    /// instances of the rule that have gone stale. Returns the instances the
    /// results touched, in result order.
    pub async fn process_eval_results(
        &self,
        rule: &AlertRule,
        results: &[EvalResult],
        extra_labels: &Labels,
    ) -> Vec<State> {
        debug!(
            org_id = rule.org_id,
            rule_uid = %rule.uid,
            results = results.len(),
            "State manager processing evaluation results"
        );

        let policy = self.policy();
        let history =
            ResultHistory::capacity_for(rule.for_duration, rule.interval(), policy.max_results);
        let now = self.clock.now();
        let stale_multiplier = self.config.stale_multiplier;

        let mut processed = Vec::with_capacity(results.len());
        let mut changes = Vec::new();

        let stale = self.cache.with_rule(rule.org_id, &rule.uid, |states| {
            let mut seen = HashSet::with_capacity(results.len());
            for result in results {
                let labels = expand_labels(rule, extra_labels, &result.instance);
                let id = cache_id(&labels);
                seen.insert(id.clone());

                if result.state == EvalState::Pending {
                    warn!(
                        rule_uid = %rule.uid,
                        "Evaluator returned a Pending result, ignoring it"
                    );
                    if let Some(existing) = states.get(&id) {
                        processed.push(existing.clone());
                    }
                    continue;
                }

                let state = states
                    .entry(id)
                    .or_insert_with(|| State::new(rule, labels, history));
                if let Some(transition) = state.apply(rule, result, policy) {
                    if transition.changed() {
                        changes.push(StateChange {
                            labels: state.labels.clone(),
                            evaluated_at: result.evaluated_at,
                            transition,
                        });
                    }
                }
                processed.push(state.clone());
            }

            let stale_ids: Vec<String> = states
                .iter()
                .filter(|(id, s)| !seen.contains(*id) && s.is_stale(now, rule, stale_multiplier))
                .map(|(id, _)| id.clone())
                .collect();
            stale_ids
                .iter()
                .filter_map(|id| states.remove(id))
                .collect::<Vec<_>>()
        });

        for change in changes {
            self.annotator.annotate(
                rule,
                &change.labels,
                change.evaluated_at,
                &change.transition.current,
                &change.transition.previous,
            );
        }

        for state in stale {
            debug!(
                org_id = state.org_id,
                rule_uid = %state.rule_uid,
                cache_id = %state.cache_id,
                "Removing stale state entry"
            );
            self.delete_instance(&state).await;
            if state.state == EvalState::Alerting {
                self.annotate_resolved(rule, &state, now);
            }
        }

        processed
    }

    /// Records that `states` went out to the notifier at their last
    /// evaluation time.
    pub fn mark_sent(&self, states: &[&State]) {
        for sent in states {
            self.cache.with_rule(sent.org_id, &sent.rule_uid, |rule_states| {
                if let Some(s) = rule_states.get_mut(&sent.cache_id) {
                    s.last_sent_at = Some(sent.last_evaluation_time);
                }
            });
        }
    }

    pub fn get(&self, org_id: i64, rule_uid: &str, cache_id: &str) -> Option<State> {
        self.cache.get(org_id, rule_uid, cache_id)
    }

    pub fn get_states_for_rule_uid(&self, org_id: i64, rule_uid: &str) -> Vec<State> {
        self.cache.get_states_for_rule(org_id, rule_uid)
    }

    pub fn get_all(&self, org_id: i64) -> Vec<State> {
        self.cache.get_all(org_id)
    }

    pub fn put(&self, states: Vec<State>) {
        for state in states {
            self.cache.set(state);
        }
    }

    /// Drops the rule's instances from the cache only.
    pub fn remove_by_rule_uid(&self, org_id: i64, rule_uid: &str) -> Vec<State> {
        self.cache.remove_by_rule_uid(org_id, rule_uid)
    }

    /// Drops the rule's instances from the cache and the instance store.
    /// Firing instances get a resolved annotation when `rule` is known.
    pub async fn reset_state_by_rule_uid(
        &self,
        key: &AlertRuleKey,
        rule: Option<&AlertRule>,
    ) -> Vec<State> {
        let removed = self.cache.remove_by_rule_uid(key.org_id, &key.uid);
        if removed.is_empty() {
            return removed;
        }
        debug!(
            org_id = key.org_id,
            rule_uid = %key.uid,
            count = removed.len(),
            "Resetting rule state"
        );

        join_all(removed.iter().map(|state| self.delete_instance(state))).await;

        let now = self.clock.now();
        for state in &removed {
            if let (Some(rule), EvalState::Alerting) = (rule, state.state) {
                self.annotate_resolved(rule, state, now);
            }
        }
        removed
    }

    /// Rebuilds the cache from the instance store. Returns how many
    /// instances were restored.
    pub async fn warm(&self, rule_source: &dyn RuleSource) -> usize {
        info!("Warming state cache for startup");
        self.cache.reset();

        let org_ids = match self.instance_store.fetch_org_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Unable to fetch org ids");
                return 0;
            }
        };

        let rules: HashMap<AlertRuleKey, AlertRule> =
            match rule_source.list_schedulable_rules().await {
                Ok(snapshot) => snapshot.rules.into_iter().map(|r| (r.key(), r)).collect(),
                Err(e) => {
                    error!(error = %e, "Unable to fetch rules, previous state is not restored");
                    return 0;
                }
            };

        let mut restored = 0;
        for org_id in org_ids {
            let instances = match self.instance_store.list_alert_instances(org_id).await {
                Ok(instances) => instances,
                Err(e) => {
                    error!(org_id, error = %e, "Unable to fetch previous state");
                    continue;
                }
            };

            for entry in instances {
                let key = AlertRuleKey::new(entry.rule_org_id, entry.rule_uid.clone());
                let Some(rule) = rules.get(&key) else {
                    error!(
                        org_id = entry.rule_org_id,
                        rule_uid = %entry.rule_uid,
                        "Rule not found for instance, ignoring"
                    );
                    continue;
                };

                let history = ResultHistory::capacity_for(
                    rule.for_duration,
                    rule.interval(),
                    self.config.max_results_per_instance,
                );
                let mut state = State::new(rule, entry.labels, history);
                state.state = entry.current_state;
                state.state_reason = entry.current_reason;
                state.starts_at = entry.current_state_since;
                state.ends_at = entry.current_state_end;
                state.last_evaluation_time = entry.last_eval_time;
                self.cache.set(state);
                restored += 1;
            }
        }

        info!(restored, "State cache warmed");
        restored
    }

    /// Writes every cached instance to the instance store. Returns how many
    /// rows were saved.
    pub async fn persist_all(&self) -> usize {
        let states = self.cache.snapshot();
        let mut saved = 0;
        for state in &states {
            match self
                .instance_store
                .save_alert_instance(AlertInstance::from(state))
                .await
            {
                Ok(()) => saved += 1,
                Err(e) => error!(
                    org_id = state.org_id,
                    rule_uid = %state.rule_uid,
                    error = %e,
                    "Failed to save alert instance"
                ),
            }
        }
        debug!(saved, total = states.len(), "Persisted alert instances");
        saved
    }

    pub fn record_metrics(&self) {
        self.metrics.set_alerts(&self.cache.count_by_state());
    }

    /// Records cache metrics and persists instances until `shutdown` flips,
    /// then flushes once more.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let metrics_period = Duration::from_secs(self.config.metrics_interval_secs.max(1));
        let persist_period = Duration::from_secs(self.config.persist_interval_secs.max(1));
        let mut metrics_tick = time::interval(metrics_period);
        let mut persist_tick = time::interval_at(Instant::now() + persist_period, persist_period);

        info!(?metrics_period, ?persist_period, "State manager background loop started");
        loop {
            tokio::select! {
                _ = metrics_tick.tick() => {
                    debug!("Recording state cache metrics");
                    self.record_metrics();
                }
                _ = persist_tick.tick() => {
                    self.persist_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.persist_all().await;
        info!("State manager background loop stopped");
    }

    async fn delete_instance(&self, state: &State) {
        if let Err(e) = self
            .instance_store
            .delete_alert_instance(state.org_id, &state.rule_uid, &cache_id(&state.labels))
            .await
        {
            error!(
                org_id = state.org_id,
                rule_uid = %state.rule_uid,
                cache_id = %state.cache_id,
                error = %e,
                "Unable to delete instance from the instance store"
            );
        }
    }

    fn annotate_resolved(&self, rule: &AlertRule, state: &State, at: DateTime<Utc>) {
        self.annotator.annotate(
            rule,
            &state.labels,
            at,
            &StateAndReason {
                state: EvalState::Normal,
                reason: String::new(),
            },
            &state.state_and_reason(),
        );
    }
}
