use crate::eval::EvalState;
use crate::state::instance::State;
use crate::types::{AlertRule, Labels};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::warn;

type RuleStates = HashMap<String, State>;

/// Instances keyed by org, then rule UID, then cache id.
#[derive(Debug, Default)]
pub struct InstanceCache {
    states: RwLock<HashMap<i64, HashMap<String, RuleStates>>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access to one rule's instances. No I/O may
    /// happen inside `f`.
    pub fn with_rule<R>(
        &self,
        org_id: i64,
        rule_uid: &str,
        f: impl FnOnce(&mut RuleStates) -> R,
    ) -> R {
        let mut states = self.states.write();
        let rule_states = states
            .entry(org_id)
            .or_default()
            .entry(rule_uid.to_string())
            .or_default();
        let out = f(rule_states);
        if rule_states.is_empty() {
            if let Some(org) = states.get_mut(&org_id) {
                org.remove(rule_uid);
                if org.is_empty() {
                    states.remove(&org_id);
                }
            }
        }
        out
    }

    pub fn set(&self, state: State) {
        let org_id = state.org_id;
        let rule_uid = state.rule_uid.clone();
        self.with_rule(org_id, &rule_uid, |rule_states| {
            rule_states.insert(state.cache_id.clone(), state);
        });
    }

    pub fn get(&self, org_id: i64, rule_uid: &str, cache_id: &str) -> Option<State> {
        self.states
            .read()
            .get(&org_id)
            .and_then(|org| org.get(rule_uid))
            .and_then(|rule| rule.get(cache_id))
            .cloned()
    }

    pub fn get_states_for_rule(&self, org_id: i64, rule_uid: &str) -> Vec<State> {
        self.states
            .read()
            .get(&org_id)
            .and_then(|org| org.get(rule_uid))
            .map(|rule| rule.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_all(&self, org_id: i64) -> Vec<State> {
        self.states
            .read()
            .get(&org_id)
            .map(|org| org.values().flat_map(|rule| rule.values().cloned()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<State> {
        self.states
            .read()
            .values()
            .flat_map(|org| org.values())
            .flat_map(|rule| rule.values().cloned())
            .collect()
    }

    pub fn remove_by_rule_uid(&self, org_id: i64, rule_uid: &str) -> Vec<State> {
        let mut states = self.states.write();
        let Some(org) = states.get_mut(&org_id) else {
            return Vec::new();
        };
        let removed = org
            .remove(rule_uid)
            .map(|rule| rule.into_values().collect())
            .unwrap_or_default();
        if org.is_empty() {
            states.remove(&org_id);
        }
        removed
    }

    pub fn reset(&self) {
        self.states.write().clear();
    }

    pub fn count_by_state(&self) -> HashMap<EvalState, usize> {
        let mut counts = HashMap::new();
        for state in self.snapshot() {
            *counts.entry(state.state).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.states
            .read()
            .values()
            .flat_map(|org| org.values())
            .map(|rule| rule.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Labels of an instance: extra labels, then rule labels, then the labels
/// the evaluator returned. Earlier sources win on conflicts.
pub fn expand_labels(rule: &AlertRule, extra: &Labels, instance: &Labels) -> Labels {
    let mut labels = extra.clone();
    let mut dupes = Vec::new();

    let mut rule_labels: Vec<(&String, &String)> = rule.labels.iter().collect();
    rule_labels.sort();
    for (k, v) in rule_labels.into_iter().chain(instance.iter()) {
        if labels.contains_key(k) {
            dupes.push(k.as_str());
            continue;
        }
        labels.insert(k.clone(), v.clone());
    }

    if !dupes.is_empty() {
        warn!(
            org_id = rule.org_id,
            rule_uid = %rule.uid,
            duplicates = ?dupes,
            "Evaluation result contains labels that conflict with reserved or rule labels, ignoring them"
        );
    }
    labels
}
