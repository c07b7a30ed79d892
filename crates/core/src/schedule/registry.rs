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

use crate::schedule::stop::{StopReason, StopSource, StopToken};
use crate::types::{AlertRule, AlertRuleKey, CoreError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;

/// Unit of work handed from the scheduler to a rule routine.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub scheduled_at: DateTime<Utc>,
    pub rule: Arc<AlertRule>,
    pub folder_title: String,
}

#[derive(Debug, Default)]
struct EvalSlot {
    pending: Option<Evaluation>,
    running: bool,
}

/// Runtime handle of one rule: its stop signal and its two mailboxes.
///
/// Each mailbox holds at most one message. An evaluation offered while one
/// is pending or running is handed back to the caller as dropped. Version
/// updates coalesce to the highest version seen.
#[derive(Debug)]
pub struct RuleHandle {
    key: AlertRuleKey,
    stop: StopSource,
    eval_slot: Mutex<EvalSlot>,
    eval_notify: Notify,
    update_slot: Mutex<Option<i64>>,
    update_notify: Notify,
}

impl RuleHandle {
    pub fn new(key: AlertRuleKey, stop: StopSource) -> Self {
        Self {
            key,
            stop,
            eval_slot: Mutex::new(EvalSlot::default()),
            eval_notify: Notify::new(),
            update_slot: Mutex::new(None),
            update_notify: Notify::new(),
        }
    }

    pub fn key(&self) -> &AlertRuleKey {
        &self.key
    }

    /// Offers an evaluation. `Ok(Some(_))` returns the offered evaluation
    /// because the routine is still busy with a previous one.
    pub fn eval(&self, evaluation: Evaluation) -> Result<Option<Evaluation>> {
        if self.stop.is_stopped() {
            return Err(CoreError::RoutineStopped);
        }
        let mut slot = self.eval_slot.lock();
        if slot.running || slot.pending.is_some() {
            return Ok(Some(evaluation));
        }
        slot.pending = Some(evaluation);
        drop(slot);
        self.eval_notify.notify_one();
        Ok(None)
    }

    pub fn update(&self, version: i64) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(CoreError::RoutineStopped);
        }
        {
            let mut slot = self.update_slot.lock();
            *slot = Some(slot.map_or(version, |v| v.max(version)));
        }
        self.update_notify.notify_one();
        Ok(())
    }

    pub fn stop(&self, reason: StopReason) -> bool {
        self.stop.stop(reason)
    }

    pub fn token(&self) -> StopToken {
        self.stop.token()
    }

    pub fn is_evaluating(&self) -> bool {
        self.eval_slot.lock().running
    }

    pub(crate) async fn eval_requested(&self) {
        self.eval_notify.notified().await
    }

    pub(crate) async fn update_requested(&self) {
        self.update_notify.notified().await
    }

    /// Takes the pending evaluation and marks the routine busy.
    pub(crate) fn begin_evaluation(&self) -> Option<Evaluation> {
        let mut slot = self.eval_slot.lock();
        let evaluation = slot.pending.take();
        if evaluation.is_some() {
            slot.running = true;
        }
        evaluation
    }

    pub(crate) fn finish_evaluation(&self) {
        self.eval_slot.lock().running = false;
    }

    pub(crate) fn take_update(&self) -> Option<i64> {
        self.update_slot.lock().take()
    }
}

/// Live rule handles by rule key.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Mutex<HashMap<AlertRuleKey, Arc<RuleHandle>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rule's handle and whether it was created by this call.
    pub fn get_or_create(
        &self,
        key: &AlertRuleKey,
        parent: &StopSource,
    ) -> (Arc<RuleHandle>, bool) {
        let mut rules = self.rules.lock();
        if let Some(handle) = rules.get(key) {
            return (handle.clone(), false);
        }
        let handle = Arc::new(RuleHandle::new(key.clone(), parent.child()));
        rules.insert(key.clone(), handle.clone());
        (handle, true)
    }

    pub fn get(&self, key: &AlertRuleKey) -> Option<Arc<RuleHandle>> {
        self.rules.lock().get(key).cloned()
    }

    pub fn exists(&self, key: &AlertRuleKey) -> bool {
        self.rules.lock().contains_key(key)
    }

    pub fn del(&self, key: &AlertRuleKey) -> Option<Arc<RuleHandle>> {
        self.rules.lock().remove(key)
    }

    pub fn key_set(&self) -> HashSet<AlertRuleKey> {
        self.rules.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct SchedulableInner {
    rules: HashMap<AlertRuleKey, Arc<AlertRule>>,
    folder_titles: HashMap<String, String>,
}

/// Latest rule definitions pulled from the rule source.
#[derive(Debug, Default)]
pub struct SchedulableRuleSet {
    inner: Mutex<SchedulableInner>,
}

impl SchedulableRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, rules: Vec<AlertRule>, folder_titles: HashMap<String, String>) {
        let rules = rules
            .into_iter()
            .map(|rule| (rule.key(), Arc::new(rule)))
            .collect();
        let mut inner = self.inner.lock();
        inner.rules = rules;
        inner.folder_titles = folder_titles;
    }

    /// Rules ordered by key, plus folder titles by namespace UID.
    pub fn all(&self) -> (Vec<Arc<AlertRule>>, HashMap<String, String>) {
        let inner = self.inner.lock();
        let mut rules: Vec<Arc<AlertRule>> = inner.rules.values().cloned().collect();
        rules.sort_by_key(|rule| rule.key());
        (rules, inner.folder_titles.clone())
    }

    pub fn get(&self, key: &AlertRuleKey) -> Option<Arc<AlertRule>> {
        self.inner.lock().rules.get(key).cloned()
    }

    pub fn del(&self, key: &AlertRuleKey) -> Option<Arc<AlertRule>> {
        self.inner.lock().rules.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().rules.is_empty()
    }
}
