use crate::clock::DynClock;
use crate::eval::{has_errors, DynEvaluatorFactory, EvalResult, EvaluationContext, Results};
use crate::monitoring::SchedulerMetrics;
use crate::schedule::compat;
use crate::schedule::registry::{Evaluation, RuleHandle};
use crate::schedule::stop::{StopReason, StopToken};
use crate::schedule::traits::DynAlertSender;
use crate::state::{State, StateManager};
use crate::types::{
    AlertRule, AlertRuleKey, CoreError, Labels, ALERT_NAME_LABEL, FOLDER_TITLE_LABEL,
    NAMESPACE_UID_LABEL, RULE_UID_LABEL,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Called with the evaluation time after a rule's results were applied.
pub type EvalAppliedHook = Arc<dyn Fn(&AlertRuleKey, DateTime<Utc>) + Send + Sync>;
/// Called when a rule routine exits.
pub type StopAppliedHook = Arc<dyn Fn(&AlertRuleKey) + Send + Sync>;

/// Dependencies shared by every rule routine.
#[derive(Clone)]
pub(crate) struct RoutineContext {
    pub evaluator_factory: DynEvaluatorFactory,
    pub state_manager: Arc<StateManager>,
    pub sender: DynAlertSender,
    pub clock: DynClock,
    pub metrics: SchedulerMetrics,
    pub max_attempts: u32,
    pub disable_folder_label: bool,
    pub app_url: Option<String>,
    pub eval_applied: Option<EvalAppliedHook>,
    pub stop_applied: Option<StopAppliedHook>,
}

pub(crate) fn extra_labels(rule: &AlertRule, folder_title: &str, with_folder: bool) -> Labels {
    let mut labels = Labels::new();
    labels.insert(RULE_UID_LABEL.to_string(), rule.uid.clone());
    labels.insert(NAMESPACE_UID_LABEL.to_string(), rule.namespace_uid.clone());
    labels.insert(ALERT_NAME_LABEL.to_string(), rule.title.clone());
    if with_folder {
        labels.insert(FOLDER_TITLE_LABEL.to_string(), folder_title.to_string());
    }
    labels
}

struct RuleRoutine {
    ctx: Arc<RoutineContext>,
    handle: Arc<RuleHandle>,
    token: StopToken,
    current_version: i64,
    last_rule: Option<Arc<AlertRule>>,
}

/// Event loop of one rule. Exits when the rule's stop signal fires.
pub(crate) async fn rule_routine(ctx: Arc<RoutineContext>, handle: Arc<RuleHandle>) {
    let token = handle.token();
    let mut routine = RuleRoutine {
        ctx,
        handle,
        token,
        current_version: 0,
        last_rule: None,
    };
    routine.run().await;
}

impl RuleRoutine {
    fn key(&self) -> &AlertRuleKey {
        self.handle.key()
    }

    async fn run(&mut self) {
        debug!(
            org_id = self.key().org_id,
            rule_uid = %self.key().uid,
            "Alert rule routine started"
        );

        loop {
            let handle = self.handle.clone();
            let token = self.token.clone();
            tokio::select! {
                biased;
                reason = token.stopped() => {
                    self.on_stop(reason).await;
                    break;
                }
                _ = handle.update_requested() => {
                    if let Some(version) = handle.take_update() {
                        self.on_update(version).await;
                    }
                }
                _ = handle.eval_requested() => {
                    if let Some(evaluation) = handle.begin_evaluation() {
                        self.on_evaluation(evaluation).await;
                        handle.finish_evaluation();
                    }
                }
            }
        }

        if let Some(hook) = &self.ctx.stop_applied {
            hook(self.key());
        }
    }

    async fn on_stop(&mut self, reason: StopReason) {
        if reason == StopReason::RuleDeleted {
            self.clear_state().await;
        }
        debug!(
            org_id = self.key().org_id,
            rule_uid = %self.key().uid,
            %reason,
            "Stopping alert rule routine"
        );
    }

    async fn on_update(&mut self, version: i64) {
        if self.current_version >= version {
            debug!(
                rule_uid = %self.key().uid,
                version = self.current_version,
                new_version = version,
                "Skip updating rule because its current version is actual"
            );
            return;
        }
        if self.current_version > 0 {
            info!(
                rule_uid = %self.key().uid,
                version = self.current_version,
                new_version = version,
                "Clearing the state of the rule because version has changed"
            );
            self.clear_state().await;
        }
        self.current_version = version;
    }

    async fn on_evaluation(&mut self, evaluation: Evaluation) {
        let rule = evaluation.rule.clone();
        if rule.version != self.current_version {
            if self.current_version > 0 {
                info!(
                    rule_uid = %rule.uid,
                    version = self.current_version,
                    new_version = rule.version,
                    "Clearing the state of the rule because its definition changed"
                );
                self.clear_state().await;
            }
            self.current_version = rule.version;
        }
        self.last_rule = Some(rule.clone());

        let start = Instant::now();
        let token = self.token.clone();
        let outcome = tokio::select! {
            biased;
            _ = token.stopped() => None,
            outcome = self.evaluate_with_retry(&rule, evaluation.scheduled_at) => Some(outcome),
        };
        let Some((results, failed)) = outcome else {
            debug!(
                rule_uid = %rule.uid,
                "Evaluation cancelled because the rule routine was stopped"
            );
            return;
        };
        self.ctx
            .metrics
            .record_evaluation(rule.org_id, start.elapsed(), failed || has_errors(&results));

        if self.token.is_stopped() {
            debug!(rule_uid = %rule.uid, "Skip updating the state because the rule was stopped");
            return;
        }

        let labels = extra_labels(
            &rule,
            &evaluation.folder_title,
            !self.ctx.disable_folder_label,
        );
        let states = self
            .ctx
            .state_manager
            .process_eval_results(&rule, &results, &labels)
            .await;
        self.send_alerts(&states).await;

        if let Some(hook) = &self.ctx.eval_applied {
            hook(self.key(), evaluation.scheduled_at);
        }
    }

    /// Returns the results and whether every attempt failed.
    async fn evaluate_with_retry(&self, rule: &AlertRule, at: DateTime<Utc>) -> (Results, bool) {
        let ctx = EvaluationContext::for_org(rule.org_id);
        let condition = rule.eval_condition();
        let start = Instant::now();
        let attempts = self.ctx.max_attempts.max(1);

        let mut last_error = CoreError::EvaluationError("no attempt made".to_string());
        for attempt in 1..=attempts {
            let result = async {
                let evaluator = self
                    .ctx
                    .evaluator_factory
                    .create(&ctx, &condition)
                    .await?;
                evaluator.evaluate(at).await
            }
            .await;

            match result {
                Ok(results) => return (results, false),
                Err(e) => {
                    warn!(
                        org_id = rule.org_id,
                        rule_uid = %rule.uid,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Failed to evaluate alert rule"
                    );
                    last_error = e;
                }
            }
        }

        let elapsed: Duration = start.elapsed();
        (vec![EvalResult::from_error(last_error, at, elapsed)], true)
    }

    async fn send_alerts(&self, states: &[State]) {
        let (alerts, sent) = compat::from_alert_states_to_postable_alerts(
            states,
            self.ctx.state_manager.config().resend_delay(),
            self.ctx.app_url.as_deref(),
        );
        if alerts.is_empty() {
            return;
        }
        self.ctx.state_manager.mark_sent(&sent);
        debug!(
            rule_uid = %self.key().uid,
            count = alerts.len(),
            "Sending alerts to notifier"
        );
        self.ctx.sender.send(self.key(), alerts).await;
    }

    async fn clear_state(&self) {
        let removed = self
            .ctx
            .state_manager
            .reset_state_by_rule_uid(self.key(), self.last_rule.as_deref())
            .await;
        let alerts = compat::from_alert_states_to_stopped_alerts(
            &removed,
            self.ctx.clock.now(),
            self.ctx.app_url.as_deref(),
        );
        if !alerts.is_empty() {
            debug!(
                rule_uid = %self.key().uid,
                count = alerts.len(),
                "Sending stopped alerts to notifier"
            );
            self.ctx.sender.send(self.key(), alerts).await;
        }
    }
}
