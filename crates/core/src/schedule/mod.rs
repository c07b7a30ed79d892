//! Tick-driven alert rule scheduler.
//!
//! Every base interval the [`Scheduler`] refreshes the schedulable rules,
//! makes sure each rule has exactly one routine, and hands an evaluation to
//! the routines whose interval is due. Routines of rules that disappear are
//! stopped with [`StopReason::RuleDeleted`], which clears their state.

pub mod compat;
pub mod registry;
pub mod routine;
pub mod stop;
pub mod traits;

pub use registry::{Evaluation, RuleHandle, RuleRegistry, SchedulableRuleSet};
pub use routine::{EvalAppliedHook, StopAppliedHook};
pub use stop::{StopReason, StopSource, StopToken};
pub use traits::*;

use crate::clock::DynClock;
use crate::config::SchedulerConfig;
use crate::eval::DynEvaluatorFactory;
use crate::monitoring::SchedulerMetrics;
use crate::state::StateManager;
use crate::types::{AlertRule, AlertRuleKey, CoreError, Result};
use chrono::{DateTime, Utc};
use routine::{rule_routine, RoutineContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Collaborators the scheduler drives.
pub struct SchedulerDeps {
    pub rule_source: DynRuleSource,
    pub evaluator_factory: DynEvaluatorFactory,
    pub state_manager: Arc<StateManager>,
    pub sender: DynAlertSender,
    pub clock: DynClock,
    pub metrics: SchedulerMetrics,
}

/// An evaluation dispatched by one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvaluation {
    pub key: AlertRuleKey,
    pub version: i64,
    pub delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scheduled: Vec<ScheduledEvaluation>,
    pub stopped: Vec<AlertRuleKey>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    rule_source: DynRuleSource,
    registry: RuleRegistry,
    schedulable: SchedulableRuleSet,
    root: StopSource,
    ctx: Arc<RoutineContext>,
    metrics: SchedulerMetrics,
    clock: DynClock,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Self {
        let ctx = RoutineContext {
            evaluator_factory: deps.evaluator_factory,
            state_manager: deps.state_manager,
            sender: deps.sender,
            clock: deps.clock.clone(),
            metrics: deps.metrics.clone(),
            max_attempts: config.max_attempts,
            disable_folder_label: config.disable_folder_label,
            app_url: config.app_url.clone(),
            eval_applied: None,
            stop_applied: None,
        };
        Self {
            config,
            rule_source: deps.rule_source,
            registry: RuleRegistry::new(),
            schedulable: SchedulableRuleSet::new(),
            root: StopSource::new(),
            ctx: Arc::new(ctx),
            metrics: deps.metrics,
            clock: deps.clock,
        }
    }

    pub fn with_eval_applied_hook(mut self, hook: EvalAppliedHook) -> Self {
        Arc::make_mut(&mut self.ctx).eval_applied = Some(hook);
        self
    }

    pub fn with_stop_applied_hook(mut self, hook: StopAppliedHook) -> Self {
        Arc::make_mut(&mut self.ctx).stop_applied = Some(hook);
        self
    }

    fn base_secs(&self) -> i64 {
        self.config.base_interval_secs.max(1) as i64
    }

    fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_secs() as u64)
    }

    /// Drives the tick loop until `shutdown` flips, then stops every rule
    /// routine and waits for all of them to return.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let base = self.base_interval();
        let base_secs = self.base_secs();
        let mut ticker = time::interval(base);
        let mut tasks = JoinSet::new();

        let now = self.clock.now().timestamp();
        let mut next_tick = DateTime::<Utc>::from_timestamp(now - now.rem_euclid(base_secs), 0)
            .ok_or_else(|| CoreError::InternalError("clock out of range".to_string()))?;

        info!(base_interval = ?base, "Starting alert rule scheduler");
        loop {
            tokio::select! {
                scheduled = ticker.tick() => {
                    let tick = next_tick;
                    next_tick += chrono::Duration::seconds(base_secs);

                    let behind = Instant::now().saturating_duration_since(scheduled);
                    self.metrics.behind_seconds.set(behind.as_secs_f64());

                    let start = Instant::now();
                    let report = self.process_tick(&mut tasks, tick).await;
                    self.metrics
                        .periodic_duration
                        .observe(start.elapsed().as_secs_f64());
                    debug!(
                        tick = %tick,
                        scheduled = report.scheduled.len(),
                        stopped = report.stopped.len(),
                        "Tick processed"
                    );
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Scheduler task panicked");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(routines = self.registry.len(), "Stopping alert rule scheduler");
        self.root.stop(StopReason::Shutdown);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Scheduler task panicked during shutdown");
                }
            }
        }
        info!("Alert rule scheduler stopped");
        Ok(())
    }

    /// Runs one tick at `tick`: refreshes rules, starts missing routines,
    /// dispatches due evaluations into `tasks` and stops routines of rules
    /// that are gone.
    pub async fn process_tick(&self, tasks: &mut JoinSet<()>, tick: DateTime<Utc>) -> TickReport {
        match self.rule_source.list_schedulable_rules().await {
            Ok(snapshot) => self.schedulable.set(snapshot.rules, snapshot.folder_titles),
            Err(e) => error!(error = %e, "Failed to update alert rules, using previous snapshot"),
        }

        let base_secs = self.base_secs();
        let tick_num = tick.timestamp().div_euclid(base_secs);
        let min_interval = self.config.min_interval_secs as i64;

        let (rules, folder_titles) = self.schedulable.all();
        let uids: Vec<&str> = rules.iter().map(|r| r.uid.as_str()).collect();
        self.metrics.record_schedulable(&uids);

        let mut previously_running = self.registry.key_set();
        let mut ready = Vec::new();

        for rule in rules.iter() {
            let rule = clamp_interval(rule, min_interval);
            let key = rule.key();
            let (handle, created) = self.registry.get_or_create(&key, &self.root);
            if created {
                tasks.spawn(rule_routine(self.ctx.clone(), handle.clone()));
            }
            previously_running.remove(&key);

            let frequency = match rule_frequency(rule.interval_seconds, min_interval, base_secs) {
                Ok(frequency) => frequency,
                Err(err) => {
                    warn!(
                        org_id = key.org_id,
                        rule_uid = %key.uid,
                        error = %err,
                        "Alert rule cannot be scheduled"
                    );
                    continue;
                }
            };
            if !is_due(tick_num, frequency) {
                continue;
            }

            let folder_title = if self.config.disable_folder_label {
                String::new()
            } else {
                match folder_titles.get(&rule.namespace_uid) {
                    Some(title) => title.clone(),
                    None => {
                        warn!(
                            rule_uid = %key.uid,
                            namespace_uid = %rule.namespace_uid,
                            "Failed to get folder title for rule, folder label will be empty"
                        );
                        String::new()
                    }
                }
            };

            ready.push((
                handle,
                Evaluation {
                    scheduled_at: tick,
                    rule,
                    folder_title,
                },
            ));
        }

        let mut report = TickReport::default();
        if !ready.is_empty() {
            let step = self.base_interval() / ready.len() as u32;
            for (i, (handle, evaluation)) in ready.into_iter().enumerate() {
                let delay = step * i as u32;
                report.scheduled.push(ScheduledEvaluation {
                    key: handle.key().clone(),
                    version: evaluation.rule.version,
                    delay,
                });
                tasks.spawn(dispatch(handle, evaluation, delay, self.metrics.clone()));
            }
        }

        if !previously_running.is_empty() {
            let mut stopped: Vec<AlertRuleKey> = previously_running.into_iter().collect();
            stopped.sort();
            self.delete_alert_rule(&stopped);
            report.stopped = stopped;
        }
        report
    }

    /// Tells a running routine that its rule changed to `version`.
    pub fn update_alert_rule(&self, key: &AlertRuleKey, version: i64) {
        let Some(handle) = self.registry.get(key) else {
            return;
        };
        if handle.update(version).is_err() {
            debug!(rule_uid = %key.uid, version, "Update dropped, rule routine already stopped");
        }
    }

    /// Forgets the rules and stops their routines. Each routine clears its
    /// rule's state before it exits.
    pub fn delete_alert_rule(&self, keys: &[AlertRuleKey]) {
        for key in keys {
            self.schedulable.del(key);
            match self.registry.del(key) {
                Some(handle) => {
                    handle.stop(StopReason::RuleDeleted);
                    info!(
                        org_id = key.org_id,
                        rule_uid = %key.uid,
                        "Alert rule deleted, routine stopped"
                    );
                }
                None => debug!(rule_uid = %key.uid, "Alert rule is not running"),
            }
        }
    }

    pub fn is_running(&self, key: &AlertRuleKey) -> bool {
        self.registry.exists(key)
    }

    pub fn running_rules(&self) -> usize {
        self.registry.len()
    }

    pub fn schedulable_rules(&self) -> usize {
        self.schedulable.len()
    }

    pub async fn rule_keys(&self) -> Result<Vec<AlertRuleKey>> {
        self.rule_source.list_rule_keys().await
    }

    /// Stops every routine without waiting for them.
    pub fn stop_all(&self) {
        self.root.stop(StopReason::Shutdown);
    }
}

/// Number of base ticks between two evaluations of a rule. The interval is
/// first raised to `min_interval_secs`; it must then be a positive multiple
/// of the base interval.
pub fn rule_frequency(interval_secs: i64, min_interval_secs: i64, base_secs: i64) -> Result<i64> {
    let interval_secs = interval_secs.max(min_interval_secs);
    if base_secs <= 0 || interval_secs <= 0 || interval_secs % base_secs != 0 {
        return Err(CoreError::InvalidInterval {
            interval_secs,
            base_interval_secs: base_secs,
        });
    }
    Ok(interval_secs / base_secs)
}

/// Raises a rule's interval to `min_interval_secs` so that everything
/// downstream sees the interval the rule is actually evaluated at.
fn clamp_interval(rule: &Arc<AlertRule>, min_interval_secs: i64) -> Arc<AlertRule> {
    if rule.interval_seconds >= min_interval_secs {
        return rule.clone();
    }
    let mut clamped = AlertRule::clone(rule);
    clamped.interval_seconds = min_interval_secs;
    Arc::new(clamped)
}

/// Whether a rule with the given frequency is due on tick number `tick_num`.
pub fn is_due(tick_num: i64, frequency: i64) -> bool {
    frequency > 0 && tick_num.rem_euclid(frequency) == 0
}

async fn dispatch(
    handle: Arc<RuleHandle>,
    evaluation: Evaluation,
    delay: Duration,
    metrics: SchedulerMetrics,
) {
    let token = handle.token();
    tokio::select! {
        biased;
        _ = token.stopped() => {
            debug!(
                rule_uid = %handle.key().uid,
                "Scheduled evaluation was cancelled because the rule was stopped"
            );
            return;
        }
        _ = time::sleep(delay) => {}
    }

    match handle.eval(evaluation) {
        Ok(None) => {}
        Ok(Some(dropped)) => {
            metrics.record_missed(handle.key());
            warn!(
                org_id = handle.key().org_id,
                rule_uid = %handle.key().uid,
                time = %dropped.scheduled_at,
                "Tick dropped because alert rule evaluation is too slow"
            );
        }
        Err(_) => debug!(
            rule_uid = %handle.key().uid,
            "Scheduled evaluation was cancelled because the rule routine was stopped"
        ),
    }
}
