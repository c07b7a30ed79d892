//! Per-instance state machine.

use crate::eval::{EvalResult, EvalState};
use crate::state::results::{EvaluationPoint, ResultHistory};
use crate::types::{cache_id, AlertRule, ExecErrState, Labels, NoDataState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Timing knobs of the transition algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// How far `EndsAt` is pushed past each firing evaluation.
    pub keep_alive: Duration,
    pub max_results: usize,
}

/// A state together with the reason it was entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateAndReason {
    pub state: EvalState,
    pub reason: String,
}

impl fmt::Display for StateAndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub previous: StateAndReason,
    pub current: StateAndReason,
}

impl StateTransition {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Where a raw evaluator verdict lands once the rule's policies are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Normal,
    Alerting,
    Keep(EvalState),
}

fn target_for(rule: &AlertRule, raw: EvalState) -> Option<Target> {
    let target = match (raw, rule.exec_err_state, rule.no_data_state) {
        (EvalState::Normal, _, _) => Target::Normal,
        (EvalState::Alerting, _, _) => Target::Alerting,
        (EvalState::Error, ExecErrState::Alerting, _) => Target::Alerting,
        (EvalState::Error, ExecErrState::Error, _) => Target::Keep(EvalState::Error),
        (EvalState::Error, ExecErrState::Ok, _) => Target::Normal,
        (EvalState::NoData, _, NoDataState::Alerting) => Target::Alerting,
        (EvalState::NoData, _, NoDataState::NoData) => Target::Keep(EvalState::NoData),
        (EvalState::NoData, _, NoDataState::Ok) => Target::Normal,
        (EvalState::Pending, _, _) => return None,
    };
    Some(target)
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

/// Tracked status of one (rule, label set) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub org_id: i64,
    pub rule_uid: String,
    pub cache_id: String,
    pub state: EvalState,
    pub state_reason: String,
    pub labels: Labels,
    pub annotations: HashMap<String, String>,
    pub results: ResultHistory,
    pub error: Option<String>,
    pub resolved: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub last_evaluation_time: DateTime<Utc>,
    pub last_evaluation_string: String,
    pub evaluation_duration: Duration,
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl State {
    pub fn new(rule: &AlertRule, labels: Labels, history: usize) -> Self {
        Self {
            org_id: rule.org_id,
            rule_uid: rule.uid.clone(),
            cache_id: cache_id(&labels),
            state: EvalState::Normal,
            state_reason: String::new(),
            labels,
            annotations: rule.annotations.clone(),
            results: ResultHistory::new(history),
            error: None,
            resolved: false,
            starts_at: None,
            ends_at: None,
            last_evaluation_time: DateTime::<Utc>::UNIX_EPOCH,
            last_evaluation_string: String::new(),
            evaluation_duration: Duration::ZERO,
            last_sent_at: None,
        }
    }

    pub fn state_and_reason(&self) -> StateAndReason {
        StateAndReason {
            state: self.state,
            reason: self.state_reason.clone(),
        }
    }

    /// Applies one evaluator verdict. Returns `None` for verdicts that are
    /// never valid input, leaving the instance untouched.
    pub fn apply(
        &mut self,
        rule: &AlertRule,
        result: &EvalResult,
        policy: TransitionPolicy,
    ) -> Option<StateTransition> {
        let target = target_for(rule, result.state)?;
        let at = result.evaluated_at;

        self.last_evaluation_time = at;
        self.evaluation_duration = result.evaluation_duration;
        self.last_evaluation_string = result.evaluation_string.clone();
        self.results.set_capacity(ResultHistory::capacity_for(
            rule.for_duration,
            rule.interval(),
            policy.max_results,
        ));
        self.results.push(EvaluationPoint {
            evaluation_time: at,
            evaluation_state: result.state,
            values: result.values.clone(),
        });

        let previous = self.state_and_reason();
        let keep_alive = to_chrono(policy.keep_alive);

        match target {
            Target::Normal => {
                self.state = EvalState::Normal;
                self.starts_at = None;
                self.ends_at = None;
            }
            Target::Alerting => {
                let for_duration = to_chrono(rule.for_duration);
                match self.state {
                    EvalState::Alerting => {}
                    EvalState::Pending => {
                        let since = self.starts_at.unwrap_or(at);
                        if at - since >= for_duration {
                            self.state = EvalState::Alerting;
                            self.starts_at = Some(at);
                        }
                    }
                    _ => {
                        self.starts_at = Some(at);
                        self.state = if rule.for_duration.is_zero() {
                            EvalState::Alerting
                        } else {
                            EvalState::Pending
                        };
                    }
                }
                self.ends_at = Some(at + keep_alive);
            }
            Target::Keep(kept) => {
                if self.state != kept || self.starts_at.is_none() {
                    self.starts_at = Some(at);
                }
                self.state = kept;
                self.ends_at = Some(at + keep_alive);
            }
        }

        self.error = match (result.state, target) {
            (EvalState::Error, Target::Normal) => None,
            (EvalState::Error, _) => result.error.clone(),
            _ => None,
        };

        self.state_reason = if self.state != result.state
            && !matches!(result.state, EvalState::Normal | EvalState::Alerting)
        {
            result.state.to_string()
        } else {
            String::new()
        };

        self.resolved = previous.state == EvalState::Alerting && self.state == EvalState::Normal;

        Some(StateTransition {
            previous,
            current: self.state_and_reason(),
        })
    }

    /// Whether the notifier must hear about this instance after the latest
    /// evaluation.
    pub fn needs_sending(&self, resend_delay: Duration) -> bool {
        if self.resolved {
            return true;
        }
        if !matches!(
            self.state,
            EvalState::Alerting | EvalState::NoData | EvalState::Error
        ) {
            return false;
        }
        let resend_delay = to_chrono(resend_delay);
        match self.last_sent_at {
            Some(sent) => sent + resend_delay <= self.last_evaluation_time,
            None => true,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, rule: &AlertRule, stale_multiplier: u32) -> bool {
        let window = to_chrono(rule.interval() * stale_multiplier);
        self.last_evaluation_time + window < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const POLICY: TransitionPolicy = TransitionPolicy {
        keep_alive: Duration::from_secs(90),
        max_results: 10,
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_000 + secs, 0).unwrap()
    }

    fn rule(for_secs: u64) -> AlertRule {
        AlertRule {
            uid: "rule".to_string(),
            title: "High CPU".to_string(),
            for_duration: Duration::from_secs(for_secs),
            ..Default::default()
        }
    }

    fn result(state: EvalState, t: i64) -> EvalResult {
        EvalResult::new(Labels::new(), state, at(t))
    }

    #[test]
    fn test_alerting_without_for_fires_immediately() {
        let rule = rule(0);
        let mut s = State::new(&rule, Labels::new(), 10);
        let tr = s.apply(&rule, &result(EvalState::Alerting, 0), POLICY).unwrap();

        assert!(tr.changed());
        assert_eq!(s.state, EvalState::Alerting);
        assert_eq!(s.starts_at, Some(at(0)));
        assert_eq!(s.ends_at, Some(at(90)));

        s.apply(&rule, &result(EvalState::Alerting, 10), POLICY);
        assert_eq!(s.starts_at, Some(at(0)));
        assert_eq!(s.ends_at, Some(at(100)));
    }

    #[test]
    fn test_pending_promotes_once_for_elapsed() {
        let rule = rule(20);
        let mut s = State::new(&rule, Labels::new(), 10);

        s.apply(&rule, &result(EvalState::Alerting, 0), POLICY);
        assert_eq!(s.state, EvalState::Pending);
        s.apply(&rule, &result(EvalState::Alerting, 10), POLICY);
        assert_eq!(s.state, EvalState::Pending);
        assert_eq!(s.starts_at, Some(at(0)));
        s.apply(&rule, &result(EvalState::Alerting, 20), POLICY);
        assert_eq!(s.state, EvalState::Alerting);
        assert_eq!(s.starts_at, Some(at(20)));
        assert_eq!(s.results.capacity(), 2);
    }

    #[test]
    fn test_normal_cancels_pending() {
        let rule = rule(30);
        let mut s = State::new(&rule, Labels::new(), 10);
        s.apply(&rule, &result(EvalState::Alerting, 0), POLICY);
        let tr = s.apply(&rule, &result(EvalState::Normal, 10), POLICY).unwrap();

        assert_eq!(tr.previous.state, EvalState::Pending);
        assert_eq!(s.state, EvalState::Normal);
        assert_eq!(s.starts_at, None);
        assert_eq!(s.ends_at, None);
        assert!(!s.resolved);
    }

    #[test]
    fn test_resolved_only_from_alerting() {
        let rule = rule(0);
        let mut s = State::new(&rule, Labels::new(), 10);
        s.apply(&rule, &result(EvalState::Alerting, 0), POLICY);
        s.apply(&rule, &result(EvalState::Normal, 10), POLICY);
        assert!(s.resolved);
        s.apply(&rule, &result(EvalState::Normal, 20), POLICY);
        assert!(!s.resolved);
    }

    #[test]
    fn test_error_policies() {
        let mut r = rule(0);
        r.exec_err_state = ExecErrState::Error;
        let mut s = State::new(&r, Labels::new(), 10);
        let err = result(EvalState::Error, 0).with_error("datasource down");
        s.apply(&r, &err, POLICY);
        assert_eq!(s.state, EvalState::Error);
        assert_eq!(s.state_reason, "");
        assert_eq!(s.error.as_deref(), Some("datasource down"));

        r.exec_err_state = ExecErrState::Alerting;
        let mut s = State::new(&r, Labels::new(), 10);
        s.apply(&r, &err, POLICY);
        assert_eq!(s.state, EvalState::Alerting);
        assert_eq!(s.state_reason, "Error");
        assert!(s.error.is_some());

        s.apply(&r, &result(EvalState::Alerting, 10), POLICY);
        assert_eq!(s.state_reason, "");
        assert!(s.error.is_none());

        r.exec_err_state = ExecErrState::Ok;
        let mut s = State::new(&r, Labels::new(), 10);
        s.apply(&r, &err, POLICY);
        assert_eq!(s.state, EvalState::Normal);
        assert_eq!(s.state_reason, "Error");
        assert_eq!(s.starts_at, None);
        assert!(s.error.is_none());
    }

    #[test]
    fn test_kept_no_data_starts_when_entered() {
        let r = rule(0);
        let mut s = State::new(&r, Labels::new(), 10);
        s.apply(&r, &result(EvalState::NoData, 0), POLICY);
        s.apply(&r, &result(EvalState::NoData, 10), POLICY);
        assert_eq!(s.state, EvalState::NoData);
        assert_eq!(s.starts_at, Some(at(0)));
        assert_eq!(s.ends_at, Some(at(100)));
    }

    #[test]
    fn test_pending_input_is_ignored() {
        let r = rule(0);
        let mut s = State::new(&r, Labels::new(), 10);
        assert!(s.apply(&r, &result(EvalState::Pending, 0), POLICY).is_none());
        assert!(s.results.is_empty());
        assert_eq!(s.last_evaluation_time, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_needs_sending_respects_resend_delay() {
        let r = rule(0);
        let mut s = State::new(&r, Labels::new(), 10);
        let delay = Duration::from_secs(30);
        s.apply(&r, &result(EvalState::Alerting, 0), POLICY);
        assert!(s.needs_sending(delay));

        s.last_sent_at = Some(at(0));
        s.apply(&r, &result(EvalState::Alerting, 10), POLICY);
        assert!(!s.needs_sending(delay));
        s.apply(&r, &result(EvalState::Alerting, 30), POLICY);
        assert!(s.needs_sending(delay));

        s.last_sent_at = Some(at(30));
        s.apply(&r, &result(EvalState::Normal, 40), POLICY);
        assert!(s.needs_sending(delay));
    }

    #[test]
    fn test_state_and_reason_display() {
        let sr = StateAndReason {
            state: EvalState::Alerting,
            reason: "NoData".to_string(),
        };
        assert_eq!(sr.to_string(), "Alerting (NoData)");
    }
}
