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

use crate::eval::EvalState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// One evaluation outcome as remembered by an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationPoint {
    pub evaluation_time: DateTime<Utc>,
    pub evaluation_state: EvalState,
    pub values: BTreeMap<String, Option<f64>>,
}

/// Fixed-capacity history of recent evaluations, oldest first. Pushing into a
/// full history evicts the oldest point.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultHistory {
    points: VecDeque<EvaluationPoint>,
    capacity: usize,
}

impl std::fmt::Debug for ResultHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHistory")
            .field("capacity", &self.capacity)
            .field("len", &self.points.len())
            .field("last", &self.points.back().map(|p| p.evaluation_state))
            .finish_non_exhaustive()
    }
}

impl ResultHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// History length for a rule: `For / interval` points when the rule has
    /// a pending period, otherwise the configured default.
    pub fn capacity_for(for_duration: Duration, interval: Duration, default: usize) -> usize {
        if for_duration.is_zero() || interval.is_zero() {
            return default;
        }
        ((for_duration.as_secs() / interval.as_secs().max(1)) as usize).max(1)
    }

    pub fn push(&mut self, point: EvaluationPoint) {
        while self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Shrinks or grows the window after a rule's `For` changed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn last(&self) -> Option<&EvaluationPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvaluationPoint> {
        self.points.iter()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.capacity
    }
}

impl Default for ResultHistory {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(secs: i64, state: EvalState) -> EvaluationPoint {
        EvaluationPoint {
            evaluation_time: Utc.timestamp_opt(secs, 0).unwrap(),
            evaluation_state: state,
            values: BTreeMap::new(),
        }
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut history = ResultHistory::new(2);
        history.push(point(1, EvalState::Normal));
        history.push(point(2, EvalState::Alerting));
        assert!(history.is_full());
        history.push(point(3, EvalState::Error));

        let times: Vec<i64> = history.iter().map(|p| p.evaluation_time.timestamp()).collect();
        assert_eq!(times, vec![2, 3]);
        assert_eq!(history.last().unwrap().evaluation_state, EvalState::Error);
    }

    #[test]
    fn test_capacity_for_rule() {
        let ten = Duration::from_secs(10);
        assert_eq!(ResultHistory::capacity_for(Duration::ZERO, ten, 10), 10);
        assert_eq!(
            ResultHistory::capacity_for(Duration::from_secs(30), ten, 10),
            3
        );
        assert_eq!(
            ResultHistory::capacity_for(Duration::from_secs(5), ten, 10),
            1
        );
    }

    #[test]
    fn test_set_capacity_trims() {
        let mut history = ResultHistory::new(4);
        for i in 0..4 {
            history.push(point(i, EvalState::Normal));
        }
        history.set_capacity(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().next().unwrap().evaluation_time.timestamp(), 2);
    }
}
