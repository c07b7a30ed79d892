use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Display, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[display("Rule store error: {}", _0)]
    RuleStoreError(String),

    #[display("Evaluator construction failed: {}", _0)]
    EvaluatorBuildError(String),

    #[display("Evaluation failed: {}", _0)]
    EvaluationError(String),

    #[display("Instance store error: {}", _0)]
    InstanceStoreError(String),

    #[display("Configuration error: {}", _0)]
    ConfigurationError(String),

    #[display(
        "Invalid interval {}s, must be a multiple of the base interval {}s",
        interval_secs,
        base_interval_secs
    )]
    InvalidInterval {
        interval_secs: i64,
        base_interval_secs: i64,
    },

    #[display("Rule routine stopped")]
    RoutineStopped,

    #[display("Internal error: {}", _0)]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
