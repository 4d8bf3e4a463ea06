use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConversionError {
    #[error("metric name is empty")]
    EmptyMetric,

    #[error("metric name contains whitespace: {0:?}")]
    InvalidMetric(String),

    #[error("value of {metric} is not finite: {value}")]
    NonFiniteValue { metric: String, value: f64 },

    #[error("invalid tag {key:?}={value:?}")]
    InvalidTag { key: String, value: String },

    #[error("unknown flat operation: {0}")]
    UnknownOperation(String),
}

/// Aggregation applied to a point when it is flattened with its peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlatOperation {
    #[default]
    Sum,
    Avg,
    Count,
    Max,
    Min,
}

impl FlatOperation {
    pub fn parse(raw: &str) -> Result<Self, ConversionError> {
        match raw {
            "sum" => Ok(FlatOperation::Sum),
            "avg" => Ok(FlatOperation::Avg),
            "count" => Ok(FlatOperation::Count),
            "max" => Ok(FlatOperation::Max),
            "min" => Ok(FlatOperation::Min),
            other => Err(ConversionError::UnknownOperation(other.to_owned())),
        }
    }
}

impl fmt::Display for FlatOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlatOperation::Sum => "sum",
            FlatOperation::Avg => "avg",
            FlatOperation::Count => "count",
            FlatOperation::Max => "max",
            FlatOperation::Min => "min",
        };
        f.write_str(name)
    }
}

/// Backend-neutral form of a single data point.
///
/// Every transport converts its own item type to and from this shape, which is
/// what lets points cross from one backend to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenedPoint {
    #[serde(default)]
    pub operation: FlatOperation,
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub value: f64,
}

impl FlattenedPoint {
    /// Checks shared by every backend: a named metric with a finite value.
    pub fn validate(&self) -> Result<(), ConversionError> {
        check_metric(&self.metric, self.value)
    }
}

pub(crate) fn check_metric(metric: &str, value: f64) -> Result<(), ConversionError> {
    if metric.is_empty() {
        return Err(ConversionError::EmptyMetric);
    }
    if !value.is_finite() {
        return Err(ConversionError::NonFiniteValue {
            metric: metric.to_owned(),
            value,
        });
    }
    Ok(())
}
