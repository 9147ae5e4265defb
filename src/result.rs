//! Operation outcome records.
//!
//! A [`ResultRecorder`] is opened when an operation starts and collects
//! warnings and metadata while it runs. [`ResultRecorder::finish`] consumes it,
//! stamps the finish time and yields an immutable [`OperationResult`], so the
//! finish timestamp is written exactly once per operation.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::Error;

/// Mutable outcome of an operation that is still running.
#[derive(Debug)]
pub struct ResultRecorder {
    operation: String,
    warnings: Vec<String>,
    metadata: BTreeMap<String, Value>,
    started_at: DateTime<Utc>,
}

impl ResultRecorder {
    /// Open a record and stamp the start time.
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Close the record.
    ///
    /// `Ok(message)` marks the operation successful. `Err(error)` records the
    /// error text and hands the error back together with the record.
    pub fn finish(
        self,
        outcome: std::result::Result<String, Error>,
    ) -> std::result::Result<OperationResult, OperationFailure> {
        let finished_at = Utc::now();
        match outcome {
            Ok(message) => Ok(OperationResult {
                operation: self.operation,
                success: true,
                message,
                warnings: self.warnings,
                errors: Vec::new(),
                metadata: self.metadata,
                started_at: self.started_at,
                finished_at,
            }),
            Err(error) => {
                let message = format!("Operation '{}' failed: {error}", self.operation);
                let result = OperationResult {
                    operation: self.operation,
                    success: false,
                    message,
                    warnings: self.warnings,
                    errors: vec![error.to_string()],
                    metadata: self.metadata,
                    started_at: self.started_at,
                    finished_at,
                };
                Err(OperationFailure {
                    error,
                    result: Box::new(result),
                })
            }
        }
    }
}

/// Finished, read-only outcome of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    operation: String,
    success: bool,
    message: String,
    warnings: Vec<String>,
    errors: Vec<String>,
    metadata: BTreeMap<String, Value>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl OperationResult {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub const fn success(&self) -> bool {
        self.success
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub const fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Convenience accessor for string metadata.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub const fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn duration(&self) -> TimeDelta {
        self.finished_at - self.started_at
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn duration_seconds(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 1000.0
    }
}

/// A failed operation: the triggering error plus the finished record.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct OperationFailure {
    #[source]
    pub error: Error,
    pub result: Box<OperationResult>,
}

impl OperationFailure {
    pub const fn error(&self) -> &Error {
        &self.error
    }

    pub fn result(&self) -> &OperationResult {
        &self.result
    }

    pub fn into_parts(self) -> (Error, OperationResult) {
        (self.error, *self.result)
    }
}
