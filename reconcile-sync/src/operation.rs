//! Update operations.
//!
//! An [`UpdateOperation`] is what a producer hands to the pipeline: a key,
//! the new data, where it came from and how it should be folded into the
//! existing value. Operations are consumed by the pipeline and never stored.

use reconcile_types::{DataSource, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How incoming data is combined with the existing canonical value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Overwrite the existing value.
    #[default]
    Replace,
    /// Shallow-merge incoming fields over the existing value.
    Merge,
    /// Concatenate incoming items onto the existing value.
    Append,
}

impl MergeStrategy {
    /// Folds `incoming` into `existing` according to this strategy.
    pub fn apply<T: Payload>(&self, existing: Option<&T>, incoming: &T) -> T {
        match (self, existing) {
            (_, None) | (Self::Replace, _) => incoming.clone(),
            (Self::Merge, Some(current)) => current.merge_fields(incoming),
            (Self::Append, Some(current)) => current.append(incoming),
        }
    }
}

/// Predicate that must accept the data before anything is committed.
pub type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A single update submitted by a producer.
#[derive(Clone)]
pub struct UpdateOperation<T> {
    /// The data key being updated.
    pub key: String,
    /// The new data.
    pub data: T,
    /// Where the data came from.
    pub source: DataSource,
    /// How to combine the data with the existing value.
    pub merge_strategy: MergeStrategy,
    /// Optional validator; a rejection aborts the update.
    pub validator: Option<Validator<T>>,
}

impl<T> UpdateOperation<T> {
    /// Creates a replace operation without a validator.
    pub fn new(key: impl Into<String>, data: T, source: DataSource) -> Self {
        Self {
            key: key.into(),
            data,
            source,
            merge_strategy: MergeStrategy::Replace,
            validator: None,
        }
    }

    /// Sets the merge strategy.
    #[must_use]
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Attaches a validator.
    #[must_use]
    pub fn with_validator(mut self, validator: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Runs the validator, if any.
    pub fn is_valid(&self) -> bool {
        self.validator.as_ref().is_none_or(|validate| validate(&self.data))
    }
}

impl<T: fmt::Debug> fmt::Debug for UpdateOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateOperation")
            .field("key", &self.key)
            .field("data", &self.data)
            .field("source", &self.source)
            .field("merge_strategy", &self.merge_strategy)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}
