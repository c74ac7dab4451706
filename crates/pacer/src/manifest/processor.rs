use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::entity::prelude::{Activity, Subject};
use crate::store::{Store, StoreError};

use super::Manifest;

/// Failure of a whole processor invocation.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed: {message}")]
    Failed { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Processor cancelled")]
    Cancelled,
}

impl ProcessorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Everything an inline processor sees for one sub-batch.
///
/// Processors report per-activity failures through [`record_error`](Self::record_error).
/// Activities without a recorded error are marked done by the scheduler once the
/// processor returns.
pub struct ProcessorContext<'a> {
    pub manifest: &'a Manifest,
    pub activities: &'a mut [Activity],
    pub subject: &'a Subject,
    pub cancel: &'a CancellationToken,
    pub store: &'a dyn Store,
    errors: HashMap<i64, String>,
}

impl<'a> ProcessorContext<'a> {
    pub fn new(
        manifest: &'a Manifest,
        activities: &'a mut [Activity],
        subject: &'a Subject,
        cancel: &'a CancellationToken,
        store: &'a dyn Store,
    ) -> Self {
        Self {
            manifest,
            activities,
            subject,
            cancel,
            store,
            errors: HashMap::new(),
        }
    }

    /// Attribute a failure to one activity.
    pub fn record_error(&mut self, activity_id: i64, message: impl Into<String>) {
        self.errors.insert(activity_id, message.into());
    }

    pub fn errors(&self) -> &HashMap<i64, String> {
        &self.errors
    }

    pub fn into_errors(self) -> HashMap<i64, String> {
        self.errors
    }
}

/// A processor run inline by the local-processing scheduler.
#[async_trait]
pub trait InlineProcessor: Send + Sync {
    async fn process(&self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError>;
}
