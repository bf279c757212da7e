//! Handler registry: a mapping from job type tag to handler, populated at
//! startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use job_common::job::JobMessage;

use crate::error::HandlerError;

/// The function that executes jobs of one type.
///
/// Handlers run under at-least-once delivery and must be idempotent on the
/// job id: status and result writes are overwrites, so replaying a message
/// converges on the same terminal state.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt. A `Some` result is persisted on the job row by
    /// the worker; handlers that persist their own result return `None`.
    async fn handle(
        &self,
        message: &JobMessage,
    ) -> Result<Option<serde_json::Value>, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>) {
        drop(self.handlers.insert(job_type.to_owned(), handler));
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}
