use crate::monitor_store::MonitorStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context handed to task type loaders and executors.
///
/// One context is created per check cycle. Executors share the cycle's
/// cancellation token, which fires when the batch deadline passes.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Cancelled when the batch deadline passes or the execution is abandoned.
    pub cancellation_token: CancellationToken,

    /// Access to task records and logs.
    pub store: Arc<dyn MonitorStore>,

    /// Upper bound on how many due records one loader call should return.
    pub due_batch_limit: usize,
}

impl ExecutionContext {
    pub fn new(
        cancellation_token: CancellationToken,
        store: Arc<dyn MonitorStore>,
        due_batch_limit: usize,
    ) -> Self {
        Self {
            cancellation_token,
            store,
            due_batch_limit,
        }
    }

    /// Long-running executors should check this between steps and return
    /// `TaskError::Cancelled` once it is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
