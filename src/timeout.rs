//! Request-scoped timeouts for remote calls

use std::future::Future;
use std::time::Duration;

use crate::errors::{ChaosError, ChaosResult};

/// Run a remote call, failing with a retryable timeout error
///
/// Dropping the inner future on timeout cancels the call; callers commit
/// nothing until the call has returned.
pub async fn with_timeout<F, T>(operation: &str, timeout: Duration, call: F) -> ChaosResult<T>
where
    F: Future<Output = ChaosResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ChaosError::timeout(operation, timeout.as_millis() as u64)),
    }
}
