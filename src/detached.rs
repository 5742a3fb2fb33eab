//! Fire-and-forget background work

use crate::error::Result;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spawn `task` independently of the request that started it
///
/// The task keeps running if the client goes away. Failures are logged and
/// never reach the response that was already returned.
pub fn spawn_detached<F>(label: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!("Background task {} finished", label),
            Err(e) => warn!("Background task {} failed: {}", label, e),
        }
    })
}
