//! Always-restore registry.
//!
//! Every device mutation the sequencer makes while arming registers the action
//! that undoes it. On every exit path the sequencer runs the registry, which
//! undoes the mutations in reverse order. A failing restore is logged and the
//! remaining restores still run.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut cleanup = CleanupRegistry::new();
//!
//! let live = scope.live.clone();
//! live.set_live(false).await?;
//! cleanup.register("live_mode", move || async move { live.set_live(true).await });
//!
//! // ... run ...
//!
//! cleanup.run_all().await;
//! ```

use std::future::Future;
use std::pin::Pin;

/// Future returned by a restore action.
pub type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Boxed restore action.
pub type AsyncCleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send + Sync>;

/// Ordered async restore actions, run last-in first-out.
#[derive(Default)]
pub struct CleanupRegistry {
    actions: Vec<(String, AsyncCleanupFn)>,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

impl CleanupRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a restore action.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: AsyncCleanupFn = Box::new(move || -> CleanupFuture { Box::pin(action()) });
        self.actions.push((name.into(), action));
    }

    /// Names of the registered actions, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run every action, most recent first. Returns the number that failed.
    pub async fn run_all(self) -> usize {
        let mut failures = 0;
        for (name, action) in self.actions.into_iter().rev() {
            tracing::debug!(action = %name, "Running cleanup");
            if let Err(err) = action().await {
                failures += 1;
                tracing::warn!(action = %name, error = %format!("{err:#}"), "Cleanup failed");
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, name: &'static str) -> AsyncCleanupFn {
        let log = Arc::clone(log);
        Box::new(move || -> CleanupFuture {
            Box::pin(async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut cleanup = CleanupRegistry::new();
        cleanup.register("live", recorder(&log, "live"));
        cleanup.register("camera", recorder(&log, "camera"));
        cleanup.register("controller", recorder(&log, "controller"));
        assert_eq!(cleanup.names(), vec!["live", "camera", "controller"]);

        assert_eq!(cleanup.run_all().await, 0);
        assert_eq!(*log.lock().unwrap(), vec!["controller", "camera", "live"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_remaining_actions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut cleanup = CleanupRegistry::new();
        cleanup.register("first", recorder(&log, "first"));
        cleanup.register("broken", || async { Err::<(), _>(anyhow::anyhow!("device offline")) });

        assert_eq!(cleanup.run_all().await, 1);
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }
}
