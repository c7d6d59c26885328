//! Periodic session pruning.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::SessionStore;
use crate::config::SESSION_PRUNE_INTERVAL_SECS;

/// Spawns the task that drops expired sessions.
pub fn spawn_background_tasks(sessions: Arc<SessionStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            sessions.prune_expired().await;
            let live = sessions.len().await;
            debug!(live, "pruned expired sessions");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_tick_prunes_expired_sessions() {
        let sessions = Arc::new(SessionStore::new(Duration::ZERO));
        sessions.create(false, Vec::new()).await;
        spawn_background_tasks(sessions.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while sessions.len().await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("expired session pruned");
    }
}
