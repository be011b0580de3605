use ingest_core::error::StoreError;
use ingest_core::store::KillFlagStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Answers "was this task killed?" without hitting the store on every
/// record. Answers may lag the store by up to the TTL; a kill is therefore
/// observed eventually, not instantly.
pub struct TaskStatusChecker {
    kill_flags: Arc<dyn KillFlagStore>,
    cache_ttl: Duration,
    poll_interval: Duration,
    cache: Mutex<HashMap<i64, (Instant, bool)>>,
}

impl TaskStatusChecker {
    pub fn new(kill_flags: Arc<dyn KillFlagStore>) -> Self {
        Self::with_timings(kill_flags, DEFAULT_CACHE_TTL, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_timings(
        kill_flags: Arc<dyn KillFlagStore>,
        cache_ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            kill_flags,
            cache_ttl,
            poll_interval,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached kill-flag lookup. A store failure reuses the stale cached
    /// answer (or reports "not killed") so record flow never stalls on the
    /// status store.
    ///
    /// The cache lock is never held across the store call; concurrent
    /// expired lookups each hit the store and the last write wins.
    pub async fn has_kill_flag(&self, task_id: i64) -> bool {
        {
            let cache = self.cache.lock().await;
            if let Some((read_at, flagged)) = cache.get(&task_id) {
                if read_at.elapsed() < self.cache_ttl {
                    return *flagged;
                }
            }
        }
        match self.kill_flags.has_kill_flag(task_id).await {
            Ok(flagged) => {
                self.cache
                    .lock()
                    .await
                    .insert(task_id, (Instant::now(), flagged));
                flagged
            }
            Err(err) => {
                warn!(task_id, error = %err, "kill flag lookup failed");
                let cache = self.cache.lock().await;
                cache.get(&task_id).map(|(_, f)| *f).unwrap_or(false)
            }
        }
    }

    pub async fn kill_reason(&self, task_id: i64) -> Result<Option<String>, StoreError> {
        self.kill_flags.kill_reason(task_id).await
    }

    /// Bridges the durable kill flag into a [`CancellationToken`].
    ///
    /// The returned token fires once the flag is observed; the polling task
    /// exits when the token is cancelled from either side or dropped via
    /// the returned handle.
    pub fn cancellation_for(self: &Arc<Self>, task_id: i64) -> (CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let checker = Arc::clone(self);
        let poll_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_token.cancelled() => return,
                    _ = tokio::time::sleep(checker.poll_interval) => {}
                }
                if checker.has_kill_flag(task_id).await {
                    info!(task_id, "kill flag observed, cancelling task");
                    poll_token.cancel();
                    return;
                }
            }
        });

        (token, handle)
    }
}
