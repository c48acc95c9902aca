// =============================================================================
// Scheduler — centralized periodic-task runner
// =============================================================================
//
// Owns every recurring job in the engine. Each task catches and logs its own
// errors; a failing task never halts the scheduler or its siblings. Tasks
// may carry a start offset (the exit reconciler runs +15 s from the entry
// reconciler) and a daily task runs at a configured local wall-clock time.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::exchange_offset;

pub struct Scheduler {
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a periodic task. The first run happens after `offset` +
    /// `interval`.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        interval: Duration,
        offset: Duration,
        task: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if !offset.is_zero() {
                tokio::time::sleep(offset).await;
            }
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately; consume
            // it so the cadence starts one interval out.
            ticker.tick().await;
            info!(task = name, interval_secs = interval.as_secs(), "periodic task scheduled");
            loop {
                ticker.tick().await;
                debug!(task = name, "periodic task tick");
                if let Err(e) = task().await {
                    error!(task = name, error = %e, "periodic task failed — will retry next tick");
                }
            }
        });
        self.handles.lock().push((name, handle));
    }

    /// Spawn a task that runs once a day at `time` (`HH:MM`, exchange local
    /// time).
    pub fn spawn_daily_at<F, Fut>(&self, name: &'static str, time: &str, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let target = match NaiveTime::parse_from_str(time, "%H:%M") {
            Ok(target) => target,
            Err(e) => {
                warn!(task = name, time, error = %e, "invalid daily time — task not scheduled");
                return;
            }
        };

        let handle = tokio::spawn(async move {
            info!(task = name, at = %target, "daily task scheduled");
            loop {
                let wait = duration_until_next(target);
                tokio::time::sleep(wait).await;
                info!(task = name, "daily task firing");
                if let Err(e) = task().await {
                    error!(task = name, error = %e, "daily task failed — will retry tomorrow");
                }
                // Guard against immediate refire on fast clocks.
                tokio::time::sleep(Duration::from_secs(61)).await;
            }
        });
        self.handles.lock().push((name, handle));
    }

    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Abort every scheduled task (shutdown path).
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock();
        for (name, handle) in handles.drain(..) {
            debug!(task = name, "aborting scheduled task");
            handle.abort();
        }
        info!("scheduler shut down");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// Time until the next occurrence of `target` in the exchange timezone.
fn duration_until_next(target: NaiveTime) -> Duration {
    let tz = exchange_offset();
    let now = Utc::now().with_timezone(&tz);
    let today_target = now.date_naive().and_time(target);
    let next = if now.naive_local() < today_target {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    let delta = next - now.naive_local();
    delta.to_std().unwrap_or(Duration::from_secs(60))
}
