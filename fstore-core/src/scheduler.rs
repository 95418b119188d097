//! Background scheduled-refresh loop.
//!
//! One thread per scheduler instance wakes on a small tick, refreshes every
//! scheduled table whose next refresh time has arrived, and advances the
//! table's refresh timestamps. The lifecycle is an explicit object with
//! `start`/`stop`; tests shrink the tick and watch the one-shot
//! `has_refreshed_table` flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::manager::ForeignStorageMgr;

pub const DEFAULT_WAIT_DURATION: Duration = Duration::from_secs(1);

pub struct ForeignTableRefreshScheduler {
    running: Arc<AtomicBool>,
    has_refreshed_table: Arc<AtomicBool>,
    wait_duration_ms: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ForeignTableRefreshScheduler {
    /// Spawn the scheduler thread.
    pub fn start(manager: Arc<ForeignStorageMgr>, wait_duration: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let has_refreshed_table = Arc::new(AtomicBool::new(false));
        let wait_duration_ms = Arc::new(AtomicU64::new(wait_duration.as_millis() as u64));

        let thread_running = Arc::clone(&running);
        let thread_refreshed = Arc::clone(&has_refreshed_table);
        let thread_wait = Arc::clone(&wait_duration_ms);
        let handle = std::thread::spawn(move || {
            let catalog = manager.catalog();
            while thread_running.load(Ordering::Acquire) {
                let now = epoch_now();
                for table in catalog.scheduled_tables_due(now) {
                    let prefix = table.table_prefix();
                    let result = manager.refresh_table(prefix, false);
                    // Times advance even on failure so a broken source is
                    // retried on its interval, not on every tick.
                    if let Err(err) = manager.stamp_refresh_times(prefix, now) {
                        tracing::error!(table = %table.name, %err, "failed to update refresh times");
                    }
                    match result {
                        Ok(()) => tracing::debug!(table = %table.name, "scheduled refresh complete"),
                        Err(err) => {
                            tracing::error!(table = %table.name, %err, "scheduled refresh failed")
                        }
                    }
                    thread_refreshed.store(true, Ordering::Release);
                }

                // Sleep in small steps so stop() joins promptly.
                let tick = Duration::from_millis(thread_wait.load(Ordering::Acquire));
                let deadline = Instant::now() + tick;
                while thread_running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
                }
            }
        });

        Self {
            running,
            has_refreshed_table,
            wait_duration_ms,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip the running flag and join the loop.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// One-shot flag set after every refresh attempt; reset it before
    /// waiting on the next cycle.
    pub fn has_refreshed_table(&self) -> bool {
        self.has_refreshed_table.load(Ordering::Acquire)
    }

    pub fn reset_has_refreshed_table(&self) {
        self.has_refreshed_table.store(false, Ordering::Release);
    }

    pub fn set_wait_duration(&self, wait_duration: Duration) {
        self.wait_duration_ms
            .store(wait_duration.as_millis() as u64, Ordering::Release);
    }
}

impl Drop for ForeignTableRefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
