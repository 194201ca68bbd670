//! Background scheduling for the sync engine
//!
//! Owns three activities: the remote poll loop with adaptive backoff, the
//! debounced upload after local writes, and the daily retention cleanup.
//! One mutex guards the timer handles so a stop racing a start never leaves
//! two live timers for the same activity. The activities themselves run
//! unserialized.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffState, Outcome};
use crate::notify::Entity;
use crate::sync_engine::{SyncCheck, SyncEngine};
use crate::{Error, Result};

#[derive(Default)]
struct Timers {
    poll: Option<JoinHandle<()>>,
    upload: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [self.poll.take(), self.upload.take(), self.cleanup.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Background scheduler bound to one [`SyncEngine`]
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    timers: Mutex<Timers>,
    backoff: Mutex<BackoffState>,
    last_cleanup: Mutex<Option<NaiveDate>>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Arc<Self> {
        let backoff = engine.config().backoff.initial_state();
        Arc::new(Self {
            engine,
            timers: Mutex::new(Timers::default()),
            backoff: Mutex::new(backoff),
            last_cleanup: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn backoff_state(&self) -> BackoffState {
        *self.backoff.lock()
    }

    /// Start the poll and cleanup loops, replacing any running ones.
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock();
        timers.abort_all();
        *self.backoff.lock() = self.engine.config().backoff.initial_state();

        let first_poll = self.engine.config().first_poll_delay;
        let weak = Arc::downgrade(self);
        timers.poll = Some(tokio::spawn(async move {
            tokio::time::sleep(first_poll).await;
            poll_loop(weak).await;
        }));

        let weak = Arc::downgrade(self);
        timers.cleanup = Some(tokio::spawn(cleanup_loop(weak)));

        info!("Auto-sync monitor and daily cleanup started");
    }

    /// Cancel every timer. An in-flight transfer runs to completion.
    pub fn stop(&self) {
        self.timers.lock().abort_all();
        info!("Auto-sync monitor stopped");
    }

    /// Upload after the debounce window, restarting the window if one is
    /// already pending. Does nothing while auto-sync is off.
    pub fn schedule_delayed_upload(self: &Arc<Self>) {
        if !self.engine.auto_sync() {
            debug!("Auto-sync disabled, not scheduling upload");
            return;
        }

        let delay = self.engine.config().upload_delay;
        let weak = Arc::downgrade(self);

        let mut timers = self.timers.lock();
        if let Some(pending) = timers.upload.take() {
            pending.abort();
        }
        timers.upload = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            // Detached so a later reschedule cannot cancel the transfer.
            let engine = this.engine.clone();
            tokio::spawn(async move {
                match engine.upload_database().await {
                    Ok(outcome) => info!("Scheduled upload completed: {:?}", outcome.status),
                    Err(e) => warn!("Scheduled upload failed: {}", e),
                }
            });
        }));
        debug!("Upload scheduled in {:?}", delay);
    }

    /// Hook for the CRUD layer after every insert, update or delete.
    pub fn on_local_mutation(self: &Arc<Self>, entity: Entity) -> Result<()> {
        self.engine.mark_local_change(entity)?;
        self.schedule_delayed_upload();
        Ok(())
    }

    /// Run one poll iteration and return the jittered delay until the next.
    pub async fn poll_once(&self) -> Duration {
        let policy = &self.engine.config().backoff;

        let outcome = match self.engine.poll_remote().await {
            Ok(SyncCheck::Disabled) => {
                debug!("Auto-sync disabled, checking again later");
                None
            }
            Ok(_) => Some(Outcome::Success),
            // Already published to the user; the remote answered normally.
            Err(Error::Conflict) => Some(Outcome::Success),
            Err(e) if e.is_rate_limited() => {
                warn!("Rate limited while checking remote: {}", e);
                Some(Outcome::RateLimited)
            }
            Err(e) if e.is_retryable() => {
                warn!("Error checking remote changes: {}", e);
                Some(Outcome::Failed)
            }
            Err(e) => {
                error!("Remote check failed and needs attention [{}]: {}", e.code(), e);
                Some(Outcome::Failed)
            }
        };

        let interval = match outcome {
            Some(outcome) => {
                let mut state = self.backoff.lock();
                let (next, interval) = policy.next_interval(*state, outcome);
                *state = next;
                interval
            }
            None => policy.regular,
        };

        let jittered = policy.apply_jitter(interval, &mut rand::thread_rng());
        info!("Next remote check in {:?}", jittered);
        jittered
    }

    /// Run the retention cleanup unless it already succeeded `today`.
    /// Syncs first so old rows are deleted from the latest copy.
    pub async fn run_daily_cleanup(self: &Arc<Self>, today: NaiveDate) -> Result<u64> {
        if *self.last_cleanup.lock() == Some(today) {
            debug!("Cleanup already ran on {}", today);
            return Ok(0);
        }

        info!("Running daily cleanup of old consumed food items");
        self.engine.sync_if_due(false).await?;

        let deleted = self.engine.cleanup_consumed(today).await?;
        if deleted > 0 {
            self.schedule_delayed_upload();
        }

        *self.last_cleanup.lock() = Some(today);
        Ok(deleted)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.timers.get_mut().abort_all();
    }
}

async fn poll_loop(weak: Weak<Scheduler>) {
    loop {
        let Some(this) = weak.upgrade() else {
            break;
        };
        let next = this.poll_once().await;
        drop(this);

        tokio::time::sleep(next).await;
    }
}

async fn cleanup_loop(weak: Weak<Scheduler>) {
    loop {
        let Some(this) = weak.upgrade() else {
            break;
        };
        let now = Local::now();
        match this.run_daily_cleanup(now.date_naive()).await {
            Ok(_) => debug!("Daily cleanup completed"),
            Err(e) => warn!("Error during daily cleanup: {}", e),
        }
        drop(this);

        let wait = duration_until_next_cleanup(Local::now());
        info!("Next cleanup in {:?}", wait);
        tokio::time::sleep(wait).await;
    }
}

/// Time from `now` until 00:01 local time on the following day.
pub fn duration_until_next_cleanup<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let fallback = Duration::from_secs(24 * 60 * 60);

    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return fallback;
    };
    let target = tomorrow.and_time(NaiveTime::from_hms_opt(0, 1, 0).unwrap_or(NaiveTime::MIN));

    // A DST gap can make 00:01 not exist; fall back to a day.
    match now.timezone().from_local_datetime(&target).earliest() {
        Some(next) => (next.naive_utc() - now.naive_utc())
            .max(ChronoDuration::zero())
            .to_std()
            .unwrap_or(fallback),
        None => fallback,
    }
}
