//! Campaign promotion scheduler.
//!
//! One timed loop looks for due draft campaigns and claims each with a
//! conditional update. Only the caller that wins the claim dispatches, so two
//! schedulers (or two overlapping ticks) never send the same campaign twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::store::Store;

pub struct Scheduler {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

/// Running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Vec<DispatchHandle>>,
}

impl SchedulerHandle {
    /// Stop future ticks and return dispatches that are still sending.
    ///
    /// In-flight sends are not cancelled; join the returned handles to wait
    /// for them.
    pub async fn stop(self) -> Vec<DispatchHandle> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(outstanding) => outstanding,
            Err(e) => {
                error!(error = %e, "scheduler_task_failed");
                Vec::new()
            }
        }
    }
}

impl Scheduler {
    pub fn new(store: Store, dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            store,
            dispatcher,
            interval,
        }
    }

    /// Spawn the tick loop. The first tick runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut outstanding: Vec<DispatchHandle> = Vec::new();

            info!(interval_secs = self.interval.as_secs(), "scheduler_started");

            loop {
                tokio::select! {
                    _ = stopped.changed() => {
                        info!(outstanding = outstanding.len(), "scheduler_stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        outstanding.extend(self.tick(Utc::now()).await);
                        reap_finished(&mut outstanding).await;
                    }
                }
            }

            outstanding
        });

        SchedulerHandle { shutdown, task }
    }

    /// Run one promotion pass as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<DispatchHandle> {
        if let Err(e) = self.store.settle_dispatched_campaigns().await {
            error!(error = %e, "scheduler_settle_failed");
        }

        let due = match self.store.due_campaigns(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "scheduler_query_failed");
                return Vec::new();
            }
        };

        if due.is_empty() {
            debug!("scheduler_nothing_due");
            return Vec::new();
        }

        let mut handles = Vec::new();
        for loaded in due {
            let campaign_id = loaded.campaign.id;

            match self.store.claim_campaign(campaign_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(campaign_id = campaign_id, "campaign_claim_lost");
                    continue;
                }
                Err(e) => {
                    error!(campaign_id = campaign_id, error = %e, "campaign_claim_failed");
                    continue;
                }
            }

            info!(
                campaign_id = campaign_id,
                name = %loaded.campaign.name,
                launch_date = %loaded.campaign.launch_date,
                "campaign_claimed"
            );

            match self.dispatcher.dispatch(loaded).await {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(campaign_id = campaign_id, error = %e, "campaign_dispatch_failed"),
            }
        }

        handles
    }
}

/// Log and drop dispatches whose sends have all completed.
async fn reap_finished(outstanding: &mut Vec<DispatchHandle>) {
    let mut idx = 0;
    while idx < outstanding.len() {
        if outstanding[idx].is_finished() {
            let summary = outstanding.swap_remove(idx).join().await;
            info!(
                campaign_id = summary.campaign_id,
                sent = summary.sent,
                failed = summary.failed,
                aborted = summary.aborted,
                "campaign_dispatch_finished"
            );
        } else {
            idx += 1;
        }
    }
}
