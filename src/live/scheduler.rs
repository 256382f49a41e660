//! Cron-style scheduling of the live jobs in the exchange timezone:
//! 07:00 Asia/Seoul Mon-Fri selection, 09:00 execution, and the optional
//! 03:00 daily cache warming.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Asia::Seoul;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use super::executor::LiveTrader;

const SELECTION_CRON: &str = "0 0 7 * * Mon-Fri";
const EXECUTION_CRON: &str = "0 0 9 * * Mon-Fri";
const WARMING_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Selection,
    Execution,
    Warming,
}

pub struct LiveScheduler {
    trader: Arc<LiveTrader>,
    selection: Schedule,
    execution: Schedule,
    warming: Option<Schedule>,
    warm_fn: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl LiveScheduler {
    pub fn new(trader: Arc<LiveTrader>, enable_cache_warming: bool) -> Self {
        Self {
            trader,
            selection: Schedule::from_str(SELECTION_CRON).expect("valid selection cron"),
            execution: Schedule::from_str(EXECUTION_CRON).expect("valid execution cron"),
            warming: enable_cache_warming
                .then(|| Schedule::from_str(WARMING_CRON).expect("valid warming cron")),
            warm_fn: None,
        }
    }

    /// Hook invoked by the 03:00 warming slot.
    pub fn with_warmer(mut self, warm: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.warm_fn = Some(warm);
        self
    }

    /// The next (job, fire time) after `now`, across all enabled jobs.
    fn next_job(&self, now: DateTime<Utc>) -> Option<(Job, DateTime<Utc>)> {
        let seoul_now = now.with_timezone(&Seoul);
        let mut candidates: Vec<(Job, DateTime<Utc>)> = Vec::new();
        if let Some(at) = self.selection.after(&seoul_now).next() {
            candidates.push((Job::Selection, at.with_timezone(&Utc)));
        }
        if let Some(at) = self.execution.after(&seoul_now).next() {
            candidates.push((Job::Execution, at.with_timezone(&Utc)));
        }
        if let Some(schedule) = &self.warming {
            if let Some(at) = schedule.after(&seoul_now).next() {
                candidates.push((Job::Warming, at.with_timezone(&Utc)));
            }
        }
        candidates.into_iter().min_by_key(|(_, at)| *at)
    }

    /// Run until cancelled, firing each job at its Seoul-time slot.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            "live scheduler started: 07:00 KST selection, 09:00 KST execution{}",
            if self.warming.is_some() { ", 03:00 KST cache warming" } else { "" }
        );
        loop {
            let Some((job, at)) = self.next_job(Utc::now()) else {
                tracing::error!("no upcoming schedule slot; scheduler stopping");
                return;
            };
            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("live scheduler stopped");
                    return;
                }
                () = tokio::time::sleep(wait) => {
                    let today = at.with_timezone(&Seoul).date_naive();
                    match job {
                        Job::Selection => self.trader.selection_job(today).await,
                        Job::Execution => self.trader.execution_job(today).await,
                        Job::Warming => {
                            if let Some(warm) = &self.warm_fn {
                                warm();
                            }
                        }
                    }
                }
            }
        }
    }
}
