// Runs one reservation attempt for a RUNNING task and folds the result back
// into the task: one audit log entry plus one status transition.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::models::{
    Account, LogLevel, Reservation, Task, TaskId, TaskStatus, TrainCandidate, TrainSelection,
};
use crate::notifier::{notify_detached, Notification, Notifier};
use crate::provider::{ProviderError, SearchQuery};
use crate::session::{Session, SessionCache};
use crate::store::TaskStore;

const MISSING_SELECTION_DETAIL: &str = "No specific train to reserve.";

const WRITE_BACK_ATTEMPTS: u32 = 3;
// A booked task is never handed back to the queue, so its record tries longer.
const BOOKED_WRITE_ATTEMPTS: u32 = 10;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Booked { detail: String },
    Retry { reason: String },
    Failed { reason: String },
    // The store could not be read or written; the task may still be RUNNING.
    Abandoned { reason: String },
    // Task gone, or not RUNNING (already finished, cancelled, never claimed)
    Skipped,
}

pub struct Executor {
    store: Arc<dyn TaskStore>,
    sessions: Arc<SessionCache>,
    notifier: Arc<dyn Notifier>,
    notifications: TaskTracker,
}

impl Executor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        sessions: Arc<SessionCache>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            notifications: TaskTracker::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn execute(&self, task_id: TaskId) -> AttemptOutcome {
        let loaded = with_store_retry("load task", WRITE_BACK_ATTEMPTS, || {
            self.store.get_task_with_account(task_id)
        })
        .await;
        let (task, account) = match loaded {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                debug!("Task no longer exists, nothing to do");
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                error!(error = %e, "Failed to load task, abandoning this cycle");
                return AttemptOutcome::Abandoned {
                    reason: format!("Failed to load task: {e}"),
                };
            }
        };

        if task.status != TaskStatus::Running {
            debug!(status = %task.status, "Task is not running, skipping attempt");
            return AttemptOutcome::Skipped;
        }

        let Some(selection) = task.selection.clone().filter(TrainSelection::is_complete) else {
            let reason = "No specific train selected for reservation in task. Marking as failed.";
            return self
                .fail(&task, &account, reason.to_string(), MISSING_SELECTION_DETAIL.to_string())
                .await;
        };

        info!(
            provider = %account.kind,
            train_type = %selection.train_type,
            train_no = %selection.train_no,
            dep_time = %selection.dep_time,
            "Attempting to reserve selected train"
        );

        let attempt = AssertUnwindSafe(self.attempt(&task, &account, &selection))
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok((train, reservation))) => {
                self.succeed(&task, &account, &train, &reservation).await
            }
            Ok(Err(e)) if !e.is_terminal() => self.retry(&task, &selection, &e).await,
            Ok(Err(Error::Authentication(msg))) => {
                let reason = format!("Login failed for task {}: {}", task.id, msg);
                self.fail(&task, &account, reason, format!("Error: {msg}")).await
            }
            Ok(Err(e)) => {
                let reason =
                    format!("An unexpected error occurred during reservation attempt: {e}");
                self.fail(&task, &account, reason, format!("Error: {e}")).await
            }
            Err(panic) => {
                let msg = panic_message(&*panic);
                let reason =
                    format!("An unexpected error occurred during reservation attempt: {msg}");
                self.fail(&task, &account, reason, format!("Error: {msg}")).await
            }
        }
    }

    /// Waits for push notifications already handed off by finished attempts.
    pub async fn flush_notifications(&self) {
        self.notifications.close();
        self.notifications.wait().await;
        self.notifications.reopen();
    }

    async fn attempt(
        &self,
        task: &Task,
        account: &Account,
        selection: &TrainSelection,
    ) -> Result<(TrainCandidate, Reservation)> {
        let session = self.sessions.acquire(account).await?;

        let query = SearchQuery::from(&task.route);
        let trains = match session.search(&query).await {
            Ok(trains) => trains,
            Err(e) => return Err(self.provider_failure(&session, "search", e).await),
        };
        debug!(candidates = trains.len(), "Search returned");

        let train = trains
            .into_iter()
            .find(|t| selection.matches(t))
            .ok_or_else(|| Error::NoMatch {
                train_no: selection.train_no.clone(),
            })?;

        if !train.has_seat() {
            return Err(Error::SeatUnavailable {
                train_no: selection.train_no.clone(),
            });
        }

        match session.reserve(&train).await {
            Ok(reservation) => Ok((train, reservation)),
            Err(e) => Err(self.provider_failure(&session, "reservation", e).await),
        }
    }

    async fn provider_failure(&self, session: &Arc<Session>, stage: &str, err: ProviderError) -> Error {
        match err {
            // Logged out under us; the next attempt logs in again
            ProviderError::Authentication(msg) => {
                self.sessions.invalidate(session).await;
                Error::ProviderUnavailable(format!("{stage} failed, session expired: {msg}"))
            }
            ProviderError::Unavailable(msg) | ProviderError::Rejected(msg) => {
                Error::ProviderUnavailable(format!("{stage} failed: {msg}"))
            }
            ProviderError::Protocol(msg) => Error::Unexpected(format!("{stage}: {msg}")),
        }
    }

    async fn succeed(
        &self,
        task: &Task,
        account: &Account,
        train: &TrainCandidate,
        reservation: &Reservation,
    ) -> AttemptOutcome {
        let detail = reservation.to_string();

        let recorded = with_store_retry("record reservation", BOOKED_WRITE_ATTEMPTS, || {
            self.store
                .transition(task.id, TaskStatus::Success, Some(detail.clone()))
        })
        .await;

        match recorded {
            Ok(_) => {
                self.log(
                    task.id,
                    LogLevel::Success,
                    &format!(
                        "Reserved {} {} from {} at {}: {}",
                        train.train_type, train.train_no, task.route.dep_station, train.dep_time, detail
                    ),
                )
                .await;
                self.notify(Notification::new(
                    format!("[{}] 예약 성공!", account.kind),
                    format!("{}->{} {}", task.route.dep_station, task.route.arr_station, train.dep_time),
                ));
            }
            Err(Error::InvalidTransition { from, .. }) => {
                // Cancelled while the reservation was in flight; the booking is
                // real, so keep it in the audit trail.
                warn!(status = %from, "Reservation completed after the task left RUNNING");
                self.log(
                    task.id,
                    LogLevel::Success,
                    &format!("Reservation completed after the task was {from}: {detail}"),
                )
                .await;
            }
            Err(e) => {
                // Left RUNNING: never re-dispatched, so the booking is not repeated.
                error!(error = %e, detail = %detail, "Reservation confirmed but could not be recorded");
                self.log(
                    task.id,
                    LogLevel::Success,
                    &format!("Reservation confirmed but its status could not be saved: {detail}"),
                )
                .await;
            }
        }

        AttemptOutcome::Booked { detail }
    }

    async fn retry(&self, task: &Task, selection: &TrainSelection, err: &Error) -> AttemptOutcome {
        let reason = match err {
            Error::NoMatch { train_no } => {
                format!("Selected train {train_no} not found in search results. Will retry search.")
            }
            Error::SeatUnavailable { train_no } => {
                format!("No seats available on selected train {train_no}. Will retry search.")
            }
            other => format!(
                "Attempt for train {} failed: {}. Will retry.",
                selection.train_no, other
            ),
        };

        self.log(task.id, LogLevel::Info, &reason).await;
        let requeued = with_store_retry("re-queue task", WRITE_BACK_ATTEMPTS, || {
            self.store.transition(task.id, TaskStatus::Pending, None)
        })
        .await;

        match requeued {
            Ok(_) => debug!("Task re-queued for the next cycle"),
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(status = %from, "Task left RUNNING during the attempt, not re-queued")
            }
            Err(e) => {
                error!(error = %e, "Failed to re-queue task");
                return AttemptOutcome::Abandoned {
                    reason: format!("{reason} Re-queue failed: {e}"),
                };
            }
        }

        AttemptOutcome::Retry { reason }
    }

    async fn fail(&self, task: &Task, account: &Account, reason: String, detail: String) -> AttemptOutcome {
        self.log(task.id, LogLevel::Error, &reason).await;

        let marked = with_store_retry("mark task failed", WRITE_BACK_ATTEMPTS, || {
            self.store
                .transition(task.id, TaskStatus::Failed, Some(detail.clone()))
        })
        .await;

        match marked {
            Ok(_) => self.notify(Notification::new(
                format!("[{}] 예약 실패", account.kind),
                format!("{}->{}: {}", task.route.dep_station, task.route.arr_station, reason),
            )),
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(status = %from, "Task left RUNNING during the attempt, not marked failed")
            }
            Err(e) => {
                error!(error = %e, "Failed to mark task as failed");
                return AttemptOutcome::Abandoned {
                    reason: format!("{reason} Marking failed did not persist: {e}"),
                };
            }
        }

        AttemptOutcome::Failed { reason }
    }

    fn notify(&self, notification: Notification) {
        notify_detached(&self.notifier, &self.notifications, notification);
    }

    // Audit log append, mirrored to the process log. Store failures are
    // retried, then logged and otherwise ignored.
    async fn log(&self, task_id: TaskId, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => warn!(task_id, "{message}"),
            _ => info!(task_id, "{message}"),
        }
        let attempts = match level {
            LogLevel::Success => BOOKED_WRITE_ATTEMPTS,
            _ => WRITE_BACK_ATTEMPTS,
        };
        if let Err(e) = with_store_retry("append task log", attempts, || {
            self.store.append_log(task_id, level, message)
        })
        .await
        {
            error!(task_id, error = %e, "Failed to append task log");
        }
    }
}

// Retries store calls that failed for reasons other than the task's state.
async fn with_store_retry<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tried = 1;
    loop {
        match op().await {
            Err(e) if tried < attempts && is_transient(&e) => {
                warn!(error = %e, attempt = tried, "Failed to {what}, retrying");
                tokio::time::sleep(STORE_RETRY_DELAY * tried).await;
                tried += 1;
            }
            result => return result,
        }
    }
}

fn is_transient(err: &Error) -> bool {
    !matches!(
        err,
        Error::InvalidTransition { .. } | Error::NotFound { .. } | Error::Validation(_)
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with unknown payload".to_string()
    }
}
