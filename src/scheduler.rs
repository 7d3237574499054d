// Periodic dispatcher. Every tick lists the active PENDING tasks, claims each
// one (conditional, so a concurrent scheduler loses cleanly) and runs the
// attempt on its own tokio task. A RUNNING task is not dispatchable again
// until its attempt puts it back to PENDING.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::executor::{AttemptOutcome, Executor};
use crate::models::{TaskId, TaskStatus};
use crate::store::TaskStore;

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    executor: Arc<Executor>,
    tick_every: Duration,
    in_flight: Mutex<Vec<(TaskId, JoinHandle<()>)>>,
    // Abandoned in RUNNING and not yet handed back to the queue
    stranded: Arc<Mutex<BTreeSet<TaskId>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, executor: Arc<Executor>, tick_every: Duration) -> Self {
        Self {
            store,
            executor,
            tick_every,
            in_flight: Mutex::new(Vec::new()),
            stranded: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// One dispatch cycle. Returns how many tasks were claimed and started.
    pub async fn tick(&self) -> usize {
        self.release_stranded().await;

        let ready = match self.store.list_dispatchable().await {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "Failed to scan for pending tasks, skipping this tick");
                return 0;
            }
        };

        let mut started = 0;
        for task in ready {
            match self.store.claim(task.id).await {
                Ok(true) => {
                    let handle = self.spawn_attempt(task.id);
                    self.in_flight.lock().push((task.id, handle));
                    started += 1;
                }
                Ok(false) => debug!(task_id = task.id, "Task claimed elsewhere or cancelled"),
                Err(e) => warn!(task_id = task.id, error = %e, "Failed to claim task"),
            }
        }

        self.in_flight.lock().retain(|(_, h)| !h.is_finished());
        if started > 0 {
            debug!(started, "Dispatched reservation attempts");
        }
        started
    }

    fn spawn_attempt(&self, task_id: TaskId) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        let stranded = Arc::clone(&self.stranded);

        tokio::spawn(async move {
            if let AttemptOutcome::Abandoned { reason } = executor.execute(task_id).await {
                warn!(task_id, reason = %reason, "Attempt abandoned, handing task back to the queue");
                if !release(&*store, task_id).await {
                    stranded.lock().insert(task_id);
                }
            }
        })
    }

    async fn release_stranded(&self) {
        let pending: Vec<TaskId> = self.stranded.lock().iter().copied().collect();
        for task_id in pending {
            if release(&*self.store, task_id).await {
                self.stranded.lock().remove(&task_id);
            }
        }
    }

    /// Ticks until `shutdown` fires, then waits for in-flight attempts.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_ms = self.tick_every.as_millis() as u64, "Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Scheduler stopping, waiting for in-flight attempts");
        self.drain().await;
        self.release_stranded().await;
        self.executor.flush_notifications().await;
        info!("Scheduler stopped");
    }

    /// Puts tasks orphaned in RUNNING by a previous process back in the queue.
    /// Only safe while no other scheduler shares the store.
    pub async fn recover(&self) -> usize {
        match self.store.reset_running().await {
            Ok(0) => 0,
            Ok(n) => {
                warn!(count = n, "Re-queued tasks left RUNNING by a previous run");
                n as usize
            }
            Err(e) => {
                error!(error = %e, "Failed to recover RUNNING tasks");
                0
            }
        }
    }

    /// Waits for every attempt started so far.
    pub async fn drain(&self) {
        let (ids, handles): (Vec<_>, Vec<_>) = std::mem::take(&mut *self.in_flight.lock())
            .into_iter()
            .unzip();
        for (task_id, result) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                error!(task_id, error = %e, "Reservation attempt aborted");
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    pub fn stranded(&self) -> usize {
        self.stranded.lock().len()
    }
}

// RUNNING -> PENDING for a task whose attempt gave up on the store. Returns
// false when the store is still failing.
async fn release(store: &dyn TaskStore, task_id: TaskId) -> bool {
    match store.get_task(task_id).await {
        Ok(Some(task)) if task.status == TaskStatus::Running => {}
        Ok(_) => return true,
        Err(e) => {
            warn!(task_id, error = %e, "Failed to check abandoned task");
            return false;
        }
    }

    match store.transition(task_id, TaskStatus::Pending, None).await {
        Ok(_) => {
            info!(task_id, "Re-queued task left RUNNING by an abandoned attempt");
            true
        }
        Err(Error::InvalidTransition { .. }) => true,
        Err(e) => {
            warn!(task_id, error = %e, "Failed to re-queue abandoned task");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogLevel, ProviderKind, Task};
    use crate::notifier::DisabledNotifier;
    use crate::provider::scripted::{candidate, ScriptedProvider, SearchStep};
    use crate::provider::ProviderRegistry;
    use crate::session::SessionCache;
    use crate::store::testing::{self, FlakyStore};
    use crate::store::{CancelOutcome, MemoryStore};

    fn scheduler(store: Arc<dyn TaskStore>, provider: Arc<ScriptedProvider>) -> Scheduler {
        let sessions = Arc::new(SessionCache::new(
            ProviderRegistry::new().with(ProviderKind::Ktx, provider),
        ));
        let executor = Arc::new(Executor::new(
            store.clone(),
            sessions,
            Arc::new(DisabledNotifier),
        ));
        Scheduler::new(store, executor, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_tick_dispatches_pending_tasks() {
        let store = Arc::new(MemoryStore::new());
        let provider = ScriptedProvider::new();
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        let (_, task) = testing::seed(&*store).await;
        let scheduler = scheduler(store.clone(), provider.clone());

        assert_eq!(scheduler.tick().await, 1);
        // claimed synchronously, so the next tick cannot pick it up again
        assert_eq!(scheduler.tick().await, 0);
        scheduler.drain().await;

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(provider.reserves(), 1);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retried_task_is_picked_up_next_tick() {
        let store = Arc::new(MemoryStore::new());
        let provider = ScriptedProvider::new();
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", false)]));
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        let (_, task) = testing::seed(&*store).await;
        let scheduler = scheduler(store.clone(), provider);

        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Success
        );
    }

    #[tokio::test]
    async fn test_cancelled_task_is_never_attempted() {
        let store = Arc::new(MemoryStore::new());
        let provider = ScriptedProvider::new();
        let (_, task) = testing::seed(&*store).await;
        assert_eq!(store.cancel(task.id).await.unwrap(), CancelOutcome::Stopped);
        let scheduler = scheduler(store.clone(), provider.clone());

        assert_eq!(scheduler.tick().await, 0);
        scheduler.drain().await;
        assert_eq!(provider.connects(), 0);
        assert!(store.logs(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_tick_is_cheap() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(store, ScriptedProvider::new());
        assert_eq!(scheduler.tick().await, 0);
    }

    #[tokio::test]
    async fn test_lost_claim_is_not_dispatched() {
        let store = Arc::new(FlakyStore::new());
        store.lose_claims();
        testing::seed(&*store).await;
        let provider = ScriptedProvider::new();
        let scheduler = scheduler(store, provider.clone());

        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(provider.connects(), 0);
    }

    #[tokio::test]
    async fn test_scan_failure_skips_tick() {
        let store = Arc::new(FlakyStore::new());
        store.fail_scans(1);
        testing::seed(&*store).await;
        let scheduler = scheduler(store, ScriptedProvider::new());

        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;
    }

    // Ticks until the task leaves the queue for good, at most `rounds` times.
    async fn settle(scheduler: &Scheduler, store: &dyn TaskStore, id: TaskId, rounds: usize) -> Task {
        for _ in 0..rounds {
            scheduler.tick().await;
            scheduler.drain().await;
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
        }
        store.get_task(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_task_survives_a_failed_load() {
        let store = Arc::new(FlakyStore::new());
        let provider = ScriptedProvider::new();
        for _ in 0..5 {
            provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        }
        let (_, task) = testing::seed(&*store).await;
        store.fail_loads(1);
        let scheduler = scheduler(store.clone(), provider.clone());

        let task = settle(&scheduler, &*store, task.id, 5).await;
        assert_eq!(task.status, TaskStatus::Success);
        assert!(!task.active);
        assert_eq!(provider.reserves(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_task_is_handed_back_to_the_queue() {
        let store = Arc::new(FlakyStore::new());
        let provider = ScriptedProvider::new();
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        let (_, task) = testing::seed(&*store).await;
        // more failures than one attempt retries
        store.fail_loads(10);
        let scheduler = scheduler(store.clone(), provider.clone());

        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;
        let reloaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert!(reloaded.active);
        assert_eq!(provider.connects(), 0);

        store.fail_loads(0);
        let task = settle(&scheduler, &*store, task.id, 3).await;
        assert_eq!(task.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_failed_requeue_is_released_on_a_later_tick() {
        let store = Arc::new(FlakyStore::new());
        let provider = ScriptedProvider::new();
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", false)]));
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        let (_, task) = testing::seed(&*store).await;
        let scheduler = scheduler(store.clone(), provider.clone());

        // exhausts the attempt's own retries and the immediate release
        store.fail_transitions(4);
        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(scheduler.stranded(), 1);

        // released at the start of the tick, then dispatched again
        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;
        assert_eq!(scheduler.stranded(), 0);
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Success
        );
        assert_eq!(provider.reserves(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_booking_is_not_attempted_again() {
        let store = Arc::new(FlakyStore::new());
        let provider = ScriptedProvider::new();
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        let (_, task) = testing::seed(&*store).await;
        store.fail_transitions(usize::MAX);
        let scheduler = scheduler(store.clone(), provider.clone());

        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;
        assert_eq!(scheduler.tick().await, 0);
        scheduler.drain().await;

        assert_eq!(provider.reserves(), 1);
        assert_eq!(scheduler.stranded(), 0);
        let logs = store.logs(task.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Success);
    }

    #[tokio::test]
    async fn test_recover_requeues_orphans() {
        let store = Arc::new(MemoryStore::new());
        let (_, task) = testing::seed(&*store).await;
        store.claim(task.id).await.unwrap();
        let scheduler = scheduler(store.clone(), ScriptedProvider::new());

        assert_eq!(scheduler.recover().await, 1);
        assert_eq!(scheduler.recover().await, 0);
        assert_eq!(store.list_dispatchable().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_drains() {
        let store = Arc::new(MemoryStore::new());
        let provider = ScriptedProvider::new();
        provider.set_login_delay(Duration::from_millis(50));
        provider.push_search(SearchStep::Trains(vec![candidate("KTX", "0900", true)]));
        let (_, task) = testing::seed(&*store).await;
        let scheduler = Arc::new(scheduler(store.clone(), provider));

        let shutdown = CancellationToken::new();
        let runner = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        runner.await.unwrap();

        // the attempt started before shutdown ran to completion
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
    }
}
