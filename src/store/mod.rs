// Durable task state: accounts, reservation tasks and their audit logs.
// Every status write goes through `transition` or the conditional `claim`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{connect_with_retry, SqliteStore};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Account, AccountId, LogLevel, NewAccount, NewTask, Task, TaskId, TaskLog, TaskStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Stopped,
    NotActive,
}

#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn create_account(&self, account: NewAccount) -> Result<Account>;

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    // New tasks start PENDING and active.
    async fn create_task(&self, task: NewTask) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    async fn get_task_with_account(&self, id: TaskId) -> Result<Option<(Task, Account)>>;

    /// Active PENDING tasks in id order.
    async fn list_dispatchable(&self) -> Result<Vec<Task>>;

    /// Atomically moves an active task from PENDING to RUNNING. `false` when
    /// another scheduler got there first or the task stopped being PENDING.
    async fn claim(&self, id: TaskId) -> Result<bool>;

    // Terminal states clear `active`; `booked_detail` is only written when given.
    async fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        booked_detail: Option<String>,
    ) -> Result<Task>;

    // Active tasks become STOPPED, anything else is left untouched.
    async fn cancel(&self, id: TaskId) -> Result<CancelOutcome>;

    async fn append_log(&self, task_id: TaskId, level: LogLevel, message: &str) -> Result<TaskLog>;

    // Oldest first
    async fn logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>>;

    /// Puts RUNNING tasks back to PENDING after an unclean shutdown.
    async fn reset_running(&self) -> Result<u64>;
}
