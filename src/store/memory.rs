// In-process store. Used by tests and `DATABASE_URL=memory`; everything is
// lost on restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{CancelOutcome, TaskStore};
use crate::error::{Error, Result};
use crate::models::{
    Account, AccountId, LogLevel, NewAccount, NewTask, Task, TaskId, TaskLog, TaskStatus,
};

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    tasks: BTreeMap<TaskId, Task>,
    logs: BTreeMap<TaskId, Vec<TaskLog>>,
    next_account_id: AccountId,
    next_task_id: TaskId,
    next_log_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_transition(task: &mut Task, to: TaskStatus, booked_detail: Option<String>) -> Result<()> {
    if !task.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: task.status,
            to,
        });
    }

    task.status = to;
    if to.is_terminal() {
        task.active = false;
    }
    if booked_detail.is_some() {
        task.booked_detail = booked_detail;
    }
    task.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let mut tables = self.tables.write();
        tables.next_account_id += 1;

        let account = Account {
            id: tables.next_account_id,
            kind: account.kind,
            username: account.username,
            secret: account.secret,
        };
        tables.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.tables.read().accounts.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.tables.read().accounts.values().cloned().collect())
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        let mut tables = self.tables.write();
        if !tables.accounts.contains_key(&task.account_id) {
            return Err(Error::not_found("Account", task.account_id));
        }

        tables.next_task_id += 1;
        let now = Utc::now();
        let task = Task {
            id: tables.next_task_id,
            account_id: task.account_id,
            route: task.route,
            selection: task.selection,
            passengers: task.passengers,
            interval_secs: task.interval_secs,
            active: true,
            status: TaskStatus::Pending,
            booked_detail: None,
            created_at: now,
            updated_at: now,
        };
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables.read().tasks.get(&id).cloned())
    }

    async fn get_task_with_account(&self, id: TaskId) -> Result<Option<(Task, Account)>> {
        let tables = self.tables.read();
        let Some(task) = tables.tasks.get(&id) else {
            return Ok(None);
        };
        let account = tables
            .accounts
            .get(&task.account_id)
            .ok_or_else(|| Error::not_found("Account", task.account_id))?;
        Ok(Some((task.clone(), account.clone())))
    }

    async fn list_dispatchable(&self) -> Result<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.active && t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn claim(&self, id: TaskId) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.tasks.get_mut(&id) {
            Some(task) if task.active && task.status == TaskStatus::Pending => {
                apply_transition(task, TaskStatus::Running, None)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        booked_detail: Option<String>,
    ) -> Result<Task> {
        let mut tables = self.tables.write();
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Task", id))?;
        apply_transition(task, to, booked_detail)?;
        Ok(task.clone())
    }

    async fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        let mut tables = self.tables.write();
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Task", id))?;

        if !task.active {
            return Ok(CancelOutcome::NotActive);
        }
        apply_transition(task, TaskStatus::Stopped, None)?;
        Ok(CancelOutcome::Stopped)
    }

    async fn append_log(&self, task_id: TaskId, level: LogLevel, message: &str) -> Result<TaskLog> {
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&task_id) {
            return Err(Error::not_found("Task", task_id));
        }

        tables.next_log_id += 1;
        let log = TaskLog {
            id: tables.next_log_id,
            task_id,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        tables.logs.entry(task_id).or_default().push(log.clone());
        Ok(log)
    }

    async fn logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>> {
        Ok(self
            .tables
            .read()
            .logs
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn reset_running(&self) -> Result<u64> {
        let mut tables = self.tables.write();
        let mut reset = 0;
        for task in tables
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Running)
        {
            apply_transition(task, TaskStatus::Pending, None)?;
            reset += 1;
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing;

    #[tokio::test]
    async fn test_task_lifecycle() {
        testing::task_lifecycle(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        testing::claim_is_exclusive(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        testing::terminal_states_are_final(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        testing::cancel_semantics(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_logs_are_ordered() {
        testing::logs_are_ordered(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_unknown_rows() {
        testing::unknown_rows(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_reset_running_recovers() {
        testing::reset_running_recovers(&MemoryStore::new()).await;
    }
}
