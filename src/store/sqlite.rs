// SQLite-backed store (sqlx). Three tables: account, task, task_log.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

use super::{CancelOutcome, TaskStore};
use crate::error::{Error, Result};
use crate::models::{
    Account, AccountId, LogLevel, NewAccount, NewTask, ProviderKind, Route, Task, TaskId,
    TaskLog, TaskStatus, TrainSelection,
};

const DEFAULT_POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
// A concurrent writer can move a task between our read and our write.
const TRANSITION_ATTEMPTS: usize = 3;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS account (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        username TEXT NOT NULL,
        secret TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES account(id) ON DELETE CASCADE,
        dep_station TEXT NOT NULL,
        arr_station TEXT NOT NULL,
        date TEXT NOT NULL,
        time_from TEXT NOT NULL,
        passengers INTEGER NOT NULL DEFAULT 1,
        selected_train_no TEXT,
        selected_train_type TEXT,
        selected_dep_time TEXT,
        selected_arr_time TEXT,
        selected_train_class TEXT,
        selected_train_id TEXT,
        interval_secs INTEGER NOT NULL DEFAULT 1,
        is_active INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'PENDING',
        booked_detail TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_dispatch ON task (is_active, status)",
    r#"
    CREATE TABLE IF NOT EXISTS task_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_log_task ON task_log (task_id, id)",
];

#[derive(FromRow)]
struct AccountRow {
    id: i64,
    kind: String,
    username: String,
    secret: String,
}

impl TryFrom<AccountRow> for Account {
    type Error = Error;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            id: row.id,
            kind: ProviderKind::from_str(&row.kind)?,
            username: row.username,
            secret: row.secret,
        })
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: i64,
    account_id: i64,
    dep_station: String,
    arr_station: String,
    date: String,
    time_from: String,
    passengers: i64,
    selected_train_no: Option<String>,
    selected_train_type: Option<String>,
    selected_dep_time: Option<String>,
    selected_arr_time: Option<String>,
    selected_train_class: Option<String>,
    selected_train_id: Option<String>,
    interval_secs: i64,
    is_active: bool,
    status: String,
    booked_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let has_selection = row.selected_train_no.is_some()
            || row.selected_train_type.is_some()
            || row.selected_dep_time.is_some()
            || row.selected_train_id.is_some();

        let selection = has_selection.then(|| TrainSelection {
            train_no: row.selected_train_no.unwrap_or_default(),
            train_type: row.selected_train_type.unwrap_or_default(),
            dep_time: row.selected_dep_time.unwrap_or_default(),
            arr_time: row.selected_arr_time.unwrap_or_default(),
            train_class: row.selected_train_class,
            train_id: row.selected_train_id.unwrap_or_default(),
        });

        Ok(Task {
            id: row.id,
            account_id: row.account_id,
            route: Route {
                dep_station: row.dep_station,
                arr_station: row.arr_station,
                date: row.date,
                time_from: row.time_from,
            },
            selection,
            passengers: u32::try_from(row.passengers).unwrap_or(1),
            interval_secs: u32::try_from(row.interval_secs).unwrap_or(1),
            active: row.is_active,
            status: TaskStatus::from_str(&row.status)?,
            booked_detail: row.booked_detail,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct LogRow {
    id: i64,
    task_id: i64,
    level: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for TaskLog {
    type Error = Error;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(TaskLog {
            id: row.id,
            task_id: row.task_id,
            level: LogLevel::from_str(&row.level)?,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database and applies the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true)
            .create_if_missing(true);

        // every connection to an in-memory database is its own database
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { DEFAULT_POOL_SIZE })
            .acquire_timeout(Duration::from_secs(30));
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn apply_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Connects to the database, retrying while it is not reachable yet.
pub async fn connect_with_retry(
    database_url: &str,
    max_tries: u32,
    delay: Duration,
) -> Result<SqliteStore> {
    let max_tries = max_tries.max(1);
    let mut attempt = 1;
    loop {
        match SqliteStore::connect(database_url).await {
            Ok(store) => {
                info!("Database connection established");
                return Ok(store);
            }
            Err(e) if attempt < max_tries => {
                warn!(
                    error = %e,
                    "Database connection failed (attempt {}/{}), retrying in {:?}",
                    attempt,
                    max_tries,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "Max database connection retries reached");
                return Err(e);
            }
        }
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let id = sqlx::query("INSERT INTO account (kind, username, secret) VALUES (?, ?, ?)")
            .bind(account.kind.as_str())
            .bind(&account.username)
            .bind(&account.secret)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        Ok(Account {
            id,
            kind: account.kind,
            username: account.username,
            secret: account.secret,
        })
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM account WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Account::try_from)
            .transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM account ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Account::try_from)
            .collect()
    }

    async fn create_task(&self, task: NewTask) -> Result<Task> {
        let now = Utc::now();
        let selection = task.selection.as_ref();

        let id = sqlx::query(
            r#"
            INSERT INTO task (
                account_id, dep_station, arr_station, date, time_from, passengers,
                selected_train_no, selected_train_type, selected_dep_time,
                selected_arr_time, selected_train_class, selected_train_id,
                interval_secs, is_active, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            "#,
        )
        .bind(task.account_id)
        .bind(&task.route.dep_station)
        .bind(&task.route.arr_station)
        .bind(&task.route.date)
        .bind(&task.route.time_from)
        .bind(i64::from(task.passengers))
        .bind(selection.map(|s| s.train_no.as_str()))
        .bind(selection.map(|s| s.train_type.as_str()))
        .bind(selection.map(|s| s.dep_time.as_str()))
        .bind(selection.map(|s| s.arr_time.as_str()))
        .bind(selection.and_then(|s| s.train_class.as_deref()))
        .bind(selection.map(|s| s.train_id.as_str()))
        .bind(i64::from(task.interval_secs))
        .bind(TaskStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_task(id)
            .await?
            .ok_or_else(|| Error::Store(format!("task {id} vanished after insert")))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM task WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Task::try_from)
            .transpose()
    }

    async fn get_task_with_account(&self, id: TaskId) -> Result<Option<(Task, Account)>> {
        let Some(task) = self.get_task(id).await? else {
            return Ok(None);
        };
        let account = self
            .get_account(task.account_id)
            .await?
            .ok_or_else(|| Error::not_found("Account", task.account_id))?;
        Ok(Some((task, account)))
    }

    async fn list_dispatchable(&self) -> Result<Vec<Task>> {
        sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM task WHERE is_active = 1 AND status = 'PENDING' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Task::try_from)
        .collect()
    }

    async fn claim(&self, id: TaskId) -> Result<bool> {
        let claimed = sqlx::query(
            "UPDATE task SET status = 'RUNNING', updated_at = ? \
             WHERE id = ? AND status = 'PENDING' AND is_active = 1",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }

    async fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        booked_detail: Option<String>,
    ) -> Result<Task> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let current = self
                .get_task(id)
                .await?
                .ok_or_else(|| Error::not_found("Task", id))?;
            if !current.status.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    from: current.status,
                    to,
                });
            }

            let active = current.active && !to.is_terminal();
            let updated = sqlx::query(
                "UPDATE task SET status = ?, is_active = ?, \
                 booked_detail = COALESCE(?, booked_detail), updated_at = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(to.as_str())
            .bind(active)
            .bind(booked_detail.as_deref())
            .bind(Utc::now())
            .bind(id)
            .bind(current.status.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 1 {
                return self
                    .get_task(id)
                    .await?
                    .ok_or_else(|| Error::not_found("Task", id));
            }
        }

        Err(Error::Store(format!(
            "task {id} kept changing while transitioning to {to}"
        )))
    }

    async fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        let stopped = sqlx::query(
            "UPDATE task SET status = 'STOPPED', is_active = 0, updated_at = ? \
             WHERE id = ? AND is_active = 1 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if stopped == 1 {
            return Ok(CancelOutcome::Stopped);
        }
        match self.get_task(id).await? {
            Some(_) => Ok(CancelOutcome::NotActive),
            None => Err(Error::not_found("Task", id)),
        }
    }

    async fn append_log(&self, task_id: TaskId, level: LogLevel, message: &str) -> Result<TaskLog> {
        let created_at = Utc::now();
        let id = sqlx::query(
            "INSERT INTO task_log (task_id, level, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(level.as_str())
        .bind(message)
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(TaskLog {
            id,
            task_id,
            level,
            message: message.to_string(),
            created_at,
        })
    }

    async fn logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>> {
        sqlx::query_as::<_, LogRow>("SELECT * FROM task_log WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TaskLog::try_from)
            .collect()
    }

    async fn reset_running(&self) -> Result<u64> {
        let reset = sqlx::query(
            "UPDATE task SET status = 'PENDING', updated_at = ? WHERE status = 'RUNNING'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        testing::task_lifecycle(&store().await).await;
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        testing::claim_is_exclusive(&store().await).await;
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        testing::terminal_states_are_final(&store().await).await;
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        testing::cancel_semantics(&store().await).await;
    }

    #[tokio::test]
    async fn test_logs_are_ordered() {
        testing::logs_are_ordered(&store().await).await;
    }

    #[tokio::test]
    async fn test_unknown_rows() {
        testing::unknown_rows(&store().await).await;
    }

    #[tokio::test]
    async fn test_reset_running_recovers() {
        testing::reset_running_recovers(&store().await).await;
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let store = store().await;
        store.apply_schema().await.unwrap();

        let (_, task) = testing::seed(&store).await;
        assert!(store.get_task(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_task_without_selection_round_trips_as_none() {
        let store = store().await;
        let (account, _) = testing::seed(&store).await;

        let task = store
            .create_task(NewTask::new(account.id, testing::route(), None))
            .await
            .unwrap();
        assert_eq!(task.selection, None);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        // a directory that cannot exist makes every attempt fail
        let err = connect_with_retry(
            "sqlite:/nonexistent-dir/for/sure/tasks.db",
            2,
            Duration::from_millis(10),
        )
        .await;
        assert!(err.is_err());
    }
}
