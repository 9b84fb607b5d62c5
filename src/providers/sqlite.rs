use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::debug;

use super::{HistoryDelta, OrchestrationItem, Provider, ProviderError, WorkItem, validate_append};
use crate::{Event, EventKind, now_ms};

/// SQLite-backed provider with transactional acks.
///
/// The pool holds a single connection: writes to one database file are
/// serialized anyway, and a single long-lived connection keeps a
/// `sqlite::memory:` database alive for the lifetime of the provider.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ProviderError::retryable(operation, format!("Connection error: {error_msg}"))
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::RowNotFound => {
                ProviderError::permanent(operation, error_msg)
            }
            _ => ProviderError::retryable(operation, error_msg),
        }
    }

    /// Open (creating if needed) a database, e.g. `sqlite:amplifier.db` or
    /// `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(30))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "content_amplifier::providers::sqlite", url = %database_url, "sqlite provider ready");
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    /// Close the pool; pending transactions finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                current_execution_id INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, execution_id, event_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT
            )
            "#,
            r#"CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, instance_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_orch_lock ON orchestrator_queue(lock_token)"#,
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER
            )
            "#,
            r#"CREATE INDEX IF NOT EXISTS idx_worker_lock ON worker_queue(lock_token)"#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(pool).await?;
        }
        Ok(())
    }

    fn generate_lock_token() -> String {
        format!("lock_{}", uuid::Uuid::new_v4())
    }

    fn now_millis() -> i64 {
        now_ms() as i64
    }

    fn timestamp_after(duration: Duration) -> i64 {
        Self::now_millis().saturating_add(duration.as_millis().min(i64::MAX as u128) as i64)
    }

    async fn read_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ? AND execution_id = ?
            ORDER BY event_id
            "#,
        )
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read_history", e))?;

        rows.into_iter()
            .enumerate()
            .map(|(idx, (data,))| {
                serde_json::from_str::<Event>(&data).map_err(|e| {
                    ProviderError::permanent(
                        "read_history",
                        format!("corrupt event at position {idx} for {instance}#{execution_id}: {e}"),
                    )
                })
            })
            .collect()
    }

    async fn current_execution_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
    ) -> Result<Option<(String, u64)>, ProviderError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT workflow_name, current_execution_id FROM instances WHERE instance_id = ?")
                .bind(instance)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("read_instance", e))?;
        Ok(row.map(|(name, exec)| (name, exec as u64)))
    }

    async fn append_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
        execution_id: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let known = Self::current_execution_in_tx(tx, instance)
            .await?
            .map(|(_, exec)| exec)
            .unwrap_or(0);
        if execution_id == 0 || execution_id > known + 1 {
            return Err(ProviderError::permanent(
                operation,
                format!("execution {instance}#{execution_id} does not follow execution {known}"),
            ));
        }
        let last = if execution_id <= known {
            let max: Option<i64> =
                sqlx::query_scalar("SELECT MAX(event_id) FROM history WHERE instance_id = ? AND execution_id = ?")
                    .bind(instance)
                    .bind(execution_id as i64)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
            Some(max.unwrap_or(0) as u64)
        } else {
            None
        };
        validate_append(operation, instance, execution_id, last, &events)?;

        if let Some(Event {
            kind: EventKind::WorkflowStarted { name, .. },
            ..
        }) = events.first()
        {
            sqlx::query(
                r#"
                INSERT INTO instances (instance_id, workflow_name, current_execution_id, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(instance_id) DO UPDATE
                SET workflow_name = ?2, current_execution_id = ?3, updated_at = ?4
                "#,
            )
            .bind(instance)
            .bind(name.as_str())
            .bind(execution_id as i64)
            .bind(Self::now_millis())
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        }

        let mut last_id = last.unwrap_or(0);
        for event in &events {
            let event_data = serde_json::to_string(event)?;
            sqlx::query(
                r#"
                INSERT INTO history (instance_id, execution_id, event_id, event_type, event_data)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance)
            .bind(execution_id as i64)
            .bind(event.event_id as i64)
            .bind(event.kind.name())
            .bind(event_data)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
            last_id = event.event_id;
        }
        Ok(last_id)
    }

    async fn enqueue_orchestrator_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        item: &WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        if item.is_worker_item() {
            return Err(ProviderError::permanent(
                operation,
                "activity attempts belong on the worker queue",
            ));
        }
        let visible_at = match (item.visible_at_ms(), delay) {
            (Some(at), _) => at as i64,
            (None, Some(d)) => Self::timestamp_after(d),
            (None, None) => Self::now_millis(),
        };
        let work_item = serde_json::to_string(item)?;
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
            .bind(item.instance())
            .bind(work_item)
            .bind(visible_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Sqlite>, ProviderError> {
        self.pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    async fn commit(tx: Transaction<'_, Sqlite>, operation: &str) -> Result<(), ProviderError> {
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut tx = self.begin("append").await?;
        let last = Self::append_in_tx(&mut tx, "append", instance, execution_id, events).await?;
        Self::commit(tx, "append").await?;
        Ok(last)
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let mut tx = self.begin("read_all").await?;
        let history = match Self::current_execution_in_tx(&mut tx, instance).await? {
            Some((_, exec)) => Self::read_history_in_tx(&mut tx, instance, exec).await?,
            None => Vec::new(),
        };
        Self::commit(tx, "read_all").await?;
        Ok(history)
    }

    async fn read_history_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let mut tx = self.begin("read_history_with_execution").await?;
        let history = Self::read_history_in_tx(&mut tx, instance, execution_id).await?;
        Self::commit(tx, "read_history_with_execution").await?;
        Ok(history)
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT current_execution_id FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("latest_execution_id", e))?;
        Ok(row.map(|(e,)| e as u64))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT DISTINCT execution_id FROM history WHERE instance_id = ? ORDER BY execution_id")
                .bind(instance)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("list_executions", e))?;
        Ok(rows.into_iter().map(|(e,)| e as u64).collect())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;
        Ok(rows.into_iter().map(|(i,)| i).collect())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut tx = self.begin("enqueue_orchestrator_work").await?;
        Self::enqueue_orchestrator_in_tx(&mut tx, "enqueue_orchestrator_work", &item, None).await?;
        Self::commit(tx, "enqueue_orchestrator_work").await
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        const OP: &str = "fetch_orchestration_item";
        let mut tx = self.begin(OP).await?;
        let now_ms = Self::now_millis();

        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT q.instance_id
            FROM orchestrator_queue q
            LEFT JOIN instance_locks il ON q.instance_id = il.instance_id
            WHERE q.visible_at <= ?1
              AND (il.instance_id IS NULL OR il.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let Some((instance,)) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let lock_token = Self::generate_lock_token();
        let locked_until = Self::timestamp_after(lock_timeout);
        let acquired = sqlx::query(
            r#"
            INSERT INTO instance_locks (instance_id, lock_token, locked_until)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(instance_id) DO UPDATE
            SET lock_token = ?2, locked_until = ?3
            WHERE locked_until <= ?4
            "#,
        )
        .bind(&instance)
        .bind(&lock_token)
        .bind(locked_until)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
        .rows_affected();
        if acquired == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        sqlx::query("UPDATE orchestrator_queue SET lock_token = ?1 WHERE instance_id = ?2 AND visible_at <= ?3")
            .bind(&lock_token)
            .bind(&instance)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT work_item FROM orchestrator_queue WHERE lock_token = ? ORDER BY id")
                .bind(&lock_token)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let messages = rows
            .into_iter()
            .map(|(data,)| serde_json::from_str::<WorkItem>(&data))
            .collect::<Result<Vec<_>, _>>()?;

        let (workflow_name, execution_id, history) = match Self::current_execution_in_tx(&mut tx, &instance).await? {
            Some((name, exec)) => {
                let history = Self::read_history_in_tx(&mut tx, &instance, exec).await?;
                (name, exec, history)
            }
            None => {
                let name = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartWorkflow { workflow, .. } => Some(workflow.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                (name, crate::INITIAL_EXECUTION_ID, Vec::new())
            }
        };

        Self::commit(tx, OP).await?;
        debug!(target: "content_amplifier::providers::sqlite", instance_id = %instance, message_count = messages.len(), "locked instance");
        Ok(Some(OrchestrationItem {
            instance,
            workflow_name,
            execution_id,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        delta: HistoryDelta,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        const OP: &str = "ack_orchestration_item";
        let mut tx = self.begin(OP).await?;

        let lock: Option<(String, i64)> =
            sqlx::query_as("SELECT instance_id, locked_until FROM instance_locks WHERE lock_token = ?")
                .bind(lock_token)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some((instance, locked_until)) = lock else {
            return Err(ProviderError::permanent(OP, "lock token not held"));
        };
        if locked_until <= Self::now_millis() {
            return Err(ProviderError::permanent(OP, "instance lock expired"));
        }

        if !delta.events.is_empty() {
            Self::append_in_tx(&mut tx, OP, &instance, delta.execution_id, delta.events).await?;
        }

        let now_ms = Self::now_millis();
        for item in &worker_items {
            let work_item = serde_json::to_string(item)?;
            sqlx::query("INSERT INTO worker_queue (work_item, visible_at) VALUES (?, ?)")
                .bind(work_item)
                .bind(now_ms)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        }
        for item in &orchestrator_items {
            Self::enqueue_orchestrator_in_tx(&mut tx, OP, item, None).await?;
        }

        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ?")
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        Self::commit(tx, OP).await?;
        debug!(
            target: "content_amplifier::providers::sqlite",
            instance_id = %instance,
            worker_items = worker_items.len(),
            orchestrator_items = orchestrator_items.len(),
            "acked orchestration item"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "abandon_orchestration_item";
        let mut tx = self.begin(OP).await?;
        let lock: Option<(String,)> = sqlx::query_as("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some((instance,)) = lock else {
            return Err(ProviderError::permanent(OP, "lock token not held"));
        };
        match delay {
            Some(d) => {
                sqlx::query("UPDATE orchestrator_queue SET lock_token = NULL, visible_at = ? WHERE lock_token = ?")
                    .bind(Self::timestamp_after(d))
                    .bind(lock_token)
                    .execute(&mut *tx)
                    .await
            }
            None => {
                sqlx::query("UPDATE orchestrator_queue SET lock_token = NULL WHERE lock_token = ?")
                    .bind(lock_token)
                    .execute(&mut *tx)
                    .await
            }
        }
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ?")
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::commit(tx, OP).await
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        const OP: &str = "fetch_work_item";
        let mut tx = self.begin(OP).await?;
        let now_ms = Self::now_millis();
        let next: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, work_item FROM worker_queue
            WHERE visible_at <= ?1
              AND (lock_token IS NULL OR locked_until <= ?1)
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some((id, data)) = next else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let lock_token = Self::generate_lock_token();
        sqlx::query("UPDATE worker_queue SET lock_token = ?1, locked_until = ?2 WHERE id = ?3")
            .bind(&lock_token)
            .bind(Self::timestamp_after(lock_timeout))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let item: WorkItem = serde_json::from_str(&data)?;
        Self::commit(tx, OP).await?;
        Ok(Some((item, lock_token)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        const OP: &str = "ack_work_item";
        let mut tx = self.begin(OP).await?;
        let deleted = sqlx::query("DELETE FROM worker_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            .rows_affected();
        if deleted == 0 {
            return Err(ProviderError::permanent(OP, "work item lock not held"));
        }
        if let Some(completion) = &completion {
            Self::enqueue_orchestrator_in_tx(&mut tx, OP, completion, None).await?;
        }
        Self::commit(tx, OP).await
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "abandon_work_item";
        let visible_at = delay.map(Self::timestamp_after).unwrap_or_else(Self::now_millis);
        let updated = sqlx::query(
            "UPDATE worker_queue SET lock_token = NULL, locked_until = NULL, visible_at = ? WHERE lock_token = ?",
        )
        .bind(visible_at)
        .bind(lock_token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
        .rows_affected();
        if updated == 0 {
            return Err(ProviderError::permanent(OP, "work item lock not held"));
        }
        Ok(())
    }

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        const OP: &str = "renew_work_item_lock";
        let updated = sqlx::query("UPDATE worker_queue SET locked_until = ?1 WHERE lock_token = ?2 AND locked_until > ?3")
            .bind(Self::timestamp_after(extend_for))
            .bind(lock_token)
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            .rows_affected();
        if updated == 0 {
            return Err(ProviderError::permanent(OP, "work item lock not held"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_store() -> SqliteProvider {
        SqliteProvider::new_in_memory()
            .await
            .expect("Failed to create in-memory store")
    }

    fn started(execution_id: u64, input: &str) -> Event {
        Event::new(
            1,
            execution_id,
            EventKind::WorkflowStarted {
                name: "Wf".into(),
                input: input.into(),
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_read_all() {
        let store = create_test_store().await;
        assert_eq!(store.append("i", 1, vec![started(1, "x")]).await.unwrap(), 1);
        let timer = Event::new(2, 1, EventKind::TimerStarted { fire_at_ms: 10 });
        assert_eq!(store.append("i", 1, vec![timer]).await.unwrap(), 2);

        let history = store.read_all("i").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind, EventKind::TimerStarted { fire_at_ms: 10 });

        let gap = Event::new(5, 1, EventKind::TimerStarted { fire_at_ms: 10 });
        assert!(store.append("i", 1, vec![gap]).await.is_err());
    }

    #[tokio::test]
    async fn test_multi_execution_support() {
        let store = create_test_store().await;
        store.append("i", 1, vec![started(1, "a")]).await.unwrap();
        store.append("i", 2, vec![started(2, "b")]).await.unwrap();
        assert!(store.append("i", 4, vec![started(4, "c")]).await.is_err());

        assert_eq!(store.list_executions("i").await.unwrap(), vec![1, 2]);
        assert_eq!(store.latest_execution_id("i").await.unwrap(), Some(2));
        let latest = store.read_all("i").await.unwrap();
        assert!(matches!(&latest[0].kind, EventKind::WorkflowStarted { input, .. } if input == "b"));
        let first = store.read_history_with_execution("i", 1).await.unwrap();
        assert!(matches!(&first[0].kind, EventKind::WorkflowStarted { input, .. } if input == "a"));
    }

    #[tokio::test]
    async fn test_transactional_ack() {
        let store = create_test_store().await;
        store
            .enqueue_orchestrator_work(WorkItem::StartWorkflow {
                instance: "i".into(),
                workflow: "Wf".into(),
                input: "".into(),
            })
            .await
            .unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.workflow_name, "Wf");

        let activity = WorkItem::ActivityExecute {
            instance: "i".into(),
            execution_id: 1,
            id: 2,
            name: "A".into(),
            input: "".into(),
            attempt: 1,
            timeout_ms: Some(1000),
        };
        store
            .ack_orchestration_item(
                &item.lock_token,
                HistoryDelta {
                    execution_id: 1,
                    events: vec![
                        started(1, ""),
                        Event::new(
                            2,
                            1,
                            EventKind::ActivityScheduled {
                                name: "A".into(),
                                input: "".into(),
                                attempt: 1,
                                timeout_ms: Some(1000),
                            },
                        ),
                    ],
                },
                vec![activity.clone()],
                vec![],
            )
            .await
            .unwrap();

        assert!(
            store
                .fetch_orchestration_item(Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );
        let (got, token) = store.fetch_work_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(got, activity);
        store
            .ack_work_item(
                &token,
                Some(WorkItem::ActivityCompleted {
                    instance: "i".into(),
                    execution_id: 1,
                    id: 2,
                    result: "done".into(),
                }),
            )
            .await
            .unwrap();
        let next = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.history.len(), 2);
        assert!(matches!(next.messages[0], WorkItem::ActivityCompleted { .. }));
    }

    #[tokio::test]
    async fn test_stale_lock_token_is_rejected() {
        let store = create_test_store().await;
        let err = store
            .ack_orchestration_item("lock_nope", HistoryDelta::default(), vec![], vec![])
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(store.renew_work_item_lock("lock_nope", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_delayed_visibility() {
        let store = create_test_store().await;
        store
            .enqueue_orchestrator_work(WorkItem::TimerFired {
                instance: "i".into(),
                execution_id: 1,
                id: 2,
                fire_at_ms: now_ms() + 60_000,
            })
            .await
            .unwrap();
        assert!(
            store
                .fetch_orchestration_item(Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("history.db").display());
        {
            let store = SqliteProvider::new(&url).await.unwrap();
            store.append("i", 1, vec![started(1, "persisted")]).await.unwrap();
            store
                .enqueue_orchestrator_work(WorkItem::CancelInstance {
                    instance: "i".into(),
                    reason: "r".into(),
                })
                .await
                .unwrap();
            store.close().await;
        }
        let store = SqliteProvider::new(&url).await.unwrap();
        assert_eq!(store.read_all("i").await.unwrap().len(), 1);
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.workflow_name, "Wf");
        assert_eq!(item.messages.len(), 1);
    }
}
