//! SQLite Repositories
//!
//! Same layout as the PostgreSQL backend. Suited to single-node deployments and
//! local development (`sqlite::memory:`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use tracing::info;

use super::{DefinitionRepository, InstanceRepository};
use crate::domain::{HistoryEntry, Process, ProcessInstance};
use crate::error::{Result, WorkflowError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS wf_processes (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        code TEXT NOT NULL,
        version INTEGER NOT NULL,
        definition TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (tenant_id, code, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wf_instances (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        process_id TEXT NOT NULL,
        process_code TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        current_state_id TEXT NOT NULL,
        assignee TEXT,
        attributes TEXT NOT NULL,
        escalated BOOLEAN NOT NULL DEFAULT 0,
        version INTEGER NOT NULL,
        state_entered_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (tenant_id, process_code, entity_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_wf_instances_state ON wf_instances(tenant_id, process_id, current_state_id)",
    "CREATE INDEX IF NOT EXISTS idx_wf_instances_entity ON wf_instances(tenant_id, process_id, entity_id)",
    r#"
    CREATE TABLE IF NOT EXISTS wf_history (
        instance_id TEXT NOT NULL REFERENCES wf_instances(id),
        sequence INTEGER NOT NULL,
        actor_id TEXT NOT NULL,
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        action_name TEXT NOT NULL,
        comment TEXT,
        assignee TEXT,
        escalated BOOLEAN NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (instance_id, sequence)
    )
    "#,
];

const INSTANCE_COLUMNS: &str = "id, tenant_id, process_id, process_code, entity_id, current_state_id, \
     assignee, attributes, escalated, version, state_entered_at, created_at, updated_at";

/// Create tables and indexes if missing
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Workflow schema initialized (sqlite)");
    Ok(())
}

fn from_millis(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts)
        .ok_or_else(|| WorkflowError::internal(format!("Invalid timestamp: {}", ts)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub struct SqliteDefinitionRepository {
    pool: SqlitePool,
}

impl SqliteDefinitionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        init_schema(&self.pool).await
    }
}

#[async_trait]
impl DefinitionRepository for SqliteDefinitionRepository {
    async fn insert(&self, process: &Process) -> Result<()> {
        let definition = serde_json::to_string(process)?;
        let result = sqlx::query(
            "INSERT INTO wf_processes (id, tenant_id, code, version, definition, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&process.id)
        .bind(&process.tenant_id)
        .bind(&process.code)
        .bind(i64::from(process.version))
        .bind(definition)
        .bind(process.created_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(WorkflowError::duplicate(
                "Process",
                "version",
                format!("{}@{}", process.code, process.version),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Process>> {
        let row = sqlx::query("SELECT definition FROM wf_processes WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(row.try_get("definition")?)?)),
            None => Ok(None),
        }
    }

    async fn find_latest_by_code(&self, tenant_id: &str, code: &str) -> Result<Option<Process>> {
        let row = sqlx::query(
            "SELECT definition FROM wf_processes WHERE tenant_id = ? AND code = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(row.try_get("definition")?)?)),
            None => Ok(None),
        }
    }

    async fn list_latest(&self, tenant_id: &str) -> Result<Vec<Process>> {
        let rows = sqlx::query(
            r#"
            SELECT p.definition
            FROM wf_processes p
            WHERE p.tenant_id = ?
              AND p.version = (
                  SELECT MAX(q.version) FROM wf_processes q
                  WHERE q.tenant_id = p.tenant_id AND q.code = p.code
              )
            ORDER BY p.code
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut processes = Vec::with_capacity(rows.len());
        for row in rows {
            processes.push(serde_json::from_str(row.try_get("definition")?)?);
        }
        Ok(processes)
    }
}

async fn load_history(conn: &mut SqliteConnection, instance_id: &str) -> Result<Vec<HistoryEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT sequence, actor_id, from_state, to_state, action_name, comment, assignee, escalated, created_at
        FROM wf_history
        WHERE instance_id = ?
        ORDER BY sequence
        "#,
    )
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut history = Vec::with_capacity(rows.len());
    for row in rows {
        history.push(HistoryEntry {
            sequence: row.try_get::<i64, _>("sequence")? as u64,
            actor_id: row.try_get("actor_id")?,
            from_state: row.try_get("from_state")?,
            to_state: row.try_get("to_state")?,
            action_name: row.try_get("action_name")?,
            comment: row.try_get("comment")?,
            assignee: row.try_get("assignee")?,
            escalated: row.try_get("escalated")?,
            timestamp: from_millis(row.try_get("created_at")?)?,
        });
    }
    Ok(history)
}

async fn hydrate(conn: &mut SqliteConnection, row: SqliteRow) -> Result<ProcessInstance> {
    let attributes: String = row.try_get("attributes")?;
    let mut instance = ProcessInstance {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        process_id: row.try_get("process_id")?,
        process_code: row.try_get("process_code")?,
        entity_id: row.try_get("entity_id")?,
        current_state_id: row.try_get("current_state_id")?,
        assignee: row.try_get("assignee")?,
        attributes: serde_json::from_str::<BTreeMap<String, Vec<String>>>(&attributes)?,
        escalated: row.try_get("escalated")?,
        version: row.try_get::<i64, _>("version")? as u64,
        history: Vec::new(),
        state_entered_at: from_millis(row.try_get("state_entered_at")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    };
    instance.history = load_history(conn, &instance.id).await?;
    Ok(instance)
}

async fn hydrate_all(conn: &mut SqliteConnection, rows: Vec<SqliteRow>) -> Result<Vec<ProcessInstance>> {
    let mut instances = Vec::with_capacity(rows.len());
    for row in rows {
        instances.push(hydrate(&mut *conn, row).await?);
    }
    Ok(instances)
}

/// Row plus history, read on one connection so a transaction sees its own writes
async fn load(conn: &mut SqliteConnection, instance_id: &str) -> Result<Option<ProcessInstance>> {
    let query = format!("SELECT {} FROM wf_instances WHERE id = ?", INSTANCE_COLUMNS);
    let row = sqlx::query(&query)
        .bind(instance_id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => Ok(Some(hydrate(conn, row).await?)),
        None => Ok(None),
    }
}

pub struct SqliteInstanceRepository {
    pool: SqlitePool,
}

impl SqliteInstanceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        init_schema(&self.pool).await
    }

    async fn find_one(&self, query: &str, binds: [&str; 3]) -> Result<Option<ProcessInstance>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(query)
            .bind(binds[0])
            .bind(binds[1])
            .bind(binds[2])
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => Ok(Some(hydrate(&mut conn, row).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl InstanceRepository for SqliteInstanceRepository {
    async fn insert(&self, instance: &ProcessInstance) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO wf_instances
                (id, tenant_id, process_id, process_code, entity_id, current_state_id, assignee,
                 attributes, escalated, version, state_entered_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.tenant_id)
        .bind(&instance.process_id)
        .bind(&instance.process_code)
        .bind(&instance.entity_id)
        .bind(&instance.current_state_id)
        .bind(instance.assignee.as_deref())
        .bind(serde_json::to_string(&instance.attributes)?)
        .bind(instance.escalated)
        .bind(instance.version as i64)
        .bind(instance.state_entered_at.timestamp_millis())
        .bind(instance.created_at.timestamp_millis())
        .bind(instance.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(WorkflowError::duplicate_instance(
                &instance.tenant_id,
                &instance.process_id,
                &instance.entity_id,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<ProcessInstance>> {
        let mut conn = self.pool.acquire().await?;
        Ok(load(&mut conn, id).await?.filter(|i| i.tenant_id == tenant_id))
    }

    async fn find_by_entity(
        &self,
        tenant_id: &str,
        process_id: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        let query = format!(
            "SELECT {} FROM wf_instances WHERE tenant_id = ? AND process_id = ? AND entity_id = ?",
            INSTANCE_COLUMNS
        );
        self.find_one(&query, [tenant_id, process_id, entity_id]).await
    }

    async fn find_by_process_code(
        &self,
        tenant_id: &str,
        process_code: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        let query = format!(
            "SELECT {} FROM wf_instances WHERE tenant_id = ? AND process_code = ? AND entity_id = ?",
            INSTANCE_COLUMNS
        );
        self.find_one(&query, [tenant_id, process_code, entity_id]).await
    }

    async fn append_transition(
        &self,
        instance_id: &str,
        expected_version: u64,
        new_state: &str,
        entry: HistoryEntry,
    ) -> Result<ProcessInstance> {
        let at = entry.timestamp.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE wf_instances
               SET current_state_id = ?,
                   version = version + 1,
                   assignee = COALESCE(?, assignee),
                   escalated = escalated OR ?,
                   state_entered_at = ?,
                   updated_at = ?
             WHERE id = ?
               AND version = ?
            "#,
        )
        .bind(new_state)
        .bind(entry.assignee.as_deref())
        .bind(entry.escalated)
        .bind(at)
        .bind(at)
        .bind(instance_id)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let exists = sqlx::query("SELECT 1 FROM wf_instances WHERE id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return Err(if exists {
                WorkflowError::conflict(instance_id, expected_version)
            } else {
                WorkflowError::not_found("ProcessInstance", instance_id)
            });
        }

        sqlx::query(
            r#"
            INSERT INTO wf_history
                (instance_id, sequence, actor_id, from_state, to_state, action_name, comment, assignee, escalated, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance_id)
        .bind((expected_version + 1) as i64)
        .bind(&entry.actor_id)
        .bind(&entry.from_state)
        .bind(new_state)
        .bind(&entry.action_name)
        .bind(entry.comment.as_deref())
        .bind(entry.assignee.as_deref())
        .bind(entry.escalated)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        // Read back before commit: the write lock keeps later writers out
        let updated = load(&mut tx, instance_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("ProcessInstance", instance_id))?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn find_in_state(
        &self,
        tenant_id: &str,
        process_id: &str,
        state_id: &str,
    ) -> Result<Vec<ProcessInstance>> {
        let query = format!(
            "SELECT {} FROM wf_instances WHERE tenant_id = ? AND process_id = ? AND current_state_id = ? ORDER BY state_entered_at",
            INSTANCE_COLUMNS
        );
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&query)
            .bind(tenant_id)
            .bind(process_id)
            .bind(state_id)
            .fetch_all(&mut *conn)
            .await?;

        hydrate_all(&mut conn, rows).await
    }

    async fn find_escalated(
        &self,
        tenant_id: &str,
        process_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProcessInstance>> {
        let query = format!(
            "SELECT {} FROM wf_instances WHERE tenant_id = ? AND process_id = ? AND escalated = 1 ORDER BY updated_at DESC LIMIT ? OFFSET ?",
            INSTANCE_COLUMNS
        );
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&query)
            .bind(tenant_id)
            .bind(process_id)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&mut *conn)
            .await?;

        hydrate_all(&mut conn, rows).await
    }
}
