//! SQLite persistence for flow runs and task runs
//!
//! Contexts are stored as JSON text, states as the int enum, timestamps through
//! sqlx's chrono support. Several processors may share one database file.

use crate::store::{
    types::{FlowRun, FlowRunUpdate, FlowRunView, NewFlowRun, RunState, TaskRun},
    FlowStore,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite,
};
use std::{path::Path, str::FromStr};

/// SQLite-backed [`FlowStore`]
#[derive(Debug, Clone)]
pub struct SqliteFlowStore {
    pool: SqlitePool,
}

impl SqliteFlowStore {
    /// Wrap an existing pool; call [`init_schema`](Self::init_schema) before use
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database from a `sqlite://` URL and initialize the schema
    pub async fn connect(url: &str) -> Result<Self> {
        if let Some(parent) = url
            .strip_prefix("sqlite://")
            .map(Path::new)
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
            })?;
        }

        tracing::info!("🗄️ Opening flow store: {}", url);
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    ///
    /// Pinned to a single connection that never expires, since every new
    /// connection to `:memory:` would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid TEXT NOT NULL UNIQUE,
                flow_name TEXT NOT NULL,
                state INTEGER NOT NULL,
                context JSON NOT NULL,
                delayed_until TIMESTAMP NULL,
                created_at TIMESTAMP NOT NULL,
                finished_at TIMESTAMP NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Polling query: state = ACTIVE AND flow_name IN (...) ORDER BY created_at
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_flow_runs_active
            ON flow_runs(state, flow_name, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_task_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                flow_run_uid TEXT NOT NULL,
                task_name TEXT NOT NULL,
                state INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL,
                finished_at TIMESTAMP NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_flow_task_runs_run
            ON flow_task_runs(flow_run_uid)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn flow_run_from_row(row: &SqliteRow) -> Result<FlowRun> {
    let context: String = row.try_get("context")?;
    Ok(FlowRun {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        flow_name: row.try_get("flow_name")?,
        state: RunState::from_i64(row.try_get("state")?)?,
        context: serde_json::from_str(&context)?,
        delayed_until: row.try_get("delayed_until")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn task_run_from_row(row: &SqliteRow) -> Result<TaskRun> {
    Ok(TaskRun {
        id: row.try_get("id")?,
        flow_run_uid: row.try_get("flow_run_uid")?,
        task_name: row.try_get("task_name")?,
        state: RunState::from_i64(row.try_get("state")?)?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn insert_flow_run(&self, run: NewFlowRun) -> Result<FlowRun> {
        let context_json = serde_json::to_string(&run.context)?;

        let id = sqlx::query(
            r#"
            INSERT INTO flow_runs (uid, flow_name, state, context, delayed_until, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.uid)
        .bind(&run.flow_name)
        .bind(RunState::Active.as_i64())
        .bind(&context_json)
        .bind(run.delayed_until)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(FlowRun {
            id,
            uid: run.uid,
            flow_name: run.flow_name,
            state: RunState::Active,
            context: run.context,
            delayed_until: run.delayed_until,
            created_at: run.created_at,
            finished_at: None,
        })
    }

    async fn find_active_flow_runs(&self, flow_names: &[String]) -> Result<Vec<FlowRunView>> {
        if flow_names.is_empty() {
            return Ok(vec![]);
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, uid, flow_name, delayed_until, created_at FROM flow_runs WHERE state = ",
        );
        query.push_bind(RunState::Active.as_i64());
        query.push(" AND flow_name IN (");
        {
            let mut names = query.separated(", ");
            for name in flow_names {
                names.push_bind(name.clone());
            }
        }
        query.push(") ORDER BY created_at ASC, id ASC");

        let rows = query.build().fetch_all(&self.pool).await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            runs.push(FlowRunView {
                id: row.try_get("id")?,
                uid: row.try_get("uid")?,
                flow_name: row.try_get("flow_name")?,
                delayed_until: row.try_get("delayed_until")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(runs)
    }

    async fn get_flow_run(&self, uid: &str) -> Result<Option<FlowRun>> {
        let row = sqlx::query("SELECT * FROM flow_runs WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(flow_run_from_row).transpose()
    }

    async fn update_flow_run(&self, id: i64, update: FlowRunUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(true);
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE flow_runs SET ");
        {
            let mut fields = query.separated(", ");
            if let Some(state) = update.state {
                fields.push("state = ").push_bind_unseparated(state.as_i64());
            }
            if let Some(context) = &update.context {
                fields
                    .push("context = ")
                    .push_bind_unseparated(serde_json::to_string(context)?);
            }
            if let Some(delayed_until) = update.delayed_until {
                fields.push("delayed_until = ").push_bind_unseparated(delayed_until);
            }
            if let Some(finished_at) = update.finished_at {
                fields.push("finished_at = ").push_bind_unseparated(finished_at);
            }
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_task_run(
        &self,
        flow_run_uid: &str,
        task_name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<TaskRun> {
        let id = sqlx::query(
            r#"
            INSERT INTO flow_task_runs (flow_run_uid, task_name, state, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(flow_run_uid)
        .bind(task_name)
        .bind(RunState::Active.as_i64())
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(TaskRun {
            id,
            flow_run_uid: flow_run_uid.to_string(),
            task_name: task_name.to_string(),
            state: RunState::Active,
            created_at,
            finished_at: None,
        })
    }

    async fn find_task_runs(&self, flow_run_uid: &str) -> Result<Vec<TaskRun>> {
        let rows = sqlx::query("SELECT * FROM flow_task_runs WHERE flow_run_uid = ? ORDER BY id ASC")
            .bind(flow_run_uid)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(task_run_from_row).collect()
    }

    async fn finish_task_run(&self, id: i64, finished_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE flow_task_runs SET state = ?, finished_at = ? WHERE id = ?")
            .bind(RunState::Finished.as_i64())
            .bind(finished_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_task_run(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM flow_task_runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
