//! Staging table writers.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::config::StagingTarget;
use crate::db::DbPool;
use crate::error::{PipelineError, Result};
use crate::extract::{KEY_COLUMN, STAGING_COLUMNS};

#[async_trait]
pub trait StagingSink: Send + Sync {
    /// Upserts a cleaned extract file (header row, staging column order) into
    /// `target`, keyed by `uniq_id`. Either every row applies or none does.
    /// Returns the number of rows inserted or updated.
    async fn upsert_file(&self, target: &StagingTarget, path: &Path) -> Result<u64>;
}

#[derive(Clone)]
pub struct PostgresStagingSink {
    pool: DbPool,
}

impl PostgresStagingSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// `INSERT ... SELECT ... ON CONFLICT (uniq_id) DO UPDATE` overwriting every
/// non-key column.
pub fn upsert_statement(target: &StagingTarget) -> String {
    let columns = STAGING_COLUMNS.join(", ");
    let assignments = STAGING_COLUMNS
        .iter()
        .filter(|column| **column != KEY_COLUMN)
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {target} ({columns}) SELECT {columns} FROM {scratch} \
         ON CONFLICT ({KEY_COLUMN}) DO UPDATE SET {assignments}",
        target = target.qualified(),
        scratch = target.scratch_qualified(),
    )
}

fn step_error(step: &'static str) -> impl Fn(sqlx::Error) -> PipelineError {
    move |err| PipelineError::load(format!("{step}: {err}"))
}

#[async_trait]
impl StagingSink for PostgresStagingSink {
    async fn upsert_file(&self, target: &StagingTarget, path: &Path) -> Result<u64> {
        let payload = tokio::fs::read(path).await.map_err(|err| {
            PipelineError::load(format!("failed to read {}: {err}", path.display()))
        })?;

        let scratch = target.scratch_qualified();
        let mut tx = self.pool.begin().await.map_err(step_error("begin"))?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {scratch}"))
            .execute(&mut *tx)
            .await
            .map_err(step_error("drop scratch table"))?;

        sqlx::query(&format!(
            "CREATE TABLE {scratch} AS SELECT * FROM {} WITH NO DATA",
            target.qualified()
        ))
        .execute(&mut *tx)
        .await
        .map_err(step_error("create scratch table"))?;

        let copy_sql = format!(
            "COPY {scratch} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
            STAGING_COLUMNS.join(", ")
        );
        let mut copy = tx
            .copy_in_raw(&copy_sql)
            .await
            .map_err(step_error("start copy"))?;
        copy.send(payload).await.map_err(step_error("copy data"))?;
        let copied = copy.finish().await.map_err(step_error("finish copy"))?;

        let upserted = sqlx::query(&upsert_statement(target))
            .execute(&mut *tx)
            .await
            .map_err(step_error("upsert"))?
            .rows_affected();

        tx.commit().await.map_err(step_error("commit"))?;

        info!(
            table = %target.qualified(),
            copied,
            upserted,
            "staging table upserted"
        );
        Ok(upserted)
    }
}
