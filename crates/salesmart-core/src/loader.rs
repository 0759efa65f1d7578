//! Download → clean → staged upsert of one increment file.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::config::{PipelineConfig, StagingTarget};
use crate::error::{PipelineError, Result};
use crate::extract::clean_extract;
use crate::sink::StagingSink;
use crate::storage::ArtifactStore;
use crate::types::{BusinessDate, IncrementHandle};

#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub work_dir: PathBuf,
    pub default_status: String,
    pub target: StagingTarget,
}

impl LoadSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            default_status: config.default_status.clone(),
            target: config.staging.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub increment_id: IncrementHandle,
    pub local_path: PathBuf,
    pub rows_read: usize,
    pub rows_written: usize,
    pub duplicates_dropped: usize,
    pub status_backfilled: bool,
    pub rows_upserted: u64,
}

/// Local copy of an increment file: `<work_dir>/<YYYYMMDD>_<filename>`.
pub fn local_staging_path(work_dir: &Path, date: BusinessDate, filename: &str) -> Result<PathBuf> {
    let valid = !filename.is_empty()
        && !filename.contains(['/', '\\'])
        && filename != "."
        && filename != "..";
    if !valid {
        return Err(PipelineError::load(format!(
            "'{filename}' is not a plain file name"
        )));
    }
    Ok(work_dir.join(format!("{}_{}", date.compact(), filename)))
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|err| PipelineError::load(format!("failed to write {}: {err}", path.display())))
}

/// Loads one increment file into the staging table.
///
/// The local file is overwritten on every run, so an interrupted load can be
/// repeated from scratch.
pub async fn load_extract(
    store: &dyn ArtifactStore,
    sink: &dyn StagingSink,
    settings: &LoadSettings,
    increment: &IncrementHandle,
    filename: &str,
    date: BusinessDate,
) -> Result<LoadResult> {
    let local_path = local_staging_path(&settings.work_dir, date, filename)?;

    let raw = store.fetch(increment, filename).await?;
    info!(
        increment_id = %increment,
        bytes = raw.len(),
        path = %local_path.display(),
        "increment downloaded"
    );

    tokio::fs::create_dir_all(&settings.work_dir)
        .await
        .map_err(|err| {
            PipelineError::load(format!(
                "failed to create {}: {err}",
                settings.work_dir.display()
            ))
        })?;
    write_file(&local_path, &raw).await?;

    let cleaned = clean_extract(&raw, &settings.default_status)?;
    write_file(&local_path, &cleaned.to_csv()?).await?;

    let rows_upserted = sink.upsert_file(&settings.target, &local_path).await?;

    let result = LoadResult {
        increment_id: increment.clone(),
        local_path,
        rows_read: cleaned.stats.rows_read,
        rows_written: cleaned.rows.len(),
        duplicates_dropped: cleaned.stats.duplicates_dropped,
        status_backfilled: cleaned.stats.status_backfilled,
        rows_upserted,
    };
    info!(
        increment_id = %increment,
        rows_written = result.rows_written,
        duplicates_dropped = result.duplicates_dropped,
        rows_upserted,
        "data uploaded to staging"
    );
    Ok(result)
}
