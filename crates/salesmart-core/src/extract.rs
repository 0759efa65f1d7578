//! Normalisation of raw increment extracts into staging-shaped CSV.
//!
//! The export carries two incidental columns (a positional index and `id`)
//! that are dropped. Rows are deduplicated on `uniq_id`, keeping the first
//! occurrence, and `status` is backfilled when the export predates the column
//! or leaves the value blank. Other values are kept as text; typing happens
//! in the database on load.

use std::collections::{HashMap, HashSet};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Staging table columns, in table order.
pub const STAGING_COLUMNS: [&str; 12] = [
    "uniq_id",
    "date_time",
    "city_id",
    "city_name",
    "customer_id",
    "first_name",
    "last_name",
    "item_id",
    "item_name",
    "quantity",
    "payment_amount",
    "status",
];

pub const KEY_COLUMN: &str = "uniq_id";
pub const STATUS_COLUMN: &str = "status";
const STATUS_SLOT: usize = 11;
const ID_COLUMN: &str = "id";

/// One order-line record shaped like the staging table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRow {
    pub uniq_id: String,
    pub date_time: String,
    pub city_id: String,
    pub city_name: String,
    pub customer_id: String,
    pub first_name: String,
    pub last_name: String,
    pub item_id: String,
    pub item_name: String,
    pub quantity: String,
    pub payment_amount: String,
    pub status: String,
}

impl StagingRow {
    /// `positions` must hold a column for every slot except `status`; a
    /// missing or blank status takes `default_status`.
    fn from_record(
        record: &StringRecord,
        positions: &[Option<usize>; 12],
        default_status: &str,
    ) -> Result<Self> {
        let value = |slot: usize| -> Result<String> {
            let idx = positions[slot].ok_or_else(|| {
                PipelineError::load(format!(
                    "column '{}' is not mapped",
                    STAGING_COLUMNS[slot]
                ))
            })?;
            Ok(record.get(idx).unwrap_or_default().to_string())
        };
        let status = positions[STATUS_SLOT]
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .filter(|status| !status.is_empty())
            .unwrap_or(default_status)
            .to_string();
        Ok(Self {
            uniq_id: value(0)?,
            date_time: value(1)?,
            city_id: value(2)?,
            city_name: value(3)?,
            customer_id: value(4)?,
            first_name: value(5)?,
            last_name: value(6)?,
            item_id: value(7)?,
            item_name: value(8)?,
            quantity: value(9)?,
            payment_amount: value(10)?,
            status,
        })
    }

    pub fn fields(&self) -> [&str; 12] {
        [
            &self.uniq_id,
            &self.date_time,
            &self.city_id,
            &self.city_name,
            &self.customer_id,
            &self.first_name,
            &self.last_name,
            &self.item_id,
            &self.item_name,
            &self.quantity,
            &self.payment_amount,
            &self.status,
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleaningStats {
    pub rows_read: usize,
    pub duplicates_dropped: usize,
    pub status_backfilled: bool,
    /// Kept rows whose `status` value was blank and took the default.
    pub blank_status_filled: usize,
    pub dropped_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedExtract {
    pub rows: Vec<StagingRow>,
    pub stats: CleaningStats,
}

impl CleanedExtract {
    /// CSV with a header row, columns in staging order.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(STAGING_COLUMNS).map_err(PipelineError::load)?;
        for row in &self.rows {
            writer.write_record(row.fields()).map_err(PipelineError::load)?;
        }
        writer
            .into_inner()
            .map_err(|err| PipelineError::load(err.error()))
    }
}

fn is_index_column(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name.starts_with("Unnamed:") || name.eq_ignore_ascii_case("index")
}

/// Cleans a raw extract. See the module docs for the rules applied.
pub fn clean_extract(raw: &[u8], default_status: &str) -> Result<CleanedExtract> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(raw);
    let headers = reader.headers().map_err(PipelineError::load)?.clone();

    let mut by_name: HashMap<&str, usize> = HashMap::new();
    let mut dropped_columns = Vec::new();
    for (idx, name) in headers.iter().enumerate() {
        let trimmed = name.trim();
        if is_index_column(trimmed) || trimmed == ID_COLUMN {
            dropped_columns.push(trimmed.to_string());
            continue;
        }
        if STAGING_COLUMNS.contains(&trimmed) {
            if by_name.insert(trimmed, idx).is_some() {
                return Err(PipelineError::load(format!(
                    "column '{trimmed}' appears more than once"
                )));
            }
        } else {
            dropped_columns.push(trimmed.to_string());
        }
    }

    let unknown: Vec<&String> = dropped_columns
        .iter()
        .filter(|name| !is_index_column(name) && name.as_str() != ID_COLUMN)
        .collect();
    if !unknown.is_empty() {
        warn!(columns = ?unknown, "ignoring columns not present in staging table");
    }

    let mut positions = [None; 12];
    for (slot, column) in STAGING_COLUMNS.iter().enumerate() {
        positions[slot] = by_name.get(column).copied();
        if positions[slot].is_none() && *column != STATUS_COLUMN {
            return Err(PipelineError::load(format!(
                "extract is missing required column '{column}'"
            )));
        }
    }
    let status_backfilled = positions[STATUS_SLOT].is_none();

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let mut rows_read = 0usize;
    let mut duplicates_dropped = 0usize;
    let mut blank_status_filled = 0usize;

    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(PipelineError::load)?;
        rows_read += 1;
        let row = StagingRow::from_record(&record, &positions, default_status)?;
        let blank_status = positions[STATUS_SLOT]
            .and_then(|idx| record.get(idx))
            .is_some_and(|value| value.trim().is_empty());
        if row.uniq_id.trim().is_empty() {
            return Err(PipelineError::load(format!(
                "data row {} has an empty {KEY_COLUMN}",
                line + 1
            )));
        }
        if !seen.insert(row.uniq_id.clone()) {
            duplicates_dropped += 1;
            continue;
        }
        if blank_status {
            blank_status_filled += 1;
        }
        rows.push(row);
    }

    if rows.is_empty() {
        warn!("extract contains no data rows");
    }
    debug!(
        rows_read,
        rows_kept = rows.len(),
        duplicates_dropped,
        status_backfilled,
        blank_status_filled,
        "extract cleaned"
    );

    Ok(CleanedExtract {
        rows,
        stats: CleaningStats {
            rows_read,
            duplicates_dropped,
            status_backfilled,
            blank_status_filled,
            dropped_columns,
        },
    })
}
