//! Data units: one zstd-compressed, headerless CSV file per table.
//!
//! The first column of every record is the hex sharding key, the remaining
//! columns are the row values in schema order.

use std::path::Path;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use tabletmgr_topo::{KeyRange, KeyspaceId};
use tracing::debug;

use super::manifest::{SnapshotFile, DATA_SUFFIX};
use crate::engine::{DataEngine, Row, TableSchema};
use crate::error::AgentError;

const ZSTD_LEVEL: i32 = 3;

/// Encodes rows as a compressed data unit.
pub fn encode_rows(rows: &[Row]) -> Result<Vec<u8>, AgentError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());
    for row in rows {
        let mut record = Vec::with_capacity(row.values.len() + 1);
        record.push(row.key.to_hex());
        record.extend(row.values.iter().cloned());
        writer.write_record(&record)?;
    }
    let raw = writer
        .into_inner()
        .map_err(|e| AgentError::Data(e.to_string()))?;
    Ok(zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?)
}

/// Decodes a compressed data unit.
pub fn decode_rows(data: &[u8]) -> Result<Vec<Row>, AgentError> {
    let raw = zstd::decode_all(data)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_slice());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter();
        let key = fields
            .next()
            .ok_or_else(|| AgentError::Data("empty record in data unit".to_string()))?;
        let key = KeyspaceId::from_hex(key).map_err(|e| AgentError::Data(e.to_string()))?;
        rows.push(Row {
            key,
            values: fields.map(str::to_string).collect(),
        });
    }
    Ok(rows)
}

/// blake3 of a data unit, hex.
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Exports `tables` of `db` into `root/rel_dir`, keeping only rows inside
/// `range`. At most `concurrency` tables are in flight. Files come back in
/// table order.
pub async fn export_tables(
    engine: &Arc<dyn DataEngine>,
    db: &str,
    tables: &[TableSchema],
    range: &KeyRange,
    root: &Path,
    rel_dir: &str,
    concurrency: usize,
) -> Result<Vec<SnapshotFile>, AgentError> {
    let dir = root.join(rel_dir);
    tokio::fs::create_dir_all(&dir).await?;

    let exports: Vec<BoxFuture<'_, Result<SnapshotFile, AgentError>>> = tables
        .iter()
        .cloned()
        .map(|schema| {
            let engine = engine.clone();
            let dir = dir.clone();
            let range = range.clone();
            async move {
                let rows: Vec<Row> = engine
                    .read_rows(db, &schema.name)
                    .await?
                    .into_iter()
                    .filter(|r| range.contains(&r.key))
                    .collect();
                let count = rows.len();
                let data = tokio::task::spawn_blocking(move || encode_rows(&rows))
                    .await
                    .map_err(|e| AgentError::Data(format!("export task failed: {}", e)))??;
                let name = format!("{}{}", schema.name, DATA_SUFFIX);
                tokio::fs::write(dir.join(&name), &data).await?;
                debug!(table = %schema.name, rows = count, bytes = data.len(), "exported table");
                Ok::<_, AgentError>(SnapshotFile {
                    table: schema.name.clone(),
                    path: format!("{}/{}", rel_dir, name),
                    size: data.len() as u64,
                    hash: content_hash(&data),
                    rows: count,
                })
            }
            .boxed()
        })
        .collect();
    let mut files: Vec<SnapshotFile> = stream::iter(exports)
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;
    files.sort_by(|a, b| a.table.cmp(&b.table));
    Ok(files)
}
