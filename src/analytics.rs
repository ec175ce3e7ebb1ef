//! Columnar OHLCV history store.
//!
//! One Parquet file per (exchange, symbol, interval) under the analytics
//! directory. The store is independent of the primary SQLite database,
//! opened lazily on first use, and never participates in its transactions.
//! File IO runs on the blocking pool.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::error::{CoreError, CoreResult};
use crate::types::HistoricalBar;

pub struct OhlcvStore {
    dir: PathBuf,
}

impl OhlcvStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Merge `bars` into the series, deduplicating on bar timestamp
    /// (latest write wins). Returns the series length after the merge.
    pub async fn append_bars(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        bars: Vec<HistoricalBar>,
    ) -> CoreResult<usize> {
        let path = self.series_path(exchange, symbol, interval);
        tokio::task::spawn_blocking(move || {
            let mut existing = if path.exists() {
                read_series(&path)?
            } else {
                Vec::new()
            };
            existing.retain(|bar| !bars.iter().any(|b| b.timestamp == bar.timestamp));
            existing.extend(bars);
            existing.sort_by_key(|bar| bar.timestamp);
            write_series(&path, &existing)?;
            Ok(existing.len())
        })
        .await
        .map_err(|e| CoreError::internal(format!("analytics write task: {e}")))?
    }

    /// Bars in `[from, to]` (epoch millis), ascending. An unknown series
    /// is an empty result, not an error.
    pub async fn query_bars(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> CoreResult<Vec<HistoricalBar>> {
        let path = self.series_path(exchange, symbol, interval);
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(Vec::new());
            }
            let mut bars = read_series(&path)?;
            bars.retain(|bar| bar.timestamp >= from && bar.timestamp <= to);
            Ok(bars)
        })
        .await
        .map_err(|e| CoreError::internal(format!("analytics read task: {e}")))?
    }

    fn series_path(&self, exchange: &str, symbol: &str, interval: &str) -> PathBuf {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect()
        };
        self.dir.join(format!(
            "{}_{}_{}.parquet",
            sanitize(exchange),
            sanitize(symbol),
            sanitize(interval)
        ))
    }
}

fn bar_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Int64, false),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Int64, false),
    ]))
}

fn write_series(path: &Path, bars: &[HistoricalBar]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CoreError::internal(format!("create {parent:?}: {e}")))?;
    }
    let schema = bar_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from_iter_values(bars.iter().map(|b| b.timestamp))),
            Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.open))),
            Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.high))),
            Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.low))),
            Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.close))),
            Arc::new(Int64Array::from_iter_values(bars.iter().map(|b| b.volume))),
        ],
    )
    .map_err(|e| CoreError::internal(format!("build record batch: {e}")))?;

    let file = File::create(path)
        .map_err(|e| CoreError::internal(format!("create {path:?}: {e}")))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)
        .map_err(|e| CoreError::internal(format!("open parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| CoreError::internal(format!("write parquet: {e}")))?;
    writer
        .close()
        .map_err(|e| CoreError::internal(format!("close parquet: {e}")))?;
    Ok(())
}

fn read_series(path: &Path) -> CoreResult<Vec<HistoricalBar>> {
    let file = File::open(path)
        .map_err(|e| CoreError::internal(format!("open {path:?}: {e}")))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| CoreError::internal(format!("open parquet reader: {e}")))?
        .build()
        .map_err(|e| CoreError::internal(format!("build parquet reader: {e}")))?;

    let mut bars = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| CoreError::internal(format!("read parquet: {e}")))?;
        let col = |i: usize| batch.column(i);
        let timestamps = downcast_i64(col(0), "timestamp")?;
        let opens = downcast_f64(col(1), "open")?;
        let highs = downcast_f64(col(2), "high")?;
        let lows = downcast_f64(col(3), "low")?;
        let closes = downcast_f64(col(4), "close")?;
        let volumes = downcast_i64(col(5), "volume")?;
        for i in 0..batch.num_rows() {
            bars.push(HistoricalBar {
                timestamp: timestamps.value(i),
                open: opens.value(i),
                high: highs.value(i),
                low: lows.value(i),
                close: closes.value(i),
                volume: volumes.value(i),
            });
        }
    }
    Ok(bars)
}

fn downcast_i64<'a>(array: &'a dyn Array, name: &str) -> CoreResult<&'a Int64Array> {
    array
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| CoreError::internal(format!("column {name} is not int64")))
}

fn downcast_f64<'a>(array: &'a dyn Array, name: &str) -> CoreResult<&'a Float64Array> {
    array
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| CoreError::internal(format!("column {name} is not float64")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> HistoricalBar {
        HistoricalBar {
            timestamp: ts,
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000,
        }
    }

    #[tokio::test]
    async fn test_append_and_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = OhlcvStore::new(dir.path().to_path_buf());

        let n = store
            .append_bars("NSE", "RELIANCE", "5m", vec![bar(1000, 10.0), bar(2000, 11.0)])
            .await
            .unwrap();
        assert_eq!(n, 2);

        let bars = store
            .query_bars("NSE", "RELIANCE", "5m", 0, 10_000)
            .await
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 1000);
        assert_eq!(bars[1].close, 11.0);
    }

    #[tokio::test]
    async fn test_append_deduplicates_on_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = OhlcvStore::new(dir.path().to_path_buf());

        store
            .append_bars("NSE", "TCS", "1d", vec![bar(1000, 10.0)])
            .await
            .unwrap();
        let n = store
            .append_bars("NSE", "TCS", "1d", vec![bar(1000, 12.0), bar(2000, 13.0)])
            .await
            .unwrap();
        assert_eq!(n, 2);

        let bars = store.query_bars("NSE", "TCS", "1d", 0, 10_000).await.unwrap();
        assert_eq!(bars[0].close, 12.0, "latest write wins");
    }

    #[tokio::test]
    async fn test_query_range_filter_and_missing_series() {
        let dir = tempfile::tempdir().unwrap();
        let store = OhlcvStore::new(dir.path().to_path_buf());

        assert!(store
            .query_bars("NSE", "UNKNOWN", "5m", 0, 10)
            .await
            .unwrap()
            .is_empty());

        store
            .append_bars(
                "NSE",
                "INFY",
                "5m",
                vec![bar(1000, 1.0), bar(2000, 2.0), bar(3000, 3.0)],
            )
            .await
            .unwrap();
        let bars = store.query_bars("NSE", "INFY", "5m", 1500, 2500).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].timestamp, 2000);
    }
}
