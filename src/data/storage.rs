//! Output sinks for run records.
//!
//! - [`CsvSink`] (feature `storage_csv`): streams rows, flushing after each so a
//!   killed run keeps everything sampled so far.
//! - [`ArrowSink`] (feature `storage_arrow`): buffers rows and writes one Arrow
//!   IPC record batch on [`RecordSink::finish`].
//! - [`ParquetSink`] (feature `storage_parquet`): same buffering, written as a
//!   ZSTD-compressed Parquet file.
//! - [`MemorySink`]: keeps rows in memory.
//!
//! [`open_sink`] picks one from the output file extension.

use super::record::{OutputRecord, FIELDS};
use crate::error::DaqError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Destination for output records.
#[async_trait]
pub trait RecordSink: Send {
    /// Append one record.
    async fn append(&mut self, record: &OutputRecord) -> Result<(), DaqError>;

    /// Flush and close. Calling it twice is harmless.
    async fn finish(&mut self) -> Result<(), DaqError>;
}

/// Output format chosen for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    /// Row-oriented text.
    Csv,
    /// Arrow IPC file.
    Arrow,
    /// Parquet file.
    Parquet,
}

impl SinkFormat {
    /// `.arrow`, `.ipc` and `.feather` are Arrow IPC, `.parquet` and `.pq`
    /// are Parquet; everything else is CSV.
    pub fn for_path(path: &Path) -> Result<Self, DaqError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "arrow" | "ipc" | "feather" => Ok(SinkFormat::Arrow),
            "parquet" | "pq" => Ok(SinkFormat::Parquet),
            _ => Ok(SinkFormat::Csv),
        }
    }
}

/// Open the sink matching `path`'s extension.
pub fn open_sink(path: &Path) -> Result<Box<dyn RecordSink>, DaqError> {
    match SinkFormat::for_path(path)? {
        SinkFormat::Arrow => {
            #[cfg(feature = "storage_arrow")]
            {
                Ok(Box::new(ArrowSink::create(path)?))
            }
            #[cfg(not(feature = "storage_arrow"))]
            {
                Err(DaqError::FeatureNotEnabled("storage_arrow".to_string()))
            }
        }
        SinkFormat::Parquet => {
            #[cfg(feature = "storage_parquet")]
            {
                Ok(Box::new(ParquetSink::create(path)?))
            }
            #[cfg(not(feature = "storage_parquet"))]
            {
                Err(DaqError::FeatureNotEnabled("storage_parquet".to_string()))
            }
        }
        SinkFormat::Csv => {
            #[cfg(feature = "storage_csv")]
            {
                Ok(Box::new(CsvSink::create(path)?))
            }
            #[cfg(not(feature = "storage_csv"))]
            {
                Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
            }
        }
    }
}

fn create_output_file(path: &Path) -> Result<std::fs::File, DaqError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DaqError::Storage(e.to_string()))?;
    }
    std::fs::File::create(path)
        .map_err(|e| DaqError::Storage(format!("Failed to create {}: {}", path.display(), e)))
}

/// Streaming CSV writer.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<std::fs::File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Create `path` and write the header row.
    pub fn create(path: &Path) -> Result<Self, DaqError> {
        let file = create_output_file(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .write_record(FIELDS)
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        writer.flush().map_err(|e| DaqError::Storage(e.to_string()))?;
        tracing::debug!(path = %path.display(), "CSV output opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl RecordSink for CsvSink {
    async fn append(&mut self, record: &OutputRecord) -> Result<(), DaqError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage(format!("{} already closed", self.path.display())))?;
        writer
            .serialize(record)
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        writer.flush().map_err(|e| DaqError::Storage(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| DaqError::Storage(e.to_string()))?;
            tracing::info!(path = %self.path.display(), "CSV output closed");
        }
        Ok(())
    }
}

/// Buffered Arrow IPC writer.
#[cfg(feature = "storage_arrow")]
pub struct ArrowSink {
    path: PathBuf,
    file: Option<std::fs::File>,
    rows: Vec<OutputRecord>,
}

#[cfg(feature = "storage_arrow")]
impl ArrowSink {
    /// Create `path` now so an unwritable destination fails before the run.
    pub fn create(path: &Path) -> Result<Self, DaqError> {
        let file = create_output_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            rows: Vec::new(),
        })
    }

    /// Schema shared by every columnar file.
    pub fn schema() -> arrow::datatypes::Schema {
        record_schema()
    }
}

/// Nullable Float64 columns in [`FIELDS`] order, `ens_ok` Boolean.
#[cfg(any(feature = "storage_arrow", feature = "storage_parquet"))]
fn record_schema() -> arrow::datatypes::Schema {
    use arrow::datatypes::{DataType, Field, Schema};

    Schema::new(
        FIELDS
            .iter()
            .map(|name| {
                let data_type = if *name == "ens_ok" {
                    DataType::Boolean
                } else {
                    DataType::Float64
                };
                Field::new(*name, data_type, true)
            })
            .collect::<Vec<_>>(),
    )
}

#[cfg(any(feature = "storage_arrow", feature = "storage_parquet"))]
fn record_batch(rows: &[OutputRecord]) -> Result<arrow::record_batch::RecordBatch, DaqError> {
    use arrow::array::{ArrayRef, BooleanArray, Float64Array};

    let values: Vec<[Option<f64>; 9]> = rows.iter().map(|r| r.numeric_values()).collect();
    let mut columns: Vec<ArrayRef> = (0..9)
        .map(|i| {
            let column: Vec<Option<f64>> = values.iter().map(|v| v[i]).collect();
            Arc::new(Float64Array::from(column)) as ArrayRef
        })
        .collect();
    columns.push(Arc::new(BooleanArray::from(
        rows.iter().map(|r| r.ens_ok).collect::<Vec<_>>(),
    )));

    arrow::record_batch::RecordBatch::try_new(Arc::new(record_schema()), columns)
        .map_err(|e| DaqError::Storage(e.to_string()))
}

#[cfg(feature = "storage_arrow")]
#[async_trait]
impl RecordSink for ArrowSink {
    async fn append(&mut self, record: &OutputRecord) -> Result<(), DaqError> {
        if self.file.is_none() {
            return Err(DaqError::Storage(format!("{} already closed", self.path.display())));
        }
        self.rows.push(record.clone());
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        use arrow::ipc::writer::FileWriter;

        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let batch = record_batch(&self.rows)?;
        let mut writer = FileWriter::try_new(file, &batch.schema())
            .map_err(|e| DaqError::Storage(format!("Failed to create Arrow IPC writer: {}", e)))?;
        writer
            .write(&batch)
            .map_err(|e| DaqError::Storage(format!("Failed to write Arrow batch: {}", e)))?;
        writer
            .finish()
            .map_err(|e| DaqError::Storage(format!("Failed to finish Arrow writer: {}", e)))?;
        tracing::info!(path = %self.path.display(), rows = self.rows.len(), "Arrow output written");
        Ok(())
    }
}

/// Buffered Parquet writer, ZSTD-compressed.
#[cfg(feature = "storage_parquet")]
pub struct ParquetSink {
    path: PathBuf,
    file: Option<std::fs::File>,
    rows: Vec<OutputRecord>,
}

#[cfg(feature = "storage_parquet")]
impl ParquetSink {
    /// Create `path` now so an unwritable destination fails before the run.
    pub fn create(path: &Path) -> Result<Self, DaqError> {
        let file = create_output_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            rows: Vec::new(),
        })
    }
}

#[cfg(feature = "storage_parquet")]
#[async_trait]
impl RecordSink for ParquetSink {
    async fn append(&mut self, record: &OutputRecord) -> Result<(), DaqError> {
        if self.file.is_none() {
            return Err(DaqError::Storage(format!("{} already closed", self.path.display())));
        }
        self.rows.push(record.clone());
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        use parquet::arrow::ArrowWriter;
        use parquet::basic::{Compression, ZstdLevel};
        use parquet::file::properties::WriterProperties;

        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let batch = record_batch(&self.rows)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .map_err(|e| DaqError::Storage(format!("Failed to create Parquet writer: {}", e)))?;
        writer
            .write(&batch)
            .map_err(|e| DaqError::Storage(format!("Failed to write Parquet batch: {}", e)))?;
        writer
            .close()
            .map_err(|e| DaqError::Storage(format!("Failed to finish Parquet writer: {}", e)))?;
        tracing::info!(
            path = %self.path.display(),
            rows = self.rows.len(),
            "Parquet output written"
        );
        Ok(())
    }
}

/// In-memory sink. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<OutputRecord>>>,
    finished: Arc<Mutex<bool>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far.
    pub fn records(&self) -> Vec<OutputRecord> {
        match self.rows.lock() {
            Ok(rows) => rows.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether `finish` was called.
    pub fn is_finished(&self) -> bool {
        self.finished.lock().map(|f| *f).unwrap_or(false)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append(&mut self, record: &OutputRecord) -> Result<(), DaqError> {
        self.rows
            .lock()
            .map_err(|_| DaqError::Storage("memory sink poisoned".into()))?
            .push(record.clone());
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        if let Ok(mut finished) = self.finished.lock() {
            *finished = true;
        }
        Ok(())
    }
}
