//! Per-stream batch uploader
//!
//! Rows are buffered in memory and shipped as numbered parts of one multipart
//! upload. Lifecycle:
//!
//! ```text
//! Open -> Accumulating -> (Uploading -> Accumulating)* -> Finalizing -> Closed
//! ```
//!
//! Only the first part carries the header row, so concatenating the parts in
//! order yields one well-formed delimited file.

use byte_unit::{Byte, UnitType};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::TargetConfig;
use crate::encode::{CsvEncoder, HeaderPolicy};
use crate::error::{Result, TargetError};
use crate::store::{ObjectStore, Part, UploadSession};
use crate::transform::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderState {
    /// Upload session created, no rows yet
    Open,
    Accumulating,
    /// A part upload is in flight
    Uploading,
    Finalizing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct UploaderOptions {
    /// Rows buffered before a part is uploaded
    pub batch_size: usize,
    pub header_policy: HeaderPolicy,
    pub encoder: CsvEncoder,
}

impl UploaderOptions {
    pub fn from_config(config: &TargetConfig) -> Self {
        Self {
            batch_size: config.upload_batch_record_count,
            header_policy: config.header_policy,
            encoder: CsvEncoder::new(config.delimiter_byte(), config.quote_byte()),
        }
    }
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_UPLOAD_BATCH_RECORD_COUNT,
            header_policy: HeaderPolicy::default(),
            encoder: CsvEncoder::default(),
        }
    }
}

/// Result of [`BatchUploader::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddOutcome {
    /// A part was uploaded as a consequence of this row
    pub flushed: bool,
    /// Rows in that part, 0 when nothing was flushed
    pub rows: usize,
}

pub struct BatchUploader {
    stream: String,
    store: Arc<dyn ObjectStore>,
    session: UploadSession,
    options: UploaderOptions,
    state: UploaderState,
    buffer: Vec<Row>,
    parts: Vec<Part>,
    /// Header fixed at the first flush under [`HeaderPolicy::Union`]
    columns: Option<Vec<String>>,
    total_rows: u64,
    flushed_rows: u64,
    total_bytes: u64,
}

impl BatchUploader {
    /// Begin the multipart upload for `key`
    pub async fn open(
        stream: impl Into<String>,
        key: &str,
        store: Arc<dyn ObjectStore>,
        options: UploaderOptions,
    ) -> Result<Self> {
        let stream = stream.into();
        let session = store.begin_chunked_upload(key).await?;

        info!(
            "Opened upload of stream {} to s3://{}/{}",
            stream,
            store.bucket(),
            session.key
        );

        Ok(Self {
            stream,
            store,
            session,
            options: UploaderOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            state: UploaderState::Open,
            buffer: Vec::new(),
            parts: Vec::new(),
            columns: None,
            total_rows: 0,
            flushed_rows: 0,
            total_bytes: 0,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn key(&self) -> &str {
        &self.session.key
    }

    pub fn state(&self) -> UploaderState {
        self.state
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Rows accepted by [`Self::add`]
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Rows already shipped in uploaded parts
    pub fn flushed_rows(&self) -> u64 {
        self.flushed_rows
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer a row, uploading a part once the batch is full
    pub async fn add(&mut self, row: Row) -> Result<AddOutcome> {
        match self.state {
            UploaderState::Finalizing | UploaderState::Closed => {
                return Err(TargetError::UploaderClosed(self.stream.clone()));
            },
            UploaderState::Open => self.state = UploaderState::Accumulating,
            UploaderState::Accumulating | UploaderState::Uploading => {},
        }

        self.buffer.push(row);
        self.total_rows += 1;

        if self.buffer.len() >= self.options.batch_size {
            let rows = self.flush().await?;
            return Ok(AddOutcome { flushed: rows > 0, rows });
        }

        Ok(AddOutcome::default())
    }

    /// Upload the buffered rows as the next part; returns the number of rows shipped
    ///
    /// On failure the rows stay buffered.
    #[instrument(skip(self), fields(stream = %self.stream))]
    pub async fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            warn!("Nothing to upload for stream {}", self.stream);
            return Ok(0);
        }

        let part_number = self.parts.len() as u32 + 1;
        let columns = match self.options.header_policy {
            HeaderPolicy::FirstRow => HeaderPolicy::FirstRow.columns(&self.buffer),
            HeaderPolicy::Union => self
                .columns
                .get_or_insert_with(|| HeaderPolicy::Union.columns(&self.buffer))
                .clone(),
        };

        let batch = self
            .options
            .encoder
            .encode(&columns, &self.buffer, part_number == 1)
            .map_err(|source| TargetError::Encode {
                stream: self.stream.clone(),
                source,
            })?;

        if !batch.dropped_columns.is_empty() {
            warn!(
                "Part {} of stream {}: columns not in the header are left out: {}",
                part_number,
                self.stream,
                batch.dropped_columns.join(", ")
            );
        }

        let rows = self.buffer.len();
        let size = batch.bytes.len() as u64;
        info!(
            "Uploading part {} of stream {}; {} records, {:.1} (total so far: {} records, {:.1})",
            part_number,
            self.stream,
            rows,
            Byte::from_u64(size).get_appropriate_unit(UnitType::Binary),
            self.total_rows,
            Byte::from_u64(self.total_bytes + size).get_appropriate_unit(UnitType::Binary)
        );

        let previous = self.state;
        self.state = UploaderState::Uploading;
        let started = Instant::now();
        let uploaded = self
            .store
            .upload_chunk(&self.session, part_number, &batch.bytes)
            .await;
        self.state = previous;
        let tag = uploaded?;

        info!("Uploaded part {} in {:.2?}", part_number, started.elapsed());

        self.parts.push(Part {
            number: part_number,
            tag,
        });
        self.buffer.clear();
        self.flushed_rows += rows as u64;
        self.total_bytes += size;

        Ok(rows)
    }

    /// Flush what is left and commit the parts as one object
    ///
    /// Calling it again after success does nothing. With no rows at all the
    /// upload is aborted instead, since an object needs at least one part.
    pub async fn complete(&mut self) -> Result<()> {
        if self.state == UploaderState::Closed {
            return Ok(());
        }

        self.state = UploaderState::Finalizing;
        self.flush().await?;

        if self.parts.is_empty() {
            debug!("No rows for stream {}; aborting upload", self.stream);
            self.store.abort(&self.session).await?;
        } else {
            self.store.complete(&self.session, &self.parts).await?;
            info!(
                "Completed s3://{}/{} ({} parts, {} records)",
                self.store.bucket(),
                self.session.key,
                self.parts.len(),
                self.flushed_rows
            );
        }

        self.state = UploaderState::Closed;
        Ok(())
    }

    /// Discard the upload and any buffered rows
    pub async fn abort(&mut self) -> Result<()> {
        if self.state == UploaderState::Closed {
            return Ok(());
        }

        self.store.abort(&self.session).await?;
        warn!(
            "Aborted upload of stream {} ({} buffered records discarded)",
            self.stream,
            self.buffer.len()
        );
        self.buffer.clear();
        self.state = UploaderState::Closed;
        Ok(())
    }
}
