//! Upload session driver
//!
//! One [`Session`] per process run. It owns the per-stream uploaders and the
//! checkpoint emitter, pulls events from the processor strictly in input
//! order, and guarantees a finalize-all pass before any error leaves
//! [`Session::run`].

use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointEmitter;
use crate::config::TargetConfig;
use crate::error::{Result, TargetError};
use crate::processor::{Event, EventStream, MessageProcessor};
use crate::store::ObjectStore;
use crate::transform::Row;
use crate::uploader::{BatchUploader, UploaderOptions};

/// Totals for a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub streams: usize,
    pub records: u64,
    pub parts: usize,
    pub checkpoints: u64,
}

pub struct Session<W> {
    config: TargetConfig,
    store: Arc<dyn ObjectStore>,
    options: UploaderOptions,
    uploaders: BTreeMap<String, BatchUploader>,
    checkpoints: CheckpointEmitter<W>,
    run_started: DateTime<Local>,
}

impl<W: Write> Session<W> {
    pub fn new(config: TargetConfig, store: Arc<dyn ObjectStore>, out: W) -> Self {
        Self {
            options: UploaderOptions::from_config(&config),
            config,
            store,
            uploaders: BTreeMap::new(),
            checkpoints: CheckpointEmitter::new(out),
            run_started: Local::now(),
        }
    }

    /// Fix the run time used in object keys
    pub fn with_run_started(mut self, run_started: DateTime<Local>) -> Self {
        self.run_started = run_started;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointEmitter<W> {
        &self.checkpoints
    }

    pub fn into_output(self) -> W {
        self.checkpoints.into_inner()
    }

    /// Consume `input` to the end and commit every stream's object
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<RunSummary> {
        let processor = MessageProcessor::from_config(&self.config);
        let mut events = EventStream::new(input, processor);

        if let Err(e) = self.drive(&mut events).await {
            error!("Stopping after line {}: {}", events.lines_read(), e);
            self.finalize_after_error().await;
            return Err(e);
        }

        self.complete_all().await?;
        self.checkpoints.release()?;

        let summary = self.summary();
        info!(
            "Loaded {} records from {} streams in {} parts; {} checkpoints emitted",
            summary.records, summary.streams, summary.parts, summary.checkpoints
        );
        Ok(summary)
    }

    async fn drive<R: AsyncBufRead + Unpin>(&mut self, events: &mut EventStream<R>) -> Result<()> {
        while let Some(event) = events.next_event().await? {
            match event {
                Event::Record { stream, row } => self.add_record(&stream, row).await?,
                Event::State(value) => self.hold_checkpoint(value),
            }
        }
        Ok(())
    }

    async fn add_record(&mut self, stream: &str, row: Row) -> Result<()> {
        let uploader = match self.uploaders.entry(stream.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let key = self.config.object_key(stream, &self.run_started);
                let uploader = BatchUploader::open(stream, &key, Arc::clone(&self.store), self.options).await?;
                entry.insert(uploader)
            },
        };

        let outcome = uploader.add(row).await?;
        if outcome.flushed {
            let uploaders = &self.uploaders;
            self.checkpoints
                .release_if_flushed(|s| uploaders.get(s).map_or(0, BatchUploader::flushed_rows))?;
        }
        Ok(())
    }

    fn hold_checkpoint(&mut self, value: Value) {
        info!("Received state from tap: {}", value);
        let watermark: HashMap<String, u64> = self
            .uploaders
            .iter()
            .map(|(stream, uploader)| (stream.clone(), uploader.total_rows()))
            .collect();
        self.checkpoints.hold(value, watermark);
    }

    /// Complete every uploader, returning the first failure after trying them all
    async fn complete_all(&mut self) -> Result<()> {
        let mut first_error: Option<TargetError> = None;

        for (stream, uploader) in self.uploaders.iter_mut() {
            if let Err(e) = uploader.complete().await {
                error!("Failed to finalize stream {}: {}", stream, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Best-effort unwind: flush and commit what was read, then emit the
    /// pending checkpoint only if every object was committed
    async fn finalize_after_error(&mut self) {
        match self.complete_all().await {
            Ok(()) => {
                if let Err(e) = self.checkpoints.release() {
                    error!("Failed to emit checkpoint: {}", e);
                }
            },
            Err(_) => {
                warn!("Some uploads were left open; run with --abort-open-uploads to clean them up");
            },
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            streams: self.uploaders.len(),
            records: self.uploaders.values().map(BatchUploader::total_rows).sum(),
            parts: self.uploaders.values().map(|u| u.parts().len()).sum(),
            checkpoints: self.checkpoints.emitted(),
        }
    }
}

/// Abort every multipart upload left open under `prefix`; returns how many were aborted
pub async fn abort_open_uploads(store: &dyn ObjectStore, prefix: &str) -> Result<usize> {
    let open = store.list_open_uploads(prefix).await?;
    warn!("Aborting {} open uploads under s3://{}/{}", open.len(), store.bucket(), prefix);

    for session in &open {
        store.abort(session).await?;
    }
    Ok(open.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn config(batch: usize) -> TargetConfig {
        TargetConfig {
            s3_bucket: Some("bucket".to_string()),
            upload_batch_record_count: batch,
            naming_convention: Some("{stream}.csv".to_string()),
            ..TargetConfig::default()
        }
    }

    const SCHEMA_T: &str = r#"{"type":"SCHEMA","stream":"t","schema":{"type":"object"},"key_properties":[]}"#;
    const SCHEMA_U: &str = r#"{"type":"SCHEMA","stream":"u","schema":{"type":"object"},"key_properties":[]}"#;

    fn record(stream: &str, a: i64) -> String {
        format!(r#"{{"type":"RECORD","stream":"{stream}","record":{{"a":{a}}}}}"#)
    }

    fn state(bookmark: i64) -> String {
        format!(r#"{{"type":"STATE","value":{{"bookmark":{bookmark}}}}}"#)
    }

    async fn run(store: &MemoryStore, batch: usize, lines: &[String]) -> (Result<RunSummary>, String) {
        let input = lines.join("\n");
        let mut session = Session::new(config(batch), Arc::new(store.clone()), Vec::new());
        let result = session.run(input.as_bytes()).await;
        (result, String::from_utf8(session.into_output()).unwrap())
    }

    #[tokio::test]
    async fn test_checkpoint_released_after_flush() {
        let store = MemoryStore::new("bucket");
        let lines = vec![
            SCHEMA_T.to_string(),
            record("t", 1),
            state(1),
            record("t", 2),
            record("t", 3),
        ];

        let (result, out) = run(&store, 2, &lines).await;

        let summary = result.unwrap();
        assert_eq!(summary.records, 3);
        assert_eq!(summary.parts, 2);
        assert_eq!(out, "{\"bookmark\":1}\n");
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_every_stream() {
        let store = MemoryStore::new("bucket");
        let lines = vec![
            SCHEMA_T.to_string(),
            SCHEMA_U.to_string(),
            record("u", 1),
            record("t", 1),
            state(1),
            // Flushes t, but u still holds a row read before the checkpoint
            record("t", 2),
        ];

        let store_handle = store.clone();
        let input = lines.join("\n");
        let mut session = Session::new(config(2), Arc::new(store_handle), Vec::new());
        session.drive_for_test(input.as_bytes()).await.unwrap();

        assert_eq!(store.pending_part_count("t.csv"), 1);
        assert_eq!(session.checkpoints().emitted(), 0);
        assert!(session.checkpoints().pending().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_emitted_once_at_shutdown() {
        let store = MemoryStore::new("bucket");
        let lines = vec![SCHEMA_T.to_string(), record("t", 1), state(1)];

        let (result, out) = run(&store, 10, &lines).await;

        assert_eq!(result.unwrap().checkpoints, 1);
        assert_eq!(out, "{\"bookmark\":1}\n");
    }

    #[tokio::test]
    async fn test_unknown_stream_finalizes_before_failing() {
        let store = MemoryStore::new("bucket");
        let lines = vec![SCHEMA_T.to_string(), record("t", 1), state(1), record("missing", 1)];

        let (result, out) = run(&store, 10, &lines).await;

        assert!(matches!(result, Err(TargetError::UnknownStream(_))));
        // Rows read before the failure are committed, and so is the checkpoint covering them
        assert_eq!(store.object("t.csv").unwrap(), b"a\r\n1\r\n");
        assert_eq!(out, "{\"bookmark\":1}\n");
    }

    #[tokio::test]
    async fn test_abort_open_uploads() {
        let store = MemoryStore::new("bucket");
        store.begin_chunked_upload("raw/a.csv").await.unwrap();
        store.begin_chunked_upload("raw/b.csv").await.unwrap();

        assert_eq!(abort_open_uploads(&store, "raw/").await.unwrap(), 2);
        assert_eq!(store.open_upload_count(), 0);
    }

    impl<W: Write> Session<W> {
        async fn drive_for_test(&mut self, input: &[u8]) -> Result<()> {
            let processor = MessageProcessor::from_config(&self.config);
            let mut events = EventStream::new(input, processor);
            self.drive(&mut events).await
        }
    }
}
