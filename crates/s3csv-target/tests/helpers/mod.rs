//! Test helpers for s3csv-target integration tests
//!
//! Builders for protocol lines and a runner that drives a full session
//! against the in-memory store.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::{Local, TimeZone};
use s3csv_target::config::TargetConfig;
use s3csv_target::retry::{RetryPolicy, RetryingStore};
use s3csv_target::session::{RunSummary, Session};
use s3csv_target::store::MemoryStore;
use s3csv_target::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "test-bucket";

pub fn schema(stream: &str, schema: Value, key_properties: &[&str]) -> String {
    json!({
        "type": "SCHEMA",
        "stream": stream,
        "schema": schema,
        "key_properties": key_properties,
    })
    .to_string()
}

/// Schema accepting any object
pub fn open_schema(stream: &str) -> String {
    schema(stream, json!({"type": "object"}), &[])
}

pub fn record(stream: &str, record: Value) -> String {
    json!({"type": "RECORD", "stream": stream, "record": record}).to_string()
}

pub fn state(value: Value) -> String {
    json!({"type": "STATE", "value": value}).to_string()
}

pub fn config(batch: usize) -> TargetConfig {
    TargetConfig {
        s3_bucket: Some(BUCKET.to_string()),
        upload_batch_record_count: batch,
        ..TargetConfig::default()
    }
}

/// Object key a stream gets in runs started by [`run`]
pub fn key_for(config: &TargetConfig, stream: &str) -> String {
    config.object_key(stream, &run_started())
}

pub fn run_started() -> chrono::DateTime<Local> {
    Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
}

/// Outcome of one session run
pub struct Run {
    pub result: Result<RunSummary>,
    /// Everything written to the checkpoint output
    pub output: String,
}

impl Run {
    pub fn checkpoints(&self) -> Vec<Value> {
        self.output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

/// Run a session over `lines` with retries that never actually wait long
pub async fn run(store: &MemoryStore, config: TargetConfig, lines: &[String]) -> Run {
    let policy = RetryPolicy::new(
        config.retry_max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(4),
    );
    let store = RetryingStore::new(store.clone(), policy);

    let input = lines.join("\n");
    let mut session = Session::new(config, Arc::new(store), Vec::new()).with_run_started(run_started());
    let result = session.run(input.as_bytes()).await;

    Run {
        result,
        output: String::from_utf8(session.into_output()).unwrap(),
    }
}

/// Parse a committed object back into rows of strings
pub fn read_csv(body: &[u8], delimiter: u8, quote: u8) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(quote)
        .from_reader(body);

    let header = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}
