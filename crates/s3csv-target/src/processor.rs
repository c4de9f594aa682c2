//! Message stream processor
//!
//! Classifies each input line and turns it into at most one [`Event`]:
//!
//! | message            | effect                                      |
//! |--------------------|---------------------------------------------|
//! | `SCHEMA`           | registers the stream's schema, no event      |
//! | `RECORD`           | validated, transformed, [`Event::Record`]    |
//! | `STATE`            | [`Event::State`]                             |
//! | `ACTIVATE_VERSION` | ignored                                      |
//! | anything else      | logged and ignored                           |

use chrono::{DateTime, Utc};
use s3csv_common::error::truncate_line;
use s3csv_common::types::{Message, RecordMessage, SchemaMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, warn};

use crate::config::TargetConfig;
use crate::error::{Result, TargetError};
use crate::schema::{SchemaRegistry, ValidationFailure};
use crate::transform::{self, extend_schema_with_metadata, RecordContext, Row, TransformOptions};

/// What happens to a record that does not match its schema
///
/// Over-precise `multipleOf` failures are fatal under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Log the mismatch and pass the record through
    #[default]
    Warn,
    /// Fail the run
    Reject,
}

/// Normalized output of the processor
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Record { stream: String, row: Row },
    State(Value),
}

pub struct MessageProcessor {
    registry: SchemaRegistry,
    transform: TransformOptions,
    policy: ValidationPolicy,
}

impl MessageProcessor {
    pub fn new(transform: TransformOptions, policy: ValidationPolicy) -> Self {
        Self {
            registry: SchemaRegistry::new(),
            transform,
            policy,
        }
    }

    pub fn from_config(config: &TargetConfig) -> Self {
        Self::new(
            TransformOptions {
                add_metadata_columns: config.add_metadata_columns,
                array_strategy: config.array_strategy,
            },
            config.validation_policy,
        )
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Process one input line, stamping records with the current time
    pub fn process(&mut self, line: &str) -> Result<Option<Event>> {
        self.process_at(line, Utc::now())
    }

    pub fn process_at(&mut self, line: &str, received_at: DateTime<Utc>) -> Result<Option<Event>> {
        match Message::parse(line)? {
            Message::Schema(message) => {
                self.register(message)?;
                Ok(None)
            },
            Message::Record(message) => self.record(message, received_at).map(Some),
            Message::State(message) => Ok(Some(Event::State(message.value))),
            Message::ActivateVersion(message) => {
                debug!(stream = %message.stream, version = message.version, "Ignoring ACTIVATE_VERSION");
                Ok(None)
            },
            Message::Unknown { message_type, .. } => {
                warn!("Unknown message type {} in message {}", message_type, truncate_line(line));
                Ok(None)
            },
        }
    }

    fn register(&mut self, message: SchemaMessage) -> Result<()> {
        let schema = if self.transform.add_metadata_columns {
            extend_schema_with_metadata(&message.schema)
        } else {
            message.schema
        };
        self.registry.register(&message.stream, schema, message.key_properties)
    }

    fn record(&self, message: RecordMessage, received_at: DateTime<Utc>) -> Result<Event> {
        let stream_schema = self
            .registry
            .get(&message.stream)
            .ok_or_else(|| TargetError::UnknownStream(message.stream.clone()))?;

        let record = Value::Object(message.record);
        let failures = stream_schema.validate(&record);
        self.check(&message.stream, &failures)?;

        let Value::Object(record) = record else {
            return Err(TargetError::validation(&message.stream, "record is not an object"));
        };

        let context = RecordContext {
            key_properties: &stream_schema.key_properties,
            version: message.version,
            time_extracted: message.time_extracted.as_deref(),
            received_at,
        };
        let row = transform::transform(record, &context, &self.transform);

        Ok(Event::Record {
            stream: message.stream,
            row,
        })
    }

    fn check(&self, stream: &str, failures: &[ValidationFailure]) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }

        if let Some(failure) = failures.iter().find(|f| f.precision) {
            return Err(TargetError::validation(
                stream,
                format!(
                    "'multipleOf' validations that allow long precisions are not supported \
                     (15 digits or more). Try removing 'multipleOf' from the JSON schema. ({})",
                    failure.message
                ),
            ));
        }

        let summary = failures
            .iter()
            .map(|f| format!("{} at '{}'", f.message, f.path))
            .collect::<Vec<_>>()
            .join("; ");

        match self.policy {
            ValidationPolicy::Reject => Err(TargetError::validation(stream, summary)),
            ValidationPolicy::Warn => {
                warn!(stream, failures = failures.len(), "Record does not match schema: {}", summary);
                Ok(())
            },
        }
    }
}

/// Lazy, single-pass [`Event`] sequence over a line-oriented reader
pub struct EventStream<R> {
    lines: Lines<R>,
    processor: MessageProcessor,
    line_number: u64,
}

impl<R: AsyncBufRead + Unpin> EventStream<R> {
    pub fn new(reader: R, processor: MessageProcessor) -> Self {
        Self {
            lines: reader.lines(),
            processor,
            line_number: 0,
        }
    }

    /// Next event, or `None` once the input is exhausted
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            if let Some(event) = self.processor.process(&line)? {
                return Ok(Some(event));
            }
        }
        debug!(lines = self.line_number, "Input exhausted");
        Ok(None)
    }

    pub fn lines_read(&self) -> u64 {
        self.line_number
    }
}
