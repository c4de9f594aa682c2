//! Checkpoint emitter
//!
//! Holds the latest STATE value until the rows read before it are in
//! uploaded parts. A newer checkpoint supersedes a pending one. Released
//! values are written to the output as one JSON line each and flushed.

use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
struct PendingCheckpoint {
    value: Value,
    /// Rows each stream had received when the checkpoint was read
    watermark: HashMap<String, u64>,
}

pub struct CheckpointEmitter<W> {
    out: W,
    pending: Option<PendingCheckpoint>,
    emitted: u64,
}

impl<W: Write> CheckpointEmitter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            pending: None,
            emitted: 0,
        }
    }

    /// Hold `value` until every stream in `watermark` has flushed that many rows
    pub fn hold(&mut self, value: Value, watermark: HashMap<String, u64>) {
        if self.pending.is_some() {
            debug!("Superseding pending checkpoint");
        }
        self.pending = Some(PendingCheckpoint { value, watermark });
    }

    pub fn pending(&self) -> Option<&Value> {
        self.pending.as_ref().map(|p| &p.value)
    }

    /// Emit the pending checkpoint if `flushed_rows` covers its watermark
    pub fn release_if_flushed<F>(&mut self, flushed_rows: F) -> Result<bool>
    where
        F: Fn(&str) -> u64,
    {
        let covered = match &self.pending {
            Some(pending) => pending
                .watermark
                .iter()
                .all(|(stream, rows)| flushed_rows(stream) >= *rows),
            None => false,
        };

        if covered {
            self.release()
        } else {
            Ok(false)
        }
    }

    /// Emit the pending checkpoint, if any, unconditionally
    pub fn release(&mut self) -> Result<bool> {
        let Some(pending) = self.pending.take() else {
            return Ok(false);
        };

        let line = serde_json::to_string(&pending.value)?;
        debug!("Emitting state {}", line);
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        self.emitted += 1;
        Ok(true)
    }

    /// Number of checkpoints written so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
