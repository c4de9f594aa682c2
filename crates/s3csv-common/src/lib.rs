//! s3csv Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every s3csv workspace member:
//!
//! - **Logging**: `tracing` subscriber setup that never writes to stdout
//! - **Error Handling**: the common error and result types
//! - **Types**: the line-delimited protocol messages read from a tap
//!
//! # Example
//!
//! ```no_run
//! use s3csv_common::types::Message;
//! use s3csv_common::Result;
//!
//! fn stream_of(line: &str) -> Result<Option<String>> {
//!     Ok(match Message::parse(line)? {
//!         Message::Record(record) => Some(record.stream),
//!         _ => None,
//!     })
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
