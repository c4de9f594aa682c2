//! s3csv Target Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads a tap's line-delimited message stream into S3 as delimited text,
//! one multipart-uploaded object per stream.
//!
//! # Pipeline
//!
//! - [`processor`]: decodes messages, keeps the [`schema`] registry, validates records
//! - [`transform`]: flattens records and handles the `_sdc_*` metadata columns
//! - [`uploader`]: buffers rows per stream and ships them as numbered parts
//! - [`checkpoint`]: releases STATE values only once their rows are uploaded
//! - [`session`]: drives all of the above for one run
//!
//! Storage goes through the [`store::ObjectStore`] trait, wrapped in
//! [`retry::RetryingStore`] for back-off on transient failures.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use s3csv_target::config::TargetConfig;
//! use s3csv_target::retry::RetryingStore;
//! use s3csv_target::session::Session;
//! use s3csv_target::store::S3Store;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TargetConfig::from_file("config.json")?.with_env();
//!     config.ensure_valid()?;
//!
//!     let store = RetryingStore::new(S3Store::from_config(&config).await, config.retry_policy());
//!     let mut session = Session::new(config, Arc::new(store), std::io::stdout());
//!     session.run(tokio::io::BufReader::new(tokio::io::stdin())).await?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod encode;
pub mod error;
pub mod processor;
pub mod retry;
pub mod schema;
pub mod session;
pub mod store;
pub mod transform;
pub mod uploader;

pub use error::{Result, StoreError, TargetError};
