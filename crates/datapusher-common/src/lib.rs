//! Datapusher Common Library
//!
//! Shared utilities for the datapusher workspace.
//!
//! - **Error Handling**: `CommonError` and its result alias
//! - **Checksums**: content hashing for downloaded source files
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use datapusher_common::checksum::{compute_checksum, ChecksumAlgorithm};
//!
//! fn hash_file(path: &str) -> datapusher_common::Result<String> {
//!     let mut file = std::fs::File::open(path)?;
//!     compute_checksum(&mut file, ChecksumAlgorithm::Md5)
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
