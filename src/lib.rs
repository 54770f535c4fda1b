//! pgarchive - archive date-partitioned PostgreSQL tables to S3-compatible
//! object storage, and restore them.
//!
//! The archive pipeline discovers partition tables inside a date window,
//! streams their rows into a serialized and compressed file, and uploads it
//! with content-addressed skip detection backed by a persistent metadata
//! cache, so re-running over the same window costs one HEAD per partition.
//! The restore pipeline is the inverse: list, download, decode, create
//! targets, insert idempotently.

pub mod cache;
pub mod commands;
pub mod compress;
pub mod config;
pub mod etag;
pub mod format;
pub mod log_format;
pub mod pathgen;
pub mod processor;
pub mod restore;
pub mod rowset;
pub mod scheduler;
pub mod source;
pub mod storage;
