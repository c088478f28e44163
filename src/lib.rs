//! Remote backup pipeline
//!
//! Collects files, directories and database dumps into one password
//! protected 7z archive and ships it to FTP servers, object stores, S3
//! buckets or local directories, purging copies older than the retention
//! window on each of them.

// remotebackup/src/lib.rs
pub mod backup;
pub mod config;
pub mod errors;
pub mod remote;
pub mod utils;
