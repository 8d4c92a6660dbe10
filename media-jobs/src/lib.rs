//! media-jobs library crate.
//!
//! A bounded, retrying job execution core for media downloads: a worker pool
//! with per-attempt timeouts, a batch coordinator reporting aggregated
//! status, TTL caches for skipping repeated work, and a memory monitor that
//! reclaims temp files and cache entries under pressure.

pub mod cache;
pub mod config;
pub mod downloads;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod monitor;
pub mod services;
pub mod utils;

pub use error::{Error, JobError, Result, WorkError};
