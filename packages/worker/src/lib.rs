// Scouter crawl worker - core library
//
// Coordinates long-running crawl jobs across a pool of worker processes, with
// PostgreSQL as the single source of truth for job state. Each worker claims one
// job at a time, supervises the crawl engine subprocess, and reconciles the
// final status. URL categorization rules live in domains/categorization.

pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
