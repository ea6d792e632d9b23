//! Crawls domain - projects and the crawl rows the engine writes into
//!
//! The worker only touches crawl metadata: the status shown to users and the
//! per-crawl partitions. Page, link and HTML rows belong to the engine.

pub mod models;

pub use models::*;
