//! Categorization domain - assigns crawled URLs to user-defined categories
//!
//! - `rules` - Rule documents (ordered YAML) and their typed form
//! - `matcher` - Compiled rule sets, URL classification
//! - `apply` - Writing categories and page assignments for stored crawls

pub mod apply;
pub mod matcher;
pub mod rules;

pub use apply::{batch_categorize_project, categorize_crawl, BatchReport, CategorizationReport};
pub use matcher::{Category, InvalidPattern, Matcher, UNCATEGORIZED};
pub use rules::{CategoryRule, RuleError, RuleSet, SkippedRule, DEFAULT_COLOR};
