pub mod categorization;
pub mod crawls;
