pub mod crawl;
pub mod project;

pub use crawl::*;
pub use project::*;
