pub mod db;
pub mod jobs;
pub mod partitions;
pub mod supervisor;
