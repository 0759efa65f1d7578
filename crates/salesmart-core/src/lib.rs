pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod loader;
pub mod pipeline;
pub mod poller;
pub mod report;
pub mod sink;
pub mod storage;
pub mod transform;
pub mod types;
