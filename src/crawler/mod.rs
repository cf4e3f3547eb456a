pub mod controller;
pub mod pages;
pub mod processor;
pub mod registry;
pub mod remote;
pub mod task;

// Re-export common types
pub use controller::PipelineController;
pub use processor::{DefaultTaskProcessor, TaskProcessor};
pub use registry::{CrawlerRegistry, ProcessorRegistry};
pub use remote::RemoteSiteCrawler;
