pub mod flow;
pub mod params;
pub mod source;

// Re-export common types
pub use flow::{FlatMap, IgnoreSink, Map};
pub use params::{gen_stream_task_params, StreamTaskParams};
pub use source::{Delivery, StreamSink, StreamSource};
