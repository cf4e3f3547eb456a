pub mod cache;
pub mod queue;
pub mod tasks;

// Re-export common types
pub use cache::RedisCache;
pub use queue::RedisStreamBus;
pub use tasks::MongoTaskStore;
