//! Redis Streams transport: at-least-once competitive delivery of
//! workflow events to workers via consumer groups.

mod client;
mod redis_client;

pub use client::{StreamClient, StreamError, StreamMessage};
pub use redis_client::RedisStreamClient;
