//! Distributed lock: short-lived named exclusion with owner token and
//! TTL, used to serialize processing per event.

mod distributed;
mod redis_lock;

pub use distributed::{DistributedLock, LockError, LockOptions};
pub use redis_lock::RedisLock;
