//! Proxy mode: forward cache operations to an external Redis

mod client;

pub use client::RedisCacheStore;
