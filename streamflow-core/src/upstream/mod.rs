pub mod cache;
pub mod client;

pub use cache::DataCache;
pub use client::{UpstreamApi, UpstreamClient};

#[cfg(test)]
pub use client::MockUpstreamApi;
