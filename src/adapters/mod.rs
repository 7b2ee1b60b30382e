// Adapters layer: concrete implementations of the domain ports for external systems.

pub mod cache;
#[cfg(test)]
pub(crate) mod mock;
pub mod openrouter;

pub use cache::{CacheEntry, CacheInfo, ResponseCache};
pub use openrouter::OpenRouterClient;
