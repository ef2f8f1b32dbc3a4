//! Page configuration cache and loader.
//!
//! The [`ConfigLoader`](loader::ConfigLoader) is the public entry point. It serves page
//! configurations out of a [`CacheStore`](caching::CacheStore), revalidates them against a
//! [`ConfigSource`](fetch::ConfigSource) using ETags, and collapses concurrent requests for the
//! same resource into a single upstream fetch.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fetch;
pub mod loader;
pub mod utils;
