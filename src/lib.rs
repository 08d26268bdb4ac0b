//! Querycache - keyed async data cache with change notification.
//!
//! Given keys and fetch functions, the cache runs at most one fetch per key
//! at a time, memoizes the latest result per key and tells interested
//! consumers whenever that result changes.
//!
//! ## Architecture
//!
//! - `cache` - query keys, the per-key `Query` state machine and the
//!   `QueryCache` registry
//! - `observer` - `QueryObserver`, one consumer's binding to one query
//! - `mutation` - `MutationController`, unkeyed write state machine
//! - `client` - `QueryClient`, the shared handle passed to every observer
//! - `config` - query defaults, from code or environment
//! - `listeners` - detach-safe callback sets
//!
//! ## Usage
//!
//! ```rust
//! use querycache::{QueryClient, QueryObserver, QueryOptions, query_key};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let client = QueryClient::new();
//! let options = QueryOptions::<String, anyhow::Error>::new(query_key!["greeting"], || async {
//!     Ok("hello".to_string())
//! });
//!
//! let observer = QueryObserver::new(&client, options)?;
//! let _subscription = observer.subscribe(|| println!("changed"));
//! observer.fetch_optimistic().await;
//!
//! assert_eq!(observer.get_current_result().data.as_deref().map(String::as_str), Some("hello"));
//! # Ok::<(), querycache::CacheError>(())
//! # }).unwrap();
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod listeners;
pub mod mutation;
pub mod observer;

pub use cache::{
    Query, QueryCache, QueryDigest, QueryFn, QueryFuture, QueryKey, QueryOptions, QueryResult,
    QueryState, QueryStatus,
};
pub use client::QueryClient;
pub use config::QueryConfig;
pub use error::CacheError;
pub use listeners::{ListenerSet, Subscription};
pub use mutation::{MutationController, MutationOptions, MutationState, MutationStatus};
pub use observer::QueryObserver;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
