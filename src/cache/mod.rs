//! Cache module - keyed queries and their registry.
//!
//! ## Architecture
//!
//! - `QueryKey` / `QueryDigest` - structured key and its canonical identity
//! - `QueryCache` - registry holding one `Query` per digest
//! - `Query` - per-key fetch state machine with change notification
//!
//! ## Usage
//!
//! ```rust
//! use querycache::{QueryCache, QueryOptions, query_key};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let cache = QueryCache::new();
//! let query = cache
//!     .build(&QueryOptions::<u32, String>::new(query_key!["answer"], || async { Ok(42) }))
//!     .unwrap();
//!
//! query.fetch().await;
//! assert_eq!(query.get_result().data.as_deref(), Some(&42));
//! # });
//! ```

mod key;
mod options;
mod query;
mod registry;

pub use key::{QueryDigest, QueryKey};
pub use options::{QueryFn, QueryFuture, QueryOptions};
pub use query::{Query, QueryResult, QueryState, QueryStatus};
pub use registry::QueryCache;
