//! Execution runtime: results, retries, caching, streams and the
//! `ProcessPromise` handle.

pub mod cache;
pub mod promise;
pub mod result;
pub mod retry;
pub mod stream;

pub use cache::{fingerprint, CacheConfig, CachePolicy, ResultCache};
pub use promise::{ProcessPromise, StdinHandle};
pub use result::{split_lines, ExecutionResult};
pub use retry::{run_with_retry, Backoff, RetryPolicy};
