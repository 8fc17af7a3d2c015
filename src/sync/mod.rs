//! Synchronization with the upstream read endpoints.
//!
//! [`Fetcher`] performs one resource read with timeout and retry;
//! [`Scheduler`] owns the per-subscription refresh loop and is the only
//! writer into the [`SeriesStore`](crate::storage::SeriesStore).

pub mod error;
pub mod fetcher;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::FetchError;
pub use fetcher::{Fetcher, Payload, RetryPolicy};
pub use scheduler::{FetchState, LogNotifier, Notifier, Scheduler, SchedulerConfig, Subscription, SubscriptionId};
pub use transport::{FetchRequest, HttpTransport, Resource, Transport};
