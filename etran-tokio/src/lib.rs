//! A crate containing utilities and extensions built on top of Tokio.

/// `NotifyOnce`, typically used as a shutdown channel.
pub mod notify_once;
/// Cancellable polling sleep which distinguishes wake from terminate.
pub mod sleep;
/// `Task` and associated helpers.
pub mod task;

// Can save a `tokio` dependency declaration
pub use tokio;
