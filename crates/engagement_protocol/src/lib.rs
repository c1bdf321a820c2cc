//! Shared plumbing for the engagement pipeline stages.
//!
//! - [`idempotency`]: message keys and content hashes for idempotent sync
//! - [`retry`]: bounded retry with timeout and exponential backoff
//! - [`cancel`]: cooperative stage cancellation
//! - [`defaults`]: canonical default values

pub mod cancel;
pub mod defaults;
pub mod idempotency;
pub mod retry;

pub use cancel::CancellationToken;
pub use idempotency::{content_hash, message_key, normalize_received_at, received_at_text, MessageKey};
pub use retry::{retry_with_backoff, AttemptFailure, RetryError, RetryPolicy, Retryable};
