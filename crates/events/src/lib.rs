//! Orchestrator event bus and the operator-visible error channel.
//!
//! - [`EventBus`] — in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`OrchestratorEvent`] — job lifecycle and dead-letter events.
//! - [`DeadLetterChannel`] — durable write of a rejected message to the
//!   dead-letter queue, followed by a bus notification.
//! - [`FailureReporter`] — background service that forwards job failures to
//!   the dead-letter queue.

pub mod bus;
pub mod dead_letter;
pub mod reporter;

pub use bus::{EventBus, OrchestratorEvent};
pub use dead_letter::{DeadLetterChannel, DeadLetterKind, DeadLetterRecord};
pub use reporter::{FailureNotice, FailureReporter, ReportError};
