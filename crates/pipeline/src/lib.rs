//! The two consumers and the background sweeps.
//!
//! - [`Dispatcher`] turns ingestion notifications into submitted clusters.
//! - [`CompletionHandler`] turns completion events into finalized records
//!   and output objects.
//! - [`QueueConsumer`] is the receive loop both run in; it applies each
//!   message's [`Disposition`].
//! - [`Reconciler`] and [`RetentionSweeper`] keep the registry honest over
//!   time.

pub mod completion;
pub mod consumer;
pub mod dispatcher;
pub mod output;
pub mod reconcile;
pub mod retention;

pub use completion::{CompletionError, CompletionHandler, CompletionHandlerConfig, CompletionOutcome};
pub use consumer::{Disposition, MessageHandler, QueueConsumer, ReceiveSettings};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig};
pub use output::JobResult;
pub use reconcile::{ReconcileSummary, Reconciler, ReconcilerConfig};
pub use retention::RetentionSweeper;
