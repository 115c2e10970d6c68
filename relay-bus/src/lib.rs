//! Relay Bus
//!
//! Connects the reduction-core entities into cascades: every journaled event
//! is turned into the commands and outcomes it implies, delivered
//! asynchronously with retry, and dead-lettered when delivery fails.
//!
//! # Delivery
//!
//! - **At-least-once**: A command may arrive more than once; entities absorb duplicates
//! - **Ordered per entity**: Commands for one entity run in FIFO order on its lane;
//!   separate entities proceed concurrently
//! - **Eventually quiet**: [`Ledger::wait_idle`] resolves once every cascade settles
//! - **Resumable**: Events whose cascade never settled are replayed when the ledger reopens

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod index;
pub mod ledger;
pub mod message;
pub mod metrics;
pub mod retry;
pub mod routes;
pub mod watermark;

pub use dispatcher::{Backlog, Delivery, Dispatcher, RelaySink};
pub use dlq::{DeadLetter, DeadLetterQueue, DlqStats};
pub use error::{Error, Result};
pub use index::ShardIndex;
pub use ledger::{Ledger, WithdrawalStatus};
pub use message::{Directive, Outcome};
pub use retry::{DeliveryFailure, RetryPolicy};
pub use watermark::{Receipt, RelayWatermarks};
