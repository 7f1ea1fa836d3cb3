//! Keyed operation scheduling.
//!
//! An [`OperationQueue`] absorbs bursts of requests for the same key into a
//! single execution, caps how many executions run at once, and retries failed
//! executions with exponential backoff. Every request gets a [`Ticket`] that
//! resolves with the outcome of the execution it was merged into.
//!
//! ```no_run
//! use freeway_queue::{Builder, Options};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let queue = Builder::new("hash")
//!     .options(Options::new(Duration::from_millis(250), 4, 2))
//!     .build(|path: String, ()| async move { Ok::<_, std::io::Error>(path.len()) });
//! let length = queue.add("a/b.png".to_string(), ()).await;
//! # }
//! ```

pub mod error;
mod merge;
mod options;
mod queue;
mod ticket;

pub use crate::merge::{Join, Latest, MergeStrategy};
pub use crate::options::{Backoff, Options};
pub use crate::queue::{Attempt, Builder, OperationQueue, Status};
pub use crate::ticket::Ticket;
