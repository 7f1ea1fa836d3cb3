use crate::error::{Error, ErrorKind, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub(crate) type Outcome<T> = std::result::Result<T, ErrorKind>;

/// Resolves with the outcome of the execution a call to
/// [`OperationQueue::add`](crate::OperationQueue::add) was merged into.
///
/// Dropping a ticket does not cancel the operation.
#[must_use = "dropping a ticket doesn't cancel the operation, but its outcome is lost"]
pub struct Ticket<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
}

impl<T> Ticket<T> {
    pub(crate) fn new(receiver: oneshot::Receiver<Outcome<T>>) -> Self {
        Self { receiver }
    }
}

impl<T> fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket").finish_non_exhaustive()
    }
}

impl<T> Future for Ticket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(kind)) => Err(Error::from(kind)),
            Err(_) => Err(Error::from(ErrorKind::Abandoned)),
        })
    }
}
