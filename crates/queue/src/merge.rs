//! What happens when an operation is requested for a key that already has one.

/// Decides how an incoming payload combines with an operation that already
/// exists for the same key. Waiters always join the existing operation (or its
/// follow-up); the strategy only decides what gets processed.
pub trait MergeStrategy<P>: Send + Sync + 'static {
    /// The existing operation is still delayed or queued and hasn't read its
    /// payload yet.
    fn pending(&self, _current: &mut P, _incoming: P) {}

    /// The existing operation is already running. Returning a payload
    /// schedules one follow-up execution once the current one settles.
    fn running(&self, _current: &P, _incoming: P) -> Option<P> {
        None
    }
}

/// Joins the existing operation and keeps its payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Join;

impl<P> MergeStrategy<P> for Join {}

/// Processes the most recent payload. A request arriving while the operation
/// runs is replayed afterwards, so no request is lost to an execution that
/// started before it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Latest;

impl<P> MergeStrategy<P> for Latest {
    fn pending(&self, current: &mut P, incoming: P) {
        *current = incoming;
    }

    fn running(&self, _current: &P, incoming: P) -> Option<P> {
        Some(incoming)
    }
}
